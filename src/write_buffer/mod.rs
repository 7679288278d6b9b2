//! Write Buffer Module
//!
//! Entry point of the write path. Producers frame entries (primary header +
//! payload, chained when larger than one fragment) directly into a shared
//! ring; the process thread drains it in rounds.
//!
//! ## Entry Layout in the Ring
//! ```text
//! ┌───────────────┬────────────┬───────────────┬────────────┬─────
//! │ PrimaryHeader │ fragment 0 │ PrimaryHeader │ fragment 1 │ ...
//! └───────────────┴────────────┴───────────────┴────────────┴─────
//!   (entries may wrap around the end of the ring)
//! ```

// The ring hands out raw views into reserved regions; no other module
// may use unsafe code
#[allow(unsafe_code)]
mod buffer;
#[allow(unsafe_code)]
mod ring;

pub use buffer::{EntrySpec, FlushSnapshot, WriteBuffer};
