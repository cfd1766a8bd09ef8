//! A quotient filter: a compact, probabilistic approximate-membership
//! structure built on a single bit-packed table.
//!
//! Unlike a classical Bloom filter, a quotient filter supports removal and
//! merging of two filters, and its entries can be iterated in sorted order.
//! It trades some of a Bloom filter's flexibility (arbitrary `k`, no upper
//! bound on occupancy) for single cache-line-local probing, at the cost of a
//! fixed capacity set at construction time.
//!
//! Producing the 64-bit fingerprint hash fed to [`QuotientFilter::insert`] is
//! the caller's responsibility; this crate does not ship a hash function.
pub mod filter;
pub mod slot;

pub use filter::{InsertOutcome, QuotientFilter};

use thiserror::Error;

/// Errors a quotient filter can report back to its caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotientFilterError {
    /// `q` and `r` must both be positive and `q + r` must not exceed 64.
    #[error("invalid quotient filter parameters: q={q}, r={r} (need q>0, r>0, q+r<=64)")]
    InvalidParameters { q: u32, r: u32 },
    /// A hash passed to `remove` used more bits than `q + r`.
    #[error("hash uses more than q+r={q_plus_r} bits")]
    HashTooWide { q_plus_r: u32 },
}
