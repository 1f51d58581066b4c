//! Error types and result definitions for the hhj hybrid hash join workspace.
//!
//! Every hhj crate returns [`Result<T>`], whose error variant is the single
//! [`Error`] enum defined here. Errors propagate across crate boundaries with
//! the `?` operator; callers that need to react to a specific failure match on
//! the variant.
//!
//! # Error Categories
//!
//! - **Configuration errors** ([`Error::Configuration`]): malformed join
//!   specifications or tuning parameters, always raised before any row is read
//! - **Resource exhaustion** ([`Error::ResourceExhausted`]): spill writes that
//!   failed or file handles that could not be obtained even after eviction
//! - **Cancellation** ([`Error::Cancelled`]): the cooperative stop signal; the
//!   coordinator turns it into a distinct outcome instead of a failure
//! - **Row source errors** ([`Error::RowSource`]): a row could not be read or a
//!   key value could not be interpreted
//! - **Spill corruption** ([`Error::SpillCorrupted`]): a spilled frame failed to
//!   decode on reload
//! - **I/O and Arrow errors** ([`Error::Io`], [`Error::Arrow`]): wrapped library
//!   errors
//! - **Internal errors** ([`Error::Internal`]): violated invariants

pub mod error;
pub mod result;

pub use error::Error;
pub use result::Result;
