//! Durable pending-operation queue
//!
//! - [`PendingLog`]: append/confirm/list over the `pending_ops` table.
//! - [`Sweeper`]: removes confirmed ops past retention and reclaims ops that
//!   stayed unconfirmed past the staleness threshold.

pub mod log;
pub mod sweeper;

pub use log::{PendingLog, PendingOp};
pub use sweeper::{SweepReport, Sweeper};
