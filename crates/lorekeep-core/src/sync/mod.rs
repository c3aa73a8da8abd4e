//! Remote synchronization
//!
//! Reconciles the local store with a single remote authority.
//!
//! ## Flow
//!
//! 1. Local mutations append to the pending-operation log in the same
//!    transaction as the write.
//! 2. [`SyncEngine::push_queued`] drains the log in order, confirming each op
//!    the remote accepts. Confirmation also records the sync base.
//! 3. [`SyncEngine::refresh`] pulls and applies changes made only remotely.
//! 4. Entities changed on both sides since the base are reported as
//!    [`Conflict`]s and resolved only with an explicit [`Strategy`].
//!
//! ## Usage
//!
//! ```ignore
//! let engine = SyncEngine::new(HttpRemote::new(url, timeout)?, config.context.clone());
//! match engine.initial_reconcile(&workspace).await? {
//!     ReconcileOutcome::Diverged { reconciliation } => {
//!         engine.resolve(&workspace, &reconciliation, Strategy::Skip).await?;
//!         engine.push_queued(&workspace).await?;
//!     }
//!     _ => {}
//! }
//! ```

pub mod conflict;
pub mod engine;
pub mod http;
pub mod remote;
pub mod state;

pub use conflict::{CommitPlan, Conflict, Outgoing, Remap, ResolveError, Strategy, SyncPlan};
pub use engine::{
    DroppedOp, PullMode, PushReport, ReconcileOutcome, Reconciliation, RefreshReport,
    ResolveReport, SharedWorkspace, SyncEngine, SyncError, SyncRound,
};
pub use http::HttpRemote;
pub use remote::{MemoryRemote, PushRequest, RemoteAuthority, RemoteError, RemoteErrorKind};
pub use state::SyncState;
