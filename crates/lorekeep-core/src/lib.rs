//! lorekeep core library
//!
//! Local-first data layer for worldbuilding records: people, groups,
//! relationships, encyclopedia entries and titles are edited offline in a
//! local store, reconciled with one remote authority, and folded into
//! read-optimized context bundles.
//!
//! # Architecture
//!
//! - **Local store**: SQLite system of record ([`storage`])
//! - **Pending-operation log**: every local mutation, queued in the same
//!   transaction until the remote confirms it ([`queue`])
//! - **Remote sync**: reconcile, conflict detection and explicit resolution,
//!   queue drain with retry ([`sync`])
//! - **Context views**: debounced, dependency-aware regeneration of derived
//!   bundles ([`views`])
//!
//! # Quick Start
//!
//! ```text
//! let mut workspace = Workspace::open(Config::load()?)?;
//!
//! let alder = workspace.create(Entity::group(0, "Alder").record)?;
//! workspace.create(Entity::person(0, "Aldric", Some(alder.id.get())).record)?;
//!
//! // Bring context bundles up to date and write them out
//! workspace.export_contexts(None)?;
//! ```
//!
//! # Modules
//!
//! - `workspace`: use-case layer (main entry point)
//! - `models`: entity records and their reference rules
//! - `notify`: change and view notifications
//! - `runtime`: background timers for regeneration, sync and sweeping
//! - `config`: application configuration

use chrono::{DateTime, Utc};

pub mod config;
pub mod models;
pub mod notify;
pub mod queue;
pub mod runtime;
pub mod storage;
pub mod sync;
pub mod views;
pub mod workspace;

pub use config::{Config, SyncContext};
pub use models::{Collection, Entity, EntityId, EntityKey, OpKind, Record};
pub use notify::{ChangeEvent, SubscriptionId, ViewEvent, CONTEXTS_UPDATED, GENERATION_COMPLETE};
pub use queue::{PendingOp, Sweeper};
pub use runtime::{Background, BackgroundSettings, RuntimeEvent};
pub use storage::{StoreError, StoreResult};
pub use sync::{HttpRemote, MemoryRemote, SharedWorkspace, Strategy, SyncEngine, SyncError};
pub use views::{ArtifactScope, Bundle, PassReport};
pub use workspace::{DeleteReport, Status, Workspace};

/// Current time as unix milliseconds
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
