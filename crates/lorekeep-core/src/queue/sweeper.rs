//! Maintenance sweeper
//!
//! Periodic cleanup of the pending-operation log and the regeneration audit log.

use serde::Serialize;
use tracing::{info, warn};

use super::log::{PendingLog, PendingOp};
use crate::config::{Config, SweeperSettings};
use crate::storage::{SqliteStore, StoreResult};
use crate::views::registry::trim_audit;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    /// Confirmed ops past retention that were deleted
    pub purged: usize,
    /// Unconfirmed ops past the staleness threshold that were given up on
    pub reclaimed: Vec<PendingOp>,
    /// Audit entries trimmed beyond per-scope retention
    pub audit_trimmed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.purged == 0 && self.reclaimed.is_empty() && self.audit_trimmed == 0
    }
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    settings: SweeperSettings,
    audit_retention: usize,
}

impl Sweeper {
    pub fn new(settings: SweeperSettings, audit_retention: usize) -> Self {
        Self {
            settings,
            audit_retention,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sweeper.clone(), config.views.audit_retention)
    }

    /// Run one sweep at time `now` (unix millis)
    pub fn sweep(&self, store: &mut SqliteStore, now: i64) -> StoreResult<SweepReport> {
        let confirmed_cutoff = now - secs_to_ms(self.settings.confirmed_retention_secs);
        let stale_cutoff = now - secs_to_ms(self.settings.stale_after_secs);
        let audit_retention = self.audit_retention;

        let report = store.write(|tx| {
            let log = PendingLog::new(tx.conn());
            Ok(SweepReport {
                purged: log.purge_confirmed(confirmed_cutoff)?,
                reclaimed: log.reclaim_stale(stale_cutoff)?,
                audit_trimmed: trim_audit(tx.conn(), audit_retention)?,
            })
        })?;

        for op in &report.reclaimed {
            warn!(
                seq = op.seq,
                collection = %op.collection,
                id = %op.entity_id,
                op = %op.op,
                enqueued_at = %op.enqueued_at,
                "Reclaimed stale pending operation; it will not reach the remote"
            );
        }
        if !report.is_empty() {
            info!(
                purged = report.purged,
                reclaimed = report.reclaimed.len(),
                audit_trimmed = report.audit_trimmed,
                "Sweep complete"
            );
        }
        Ok(report)
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}
