//! Artifact registry
//!
//! Persistent record of the materialized artifacts: current content per
//! scope, staleness flags, the set of promoted groups and the regeneration
//! audit log. Works over a plain connection or an open write transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::generator::Bundle;
use super::scope::ArtifactScope;
use crate::from_ms;
use crate::models::EntityId;
use crate::storage::{StoreError, StoreResult};

/// What started a regeneration pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Debounce timer expired
    Debounced,
    /// `flush()` forced pending scopes through
    Flush,
    /// Explicit regenerate-now request
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Debounced => "debounced",
            Trigger::Flush => "flush",
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debounced" => Ok(Trigger::Debounced),
            "flush" => Ok(Trigger::Flush),
            "manual" => Ok(Trigger::Manual),
            other => Err(format!("unknown trigger '{}'", other)),
        }
    }
}

/// Stored artifact with its content bundle
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub scope: ArtifactScope,
    pub generated_at: DateTime<Utc>,
    pub source_counts: BTreeMap<String, usize>,
    pub bundle: Bundle,
    pub stale: bool,
    pub stale_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Artifact metadata without content
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub artifact_id: String,
    pub scope: ArtifactScope,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub source_counts: BTreeMap<String, usize>,
    pub stale: bool,
    pub stale_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ArtifactSummary {
    /// Failed its last regeneration, or stale since before `cutoff`
    pub fn is_unhealthy(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_error.is_some() || matches!(self.stale_since, Some(since) if since < cutoff)
    }
}

/// One regeneration audit record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub scope: ArtifactScope,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub item_count: usize,
    /// `None` on success
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ArtifactRegistry<'c> {
    conn: &'c Connection,
}

const SELECT_ARTIFACTS: &str = "SELECT artifact_id, scope, generated_at, source_counts, content, \
     stale, stale_since, last_error FROM artifacts";

impl<'c> ArtifactRegistry<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn promoted_groups(&self) -> StoreResult<BTreeSet<EntityId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT group_id FROM promoted_groups")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

        let mut groups = BTreeSet::new();
        for row in rows {
            groups.insert(EntityId(row?));
        }
        Ok(groups)
    }

    /// Promote a group to a dedicated artifact; false if already promoted
    pub fn promote(&self, group_id: EntityId, now: i64) -> StoreResult<bool> {
        Ok(self.conn.execute(
            "INSERT OR IGNORE INTO promoted_groups (group_id, promoted_at) VALUES (?1, ?2)",
            params![group_id.0, now],
        )? > 0)
    }

    /// Forget a promoted group and drop its artifact
    pub fn retire(&self, group_id: EntityId) -> StoreResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM promoted_groups WHERE group_id = ?1",
            params![group_id.0],
        )? > 0;
        self.remove(ArtifactScope::Group(group_id))?;
        Ok(removed)
    }

    /// Artifact summaries ordered by scope
    pub fn artifacts(&self) -> StoreResult<Vec<ArtifactSummary>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{} ORDER BY scope", SELECT_ARTIFACTS))?;
        let rows = stmt.query_map([], RawArtifact::from_row)?;

        let mut summaries = Vec::new();
        for row in rows {
            let artifact = row?.decode()?;
            summaries.push(ArtifactSummary {
                name: artifact.bundle.name,
                artifact_id: artifact.artifact_id,
                scope: artifact.scope,
                generated_at: artifact.generated_at,
                source_counts: artifact.source_counts,
                stale: artifact.stale,
                stale_since: artifact.stale_since,
                last_error: artifact.last_error,
            });
        }
        summaries.sort_by_key(|s| s.scope);
        Ok(summaries)
    }

    pub fn artifact(&self, scope: ArtifactScope) -> StoreResult<Option<Artifact>> {
        self.conn
            .query_row(
                &format!("{} WHERE scope = ?1", SELECT_ARTIFACTS),
                params![scope.key()],
                RawArtifact::from_row,
            )
            .optional()?
            .map(RawArtifact::decode)
            .transpose()
    }

    /// Replace the whole content of a scope, clearing staleness and errors
    pub fn replace(&self, scope: ArtifactScope, bundle: &Bundle, now: i64) -> StoreResult<String> {
        let artifact_id = uuid::Uuid::new_v4().to_string();
        let source_counts = serde_json::to_string(&bundle.source_counts())?;
        let content = serde_json::to_vec(bundle)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO artifacts
                (scope, artifact_id, generated_at, source_counts, content, stale, stale_since, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, NULL)",
            params![scope.key(), artifact_id, now, source_counts, content],
        )?;
        Ok(artifact_id)
    }

    /// Flag a scope stale; keeps the earliest stale time
    pub fn mark_stale(&self, scope: ArtifactScope, now: i64) -> StoreResult<bool> {
        Ok(self.conn.execute(
            "UPDATE artifacts SET stale = 1, stale_since = COALESCE(stale_since, ?2)
             WHERE scope = ?1",
            params![scope.key(), now],
        )? > 0)
    }

    /// Keep prior content but remember why the rebuild failed
    pub fn record_failure(&self, scope: ArtifactScope, error: &str, now: i64) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE artifacts SET stale = 1, stale_since = COALESCE(stale_since, ?3), last_error = ?2
             WHERE scope = ?1",
            params![scope.key(), error, now],
        )?;
        Ok(())
    }

    pub fn remove(&self, scope: ArtifactScope) -> StoreResult<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM artifacts WHERE scope = ?1", params![scope.key()])?
            > 0)
    }

    pub fn append_audit(
        &self,
        scope: ArtifactScope,
        trigger: Trigger,
        started_at: i64,
        duration_ms: u64,
        item_count: usize,
        error: Option<&str>,
    ) -> StoreResult<i64> {
        let outcome = if error.is_some() { "failed" } else { "ok" };
        self.conn.execute(
            "INSERT INTO regeneration_log
                (scope, trigger, started_at, duration_ms, item_count, outcome, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                scope.key(),
                trigger.as_str(),
                started_at,
                duration_ms as i64,
                item_count as i64,
                outcome,
                error
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent audit entries first, optionally for one scope
    pub fn audit_log(
        &self,
        scope: Option<ArtifactScope>,
        limit: usize,
    ) -> StoreResult<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, scope, trigger, started_at, duration_ms, item_count, error
             FROM regeneration_log
             WHERE ?1 IS NULL OR scope = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![scope.map(|s| s.key()), limit as i64],
            |row: &Row<'_>| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, scope, trigger, started_at, duration_ms, item_count, error) = row?;
            entries.push(AuditEntry {
                id,
                scope: parse_scope(&scope)?,
                trigger: trigger.parse().map_err(|details| StoreError::Corrupt {
                    what: "regeneration_log",
                    details,
                })?,
                started_at: from_ms(started_at),
                duration_ms: duration_ms.max(0) as u64,
                item_count: item_count.max(0) as usize,
                error,
            });
        }
        Ok(entries)
    }

    /// Time of the most recent successful regeneration of any scope
    pub fn last_regeneration_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let latest: Option<i64> =
            self.conn
                .query_row("SELECT MAX(generated_at) FROM artifacts", [], |row| {
                    row.get(0)
                })?;
        Ok(latest.map(from_ms))
    }
}

/// Keep only the newest `keep` audit entries of every scope
pub fn trim_audit(conn: &Connection, keep: usize) -> StoreResult<usize> {
    Ok(conn.execute(
        "DELETE FROM regeneration_log WHERE id NOT IN (
             SELECT newer.id FROM regeneration_log AS newer
             WHERE newer.scope = regeneration_log.scope
             ORDER BY newer.id DESC LIMIT ?1
         )",
        params![keep as i64],
    )?)
}

fn parse_scope(key: &str) -> StoreResult<ArtifactScope> {
    key.parse().map_err(|details| StoreError::Corrupt {
        what: "artifact scope",
        details,
    })
}

struct RawArtifact {
    artifact_id: String,
    scope: String,
    generated_at: i64,
    source_counts: String,
    content: Vec<u8>,
    stale: bool,
    stale_since: Option<i64>,
    last_error: Option<String>,
}

impl RawArtifact {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            artifact_id: row.get(0)?,
            scope: row.get(1)?,
            generated_at: row.get(2)?,
            source_counts: row.get(3)?,
            content: row.get(4)?,
            stale: row.get(5)?,
            stale_since: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn decode(self) -> StoreResult<Artifact> {
        let corrupt = |e: serde_json::Error| StoreError::Corrupt {
            what: "artifact",
            details: format!("{}: {}", self.scope, e),
        };
        let bundle: Bundle = serde_json::from_slice(&self.content).map_err(corrupt)?;
        let source_counts = serde_json::from_str(&self.source_counts).map_err(corrupt)?;

        Ok(Artifact {
            scope: parse_scope(&self.scope)?,
            artifact_id: self.artifact_id,
            generated_at: from_ms(self.generated_at),
            source_counts,
            bundle,
            stale: self.stale,
            stale_since: self.stale_since.map(from_ms),
            last_error: self.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_schema;
    use crate::views::generator::BundleFile;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn bundle(name: &str, people: usize) -> Bundle {
        Bundle {
            name: name.to_string(),
            files: vec![BundleFile {
                name: "people.json".to_string(),
                kind: "people".to_string(),
                item_count: people,
                content: "{}".to_string(),
            }],
        }
    }

    #[test]
    fn test_replace_and_read_back() {
        let conn = conn();
        let registry = ArtifactRegistry::new(&conn);

        let first = registry.replace(ArtifactScope::Global, &bundle("world", 2), 1_000).unwrap();
        let second = registry.replace(ArtifactScope::Global, &bundle("world", 3), 2_000).unwrap();
        assert_ne!(first, second);

        let artifact = registry.artifact(ArtifactScope::Global).unwrap().unwrap();
        assert_eq!(artifact.artifact_id, second);
        assert_eq!(artifact.source_counts["people"], 3);
        assert_eq!(artifact.generated_at.timestamp_millis(), 2_000);
        assert!(!artifact.stale);
        assert_eq!(registry.artifacts().unwrap().len(), 1);
    }

    #[test]
    fn test_stale_keeps_earliest_time_and_replace_clears() {
        let conn = conn();
        let registry = ArtifactRegistry::new(&conn);
        assert!(!registry.mark_stale(ArtifactScope::Minor, 10).unwrap());

        registry.replace(ArtifactScope::Minor, &bundle("minor-groups", 0), 5).unwrap();
        registry.mark_stale(ArtifactScope::Minor, 10).unwrap();
        registry.mark_stale(ArtifactScope::Minor, 20).unwrap();

        let artifact = registry.artifact(ArtifactScope::Minor).unwrap().unwrap();
        assert!(artifact.stale);
        assert_eq!(artifact.stale_since.unwrap().timestamp_millis(), 10);

        registry.replace(ArtifactScope::Minor, &bundle("minor-groups", 0), 30).unwrap();
        assert!(!registry.artifact(ArtifactScope::Minor).unwrap().unwrap().stale);
    }

    #[test]
    fn test_failure_marks_unhealthy() {
        let conn = conn();
        let registry = ArtifactRegistry::new(&conn);
        registry.replace(ArtifactScope::Global, &bundle("world", 1), 5).unwrap();
        registry.record_failure(ArtifactScope::Global, "boom", 6).unwrap();

        let summary = &registry.artifacts().unwrap()[0];
        assert_eq!(summary.last_error.as_deref(), Some("boom"));
        assert!(summary.is_unhealthy(from_ms(0)));
        // Prior content survives
        assert_eq!(summary.source_counts["people"], 1);
    }

    #[test]
    fn test_promotion_is_idempotent_and_retire_drops_artifact() {
        let conn = conn();
        let registry = ArtifactRegistry::new(&conn);
        let alder = EntityId(1);

        assert!(registry.promote(alder, 1).unwrap());
        assert!(!registry.promote(alder, 2).unwrap());
        registry.replace(ArtifactScope::Group(alder), &bundle("group-1", 10), 3).unwrap();

        assert!(registry.retire(alder).unwrap());
        assert!(registry.promoted_groups().unwrap().is_empty());
        assert!(registry.artifact(ArtifactScope::Group(alder)).unwrap().is_none());
    }

    #[test]
    fn test_audit_log_and_trim() {
        let conn = conn();
        let registry = ArtifactRegistry::new(&conn);
        for i in 0..5 {
            registry
                .append_audit(ArtifactScope::Global, Trigger::Debounced, i, 3, 7, None)
                .unwrap();
        }
        registry
            .append_audit(ArtifactScope::Minor, Trigger::Flush, 9, 1, 0, Some("boom"))
            .unwrap();

        let all = registry.audit_log(None, 100).unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0].scope, ArtifactScope::Minor);
        assert!(!all[0].succeeded());

        assert_eq!(trim_audit(&conn, 2).unwrap(), 3);
        let global = registry.audit_log(Some(ArtifactScope::Global), 100).unwrap();
        assert_eq!(global.len(), 2);
        assert_eq!(global[0].started_at.timestamp_millis(), 4);
        assert_eq!(registry.audit_log(Some(ArtifactScope::Minor), 100).unwrap().len(), 1);
    }
}
