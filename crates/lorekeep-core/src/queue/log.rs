//! Pending-operation log
//!
//! Append-only record of local mutations that the remote authority has not
//! confirmed yet. The log lives in the same SQLite database as the entities
//! and is always written through the transaction of the mutation it records,
//! so the two are lost or kept together.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::from_ms;
use crate::models::{Collection, Entity, EntityId, EntityKey, OpKind};
use crate::storage::local::decode_entity;
use crate::storage::{StoreError, StoreResult};

/// One queued local mutation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOp {
    /// Monotonic sequence id, defines enqueue order
    pub seq: i64,
    pub collection: Collection,
    pub entity_id: EntityId,
    pub op: OpKind,
    /// Snapshot of the entity after the mutation (absent for deletes)
    pub payload: Option<Entity>,
    pub enqueued_at: DateTime<Utc>,
    pub confirmed: bool,
}

impl PendingOp {
    pub fn key(&self) -> EntityKey {
        (self.collection, self.entity_id)
    }
}

/// View of the log over a connection or open transaction
pub struct PendingLog<'c> {
    conn: &'c Connection,
}

const SELECT_OPS: &str =
    "SELECT seq, collection, entity_id, op, payload, enqueued_at, confirmed FROM pending_ops";

impl<'c> PendingLog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Record a mutation, returning its sequence id
    pub fn append(
        &self,
        key: &EntityKey,
        op: OpKind,
        payload: Option<&Entity>,
        now: i64,
    ) -> StoreResult<i64> {
        let payload = payload
            .map(|entity| serde_json::to_string(&entity.record))
            .transpose()?;
        self.conn.execute(
            "INSERT INTO pending_ops (collection, entity_id, op, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key.0.as_str(), key.1 .0, op.as_str(), payload, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Mark every unconfirmed op of an entity confirmed
    ///
    /// Idempotent: confirming an entity with nothing pending is a no-op.
    pub fn confirm(&self, key: &EntityKey, now: i64) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "UPDATE pending_ops SET confirmed = 1, confirmed_at = ?3
             WHERE collection = ?1 AND entity_id = ?2 AND confirmed = 0",
            params![key.0.as_str(), key.1 .0, now],
        )?)
    }

    /// Confirm an entity's ops up to and including `seq`
    ///
    /// Ops enqueued after `seq` (mutations made while the push was in
    /// flight) stay pending.
    pub fn confirm_through(&self, key: &EntityKey, seq: i64, now: i64) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "UPDATE pending_ops SET confirmed = 1, confirmed_at = ?4
             WHERE collection = ?1 AND entity_id = ?2 AND confirmed = 0 AND seq <= ?3",
            params![key.0.as_str(), key.1 .0, seq, now],
        )?)
    }

    /// Unconfirmed ops, oldest first
    pub fn list_pending(&self) -> StoreResult<Vec<PendingOp>> {
        self.query(
            &format!("{} WHERE confirmed = 0 ORDER BY seq", SELECT_OPS),
            params![],
        )
    }

    /// Unconfirmed ops of one entity, oldest first
    pub fn pending_for(&self, key: &EntityKey) -> StoreResult<Vec<PendingOp>> {
        self.query(
            &format!(
                "{} WHERE confirmed = 0 AND collection = ?1 AND entity_id = ?2 ORDER BY seq",
                SELECT_OPS
            ),
            params![key.0.as_str(), key.1 .0],
        )
    }

    /// Keys of every entity with unconfirmed ops
    pub fn pending_keys(&self) -> StoreResult<BTreeSet<EntityKey>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT collection, entity_id FROM pending_ops WHERE confirmed = 0",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut keys = BTreeSet::new();
        for row in rows {
            let (collection, id) = row?;
            keys.insert((collection.parse::<Collection>()?, EntityId(id)));
        }
        Ok(keys)
    }

    /// Whether any local mutation is still unconfirmed
    pub fn has_pending(&self) -> StoreResult<bool> {
        Ok(self.pending_count()? > 0)
    }

    pub fn pending_count(&self) -> StoreResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_ops WHERE confirmed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Drop one op (permanent push failure)
    pub fn discard(&self, seq: i64) -> StoreResult<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM pending_ops WHERE seq = ?1", params![seq])?
            > 0)
    }

    /// Drop every unconfirmed op of an entity (remote copy won a conflict)
    pub fn discard_for(&self, key: &EntityKey) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM pending_ops WHERE collection = ?1 AND entity_id = ?2 AND confirmed = 0",
            params![key.0.as_str(), key.1 .0],
        )?)
    }

    /// Delete confirmed ops confirmed before `cutoff`
    pub fn purge_confirmed(&self, cutoff: i64) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM pending_ops WHERE confirmed = 1 AND confirmed_at < ?1",
            params![cutoff],
        )?)
    }

    /// Remove unconfirmed ops enqueued before `cutoff`, returning them
    pub fn reclaim_stale(&self, cutoff: i64) -> StoreResult<Vec<PendingOp>> {
        let stale = self.query(
            &format!(
                "{} WHERE confirmed = 0 AND enqueued_at < ?1 ORDER BY seq",
                SELECT_OPS
            ),
            params![cutoff],
        )?;
        self.conn.execute(
            "DELETE FROM pending_ops WHERE confirmed = 0 AND enqueued_at < ?1",
            params![cutoff],
        )?;
        Ok(stale)
    }

    /// Every op still in the table, confirmed or not
    pub fn list_all(&self) -> StoreResult<Vec<PendingOp>> {
        self.query(&format!("{} ORDER BY seq", SELECT_OPS), params![])
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> StoreResult<Vec<PendingOp>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, RawOp::from_row)?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(row?.decode()?);
        }
        Ok(ops)
    }
}

struct RawOp {
    seq: i64,
    collection: String,
    entity_id: i64,
    op: String,
    payload: Option<String>,
    enqueued_at: i64,
    confirmed: bool,
}

impl RawOp {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            collection: row.get(1)?,
            entity_id: row.get(2)?,
            op: row.get(3)?,
            payload: row.get(4)?,
            enqueued_at: row.get(5)?,
            confirmed: row.get(6)?,
        })
    }

    fn decode(self) -> StoreResult<PendingOp> {
        let collection: Collection = self.collection.parse()?;
        let entity_id = EntityId(self.entity_id);
        let op: OpKind = self.op.parse()?;
        let payload = self
            .payload
            .map(|body| decode_entity(collection, entity_id, &body))
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                what: "pending_op",
                details: format!("seq {}: {}", self.seq, e),
            })?;

        Ok(PendingOp {
            seq: self.seq,
            collection,
            entity_id,
            op,
            payload,
            enqueued_at: from_ms(self.enqueued_at),
            confirmed: self.confirmed,
        })
    }
}
