//! Sync state persistence
//!
//! Stores, per entity, the last copy both sides agreed on (the sync base), plus
//! bookkeeping such as the last successful sync time. A side "changed since the
//! last sync" when its copy differs from the base.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::from_ms;
use crate::models::{Collection, Entity, EntityId, EntityKey};
use crate::storage::local::decode_entity;
use crate::storage::StoreResult;

const LAST_SYNC_AT: &str = "last_sync_at";
const REMOTE_IDENTITY: &str = "remote_identity";

/// Sync bookkeeping over a connection or open transaction
pub struct SyncState<'c> {
    conn: &'c Connection,
}

impl<'c> SyncState<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Every base snapshot
    pub fn load_base(&self) -> StoreResult<BTreeMap<EntityKey, Entity>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT collection, id, body FROM sync_base")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut base = BTreeMap::new();
        for row in rows {
            let (collection, id, body) = row?;
            let collection: Collection = collection.parse()?;
            let entity = decode_entity(collection, EntityId(id), &body)?;
            base.insert(entity.key(), entity);
        }
        Ok(base)
    }

    pub fn base(&self, key: &EntityKey) -> StoreResult<Option<Entity>> {
        let body: Option<String> = self
            .conn
            .prepare_cached("SELECT body FROM sync_base WHERE collection = ?1 AND id = ?2")?
            .query_row(params![key.0.as_str(), key.1 .0], |row| row.get(0))
            .optional()?;
        body.map(|body| decode_entity(key.0, key.1, &body)).transpose()
    }

    /// Record `entity` as the agreed copy
    pub fn set_base(&self, entity: &Entity, now: i64) -> StoreResult<()> {
        let body = serde_json::to_string(&entity.record)?;
        self.conn.execute(
            "INSERT INTO sync_base (collection, id, body, synced_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET body = excluded.body, synced_at = excluded.synced_at",
            params![entity.collection().as_str(), entity.id.0, body, now],
        )?;
        Ok(())
    }

    /// Forget the agreed copy (entity deleted on both sides)
    pub fn clear_base(&self, key: &EntityKey) -> StoreResult<bool> {
        Ok(self.conn.execute(
            "DELETE FROM sync_base WHERE collection = ?1 AND id = ?2",
            params![key.0.as_str(), key.1 .0],
        )? > 0)
    }

    pub fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Time of the last push pass that finished without transient failures
    pub fn last_sync_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .get_meta(LAST_SYNC_AT)?
            .and_then(|v| v.parse::<i64>().ok())
            .map(from_ms))
    }

    pub fn set_last_sync_at(&self, now: i64) -> StoreResult<()> {
        self.set_meta(LAST_SYNC_AT, &now.to_string())
    }

    /// Identity this store presents to the remote
    ///
    /// Stores `fresh` only when no identity exists yet. Concurrent first
    /// opens agree on whichever insert landed first.
    pub fn remote_identity(&self, fresh: impl FnOnce() -> String) -> StoreResult<String> {
        if let Some(identity) = self.get_meta(REMOTE_IDENTITY)? {
            return Ok(identity);
        }
        let fresh = fresh();
        self.conn.execute(
            "INSERT OR IGNORE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![REMOTE_IDENTITY, fresh],
        )?;
        Ok(self.get_meta(REMOTE_IDENTITY)?.unwrap_or(fresh))
    }
}
