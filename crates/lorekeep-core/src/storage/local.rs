//! SQLite-backed local store
//!
//! Every write runs inside [`SqliteStore::write`]: one IMMEDIATE transaction
//! in which the caller puts/deletes entities and appends the matching pending
//! operations. Either everything commits or nothing does.
//!
//! ## Multiple instances
//!
//! Separate processes may open the same database. Each committed write bumps
//! `write_version`; a store whose last observed version no longer matches
//! refuses to write with [`StoreError::VersionConflict`] until it is reloaded.
//! This surfaces the conflict instead of silently interleaving writers.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use super::error::{StoreError, StoreResult};
use super::schema::{get_write_version, init_schema, needs_init, set_write_version};
use super::EntityStore;
use crate::config::Config;
use crate::models::{Collection, Entity, EntityId, Record, ValidationError};
use crate::now_ms;
use crate::queue::PendingLog;

/// Durable local store
pub struct SqliteStore {
    conn: Connection,
    /// Write version observed at open or at our last commit
    seen_version: i64,
}

impl SqliteStore {
    /// Open or create the database in the configured data directory
    pub fn open(config: &Config) -> StoreResult<Self> {
        Self::open_path(&config.sqlite_path())
    }

    /// Open or create the database at `path`
    pub fn open_path(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        if needs_init(&conn) {
            init_schema(&conn)?;
        }
        let seen_version = get_write_version(&conn)?;
        Ok(Self { conn, seen_version })
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Write version this handle last observed
    pub fn write_version(&self) -> i64 {
        self.seen_version
    }

    /// Whether another instance has committed since we last looked
    pub fn is_outdated(&self) -> StoreResult<bool> {
        Ok(get_write_version(&self.conn)? != self.seen_version)
    }

    /// Accept writes made by other instances
    pub fn reload(&mut self) -> StoreResult<i64> {
        let current = get_write_version(&self.conn)?;
        if current != self.seen_version {
            debug!(
                from = self.seen_version,
                to = current,
                "Reloaded store after external writes"
            );
        }
        self.seen_version = current;
        Ok(current)
    }

    /// Run `f` in one write transaction
    ///
    /// The transaction commits only if `f` succeeds; any error rolls back
    /// every entity write and queue append made inside it.
    pub fn write<T>(
        &mut self,
        f: impl FnOnce(&mut WriteTx<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let expected = self.seen_version;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let found = get_write_version(&tx)?;
        if found != expected {
            warn!(expected, found, "Refusing write: store changed by another instance");
            return Err(StoreError::VersionConflict { expected, found });
        }

        let mut write = WriteTx { tx, now: now_ms() };
        let value = f(&mut write)?;

        let WriteTx { tx, .. } = write;
        set_write_version(&tx, found + 1)?;
        tx.commit()?;
        self.seen_version = found + 1;
        Ok(value)
    }

    /// Number of entities in a collection
    pub fn count(&self, collection: Collection) -> StoreResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE collection = ?1",
            params![collection.as_str()],
            |row| row.get(0),
        )?)
    }
}

impl EntityStore for SqliteStore {
    fn get(&self, collection: Collection, id: EntityId) -> StoreResult<Option<Entity>> {
        get_entity(&self.conn, collection, id)
    }

    fn put(&mut self, entity: &Entity) -> StoreResult<()> {
        self.write(|tx| tx.put(entity))
    }

    fn delete(&mut self, collection: Collection, id: EntityId) -> StoreResult<bool> {
        self.write(|tx| tx.delete(collection, id))
    }

    fn list(&self, collection: Collection) -> StoreResult<Vec<Entity>> {
        list_entities(&self.conn, collection)
    }

    fn next_id(&self, collection: Collection) -> StoreResult<EntityId> {
        next_entity_id(&self.conn, collection)
    }
}

/// An open write transaction
pub struct WriteTx<'a> {
    tx: Transaction<'a>,
    now: i64,
}

impl WriteTx<'_> {
    /// Connection view of the transaction, for log and sync-base helpers
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    /// Commit timestamp shared by every row written in this transaction
    pub fn now(&self) -> i64 {
        self.now
    }

    /// The pending-operation log, inside this transaction
    pub fn log(&self) -> PendingLog<'_> {
        PendingLog::new(&self.tx)
    }
}

impl EntityStore for WriteTx<'_> {
    fn get(&self, collection: Collection, id: EntityId) -> StoreResult<Option<Entity>> {
        get_entity(&self.tx, collection, id)
    }

    fn put(&mut self, entity: &Entity) -> StoreResult<()> {
        entity.validate()?;
        let body = serde_json::to_string(&entity.record)?;
        self.tx.execute(
            "INSERT INTO entities (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![entity.collection().as_str(), entity.id.0, body, self.now],
        )?;
        Ok(())
    }

    fn delete(&mut self, collection: Collection, id: EntityId) -> StoreResult<bool> {
        let removed = self.tx.execute(
            "DELETE FROM entities WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.0],
        )?;
        Ok(removed > 0)
    }

    fn list(&self, collection: Collection) -> StoreResult<Vec<Entity>> {
        list_entities(&self.tx, collection)
    }

    fn next_id(&self, collection: Collection) -> StoreResult<EntityId> {
        next_entity_id(&self.tx, collection)
    }
}

fn get_entity(conn: &Connection, collection: Collection, id: EntityId) -> StoreResult<Option<Entity>> {
    let body: Option<String> = conn
        .prepare_cached("SELECT body FROM entities WHERE collection = ?1 AND id = ?2")?
        .query_row(params![collection.as_str(), id.0], |row| row.get(0))
        .optional()?;

    body.map(|body| decode_entity(collection, id, &body)).transpose()
}

fn list_entities(conn: &Connection, collection: Collection) -> StoreResult<Vec<Entity>> {
    let mut stmt =
        conn.prepare_cached("SELECT id, body FROM entities WHERE collection = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![collection.as_str()], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut entities = Vec::new();
    for row in rows {
        let (id, body) = row?;
        entities.push(decode_entity(collection, EntityId(id), &body)?);
    }
    Ok(entities)
}

fn next_entity_id(conn: &Connection, collection: Collection) -> StoreResult<EntityId> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(id), 0) + 1 FROM entities WHERE collection = ?1",
        params![collection.as_str()],
        |row| row.get(0),
    )?;
    Ok(EntityId(next))
}

/// Decode a stored record body and check it belongs to `collection`
pub(crate) fn decode_entity(collection: Collection, id: EntityId, body: &str) -> StoreResult<Entity> {
    let record: Record = serde_json::from_str(body).map_err(|e| StoreError::Corrupt {
        what: "entity",
        details: format!("{} {}: {}", collection, id, e),
    })?;
    if record.collection() != collection {
        return Err(ValidationError::WrongCollection {
            expected: collection,
            found: record.collection(),
        }
        .into());
    }
    Ok(Entity::new(id, record))
}
