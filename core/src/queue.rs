//! Durable client-side queue of mutations awaiting server confirmation.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use crate::models::{DroppedMutation, MutationPayload, QueuedMutation, RejectReason};

/// Largest encoded payload the queue accepts. The server's request body limit is larger.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("mutation id '{0}' is already queued or was previously removed")]
    DuplicateId(String),
    #[error("failed to encode queued mutation: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("mutation is {size} bytes; at most {limit} can be queued")]
    TooLarge { size: usize, limit: usize },
}

/// Storage port behind [`MutationQueue`]. Each call is atomic on its own.
pub trait QueueStore: Send {
    /// Insert a new record. Ids that are live or were ever removed are refused.
    fn put(&mut self, item: &QueuedMutation) -> Result<(), QueueError>;
    /// All live records ordered by `created_at`, then `id`.
    fn get_all(&self) -> Result<Vec<QueuedMutation>, QueueError>;
    /// Remove a record, returning whether it existed.
    fn delete(&mut self, id: &str) -> Result<bool, QueueError>;
    fn count(&self) -> Result<usize, QueueError>;
    /// Move a live record to the dead-letter list.
    fn put_dropped(&mut self, dropped: &DroppedMutation) -> Result<(), QueueError>;
    fn get_dropped(&self) -> Result<Vec<DroppedMutation>, QueueError>;
    /// Claim the drain lease for `holder` unless another holder has an unexpired claim.
    fn try_acquire_lease(
        &mut self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, QueueError>;
    fn release_lease(&mut self, holder: &str) -> Result<(), QueueError>;
}

fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
}

// --- SQLite store ---

/// Queue persisted in its own SQLite file, separate from any other app data.
pub struct SqliteQueueStore {
    conn: Connection,
}

impl SqliteQueueStore {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = SqliteQueueStore { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteQueueStore { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), QueueError> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS queue_mutations (
                    id TEXT PRIMARY KEY,
                    created_at_us INTEGER NOT NULL,
                    payload TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_queue_mutations_order
                    ON queue_mutations(created_at_us, id);

                CREATE TABLE IF NOT EXISTS queue_tombstones (
                    id TEXT PRIMARY KEY,
                    removed_at_us INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS dropped_mutations (
                    id TEXT PRIMARY KEY,
                    created_at_us INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    message TEXT NOT NULL,
                    dropped_at_us INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS drain_lease (
                    name TEXT PRIMARY KEY CHECK (name = 'drain'),
                    holder TEXT NOT NULL,
                    expires_at_us INTEGER NOT NULL
                );

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    fn timestamp(column: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::from_timestamp_micros(micros)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, micros))
    }

    fn payload(column: usize, text: &str) -> rusqlite::Result<MutationPayload> {
        serde_json::from_str(text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
    }

    // --- Row mapping helpers ---

    fn queued_from_row(row: &rusqlite::Row) -> rusqlite::Result<QueuedMutation> {
        let payload: String = row.get(2)?;
        Ok(QueuedMutation {
            id: row.get(0)?,
            created_at: Self::timestamp(1, row.get(1)?)?,
            payload: Self::payload(2, &payload)?,
        })
    }

    // Columns: 0 id, 1 created_at_us, 2 payload, 3 reason, 4 message, 5 dropped_at_us
    fn dropped_from_row(row: &rusqlite::Row) -> rusqlite::Result<DroppedMutation> {
        let reason: String = row.get(3)?;
        let reason = reason.parse::<RejectReason>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?;
        Ok(DroppedMutation {
            mutation: Self::queued_from_row(row)?,
            reason,
            message: row.get(4)?,
            dropped_at: Self::timestamp(5, row.get(5)?)?,
        })
    }

    fn is_known_id(&self, id: &str) -> Result<bool, QueueError> {
        let known: i64 = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM queue_mutations WHERE id = ?1)
                  + (SELECT COUNT(*) FROM queue_tombstones WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(known > 0)
    }
}

impl QueueStore for SqliteQueueStore {
    fn put(&mut self, item: &QueuedMutation) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&item.payload)?;
        let tx = self.conn.unchecked_transaction()?;
        if self.is_known_id(&item.id)? {
            return Err(QueueError::DuplicateId(item.id.clone()));
        }
        tx.execute(
            "INSERT INTO queue_mutations (id, created_at_us, payload) VALUES (?1, ?2, ?3)",
            params![item.id, item.created_at.timestamp_micros(), payload],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<QueuedMutation>, QueueError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at_us, payload FROM queue_mutations ORDER BY created_at_us, id",
        )?;
        let items = stmt
            .query_map([], Self::queued_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn delete(&mut self, id: &str) -> Result<bool, QueueError> {
        let tx = self.conn.unchecked_transaction()?;
        let rows = tx.execute("DELETE FROM queue_mutations WHERE id = ?1", params![id])?;
        if rows > 0 {
            tx.execute(
                "INSERT OR IGNORE INTO queue_tombstones (id, removed_at_us) VALUES (?1, ?2)",
                params![id, Utc::now().timestamp_micros()],
            )?;
        }
        tx.commit()?;
        Ok(rows > 0)
    }

    fn count(&self) -> Result<usize, QueueError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM queue_mutations", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn put_dropped(&mut self, dropped: &DroppedMutation) -> Result<(), QueueError> {
        let item = &dropped.mutation;
        let payload = serde_json::to_string(&item.payload)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM queue_mutations WHERE id = ?1", params![item.id])?;
        tx.execute(
            "INSERT OR IGNORE INTO queue_tombstones (id, removed_at_us) VALUES (?1, ?2)",
            params![item.id, dropped.dropped_at.timestamp_micros()],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO dropped_mutations
                (id, created_at_us, payload, reason, message, dropped_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.id,
                item.created_at.timestamp_micros(),
                payload,
                dropped.reason.as_str(),
                dropped.message,
                dropped.dropped_at.timestamp_micros(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_dropped(&self) -> Result<Vec<DroppedMutation>, QueueError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at_us, payload, reason, message, dropped_at_us
             FROM dropped_mutations ORDER BY dropped_at_us, id",
        )?;
        let items = stmt
            .query_map([], Self::dropped_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn try_acquire_lease(
        &mut self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, QueueError> {
        // Take the write lock up front so two processes cannot both read an empty lease.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(String, i64)> = tx
            .query_row(
                "SELECT holder, expires_at_us FROM drain_lease WHERE name = 'drain'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((other, expires_at_us)) = current {
            if other != holder && expires_at_us > now.timestamp_micros() {
                return Ok(false);
            }
        }
        tx.execute(
            "INSERT INTO drain_lease (name, holder, expires_at_us) VALUES ('drain', ?1, ?2)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at_us = excluded.expires_at_us",
            params![holder, lease_expiry(now, ttl).timestamp_micros()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn release_lease(&mut self, holder: &str) -> Result<(), QueueError> {
        self.conn.execute(
            "DELETE FROM drain_lease WHERE name = 'drain' AND holder = ?1",
            params![holder],
        )?;
        Ok(())
    }
}

// --- In-memory store ---

/// Non-durable store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    items: BTreeMap<(DateTime<Utc>, String), QueuedMutation>,
    removed: HashSet<String>,
    dropped: Vec<DroppedMutation>,
    lease: Option<(String, DateTime<Utc>)>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_live(&mut self, id: &str) -> bool {
        let key = self.items.keys().find(|(_, k)| k == id).cloned();
        match key {
            Some(key) => {
                self.items.remove(&key);
                self.removed.insert(id.to_string());
                true
            }
            None => false,
        }
    }
}

impl QueueStore for MemoryQueueStore {
    fn put(&mut self, item: &QueuedMutation) -> Result<(), QueueError> {
        let live = self.items.keys().any(|(_, id)| *id == item.id);
        if live || self.removed.contains(&item.id) {
            return Err(QueueError::DuplicateId(item.id.clone()));
        }
        self.items
            .insert((item.created_at, item.id.clone()), item.clone());
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<QueuedMutation>, QueueError> {
        Ok(self.items.values().cloned().collect())
    }

    fn delete(&mut self, id: &str) -> Result<bool, QueueError> {
        Ok(self.remove_live(id))
    }

    fn count(&self) -> Result<usize, QueueError> {
        Ok(self.items.len())
    }

    fn put_dropped(&mut self, dropped: &DroppedMutation) -> Result<(), QueueError> {
        self.remove_live(&dropped.mutation.id);
        self.removed.insert(dropped.mutation.id.clone());
        self.dropped.push(dropped.clone());
        Ok(())
    }

    fn get_dropped(&self) -> Result<Vec<DroppedMutation>, QueueError> {
        Ok(self.dropped.clone())
    }

    fn try_acquire_lease(
        &mut self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, QueueError> {
        if let Some((other, expires_at)) = &self.lease {
            if other != holder && *expires_at > now {
                return Ok(false);
            }
        }
        self.lease = Some((holder.to_string(), lease_expiry(now, ttl)));
        Ok(true)
    }

    fn release_lease(&mut self, holder: &str) -> Result<(), QueueError> {
        if self.lease.as_ref().is_some_and(|(h, _)| h == holder) {
            self.lease = None;
        }
        Ok(())
    }
}

// --- Queue facade ---

/// Thread-safe handle over a [`QueueStore`].
///
/// Every method is atomic on its own; sequences such as list-then-remove are not.
/// Use the drain lease to keep several processes from draining the same store.
pub struct MutationQueue {
    store: Mutex<Box<dyn QueueStore>>,
}

impl MutationQueue {
    pub fn new(store: impl QueueStore + 'static) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
        }
    }

    /// Open (or create) the durable queue at `path`.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        Ok(Self::new(SqliteQueueStore::open(path)?))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryQueueStore::new())
    }

    fn store(&self) -> MutexGuard<'_, Box<dyn QueueStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `payload` under a fresh time-ordered id. The record is durable once this returns.
    pub fn enqueue(&self, payload: MutationPayload) -> Result<QueuedMutation, QueueError> {
        let size = serde_json::to_vec(&payload)?.len();
        if size > MAX_PAYLOAD_BYTES {
            return Err(QueueError::TooLarge {
                size,
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        let now = Utc::now();
        // Stored at microsecond precision; truncate so the returned record matches a reload.
        let created_at = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        let item = QueuedMutation {
            id: Uuid::now_v7().to_string(),
            created_at,
            payload,
        };
        self.store().put(&item)?;
        tracing::debug!(
            id = %item.id,
            entity = %item.payload.entity,
            op = %item.payload.op,
            "enqueued mutation"
        );
        Ok(item)
    }

    pub fn list_all(&self) -> Result<Vec<QueuedMutation>, QueueError> {
        self.store().get_all()
    }

    /// Remove a confirmed record. Unknown ids are a no-op.
    pub fn remove_by_id(&self, id: &str) -> Result<bool, QueueError> {
        let removed = self.store().delete(id)?;
        tracing::debug!(id, removed, "removed queued mutation");
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize, QueueError> {
        self.store().count()
    }

    /// Explicit user discard of a pending record.
    pub fn discard(&self, id: &str) -> Result<bool, QueueError> {
        let removed = self.store().delete(id)?;
        if removed {
            tracing::info!(id, "discarded queued mutation");
        }
        Ok(removed)
    }

    /// Move a permanently rejected record to the dead-letter list.
    pub fn drop_rejected(
        &self,
        mutation: QueuedMutation,
        reason: RejectReason,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<DroppedMutation, QueueError> {
        let dropped = DroppedMutation {
            mutation,
            reason,
            message,
            dropped_at: now,
        };
        self.store().put_dropped(&dropped)?;
        tracing::warn!(
            id = %dropped.mutation.id,
            reason = %dropped.reason,
            message = %dropped.message,
            "dropped rejected mutation"
        );
        Ok(dropped)
    }

    pub fn dropped(&self) -> Result<Vec<DroppedMutation>, QueueError> {
        self.store().get_dropped()
    }

    pub fn try_acquire_lease(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, QueueError> {
        self.store().try_acquire_lease(holder, now, ttl)
    }

    pub fn release_lease(&self, holder: &str) -> Result<(), QueueError> {
        self.store().release_lease(holder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;
    use serde_json::{Map, json};

    fn feeding(amount: u32) -> MutationPayload {
        let value = json!({
            "kind": "bottle",
            "started_at": "2025-03-01T08:00:00Z",
            "amount_ml": amount
        });
        let serde_json::Value::Object(fields) = value else {
            unreachable!()
        };
        MutationPayload::create(EntityType::Feeding, None, fields)
    }

    fn item(id: &str, created_at: &str) -> QueuedMutation {
        QueuedMutation {
            id: id.to_string(),
            created_at: DateTime::parse_from_rfc3339(created_at)
                .unwrap()
                .with_timezone(&Utc),
            payload: MutationPayload::delete(EntityType::Diaper, "x"),
        }
    }

    fn stores() -> Vec<MutationQueue> {
        vec![
            MutationQueue::in_memory(),
            MutationQueue::new(SqliteQueueStore::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn test_enqueue_then_remove_restores_count() {
        for queue in stores() {
            queue.enqueue(feeding(60)).unwrap();
            let before = queue.count().unwrap();
            let item = queue.enqueue(feeding(90)).unwrap();
            assert_eq!(queue.count().unwrap(), before + 1);
            assert!(queue.remove_by_id(&item.id).unwrap());
            assert_eq!(queue.count().unwrap(), before);
        }
    }

    #[test]
    fn test_oversized_payload_is_refused() {
        for queue in stores() {
            let mut payload = feeding(60);
            payload
                .fields
                .insert("note".to_string(), json!("x".repeat(MAX_PAYLOAD_BYTES)));
            let err = queue.enqueue(payload).unwrap_err();
            assert!(matches!(err, QueueError::TooLarge { limit: MAX_PAYLOAD_BYTES, .. }));
            assert_eq!(queue.count().unwrap(), 0);
        }
    }

    #[test]
    fn test_list_all_in_insertion_order() {
        for queue in stores() {
            let ids: Vec<String> = (0..5)
                .map(|i| queue.enqueue(feeding(10 * (i + 1))).unwrap().id)
                .collect();
            let listed: Vec<String> = queue.list_all().unwrap().into_iter().map(|m| m.id).collect();
            assert_eq!(listed, ids);
            assert_eq!(queue.count().unwrap(), listed.len());
        }
    }

    #[test]
    fn test_list_all_sorted_by_created_at_then_id() {
        let mut memory = MemoryQueueStore::new();
        let mut sqlite = SqliteQueueStore::open_in_memory().unwrap();
        let items = [
            item("c", "2025-03-01T08:00:02Z"),
            item("b", "2025-03-01T08:00:01Z"),
            item("a", "2025-03-01T08:00:02Z"),
        ];
        for store in [&mut memory as &mut dyn QueueStore, &mut sqlite] {
            for it in &items {
                store.put(it).unwrap();
            }
            let ids: Vec<String> = store.get_all().unwrap().into_iter().map(|m| m.id).collect();
            assert_eq!(ids, vec!["b", "a", "c"]);
        }
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        for queue in stores() {
            queue.enqueue(feeding(60)).unwrap();
            assert!(!queue.remove_by_id("does-not-exist").unwrap());
            assert_eq!(queue.count().unwrap(), 1);
        }
    }

    #[test]
    fn test_removed_id_cannot_be_reinserted() {
        let mut memory = MemoryQueueStore::new();
        let mut sqlite = SqliteQueueStore::open_in_memory().unwrap();
        for store in [&mut memory as &mut dyn QueueStore, &mut sqlite] {
            let it = item("m1", "2025-03-01T08:00:00Z");
            store.put(&it).unwrap();
            assert!(matches!(store.put(&it), Err(QueueError::DuplicateId(_))));
            assert!(store.delete("m1").unwrap());
            assert!(matches!(store.put(&it), Err(QueueError::DuplicateId(id)) if id == "m1"));
            assert_eq!(store.count().unwrap(), 0);
        }
    }

    #[test]
    fn test_enqueued_record_round_trips_payload() {
        for queue in stores() {
            let item = queue.enqueue(feeding(120)).unwrap();
            let listed = queue.list_all().unwrap();
            assert_eq!(listed, vec![item]);
        }
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let first = {
            let queue = MutationQueue::open(&path).unwrap();
            let first = queue.enqueue(feeding(60)).unwrap();
            queue.enqueue(feeding(90)).unwrap();
            first
        };

        let queue = MutationQueue::open(&path).unwrap();
        let items = queue.list_all().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], first);
        assert_eq!(items[1].payload.fields["amount_ml"], json!(90));
    }

    #[test]
    fn test_drop_rejected_moves_to_dead_letter() {
        for queue in stores() {
            let keep = queue.enqueue(feeding(60)).unwrap();
            let bad = queue.enqueue(feeding(0)).unwrap();
            let dropped = queue
                .drop_rejected(bad.clone(), RejectReason::Validation, "amount_ml must be greater than 0".into(), Utc::now())
                .unwrap();
            assert_eq!(dropped.mutation, bad);

            let ids: Vec<String> = queue.list_all().unwrap().into_iter().map(|m| m.id).collect();
            assert_eq!(ids, vec![keep.id]);
            let dead = queue.dropped().unwrap();
            assert_eq!(dead.len(), 1);
            assert_eq!(dead[0].reason, RejectReason::Validation);
            assert_eq!(dead[0].mutation.id, bad.id);
        }
    }

    #[test]
    fn test_discard() {
        for queue in stores() {
            let item = queue.enqueue(feeding(60)).unwrap();
            assert!(queue.discard(&item.id).unwrap());
            assert!(!queue.discard(&item.id).unwrap());
            assert_eq!(queue.count().unwrap(), 0);
            assert!(queue.dropped().unwrap().is_empty());
        }
    }

    #[test]
    fn test_lease_excludes_other_holders_until_expiry() {
        let ttl = Duration::from_secs(60);
        let t0 = Utc::now();
        for queue in stores() {
            assert!(queue.try_acquire_lease("a", t0, ttl).unwrap());
            assert!(!queue.try_acquire_lease("b", t0, ttl).unwrap());
            // Re-entrant for the same holder.
            assert!(queue.try_acquire_lease("a", t0, ttl).unwrap());
            // Expired claims can be taken over.
            let later = t0 + chrono::Duration::seconds(61);
            assert!(queue.try_acquire_lease("b", later, ttl).unwrap());
            queue.release_lease("a").unwrap();
            assert!(!queue.try_acquire_lease("a", later, ttl).unwrap());
            queue.release_lease("b").unwrap();
            assert!(queue.try_acquire_lease("a", later, ttl).unwrap());
        }
    }

    #[test]
    fn test_lease_shared_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let one = MutationQueue::open(&path).unwrap();
        let two = MutationQueue::open(&path).unwrap();
        let now = Utc::now();
        let ttl = Duration::from_secs(120);
        assert!(one.try_acquire_lease("one", now, ttl).unwrap());
        assert!(!two.try_acquire_lease("two", now, ttl).unwrap());
        one.release_lease("one").unwrap();
        assert!(two.try_acquire_lease("two", now, ttl).unwrap());
    }

    #[test]
    fn test_empty_fields_serialize() {
        let queue = MutationQueue::new(SqliteQueueStore::open_in_memory().unwrap());
        let item = queue
            .enqueue(MutationPayload::create(EntityType::Sleep, Some("s1".into()), Map::new()))
            .unwrap();
        assert_eq!(queue.list_all().unwrap()[0], item);
    }
}
