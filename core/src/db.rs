use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{
    Baby, Caller, CaregiverRole, EntityType, LogEntry, Operation, QueuedMutation, merge_fields,
    validate_entity_fields, validate_mutation,
};

/// Server-side store: callers, babies, caregiver links, log entries and rate-limit counters.
pub struct Database {
    conn: Connection,
}

/// A mutation id the server has already committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMutation {
    pub mutation_id: String,
    pub caller_id: String,
    pub baby_id: String,
    pub entity_id: String,
    pub applied_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { entity_id: String },
    /// Nothing was written; the message says why.
    Invalid(String),
    /// The target entry exists but belongs to a different baby.
    Forbidden(String),
}

fn foreign_entry(existing: Option<&LogEntry>, baby_id: &str) -> Option<String> {
    existing
        .filter(|e| e.baby_id != baby_id)
        .map(|e| format!("Entry {} belongs to another baby", e.id))
}

/// Hex SHA-256 of an access token. Only the hash is stored.
#[must_use]
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS callers (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    token_sha256 TEXT NOT NULL UNIQUE,
                    active_baby_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS babies (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    birth_date TEXT,
                    sex TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS caregiver_links (
                    caller_id TEXT NOT NULL REFERENCES callers(id) ON DELETE CASCADE,
                    baby_id TEXT NOT NULL REFERENCES babies(id) ON DELETE CASCADE,
                    role TEXT NOT NULL CHECK (role IN ('owner', 'caregiver', 'viewer')),
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (caller_id, baby_id)
                );

                CREATE TABLE IF NOT EXISTS log_entries (
                    id TEXT PRIMARY KEY,
                    baby_id TEXT NOT NULL REFERENCES babies(id) ON DELETE CASCADE,
                    entity TEXT NOT NULL,
                    fields TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_log_entries_baby ON log_entries(baby_id, entity);

                CREATE TABLE IF NOT EXISTS applied_mutations (
                    mutation_id TEXT PRIMARY KEY,
                    caller_id TEXT NOT NULL,
                    baby_id TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS rate_limits (
                    key TEXT NOT NULL,
                    window_start INTEGER NOT NULL,
                    count INTEGER NOT NULL,
                    PRIMARY KEY (key, window_start)
                );
                CREATE INDEX IF NOT EXISTS idx_rate_limits_window ON rate_limits(window_start);

                PRAGMA user_version = 1;",
            )?;
        }

        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    // --- Row mapping helpers ---

    fn caller_from_row(row: &rusqlite::Row) -> rusqlite::Result<Caller> {
        Ok(Caller {
            id: row.get(0)?,
            name: row.get(1)?,
            active_baby_id: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn baby_from_row(row: &rusqlite::Row) -> rusqlite::Result<Baby> {
        let birth_date: Option<String> = row.get(2)?;
        Ok(Baby {
            id: row.get(0)?,
            name: row.get(1)?,
            birth_date: birth_date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
            sex: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn text_error(column: usize, e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, e.into())
    }

    // Columns: 0 id, 1 baby_id, 2 entity, 3 fields, 4 created_by, 5 created_at, 6 updated_at
    fn log_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<LogEntry> {
        let entity: String = row.get(2)?;
        let fields: String = row.get(3)?;
        Ok(LogEntry {
            id: row.get(0)?,
            baby_id: row.get(1)?,
            entity: entity
                .parse::<EntityType>()
                .map_err(|e| Self::text_error(2, e))?,
            fields: serde_json::from_str(&fields).map_err(|e| Self::text_error(3, e))?,
            created_by: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    // --- Callers ---

    /// Register a caller identified by `token`. The token itself is never stored.
    pub fn create_caller(&self, name: &str, token: &str) -> Result<Caller> {
        if name.trim().is_empty() {
            bail!("Caller name must not be empty");
        }
        if token.len() < 16 {
            bail!("Access token must be at least 16 characters");
        }
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO callers (id, name, token_sha256, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, name.trim(), hash_token(token), now],
            )
            .context("Failed to create caller")?;
        self.get_caller(&id)
    }

    pub fn get_caller(&self, id: &str) -> Result<Caller> {
        self.conn
            .query_row(
                "SELECT id, name, active_baby_id, created_at FROM callers WHERE id = ?1",
                params![id],
                Self::caller_from_row,
            )
            .context("Caller not found")
    }

    pub fn find_caller_by_token(&self, token: &str) -> Result<Option<Caller>> {
        let caller = self
            .conn
            .query_row(
                "SELECT id, name, active_baby_id, created_at FROM callers WHERE token_sha256 = ?1",
                params![hash_token(token)],
                Self::caller_from_row,
            )
            .optional()?;
        Ok(caller)
    }

    pub fn list_callers(&self) -> Result<Vec<Caller>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, active_baby_id, created_at FROM callers ORDER BY created_at, id",
        )?;
        let callers = stmt
            .query_map([], Self::caller_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(callers)
    }

    // --- Babies & caregivers ---

    /// Create a baby profile owned by `owner_id`.
    pub fn create_baby(
        &self,
        owner_id: &str,
        name: &str,
        birth_date: Option<NaiveDate>,
        sex: Option<&str>,
    ) -> Result<Baby> {
        if name.trim().is_empty() {
            bail!("Baby name must not be empty");
        }
        self.get_caller(owner_id)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO babies (id, name, birth_date, sex, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                name.trim(),
                birth_date.map(|d| d.format("%Y-%m-%d").to_string()),
                sex,
                now
            ],
        )?;
        tx.execute(
            "INSERT INTO caregiver_links (caller_id, baby_id, role, created_at) VALUES (?1, ?2, 'owner', ?3)",
            params![owner_id, id, now],
        )?;
        tx.commit()?;
        self.get_baby(&id)?.context("Baby not found after insert")
    }

    pub fn get_baby(&self, id: &str) -> Result<Option<Baby>> {
        let baby = self
            .conn
            .query_row(
                "SELECT id, name, birth_date, sex, created_at FROM babies WHERE id = ?1",
                params![id],
                Self::baby_from_row,
            )
            .optional()?;
        Ok(baby)
    }

    /// Grant (or change) a caller's role on a baby.
    pub fn link_caregiver(&self, caller_id: &str, baby_id: &str, role: CaregiverRole) -> Result<()> {
        self.get_caller(caller_id)?;
        if self.get_baby(baby_id)?.is_none() {
            bail!("Baby not found: {baby_id}");
        }
        self.conn.execute(
            "INSERT INTO caregiver_links (caller_id, baby_id, role, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(caller_id, baby_id) DO UPDATE SET role = excluded.role",
            params![caller_id, baby_id, role.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn caregiver_role(&self, caller_id: &str, baby_id: &str) -> Result<Option<CaregiverRole>> {
        let role: Option<String> = self
            .conn
            .query_row(
                "SELECT role FROM caregiver_links WHERE caller_id = ?1 AND baby_id = ?2",
                params![caller_id, baby_id],
                |row| row.get(0),
            )
            .optional()?;
        role.map(|r| r.parse::<CaregiverRole>()).transpose()
    }

    /// Babies the caller can see, with the caller's role on each.
    pub fn linked_babies(&self, caller_id: &str) -> Result<Vec<(Baby, CaregiverRole)>> {
        let mut stmt = self.conn.prepare(
            "SELECT b.id, b.name, b.birth_date, b.sex, b.created_at, l.role
             FROM caregiver_links l
             JOIN babies b ON b.id = l.baby_id
             WHERE l.caller_id = ?1
             ORDER BY b.created_at, b.id",
        )?;
        let rows = stmt
            .query_map(params![caller_id], |row| {
                Ok((Self::baby_from_row(row)?, row.get::<_, String>(5)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(baby, role)| Ok((baby, role.parse::<CaregiverRole>()?)))
            .collect()
    }

    pub fn set_active_baby(&self, caller_id: &str, baby_id: &str) -> Result<()> {
        if self.caregiver_role(caller_id, baby_id)?.is_none() {
            bail!("Caller has no access to baby {baby_id}");
        }
        self.conn.execute(
            "UPDATE callers SET active_baby_id = ?1 WHERE id = ?2",
            params![baby_id, caller_id],
        )?;
        Ok(())
    }

    // --- Log entries ---

    pub fn get_entry(&self, id: &str) -> Result<Option<LogEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT id, baby_id, entity, fields, created_by, created_at, updated_at
                 FROM log_entries WHERE id = ?1",
                params![id],
                Self::log_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn list_entries(
        &self,
        baby_id: &str,
        entity: Option<EntityType>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, baby_id, entity, fields, created_by, created_at, updated_at
             FROM log_entries
             WHERE baby_id = ?1 AND (?2 IS NULL OR entity = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let entries = stmt
            .query_map(
                params![baby_id, entity.map(EntityType::as_str), limit],
                Self::log_entry_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // --- Mutations ---

    pub fn get_applied_mutation(&self, mutation_id: &str) -> Result<Option<AppliedMutation>> {
        let applied = self
            .conn
            .query_row(
                "SELECT mutation_id, caller_id, baby_id, entity_id, applied_at
                 FROM applied_mutations WHERE mutation_id = ?1",
                params![mutation_id],
                |row| {
                    Ok(AppliedMutation {
                        mutation_id: row.get(0)?,
                        caller_id: row.get(1)?,
                        baby_id: row.get(2)?,
                        entity_id: row.get(3)?,
                        applied_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(applied)
    }

    /// Validate and commit one mutation against `baby_id` in a single transaction,
    /// recording its id so replays can be recognised.
    pub fn apply_mutation(
        &self,
        caller_id: &str,
        baby_id: &str,
        mutation: &QueuedMutation,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let payload = &mutation.payload;
        if let Err(e) = validate_mutation(payload) {
            return Ok(ApplyOutcome::Invalid(e.to_string()));
        }

        let now = now.to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;

        let existing = match &payload.target_id {
            Some(id) => self.get_entry(id)?,
            None => None,
        };

        let entity_id = match payload.op {
            Operation::Create => {
                if existing.is_some() {
                    return Ok(ApplyOutcome::Invalid("Entry already exists".to_string()));
                }
                let id = payload
                    .target_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                tx.execute(
                    "INSERT INTO log_entries (id, baby_id, entity, fields, created_by, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id,
                        baby_id,
                        payload.entity.as_str(),
                        serde_json::to_string(&payload.fields)?,
                        caller_id,
                        now,
                        now
                    ],
                )?;
                id
            }
            Operation::Update => {
                if let Some(message) = foreign_entry(existing.as_ref(), baby_id) {
                    return Ok(ApplyOutcome::Forbidden(message));
                }
                let Some(entry) = existing.filter(|e| e.entity == payload.entity) else {
                    return Ok(ApplyOutcome::Invalid(format!(
                        "No {} entry with that id",
                        payload.entity
                    )));
                };
                let mut fields: Map<String, Value> = entry.fields;
                merge_fields(&mut fields, &payload.fields);
                if let Err(e) = validate_entity_fields(payload.entity, &fields) {
                    return Ok(ApplyOutcome::Invalid(e.to_string()));
                }
                tx.execute(
                    "UPDATE log_entries SET fields = ?1, updated_at = ?2 WHERE id = ?3",
                    params![serde_json::to_string(&fields)?, now, entry.id],
                )?;
                entry.id
            }
            Operation::Delete => {
                if let Some(message) = foreign_entry(existing.as_ref(), baby_id) {
                    return Ok(ApplyOutcome::Forbidden(message));
                }
                let Some(entry) = existing.filter(|e| e.entity == payload.entity) else {
                    return Ok(ApplyOutcome::Invalid(format!(
                        "No {} entry with that id",
                        payload.entity
                    )));
                };
                tx.execute("DELETE FROM log_entries WHERE id = ?1", params![entry.id])?;
                entry.id
            }
        };

        tx.execute(
            "INSERT INTO applied_mutations (mutation_id, caller_id, baby_id, entity_id, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![mutation.id, caller_id, baby_id, entity_id, now],
        )?;
        tx.commit()?;
        Ok(ApplyOutcome::Applied { entity_id })
    }

    // --- Rate-limit counters ---

    pub fn rate_limit_count(&self, key: &str, window_start: i64) -> Result<u32> {
        let count: Option<u32> = self
            .conn
            .query_row(
                "SELECT count FROM rate_limits WHERE key = ?1 AND window_start = ?2",
                params![key, window_start],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Increment the counter for (`key`, `window_start`) unless it already reached `limit`.
    /// Returns the new count, or `None` when the increment was refused.
    pub fn try_increment_rate_limit(
        &self,
        key: &str,
        window_start: i64,
        limit: u32,
    ) -> Result<Option<u32>> {
        if limit == 0 {
            return Ok(None);
        }
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "INSERT INTO rate_limits (key, window_start, count) VALUES (?1, ?2, 1)
             ON CONFLICT(key, window_start) DO UPDATE SET count = count + 1 WHERE count < ?3",
            params![key, window_start, limit],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let count: u32 = tx.query_row(
            "SELECT count FROM rate_limits WHERE key = ?1 AND window_start = ?2",
            params![key, window_start],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(Some(count))
    }

    /// Delete counters for windows that started before `before`.
    pub fn prune_rate_limits(&self, before: i64) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM rate_limits WHERE window_start < ?1", params![before])?;
        Ok(rows)
    }
}
