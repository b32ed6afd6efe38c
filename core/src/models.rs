use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// --- Mutation descriptors ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Feeding,
    Sleep,
    Diaper,
    Growth,
    Vaccination,
    Appointment,
}

pub const ENTITY_TYPES: &[EntityType] = &[
    EntityType::Feeding,
    EntityType::Sleep,
    EntityType::Diaper,
    EntityType::Growth,
    EntityType::Vaccination,
    EntityType::Appointment,
];

impl EntityType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Feeding => "feeding",
            Self::Sleep => "sleep",
            Self::Diaper => "diaper",
            Self::Growth => "growth",
            Self::Vaccination => "vaccination",
            Self::Appointment => "appointment",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        let trimmed = lower.strip_suffix('s').unwrap_or(&lower);
        ENTITY_TYPES
            .iter()
            .copied()
            .find(|e| e.as_str() == trimmed || e.as_str() == lower)
            .ok_or_else(|| {
                let names: Vec<&str> = ENTITY_TYPES.iter().map(|e| e.as_str()).collect();
                anyhow::anyhow!(
                    "Invalid entity type '{s}'. Must be one of: {}",
                    names.join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "create" | "add" => Ok(Self::Create),
            "update" | "edit" => Ok(Self::Update),
            "delete" | "remove" => Ok(Self::Delete),
            _ => bail!("Invalid operation '{s}'. Must be one of: create, update, delete"),
        }
    }
}

/// A single mutation against one tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPayload {
    pub entity: EntityType,
    pub op: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl MutationPayload {
    #[must_use]
    pub fn create(entity: EntityType, target_id: Option<String>, fields: Map<String, Value>) -> Self {
        Self {
            entity,
            op: Operation::Create,
            target_id,
            fields,
        }
    }

    #[must_use]
    pub fn update(entity: EntityType, target_id: &str, fields: Map<String, Value>) -> Self {
        Self {
            entity,
            op: Operation::Update,
            target_id: Some(target_id.to_string()),
            fields,
        }
    }

    #[must_use]
    pub fn delete(entity: EntityType, target_id: &str) -> Self {
        Self {
            entity,
            op: Operation::Delete,
            target_id: Some(target_id.to_string()),
            fields: Map::new(),
        }
    }
}

/// A mutation waiting in the local queue for remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub payload: MutationPayload,
}

// --- Sync state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncState {
    pub pending_count: usize,
    pub is_syncing: bool,
    pub is_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Draining,
    Offline,
}

impl SyncState {
    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        if self.is_syncing {
            SyncPhase::Draining
        } else if self.is_online {
            SyncPhase::Idle
        } else {
            SyncPhase::Offline
        }
    }
}

// --- Endpoint wire types ---

/// Id for an entry created on the client, so later offline edits can target it before sync.
#[must_use]
pub fn new_entry_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Unauthenticated,
    /// The caller may not act on the resolved baby at all (no access, no baby
    /// chosen, or read-only). Nothing from this caller can succeed until that changes.
    Scope,
    /// This mutation touches an entry the caller's baby does not own.
    Authorization,
    Validation,
    RateLimited,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Scope => "scope",
            Self::Authorization => "authorization",
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unauthenticated" => Ok(Self::Unauthenticated),
            "scope" => Ok(Self::Scope),
            "authorization" => Ok(Self::Authorization),
            "validation" => Ok(Self::Validation),
            "rate_limited" => Ok(Self::RateLimited),
            _ => bail!("Unknown reject reason '{s}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationResponse {
    Accepted {
        entity_id: String,
        #[serde(default)]
        duplicate: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate_limit: Option<RateLimitStatus>,
    },
    Rejected {
        reason: RejectReason,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate_limit: Option<RateLimitStatus>,
    },
}

impl MutationResponse {
    #[must_use]
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            message: message.into(),
            rate_limit: None,
        }
    }

    #[must_use]
    pub fn rate_limit(&self) -> Option<&RateLimitStatus> {
        match self {
            Self::Accepted { rate_limit, .. } | Self::Rejected { rate_limit, .. } => {
                rate_limit.as_ref()
            }
        }
    }
}

/// A queued mutation the server refused permanently; kept for the user to review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedMutation {
    pub mutation: QueuedMutation,
    pub reason: RejectReason,
    pub message: String,
    pub dropped_at: DateTime<Utc>,
}

// --- Server-side records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaregiverRole {
    Owner,
    Caregiver,
    Viewer,
}

impl CaregiverRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Caregiver => "caregiver",
            Self::Viewer => "viewer",
        }
    }

    #[must_use]
    pub fn can_write(self) -> bool {
        !matches!(self, Self::Viewer)
    }
}

impl FromStr for CaregiverRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "caregiver" => Ok(Self::Caregiver),
            "viewer" => Ok(Self::Viewer),
            _ => bail!("Invalid role '{s}'. Must be one of: owner, caregiver, viewer"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Caller {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_baby_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Baby {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: String,
    pub baby_id: String,
    pub entity: EntityType,
    pub fields: Map<String, Value>,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

// --- Validation ---

pub const FEEDING_KINDS: &[&str] = &["breast", "bottle", "solids"];
pub const DIAPER_KINDS: &[&str] = &["wet", "dirty", "mixed", "dry"];

/// Validate the shape of a mutation before it is committed.
///
/// Create validates the record as given; update callers should pass the merged record
/// through [`validate_entity_fields`] instead.
pub fn validate_mutation(payload: &MutationPayload) -> Result<()> {
    match payload.op {
        Operation::Create => {
            if let Some(id) = &payload.target_id {
                validate_target_id(id)?;
            }
            validate_entity_fields(payload.entity, &payload.fields)
        }
        Operation::Update => {
            let Some(id) = &payload.target_id else {
                bail!("update requires a target_id");
            };
            validate_target_id(id)?;
            if payload.fields.is_empty() {
                bail!("update requires at least one field");
            }
            Ok(())
        }
        Operation::Delete => {
            let Some(id) = &payload.target_id else {
                bail!("delete requires a target_id");
            };
            validate_target_id(id)
        }
    }
}

fn validate_target_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("target_id must not be empty");
    }
    if id.len() > 64 {
        bail!("target_id must be at most 64 characters");
    }
    Ok(())
}

/// Validate a full entity record for its type.
pub fn validate_entity_fields(entity: EntityType, fields: &Map<String, Value>) -> Result<()> {
    match entity {
        EntityType::Feeding => {
            require_one_of(fields, "kind", FEEDING_KINDS)?;
            require_timestamp(fields, "started_at")?;
            optional_positive(fields, "amount_ml")?;
            optional_non_negative(fields, "duration_min")?;
        }
        EntityType::Sleep => {
            let started = require_timestamp(fields, "started_at")?;
            if let Some(ended) = optional_timestamp(fields, "ended_at")? {
                if ended < started {
                    bail!("ended_at must not be before started_at");
                }
            }
        }
        EntityType::Diaper => {
            require_one_of(fields, "kind", DIAPER_KINDS)?;
            require_timestamp(fields, "changed_at")?;
        }
        EntityType::Growth => {
            require_date(fields, "measured_on")?;
            let mut any = false;
            for key in ["weight_kg", "length_cm", "head_cm"] {
                any |= optional_positive(fields, key)?.is_some();
            }
            if !any {
                bail!("growth entry needs at least one of weight_kg, length_cm, head_cm");
            }
        }
        EntityType::Vaccination => {
            require_text(fields, "vaccine")?;
            require_date(fields, "given_on")?;
        }
        EntityType::Appointment => {
            require_text(fields, "title")?;
            require_timestamp(fields, "scheduled_at")?;
        }
    }
    Ok(())
}

/// Shallow-merge `patch` into `base`; a JSON `null` removes the key.
pub fn merge_fields(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            base.remove(key);
        } else {
            base.insert(key.clone(), value.clone());
        }
    }
}

fn require_text<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    match fields.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => bail!("{key} must not be empty"),
        Some(_) => bail!("{key} must be a string"),
        None => bail!("{key} is required"),
    }
}

fn require_one_of(fields: &Map<String, Value>, key: &str, allowed: &[&str]) -> Result<()> {
    let value = require_text(fields, key)?;
    if !allowed.contains(&value) {
        bail!(
            "Invalid {key} '{value}'. Must be one of: {}",
            allowed.join(", ")
        );
    }
    Ok(())
}

fn parse_timestamp(key: &str, value: &Value) -> Result<DateTime<Utc>> {
    let Value::String(s) = value else {
        bail!("{key} must be an RFC 3339 timestamp string");
    };
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| anyhow::anyhow!("Invalid {key} '{s}'. Must be RFC 3339 format"))
}

fn require_timestamp(fields: &Map<String, Value>, key: &str) -> Result<DateTime<Utc>> {
    let value = fields
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("{key} is required"))?;
    parse_timestamp(key, value)
}

fn optional_timestamp(fields: &Map<String, Value>, key: &str) -> Result<Option<DateTime<Utc>>> {
    fields.get(key).map(|v| parse_timestamp(key, v)).transpose()
}

fn require_date(fields: &Map<String, Value>, key: &str) -> Result<NaiveDate> {
    let s = require_text(fields, key)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("Invalid {key} '{s}'. Must be YYYY-MM-DD"))
}

fn optional_number(fields: &Map<String, Value>, key: &str) -> Result<Option<f64>> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("{key} must be a number")),
    }
}

fn optional_positive(fields: &Map<String, Value>, key: &str) -> Result<Option<f64>> {
    let value = optional_number(fields, key)?;
    if value.is_some_and(|v| v <= 0.0) {
        bail!("{key} must be greater than 0");
    }
    Ok(value)
}

fn optional_non_negative(fields: &Map<String, Value>, key: &str) -> Result<Option<f64>> {
    let value = optional_number(fields, key)?;
    if value.is_some_and(|v| v < 0.0) {
        bail!("{key} must not be negative");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_entity_type_from_str() {
        assert_eq!("feeding".parse::<EntityType>().unwrap(), EntityType::Feeding);
        assert_eq!("Feedings".parse::<EntityType>().unwrap(), EntityType::Feeding);
        assert_eq!("SLEEP".parse::<EntityType>().unwrap(), EntityType::Sleep);
        assert_eq!("diapers".parse::<EntityType>().unwrap(), EntityType::Diaper);
        assert!("nap".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_operation_from_str() {
        assert_eq!("create".parse::<Operation>().unwrap(), Operation::Create);
        assert_eq!("Edit".parse::<Operation>().unwrap(), Operation::Update);
        assert_eq!("remove".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn test_valid_feeding() {
        let payload = MutationPayload::create(
            EntityType::Feeding,
            None,
            fields(json!({
                "kind": "bottle",
                "started_at": "2025-03-01T08:00:00Z",
                "amount_ml": 120.0
            })),
        );
        assert!(validate_mutation(&payload).is_ok());
    }

    #[test]
    fn test_feeding_invalid_kind() {
        let payload = MutationPayload::create(
            EntityType::Feeding,
            None,
            fields(json!({ "kind": "juice", "started_at": "2025-03-01T08:00:00Z" })),
        );
        assert!(validate_mutation(&payload).is_err());
    }

    #[test]
    fn test_feeding_zero_amount() {
        let payload = MutationPayload::create(
            EntityType::Feeding,
            None,
            fields(json!({
                "kind": "bottle",
                "started_at": "2025-03-01T08:00:00Z",
                "amount_ml": 0
            })),
        );
        assert!(validate_mutation(&payload).is_err());
    }

    #[test]
    fn test_sleep_end_before_start() {
        let f = fields(json!({
            "started_at": "2025-03-01T08:00:00Z",
            "ended_at": "2025-03-01T07:00:00Z"
        }));
        assert!(validate_entity_fields(EntityType::Sleep, &f).is_err());

        let f = fields(json!({
            "started_at": "2025-03-01T08:00:00Z",
            "ended_at": "2025-03-01T09:30:00+01:00"
        }));
        assert!(validate_entity_fields(EntityType::Sleep, &f).is_ok());
    }

    #[test]
    fn test_diaper_requires_changed_at() {
        let f = fields(json!({ "kind": "wet" }));
        assert!(validate_entity_fields(EntityType::Diaper, &f).is_err());
        let f = fields(json!({ "kind": "wet", "changed_at": "2025-03-01T08:00:00Z" }));
        assert!(validate_entity_fields(EntityType::Diaper, &f).is_ok());
    }

    #[test]
    fn test_growth_needs_a_measurement() {
        let f = fields(json!({ "measured_on": "2025-03-01" }));
        assert!(validate_entity_fields(EntityType::Growth, &f).is_err());
        let f = fields(json!({ "measured_on": "2025-03-01", "weight_kg": 4.2 }));
        assert!(validate_entity_fields(EntityType::Growth, &f).is_ok());
        let f = fields(json!({ "measured_on": "2025-03-01", "weight_kg": -1 }));
        assert!(validate_entity_fields(EntityType::Growth, &f).is_err());
        let f = fields(json!({ "measured_on": "03/01/2025", "weight_kg": 4.2 }));
        assert!(validate_entity_fields(EntityType::Growth, &f).is_err());
    }

    #[test]
    fn test_vaccination_and_appointment() {
        let f = fields(json!({ "vaccine": "  ", "given_on": "2025-03-01" }));
        assert!(validate_entity_fields(EntityType::Vaccination, &f).is_err());
        let f = fields(json!({ "vaccine": "DTaP", "given_on": "2025-03-01" }));
        assert!(validate_entity_fields(EntityType::Vaccination, &f).is_ok());
        let f = fields(json!({ "title": "2 month checkup", "scheduled_at": "2025-04-01T10:00:00Z" }));
        assert!(validate_entity_fields(EntityType::Appointment, &f).is_ok());
        let f = fields(json!({ "title": 42, "scheduled_at": "2025-04-01T10:00:00Z" }));
        assert!(validate_entity_fields(EntityType::Appointment, &f).is_err());
    }

    #[test]
    fn test_update_and_delete_require_target() {
        let mut payload = MutationPayload::update(
            EntityType::Feeding,
            "abc",
            fields(json!({ "amount_ml": 90 })),
        );
        assert!(validate_mutation(&payload).is_ok());
        payload.target_id = None;
        assert!(validate_mutation(&payload).is_err());

        let empty = MutationPayload::update(EntityType::Feeding, "abc", Map::new());
        assert!(validate_mutation(&empty).is_err());

        let mut delete = MutationPayload::delete(EntityType::Sleep, "abc");
        assert!(validate_mutation(&delete).is_ok());
        delete.target_id = Some(String::new());
        assert!(validate_mutation(&delete).is_err());
    }

    #[test]
    fn test_merge_fields_null_removes() {
        let mut base = fields(json!({ "kind": "bottle", "amount_ml": 120, "note": "fussy" }));
        merge_fields(&mut base, &fields(json!({ "amount_ml": 90, "note": null })));
        assert_eq!(base["amount_ml"], json!(90));
        assert!(!base.contains_key("note"));
        assert_eq!(base["kind"], json!("bottle"));
    }

    #[test]
    fn test_sync_phase() {
        let mut state = SyncState::default();
        assert_eq!(state.phase(), SyncPhase::Offline);
        state.is_online = true;
        assert_eq!(state.phase(), SyncPhase::Idle);
        state.is_syncing = true;
        assert_eq!(state.phase(), SyncPhase::Draining);
    }

    #[test]
    fn test_rate_limit_status_wire_shape() {
        let status = RateLimitStatus {
            allowed: true,
            limit: 5,
            remaining: 4,
            reset_at: DateTime::parse_from_rfc3339("2025-03-01T08:15:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["allowed"], json!(true));
        assert_eq!(value["remaining"], json!(4));
        assert!(value["resetAt"].as_str().unwrap().starts_with("2025-03-01T08:15:00"));
    }

    #[test]
    fn test_mutation_response_tagging() {
        let accepted = MutationResponse::Accepted {
            entity_id: "e1".to_string(),
            duplicate: false,
            rate_limit: None,
        };
        let value = serde_json::to_value(&accepted).unwrap();
        assert_eq!(value["status"], json!("accepted"));
        assert_eq!(value["entity_id"], json!("e1"));

        let rejected = MutationResponse::rejected(RejectReason::Validation, "bad");
        let value = serde_json::to_value(&rejected).unwrap();
        assert_eq!(value["status"], json!("rejected"));
        assert_eq!(value["reason"], json!("validation"));
    }
}
