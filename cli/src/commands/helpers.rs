use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Number, Value};

use nestling_core::models::EntityType;
use nestling_core::units::{parse_length_cm, parse_volume_ml, parse_weight_kg, round2};

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .with_context(|| format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday")),
        },
    }
}

/// Parse "now", an RFC 3339 timestamp, or a local "YYYY-MM-DD HH:MM" / "YYYY-MM-DDTHH:MM".
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Ok(Utc::now());
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|ts| ts.with_timezone(&Utc))
                .with_context(|| format!("'{s}' does not exist in the local time zone"));
        }
    }
    bail!("Invalid timestamp '{s}'. Use 'now', RFC 3339, or 'YYYY-MM-DD HH:MM'")
}

/// Unit-aware shorthand keys and the stored field they expand to.
const UNIT_KEYS: &[(&str, &str)] = &[
    ("amount", "amount_ml"),
    ("weight", "weight_kg"),
    ("length", "length_cm"),
    ("head", "head_cm"),
];

fn number(value: f64, key: &str) -> Result<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .with_context(|| format!("Invalid number for '{key}'"))
}

fn parse_field_value(key: &str, raw: &str) -> Result<(String, Value)> {
    if let Some((_, stored)) = UNIT_KEYS.iter().find(|(short, _)| *short == key) {
        let value = match *stored {
            "amount_ml" => round2(parse_volume_ml(raw)?),
            // Gram precision.
            "weight_kg" => (parse_weight_kg(raw)? * 1000.0).round() / 1000.0,
            _ => round2(parse_length_cm(raw)?),
        };
        return Ok(((*stored).to_string(), number(value, key)?));
    }

    if raw.eq_ignore_ascii_case("null") {
        return Ok((key.to_string(), Value::Null));
    }
    if key.ends_with("_at") {
        let ts = parse_timestamp(raw)?;
        return Ok((key.to_string(), Value::String(ts.to_rfc3339())));
    }
    if key.ends_with("_on") {
        let date = parse_date(Some(raw.to_string()))?;
        return Ok((key.to_string(), Value::String(date.format("%Y-%m-%d").to_string())));
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Ok((key.to_string(), Value::from(n)));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Ok((key.to_string(), number(f, key)?));
    }
    match raw {
        "true" => Ok((key.to_string(), Value::Bool(true))),
        "false" => Ok((key.to_string(), Value::Bool(false))),
        _ => Ok((key.to_string(), Value::String(raw.to_string()))),
    }
}

/// Parse `key=value` arguments into entry fields.
///
/// `amount`, `weight`, `length` and `head` accept units ("4 fl oz", "7 lb 4 oz",
/// "21in") and are stored as `amount_ml`, `weight_kg`, `length_cm`, `head_cm`.
/// Keys ending in `_at` take timestamps and keys ending in `_on` take dates.
pub(crate) fn parse_fields(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Invalid field '{pair}'. Use key=value (e.g. kind=bottle, amount=\"4 fl oz\")");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid field '{pair}': empty key");
        }
        let (key, value) = parse_field_value(key, raw.trim())?;
        fields.insert(key, value);
    }
    Ok(fields)
}

/// Fill the entity's primary time field with the current time when it is missing.
pub(crate) fn fill_default_time(entity: EntityType, fields: &mut Map<String, Value>) {
    let (key, value) = match entity {
        EntityType::Feeding | EntityType::Sleep => ("started_at", Value::String(Utc::now().to_rfc3339())),
        EntityType::Diaper => ("changed_at", Value::String(Utc::now().to_rfc3339())),
        EntityType::Growth => (
            "measured_on",
            Value::String(Local::now().date_naive().format("%Y-%m-%d").to_string()),
        ),
        EntityType::Vaccination => (
            "given_on",
            Value::String(Local::now().date_naive().format("%Y-%m-%d").to_string()),
        ),
        EntityType::Appointment => return,
    };
    fields.entry(key).or_insert(value);
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

pub(crate) fn format_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
}
