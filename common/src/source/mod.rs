// Source adapters
// Fetch candidate obligations from an external system and normalize them into
// RawCandidate before anything else sees the payload.

pub mod file;
pub mod http;

pub use file::FileSource;
pub use http::HttpSource;

use crate::errors::SourceError;
use crate::models::RawCandidate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::{Map, Value};

/// Finite stream of candidates produced by one fetch
pub type CandidateStream = BoxStream<'static, Result<RawCandidate, SourceError>>;

/// SourceAdapter is a pure read of the source system.
///
/// An `Err` from `fetch`, or an `Err` item anywhere in the stream, means the
/// source could not be checked. An empty stream means nothing is due.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, now: DateTime<Utc>) -> Result<CandidateStream, SourceError>;
}

const TAXPAYER_KEYS: &[&str] = &["taxpayer_id", "taxpayer", "customer_id"];
const PERIOD_KEYS: &[&str] = &["period", "tax_period"];
const KIND_KEYS: &[&str] = &["kind", "type", "category"];
const DUE_KEYS: &[&str] = &["due_at", "deadline", "due_date"];
const AMOUNT_KEYS: &[&str] = &["amount", "amount_due"];
const BASE_KEYS: &[&str] = &["base_amount", "base", "income"];
const RATE_KEYS: &[&str] = &["rate", "tax_rate"];
const MINIMUM_KEYS: &[&str] = &["minimum_amount", "minimum", "min_amount"];
const CURRENCY_KEYS: &[&str] = &["currency"];
const DESCRIPTION_KEYS: &[&str] = &["description", "note"];
const RESOLVED_KEYS: &[&str] = &["resolved", "paid", "settled"];

/// Normalize a source document: either a bare array of obligations or an
/// object with an `obligations` array.
pub fn normalize_document(document: Value) -> Result<Vec<RawCandidate>, SourceError> {
    let items = match document {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("obligations") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => {
                return Err(SourceError::InvalidPayload(
                    "object payload has no 'obligations' array".to_string(),
                ))
            }
            Some(other) => {
                return Err(SourceError::InvalidPayload(format!(
                    "'obligations' must be an array, got {}",
                    json_type(&other)
                )))
            }
        },
        other => {
            return Err(SourceError::InvalidPayload(format!(
                "expected array or object, got {}",
                json_type(&other)
            )))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(obj) => Ok(normalize_entry(&obj)),
            other => Err(SourceError::InvalidPayload(format!(
                "entry {} is {}, expected object",
                index,
                json_type(&other)
            ))),
        })
        .collect()
}

/// Map one dynamic entry onto the fixed RawCandidate shape. Missing
/// identifying fields stay empty and are rejected by the evaluator.
pub fn normalize_entry(obj: &Map<String, Value>) -> RawCandidate {
    RawCandidate {
        taxpayer_id: text(obj, TAXPAYER_KEYS).unwrap_or_default(),
        period: text(obj, PERIOD_KEYS).unwrap_or_default(),
        kind: text(obj, KIND_KEYS).unwrap_or_default(),
        due_at: text(obj, DUE_KEYS).unwrap_or_default(),
        amount: text(obj, AMOUNT_KEYS),
        base_amount: text(obj, BASE_KEYS),
        rate: text(obj, RATE_KEYS),
        minimum_amount: text(obj, MINIMUM_KEYS),
        currency: text(obj, CURRENCY_KEYS),
        description: text(obj, DESCRIPTION_KEYS),
        resolved: flag(obj, RESOLVED_KEYS),
    }
}

fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| !value.is_null())
}

/// Strings are trimmed. Numbers keep their JSON text (serde_json is built
/// with `arbitrary_precision`), so amounts never pass through a float.
fn text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match first(obj, keys)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn flag(obj: &Map<String, Value>, keys: &[&str]) -> bool {
    match first(obj, keys) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
        Some(Value::Number(n)) => n.as_i64().map_or(false, |v| v != 0),
        _ => false,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
