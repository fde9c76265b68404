//! Map native model records onto public model entries.
//!
//! Everything here is deterministic: the same native record always maps to
//! the same entry, so nothing reads the clock or generates identifiers.

use chrono::DateTime;

use super::native_types::{NativeListResponse, NativeModel, NativeShowResponse};
use super::openai_types::{Model, ModelList, LIST_OBJECT, MODEL_OBJECT};

const DEFAULT_NAMESPACE: &str = "library";

/// Convert a native RFC 3339 timestamp to epoch seconds. Missing or unparseable → 0.
pub fn epoch_seconds(timestamp: Option<&str>) -> i64 {
    timestamp
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map_or(0, |dt| dt.timestamp())
}

/// Namespace segment of a native model name.
///
/// `ns/model:tag` → `ns`, `host/ns/model` → `ns`, bare names → `library`.
pub fn owner_of(name: &str) -> String {
    let segments: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();
    match segments.len() {
        0 | 1 => DEFAULT_NAMESPACE.to_string(),
        n => segments[n - 2].to_string(),
    }
}

/// Build a public entry for one model. `id` is used verbatim.
pub fn model_entry(id: &str, modified_at: Option<&str>) -> Model {
    Model {
        id: id.to_string(),
        object: MODEL_OBJECT.to_string(),
        created: epoch_seconds(modified_at),
        owned_by: owner_of(id),
    }
}

pub fn from_native_model(model: &NativeModel) -> Model {
    model_entry(&model.name, model.modified_at.as_deref())
}

/// Wrap the native model enumeration. An empty native list yields empty `data`.
pub fn list_to_public(resp: &NativeListResponse) -> ModelList {
    ModelList {
        object: LIST_OBJECT.to_string(),
        data: resp.models.iter().map(from_native_model).collect(),
    }
}

/// Wrap a single model description under the name the caller asked for.
pub fn show_to_public(requested: &str, resp: &NativeShowResponse) -> Model {
    model_entry(requested, resp.modified_at.as_deref())
}
