//! Typed payload boundary.
//!
//! All engine payloads (orchestration inputs/outputs, activity inputs/results,
//! external event data) cross the wire as strings. A `Codec` maps typed values
//! onto that boundary; `Json` is the default.

use serde::Serialize;
use serde::de::DeserializeOwned;

pub trait Codec {
    fn encode<T: Serialize>(value: &T) -> Result<String, String>;
    fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, String>;
}

/// JSON codec backed by `serde_json`.
pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(value: &T) -> Result<String, String> {
        serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, String> {
        serde_json::from_str(payload).map_err(|e| format!("decode: {e}"))
    }
}
