//! Schema-versioned record envelopes
//!
//! Every persisted record is wrapped as `{ "schema": .., "version": .., "data": .. }`.
//! Loading fails closed: an unknown schema name or any version other than
//! [`SCHEMA_VERSION`] is rejected before the payload is parsed.

use cadence_core::{CadenceError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current on-disk format version
pub const SCHEMA_VERSION: u32 = 1;

pub const SESSION_SCHEMA: &str = "cadence.session";
pub const PLAN_SCHEMA: &str = "cadence.plan";
pub const CHECKPOINT_SCHEMA: &str = "cadence.checkpoint";
pub const METRICS_SCHEMA: &str = "cadence.metrics";
pub const BASELINE_SCHEMA: &str = "cadence.baseline";

/// Versioned envelope around a persisted value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record<T> {
    pub schema: String,
    pub version: u32,
    pub data: T,
}

#[derive(Serialize)]
struct RecordRef<'a, T> {
    schema: &'a str,
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct RecordHeader {
    schema: String,
    version: u32,
}

/// Serialize `data` as a single-line record
pub fn encode<T: Serialize>(schema: &str, data: &T) -> Result<String> {
    Ok(serde_json::to_string(&RecordRef {
        schema,
        version: SCHEMA_VERSION,
        data,
    })?)
}

/// Serialize `data` as a pretty-printed record
pub fn encode_pretty<T: Serialize>(schema: &str, data: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(&RecordRef {
        schema,
        version: SCHEMA_VERSION,
        data,
    })?)
}

/// Parse a record, rejecting other schemas and versions
pub fn decode<T: DeserializeOwned>(schema: &str, text: &str) -> Result<T> {
    let header: RecordHeader = serde_json::from_str(text).map_err(|e| {
        CadenceError::StateStore(format!("Unreadable {} record: {}", schema, e))
    })?;

    if header.schema != schema {
        return Err(CadenceError::StateStore(format!(
            "Expected {} record, found {}",
            schema, header.schema
        )));
    }
    if header.version != SCHEMA_VERSION {
        return Err(CadenceError::SchemaVersion {
            record: schema.to_string(),
            found: header.version,
            expected: SCHEMA_VERSION,
        });
    }

    let record: Record<T> = serde_json::from_str(text)?;
    Ok(record.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{PlannedFile, Severity};

    #[test]
    fn test_envelope_shape() {
        let text = encode(PLAN_SCHEMA, &Severity::Major).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["schema"], "cadence.plan");
        assert_eq!(value["version"], 1);
        assert_eq!(value["data"], "major");
    }

    #[test]
    fn test_future_version_rejected() {
        let text = r#"{"schema":"cadence.plan","version":2,"data":{"path":"a.rs"}}"#;
        let err = decode::<PlannedFile>(PLAN_SCHEMA, text).unwrap_err();
        assert!(matches!(
            err,
            CadenceError::SchemaVersion {
                found: 2,
                expected: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_wrong_schema_rejected() {
        let text = encode(METRICS_SCHEMA, &Severity::Minor).unwrap();
        assert!(matches!(
            decode::<Severity>(SESSION_SCHEMA, &text),
            Err(CadenceError::StateStore(_))
        ));
    }

    #[test]
    fn test_unversioned_json_rejected() {
        let err = decode::<PlannedFile>(PLAN_SCHEMA, r#"{"path":"a.rs"}"#).unwrap_err();
        assert!(matches!(err, CadenceError::StateStore(_)));
    }

    #[test]
    fn test_decode_current() {
        let file = PlannedFile {
            path: "src/lib.rs".into(),
            description: "entry".into(),
        };
        let text = encode_pretty(PLAN_SCHEMA, &file).unwrap();
        assert_eq!(decode::<PlannedFile>(PLAN_SCHEMA, &text).unwrap(), file);
    }
}
