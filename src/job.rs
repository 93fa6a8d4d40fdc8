use anyhow::{Context, Result};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::constants::IDENTIFIER_LENGTH;
use crate::timing::now_unix;

/// The unit of work moved between keys. One serialized record lives in
/// exactly one of: a live list, `scheduled`, `retry`, `dead`, or a worker's
/// in-progress list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
    pub enqueued_at: i64,
    #[serde(default)]
    pub fails: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
}

impl Job {
    pub fn new(name: &str, args: serde_json::Map<String, Value>) -> Self {
        Self {
            id: new_identifier(),
            name: name.to_string(),
            args,
            enqueued_at: now_unix(),
            fails: 0,
            last_err: None,
            failed_at: None,
            unique_key: None,
        }
    }

    /// A periodic instance for instant `t`. Every field is derived from
    /// `(name, t)`, so independent pools serialize byte-identical records
    /// and the scheduled z-set deduplicates them.
    pub fn periodic(name: &str, t: i64) -> Self {
        Self {
            id: periodic_identifier(name, t),
            name: name.to_string(),
            args: serde_json::Map::new(),
            enqueued_at: t,
            fails: 0,
            last_err: None,
            failed_at: None,
            unique_key: None,
        }
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize job record")
    }

    pub fn deserialize(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse job record")
    }

    pub fn unmarshal_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let value = Value::Object(self.args.clone());
        serde_json::from_value(value).context("failed to unmarshal job payload")
    }
}

/// ~20 random characters from a CSPRNG-backed generator.
pub fn new_identifier() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(IDENTIFIER_LENGTH)
        .map(char::from)
        .collect()
}

/// Deduplication key for unique jobs: lowercase hex of SHA-256 over the job
/// name and the canonical (key-sorted) JSON encoding of its args. Logically
/// equal payloads must fingerprint identically; `serde_json::Map` is ordered
/// by key, so its encoding is already canonical.
pub fn fingerprint(name: &str, args: &serde_json::Map<String, Value>) -> Result<String> {
    let canonical = serde_json::to_string(args).context("failed to encode args")?;
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn periodic_identifier(name: &str, t: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"@");
    hasher.update(t.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..IDENTIFIER_LENGTH].to_string()
}
