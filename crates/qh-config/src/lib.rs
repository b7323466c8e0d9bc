//! Layered YAML service configuration with canonical hashing.
//!
//! Config files merge in order (base first, overrides later); the merged
//! document is canonicalized, hashed, and checked for secret-looking literal
//! values before deserializing into [`ServiceConfig`]. The hash is reported
//! on startup and in `/v1/status` so operators can tell which config a
//! running daemon was started with.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

/// Known secret-like prefixes. A config is rejected outright if any leaf
/// string starts with one of these — credentials belong in the environment,
/// never in a hashed, logged config document.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",
    "sk_live",
    "sk_test",
    "AKIA",
    "-----BEGIN",
    "ghp_",
    "gho_",
    "glpat-",
    "xoxb-",
    "xoxp-",
];

// ---------------------------------------------------------------------------
// ServiceConfig
// ---------------------------------------------------------------------------

/// Typed settings for the quota holder service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP bind address, e.g. "127.0.0.1:8877".
    pub bind_addr: Option<String>,
    /// Per-transaction row-lock timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// How many times a commission transaction is retried on a
    /// serialization/deadlock failure before surfacing an error.
    pub issue_retry_limit: u32,
    /// Seconds between reconcile ticks.
    pub reconcile_interval_secs: u64,
    /// A pending commission older than this is considered overdue.
    pub pending_age_threshold_secs: i64,
    /// Timeline retention; entries older than this many days may be pruned.
    /// `None` keeps everything.
    pub timeline_retention_days: Option<i64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            lock_timeout_ms: 5_000,
            issue_retry_limit: 3,
            reconcile_interval_secs: 60,
            pending_age_threshold_secs: 3_600,
            timeline_retention_days: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
    pub settings: ServiceConfig,
}

/// Load and merge YAML files in order; earlier files are base, later override.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }
    let doc_refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

/// Same as [`load_layered_yaml`] but over in-memory documents (tests).
pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        merged = deep_merge(merged, v_json);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    let settings: ServiceConfig =
        serde_json::from_value(merged.clone()).context("config does not match schema")?;

    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
        settings,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

/// Canonical form: recursively key-sorted, compact JSON.
fn canonicalize_json(v: &Value) -> Result<String> {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).context("canonical json serialize failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let mut leaves = Vec::new();
    collect_leaf_pointers(v, "", &mut leaves);

    for ptr in leaves {
        if let Some(val) = v.pointer(&ptr) {
            if let Some(s) = val.as_str() {
                if looks_like_secret(s) {
                    bail!("CONFIG_SECRET_DETECTED leaf={} value=REDACTED", ptr);
                }
            }
        }
    }
    Ok(())
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    if t.len() < 8 {
        return false;
    }
    SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}

fn collect_leaf_pointers(v: &Value, prefix: &str, out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            for (k, vv) in map.iter() {
                let next = format!("{}/{}", prefix, escape_pointer_token(k));
                collect_leaf_pointers(vv, &next, out);
            }
        }
        Value::Array(arr) => {
            for (i, vv) in arr.iter().enumerate() {
                let next = format!("{}/{}", prefix, i);
                collect_leaf_pointers(vv, &next, out);
            }
        }
        _ => {
            let p = if prefix.is_empty() {
                "/".to_string()
            } else {
                prefix.to_string()
            };
            out.push(p);
        }
    }
}

fn escape_pointer_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_config() {
        let loaded = load_layered_yaml_from_strings(&["{}"]).unwrap();
        assert_eq!(loaded.settings.lock_timeout_ms, 5_000);
        assert_eq!(loaded.settings.issue_retry_limit, 3);
        assert!(loaded.settings.bind_addr.is_none());
    }

    #[test]
    fn later_layers_override_earlier() {
        let base = "lock_timeout_ms: 1000\nreconcile_interval_secs: 30\n";
        let over = "lock_timeout_ms: 250\n";
        let loaded = load_layered_yaml_from_strings(&[base, over]).unwrap();
        assert_eq!(loaded.settings.lock_timeout_ms, 250);
        assert_eq!(loaded.settings.reconcile_interval_secs, 30);
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = "lock_timeout_ms: 100\nissue_retry_limit: 2\n";
        let b = "issue_retry_limit: 2\nlock_timeout_ms: 100\n";
        let la = load_layered_yaml_from_strings(&[a]).unwrap();
        let lb = load_layered_yaml_from_strings(&[b]).unwrap();
        assert_eq!(la.config_hash, lb.config_hash);
    }

    #[test]
    fn hash_changes_with_content() {
        let la = load_layered_yaml_from_strings(&["lock_timeout_ms: 100\n"]).unwrap();
        let lb = load_layered_yaml_from_strings(&["lock_timeout_ms: 101\n"]).unwrap();
        assert_ne!(la.config_hash, lb.config_hash);
    }

    #[test]
    fn secret_literal_is_rejected() {
        let doc = "bind_addr: \"127.0.0.1:8877\"\nnote: \"sk_live_abcdef123456\"\n";
        let err = load_layered_yaml_from_strings(&[doc]).unwrap_err();
        assert!(err.to_string().contains("CONFIG_SECRET_DETECTED"));
        // The secret value itself must not appear in the error.
        assert!(!err.to_string().contains("abcdef123456"));
    }

    #[test]
    fn short_strings_are_not_secrets() {
        let doc = "bind_addr: \"sk-tiny\"\n";
        assert!(load_layered_yaml_from_strings(&[doc]).is_ok());
    }
}
