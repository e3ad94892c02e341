use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

const HASH_HEX_LEN: usize = 32;

/// Query parameters of a cached view. Ordering of insertion never matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheParams(BTreeMap<String, String>);

impl CacheParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl ToString) -> Self {
        self.0.insert(name.trim().to_string(), value.to_string());
        self
    }

    pub fn with_opt(self, name: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.with(name, value),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sorted `name=value` pairs, JSON encoded so separators in values cannot collide.
    pub fn canonical(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

/// `<namespace>_<hash-of-sorted-params>`. Stable across restarts.
pub fn cache_key(namespace: &str, params: &CacheParams) -> String {
    let ns = sanitize_namespace(namespace);
    let digest = Sha256::digest(params.canonical().as_bytes());
    let hex = format!("{digest:x}");
    format!("{ns}_{}", &hex[..HASH_HEX_LEN])
}

/// The namespace part of a key produced by `cache_key`.
pub fn namespace_of(key: &str) -> Option<&str> {
    key.rsplit_once('_').map(|(ns, _)| ns)
}

/// Namespaces never contain `_`, so the last `_` always splits off the hash.
pub fn sanitize_namespace(namespace: &str) -> String {
    let cleaned: String = namespace
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_order_independent() {
        let a = CacheParams::new().with("league", "PD").with("days", 7);
        let b = CacheParams::new().with("days", "7").with("league", "PD");
        assert_eq!(cache_key("upcoming", &a), cache_key("upcoming", &b));
        assert_ne!(
            cache_key("upcoming", &a),
            cache_key("upcoming", &a.clone().with("days", 8))
        );
        let key = cache_key("upcoming", &a);
        assert!(key.starts_with("upcoming_"));
        assert_eq!(key.len(), "upcoming_".len() + HASH_HEX_LEN);
    }

    #[test]
    fn namespace_round_trips_through_key() {
        let key = cache_key("team_list", &CacheParams::new());
        assert_eq!(namespace_of(&key), Some("team-list"));
        assert_eq!(namespace_of(&cache_key("teams", &CacheParams::new())), Some("teams"));
        assert_eq!(sanitize_namespace("  "), "default");
    }

    #[test]
    fn with_opt_skips_missing_values() {
        let params = CacheParams::new().with_opt("team", None::<String>);
        assert!(params.is_empty());
        assert_eq!(params.canonical(), "{}");
    }
}
