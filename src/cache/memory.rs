use std::collections::HashMap;

use serde_json::Value;

use super::key::namespace_of;

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    /// When the value was produced; drives eviction order.
    pub created_at: f64,
    /// When this copy stops being served from MEMORY.
    pub expires_at: f64,
    pub value: Value,
}

/// Bounded in-process map. Over capacity, the oldest entries by creation time go first.
#[derive(Debug)]
pub struct MemoryTier {
    entries: HashMap<String, MemoryEntry>,
    capacity: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<&MemoryEntry> {
        self.entries.get(key)
    }

    /// Inserts and returns the keys evicted to stay within capacity.
    pub fn insert(&mut self, key: String, entry: MemoryEntry) -> Vec<String> {
        self.entries.insert(key, entry);
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by(|a, b| a.1.created_at.total_cmp(&b.1.created_at))
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn remove_namespace(&mut self, namespace: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, _| namespace_of(key) != Some(namespace));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(created_at: f64) -> MemoryEntry {
        MemoryEntry {
            created_at,
            expires_at: created_at + 60.0,
            value: json!(created_at),
        }
    }

    #[test]
    fn evicts_oldest_created_not_least_recently_read() {
        let mut tier = MemoryTier::new(2);
        tier.insert("a_1".to_string(), entry(10.0));
        tier.insert("a_2".to_string(), entry(20.0));
        // Reading the oldest entry does not protect it.
        assert!(tier.get("a_1").is_some());
        let evicted = tier.insert("a_3".to_string(), entry(30.0));
        assert_eq!(evicted, vec!["a_1".to_string()]);
        assert_eq!(tier.len(), 2);
        assert!(tier.get("a_2").is_some());
    }

    #[test]
    fn namespace_removal_is_exact() {
        let mut tier = MemoryTier::new(10);
        tier.insert("team_aa".to_string(), entry(1.0));
        tier.insert("teams_bb".to_string(), entry(1.0));
        tier.insert("teams_cc".to_string(), entry(1.0));
        assert_eq!(tier.remove_namespace("teams"), 2);
        assert!(tier.get("team_aa").is_some());
        assert_eq!(tier.remove_namespace("missing"), 0);
    }
}
