use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;
const MAX_ENTRIES_PER_SHARD: usize = 1024;
const IDLE_TTL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct StickyEntry {
    auth_id: String,
    last_used: Instant,
}

/// Soft affinity between a client fingerprint and the auth it last got.
/// Keys are `provider:fingerprint`; the fingerprint itself is opaque here.
/// Reads are lossy under races and that is fine: the mapping is advisory.
pub struct StickyStore {
    shards: Vec<Mutex<HashMap<String, StickyEntry>>>,
}

impl Default for StickyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StickyStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn key(provider_name: &str, fingerprint: &str) -> String {
        format!("{provider_name}:{fingerprint}")
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, StickyEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Look up and touch; expired entries are dropped on read.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.shard(key).lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard.get_mut(key)?;
        if entry.last_used.elapsed() > IDLE_TTL {
            guard.remove(key);
            return None;
        }
        entry.last_used = Instant::now();
        Some(entry.auth_id.clone())
    }

    pub fn set(&self, key: &str, auth_id: &str) {
        let mut guard = self.shard(key).lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= MAX_ENTRIES_PER_SHARD && !guard.contains_key(key) {
            // Capacity pressure: drop the stalest entry in this shard.
            if let Some(oldest) = guard
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone())
            {
                guard.remove(&oldest);
            }
        }
        guard.insert(
            key.to_string(),
            StickyEntry {
                auth_id: auth_id.to_string(),
                last_used: Instant::now(),
            },
        );
    }

    pub fn del(&self, key: &str) {
        self.shard(key)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) {
        for shard in &self.shards {
            shard
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|_, entry| entry.last_used.elapsed() <= IDLE_TTL);
        }
    }

    /// Periodic TTL sweeper; one per process.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del_cycle() {
        let store = StickyStore::new();
        let key = StickyStore::key("gemini", "client-a");
        assert!(store.get(&key).is_none());
        store.set(&key, "g1");
        assert_eq!(store.get(&key).as_deref(), Some("g1"));
        store.del(&key);
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn last_write_wins() {
        let store = StickyStore::new();
        let key = StickyStore::key("claude", "client-b");
        store.set(&key, "c1");
        store.set(&key, "c2");
        assert_eq!(store.get(&key).as_deref(), Some("c2"));
    }

    #[test]
    fn capacity_pressure_evicts_stalest() {
        let store = StickyStore::new();
        // Overfill a single shard by brute force: insert enough keys that at
        // least one shard crosses its cap, then verify total stays bounded.
        for i in 0..(MAX_ENTRIES_PER_SHARD * SHARD_COUNT + 512) {
            store.set(&format!("p:fp-{i}"), "a");
        }
        assert!(store.len() <= MAX_ENTRIES_PER_SHARD * SHARD_COUNT);
    }
}
