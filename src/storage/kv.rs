use std::collections::{BTreeSet, HashMap as StdHashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{KvBackend, StorageError, StorageResult};

/// Value variants supported by the in-memory KV store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvValue {
    Str(String),
    Hash(StdHashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: KvValue,
    /// Optional expiry time
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(value: KvValue) -> Self { Self { value, expires_at: None } }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// Process-local key/value store with per-key expiry.
///
/// Expired keys are invisible to reads immediately and are physically removed either on
/// access or by `sweep`, which `spawn_sweeper` runs periodically.
#[derive(Clone, Default)]
pub struct MemoryKv {
    map: Arc<parking_lot::RwLock<StdHashMap<String, Entry>>>,
}

impl MemoryKv {
    pub fn new() -> Self { Self::default() }

    /// Read a key, dropping it first if it has expired.
    fn read_live(&self, key: &str) -> Option<KvValue> {
        let now = Instant::now();
        {
            let r = self.map.read();
            match r.get(key) {
                None => return None,
                Some(ent) if !ent.expired(now) => return Some(ent.value.clone()),
                Some(_) => {}
            }
        }
        let mut w = self.map.write();
        if w.get(key).map(|e| e.expired(now)).unwrap_or(false) { w.remove(key); }
        None
    }

    /// Mutate the value at `key` in place, creating it with `init` when absent or expired.
    fn upsert<F>(&self, key: &str, init: impl FnOnce() -> KvValue, f: F) -> StorageResult<()>
    where
        F: FnOnce(&mut KvValue) -> StorageResult<()>,
    {
        let now = Instant::now();
        let mut w = self.map.write();
        if w.get(key).map(|e| e.expired(now)).unwrap_or(false) { w.remove(key); }
        let ent = w.entry(key.to_string()).or_insert_with(|| Entry::live(init()));
        f(&mut ent.value)
    }

    pub fn len(&self) -> usize { self.map.read().len() }
    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }

    /// Remove expired keys. Returns number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut w = self.map.write();
        let before = w.len();
        w.retain(|_, e| !e.expired(now));
        before - w.len()
    }

    /// Start the background expiry sweeper on the current tokio runtime.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let removed = this.sweep();
                if removed > 0 { tracing::debug!(removed = removed, "kv_sweep"); }
            }
        })
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> StorageResult<()> {
        self.upsert(key, || KvValue::Hash(StdHashMap::new()), |v| match v {
            KvValue::Hash(h) => {
                for (f, val) in fields { h.insert(f.clone(), val.clone()); }
                Ok(())
            }
            _ => Err(StorageError::WrongType(key.to_string())),
        })
    }

    async fn hgetall(&self, key: &str) -> StorageResult<StdHashMap<String, String>> {
        match self.read_live(key) {
            None => Ok(StdHashMap::new()),
            Some(KvValue::Hash(h)) => Ok(h),
            Some(_) => Err(StorageError::WrongType(key.to_string())),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StorageResult<()> {
        self.upsert(key, || KvValue::Set(BTreeSet::new()), |v| match v {
            KvValue::Set(s) => { s.insert(member.to_string()); Ok(()) }
            _ => Err(StorageError::WrongType(key.to_string())),
        })
    }

    async fn srem(&self, key: &str, member: &str) -> StorageResult<()> {
        let mut w = self.map.write();
        let now_empty = match w.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(()),
            Some(KvValue::Set(s)) => { s.remove(member); s.is_empty() }
            Some(_) => return Err(StorageError::WrongType(key.to_string())),
        };
        // Redis drops a set once its last member is removed
        if now_empty { w.remove(key); }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StorageResult<Vec<String>> {
        match self.read_live(key) {
            None => Ok(Vec::new()),
            Some(KvValue::Set(s)) => Ok(s.into_iter().collect()),
            Some(_) => Err(StorageError::WrongType(key.to_string())),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StorageResult<()> {
        let ent = Entry { value: KvValue::Str(value.to_string()), expires_at: Some(Instant::now() + ttl) };
        self.map.write().insert(key.to_string(), ent);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match self.read_live(key) {
            None => Ok(None),
            Some(KvValue::Str(s)) => Ok(Some(s)),
            Some(_) => Err(StorageError::WrongType(key.to_string())),
        }
    }

    async fn del(&self, key: &str) -> StorageResult<bool> {
        let now = Instant::now();
        Ok(self.map.write().remove(key).map(|e| !e.expired(now)).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn hash_writes_merge_fields() {
        let kv = MemoryKv::new();
        kv.hset_all("users:a", &fields(&[("name", "A"), ("role", "user")])).await.unwrap();
        kv.hset_all("users:a", &fields(&[("role", "admin")])).await.unwrap();
        let h = kv.hgetall("users:a").await.unwrap();
        assert_eq!(h.get("name").map(String::as_str), Some("A"));
        assert_eq!(h.get("role").map(String::as_str), Some("admin"));
        assert!(kv.hgetall("users:missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_membership_and_cleanup() {
        let kv = MemoryKv::new();
        kv.sadd("users", "b@x.com").await.unwrap();
        kv.sadd("users", "a@x.com").await.unwrap();
        kv.sadd("users", "a@x.com").await.unwrap();
        assert_eq!(kv.smembers("users").await.unwrap(), vec!["a@x.com", "b@x.com"]);
        kv.srem("users", "a@x.com").await.unwrap();
        kv.srem("users", "b@x.com").await.unwrap();
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn expired_strings_disappear() {
        let kv = MemoryKv::new();
        kv.set_ex("sessions:s1", "{}", Duration::from_millis(20)).await.unwrap();
        kv.set_ex("sessions:s2", "{}", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("sessions:s1").await.unwrap().as_deref(), Some("{}"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("sessions:s1").await.unwrap(), None);
        assert_eq!(kv.sweep(), 0, "read already pruned the expired key");
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_untouched_expired_keys() {
        let kv = MemoryKv::new();
        kv.set_ex("a", "1", Duration::from_millis(10)).await.unwrap();
        kv.set_ex("b", "2", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.sweep(), 2);
        assert!(!kv.del("a").await.unwrap());
    }

    #[tokio::test]
    async fn type_mismatch_is_reported() {
        let kv = MemoryKv::new();
        kv.sadd("users", "a@x.com").await.unwrap();
        assert!(matches!(kv.hgetall("users").await, Err(StorageError::WrongType(_))));
        assert!(matches!(kv.get("users").await, Err(StorageError::WrongType(_))));
    }
}
