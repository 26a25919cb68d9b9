use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Persistence boundary for the messaging core: a string key-value store with
/// prefix listing and a conditional write.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: String) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Writes `value` only if the stored value equals `expected` (`None` meaning
    /// absent). Returns whether the write happened.
    fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: String) -> Result<bool>;

    fn insert_if_absent(&self, key: &str, value: String) -> Result<bool> {
        self.compare_and_swap(key, None, value)
    }
}

#[derive(Clone)]
pub struct InMemoryStorage {
    store: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, String>>> {
        self.store
            .lock()
            .map_err(|_| Error::Storage("in-memory store poisoned".to_string()))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: String) -> Result<bool> {
        let mut store = self.lock()?;
        if store.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        store.insert(key.to_string(), value);
        Ok(true)
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(
    storage: &dyn StorageAdapter,
    key: &str,
) -> Result<Option<T>> {
    match storage.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Reads every JSON document under `prefix`, skipping entries that vanish
/// between listing and reading or that fail to parse.
pub(crate) fn read_all_json<T: DeserializeOwned>(
    storage: &dyn StorageAdapter,
    prefix: &str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for key in storage.list(prefix)? {
        let Some(raw) = storage.get(&key)? else {
            continue;
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => out.push(value),
            Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable document"),
        }
    }
    Ok(out)
}

pub(crate) enum Update<T> {
    Write(T),
    Keep,
}

pub(crate) struct CasOutcome<T> {
    pub value: Option<T>,
    pub changed: bool,
}

/// Read-modify-write loop over a JSON document using compare-and-swap.
/// `apply` sees the current value and may be called several times.
pub(crate) fn update_json<T, F>(
    storage: &dyn StorageAdapter,
    key: &str,
    max_attempts: u32,
    mut apply: F,
) -> Result<CasOutcome<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Result<Update<T>>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let raw = storage.get(key)?;
        let current = match &raw {
            Some(raw) => Some(serde_json::from_str::<T>(raw)?),
            None => None,
        };
        match apply(current)? {
            Update::Keep => {
                let value = match &raw {
                    Some(raw) => Some(serde_json::from_str::<T>(raw)?),
                    None => None,
                };
                return Ok(CasOutcome {
                    value,
                    changed: false,
                });
            }
            Update::Write(next) => {
                let encoded = serde_json::to_string(&next)?;
                if storage.compare_and_swap(key, raw.as_deref(), encoded)? {
                    return Ok(CasOutcome {
                        value: Some(next),
                        changed: true,
                    });
                }
                tracing::debug!(key = %key, attempt, "compare-and-swap lost, retrying");
                std::thread::yield_now();
            }
        }
    }
    Err(Error::Conflict {
        key: key.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: u32,
    }

    #[test]
    fn compare_and_swap_semantics() {
        let storage = InMemoryStorage::new();
        assert!(storage.insert_if_absent("k", "a".to_string()).unwrap());
        assert!(!storage.insert_if_absent("k", "b".to_string()).unwrap());
        assert_eq!(storage.get("k").unwrap(), Some("a".to_string()));

        assert!(!storage.compare_and_swap("k", Some("x"), "c".to_string()).unwrap());
        assert!(storage.compare_and_swap("k", Some("a"), "c".to_string()).unwrap());
        assert_eq!(storage.get("k").unwrap(), Some("c".to_string()));
    }

    #[test]
    fn list_filters_by_prefix() {
        let storage = InMemoryStorage::new();
        storage.put("messages/a/1", "1".to_string()).unwrap();
        storage.put("messages/a/2", "2".to_string()).unwrap();
        storage.put("messages/b/1", "3".to_string()).unwrap();

        let mut keys = storage.list("messages/a/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["messages/a/1", "messages/a/2"]);
        storage.del("messages/a/1").unwrap();
        assert_eq!(storage.list("messages/a/").unwrap().len(), 1);
    }

    #[test]
    fn update_json_creates_and_increments() {
        let storage = InMemoryStorage::new();
        for _ in 0..3 {
            update_json::<Counter, _>(&storage, "counter", 4, |current| {
                let value = current.map(|c| c.value).unwrap_or(0);
                Ok(Update::Write(Counter { value: value + 1 }))
            })
            .unwrap();
        }
        let counter: Counter = read_json(&storage, "counter").unwrap().unwrap();
        assert_eq!(counter.value, 3);
    }

    #[test]
    fn update_json_keep_returns_current() {
        let storage = InMemoryStorage::new();
        storage
            .put("counter", serde_json::to_string(&Counter { value: 7 }).unwrap())
            .unwrap();
        let outcome = update_json::<Counter, _>(&storage, "counter", 4, |_| Ok(Update::Keep)).unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.value, Some(Counter { value: 7 }));
    }

    #[test]
    fn update_json_gives_up_after_repeated_conflicts() {
        let storage = InMemoryStorage::new();
        storage
            .put("counter", serde_json::to_string(&Counter { value: 0 }).unwrap())
            .unwrap();
        let mut calls = 0;
        let result = update_json::<Counter, _>(&storage, "counter", 3, |current| {
            calls += 1;
            // Another writer sneaks in between our read and our write.
            storage
                .put(
                    "counter",
                    serde_json::to_string(&Counter { value: 100 + calls }).unwrap(),
                )
                .unwrap();
            let value = current.map(|c| c.value).unwrap_or(0);
            Ok(Update::Write(Counter { value: value + 1 }))
        });
        assert!(matches!(result, Err(Error::Conflict { attempts: 3, .. })));
        assert_eq!(calls, 3);
    }
}
