//! The task table: a reader/writer-locked map from task ID to handle.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::DriverError;

/// Thread-safe map from task ID to a shared task handle.
///
/// Keys are unique; inserting an existing ID fails loudly instead of
/// replacing the live handle.
#[derive(Debug)]
pub struct TaskStore<H> {
    inner: RwLock<HashMap<String, Arc<H>>>,
}

impl<H> TaskStore<H> {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a handle under `id`.
    ///
    /// # Errors
    ///
    /// [`DriverError::DuplicateTask`] when `id` is already present.
    pub fn put(&self, id: &str, handle: Arc<H>) -> Result<(), DriverError> {
        let mut inner = self.inner.write().expect("task store lock poisoned");
        if inner.contains_key(id) {
            return Err(DriverError::DuplicateTask(id.to_string()));
        }
        inner.insert(id.to_string(), handle);
        Ok(())
    }

    /// Look up the handle for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<H>> {
        self.inner
            .read()
            .expect("task store lock poisoned")
            .get(id)
            .cloned()
    }

    /// Remove and return the handle for `id`.
    pub fn delete(&self, id: &str) -> Option<Arc<H>> {
        self.inner
            .write()
            .expect("task store lock poisoned")
            .remove(id)
    }

    /// The registered task IDs.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("task store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("task store lock poisoned").len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H> Default for TaskStore<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store: TaskStore<u32> = TaskStore::new();
        store.put("t1", Arc::new(7)).expect("put");
        assert_eq!(store.get("t1").as_deref(), Some(&7));
        assert_eq!(store.delete("t1").as_deref(), Some(&7));
        assert!(store.get("t1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_insert_fails_loudly() {
        let store: TaskStore<u32> = TaskStore::new();
        store.put("t1", Arc::new(1)).expect("first put");
        let err = store.put("t1", Arc::new(2)).unwrap_err();
        assert!(matches!(err, DriverError::DuplicateTask(_)));
        // the original handle is untouched
        assert_eq!(store.get("t1").as_deref(), Some(&1));
    }

    #[test]
    fn test_concurrent_access_is_consistent() {
        let store: Arc<TaskStore<usize>> = Arc::new(TaskStore::new());
        let mut handles = Vec::new();
        for worker in 0..8usize {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for round in 0..100usize {
                    let id = format!("task-{worker}-{round}");
                    store.put(&id, Arc::new(round)).expect("unique put");
                    // a concurrent reader sees the entry or nothing; never
                    // a torn state
                    let got = store.get(&id).expect("just inserted");
                    assert_eq!(*got, round);
                    assert!(store.delete(&id).is_some());
                    assert!(store.get(&id).is_none());
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert!(store.is_empty());
    }
}
