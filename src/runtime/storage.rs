use futures::{future::BoxFuture, FutureExt};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::error::{Error, Result};

/// Per-thread shared variables, as seen by value handlers. Values are opaque
/// payloads; `indices` address one element of an array variable and are
/// empty for a whole variable.
pub trait Storage: Send + Sync {
    fn get(&self, name: &str, indices: &[u32]) -> Result<Vec<u8>>;

    /// Stores a value and counts one modification of `name`.
    fn put(&self, name: &str, value: Vec<u8>, indices: &[u32]) -> Result<()>;

    /// Starts counting modifications of `name` from zero.
    fn monitor(&self, name: &str) -> Result<()>;

    /// Waits until `name` has been modified `count` times since the last
    /// `monitor`, then consumes those modifications.
    fn wait_for(&self, name: &str, count: u64) -> BoxFuture<'_, Result<()>>;
}

#[derive(Default)]
struct Variable {
    values: HashMap<Vec<u32>, Vec<u8>>,
    modifications: u64,
}

/// A `Storage` kept entirely in memory.
#[derive(Default)]
pub struct MemoryStorage {
    variables: Mutex<HashMap<String, Variable>>,
    modified: Notify,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, name: &str, indices: &[u32]) -> Result<Vec<u8>> {
        let variables = self.variables.lock();
        let variable = variables
            .get(name)
            .ok_or_else(|| Error::Storage(format!("no variable named {:?}", name)))?;
        variable.values.get(indices).cloned().ok_or_else(|| {
            Error::Storage(format!("variable {:?} has no value at {:?}", name, indices))
        })
    }

    fn put(&self, name: &str, value: Vec<u8>, indices: &[u32]) -> Result<()> {
        {
            let mut variables = self.variables.lock();
            let variable = variables.entry(name.to_string()).or_default();
            variable.values.insert(indices.to_vec(), value);
            variable.modifications += 1;
        }
        self.modified.notify_waiters();
        Ok(())
    }

    fn monitor(&self, name: &str) -> Result<()> {
        self.variables
            .lock()
            .entry(name.to_string())
            .or_default()
            .modifications = 0;
        Ok(())
    }

    fn wait_for(&self, name: &str, count: u64) -> BoxFuture<'_, Result<()>> {
        let name = name.to_string();
        async move {
            loop {
                let modified = self.modified.notified();
                tokio::pin!(modified);
                modified.as_mut().enable();
                {
                    let mut variables = self.variables.lock();
                    let variable = variables.entry(name.clone()).or_default();
                    if variable.modifications >= count {
                        variable.modifications -= count;
                        return Ok(());
                    }
                }
                modified.await;
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn values_are_addressed_by_name_and_indices() {
        let storage = MemoryStorage::new();
        assert!(matches!(storage.get("a", &[]), Err(Error::Storage(_))));

        storage.put("a", vec![1], &[]).unwrap();
        storage.put("a", vec![2], &[3]).unwrap();
        storage.put("a", vec![4], &[3, 1]).unwrap();
        assert_eq!(storage.get("a", &[]).unwrap(), vec![1]);
        assert_eq!(storage.get("a", &[3]).unwrap(), vec![2]);
        assert_eq!(storage.get("a", &[3, 1]).unwrap(), vec![4]);
        assert!(storage.get("a", &[0]).is_err());
    }

    #[tokio::test]
    async fn wait_for_consumes_modifications() {
        let storage = Arc::new(MemoryStorage::new());
        storage.monitor("x").unwrap();
        storage.put("x", vec![0], &[]).unwrap();

        let waiter = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.wait_for("x", 3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        storage.put("x", vec![1], &[]).unwrap();
        storage.put("x", vec![2], &[]).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // the three modifications were consumed
        let again = tokio::time::timeout(Duration::from_millis(20), storage.wait_for("x", 1)).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn monitor_restarts_the_count() {
        let storage = MemoryStorage::new();
        storage.put("y", vec![0], &[]).unwrap();
        storage.put("y", vec![0], &[]).unwrap();
        storage.monitor("y").unwrap();
        storage.put("y", vec![0], &[]).unwrap();
        storage.wait_for("y", 1).await.unwrap();
        let again = tokio::time::timeout(Duration::from_millis(20), storage.wait_for("y", 1)).await;
        assert!(again.is_err());
    }
}
