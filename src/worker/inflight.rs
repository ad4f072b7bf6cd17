use crate::store::StoreError;
use crate::transport::ResultEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;

const INFLIGHT_FILE: &str = "inflight.json";

/// An accepted attempt whose RESULT has not been acknowledged yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InflightEntry {
    pub workflow_instance_id: String,
    pub task_instance_id: String,
    pub attempt: u32,
    pub master_host: String,
    /// Set once the attempt finished; cleared with the entry on ack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultEvent>,
}

/// Worker's in-flight set, mirrored to `<state_dir>/inflight.json`
///
/// Without a state dir the set lives in memory only and a restarted worker
/// has nothing to reconcile.
pub struct InflightStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<(String, u32), InflightEntry>>,
}

impl InflightStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load entries left behind by a previous run
    pub async fn open(state_dir: Option<PathBuf>) -> Result<Self, StoreError> {
        let Some(dir) = state_dir else {
            return Ok(Self::in_memory());
        };
        fs::create_dir_all(&dir).await?;
        let path = dir.join(INFLIGHT_FILE);

        let entries = match fs::read_to_string(&path).await {
            Ok(content) => {
                let list: Vec<InflightEntry> =
                    serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                list.into_iter()
                    .map(|entry| ((entry.task_instance_id.clone(), entry.attempt), entry))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub async fn insert(&self, entry: InflightEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert((entry.task_instance_id.clone(), entry.attempt), entry);
        self.persist(&entries).await
    }

    /// Record the RESULT of a finished attempt until it is acknowledged
    pub async fn finish(&self, result: ResultEvent) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        let key = (result.task_instance_id.clone(), result.attempt);
        match entries.get_mut(&key) {
            Some(entry) => entry.result = Some(result),
            None => {
                let entry = InflightEntry {
                    workflow_instance_id: result.workflow_instance_id.clone(),
                    task_instance_id: result.task_instance_id.clone(),
                    attempt: result.attempt,
                    master_host: String::new(),
                    result: Some(result),
                };
                entries.insert(key, entry);
            }
        }
        self.persist(&entries).await
    }

    pub async fn remove(&self, task_instance_id: &str, attempt: u32) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(&(task_instance_id.to_string(), attempt)).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    pub async fn entries(&self) -> Vec<InflightEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    async fn persist(&self, entries: &BTreeMap<(String, u32), InflightEntry>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let list: Vec<&InflightEntry> = entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&list).map_err(|e| StoreError::Encode(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, attempt: u32) -> InflightEntry {
        InflightEntry {
            workflow_instance_id: "wf".to_string(),
            task_instance_id: id.to_string(),
            attempt,
            master_host: "m1".to_string(),
            result: None,
        }
    }

    fn outcome(id: &str, attempt: u32) -> ResultEvent {
        ResultEvent {
            workflow_instance_id: "wf".to_string(),
            task_instance_id: id.to_string(),
            attempt,
            worker_host: "w1".to_string(),
            outcome: crate::transport::TaskOutcome::Success,
            output_vars: Default::default(),
            exit_code: Some(0),
            message: None,
            end_time: 1,
        }
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = InflightStore::open(Some(dir.path().to_path_buf())).await.unwrap();
        store.insert(entry("t1", 1)).await.unwrap();
        store.insert(entry("t2", 1)).await.unwrap();
        store.remove("t1", 1).await.unwrap();
        drop(store);

        let reopened = InflightStore::open(Some(dir.path().to_path_buf())).await.unwrap();
        assert_eq!(reopened.entries().await, vec![entry("t2", 1)]);
    }

    #[tokio::test]
    async fn test_finished_result_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = InflightStore::open(Some(dir.path().to_path_buf())).await.unwrap();
        store.insert(entry("t1", 1)).await.unwrap();
        store.finish(outcome("t1", 1)).await.unwrap();
        drop(store);

        let reopened = InflightStore::open(Some(dir.path().to_path_buf())).await.unwrap();
        let entries = reopened.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].master_host, "m1");
        assert_eq!(entries[0].result, Some(outcome("t1", 1)));

        reopened.remove("t1", 1).await.unwrap();
        assert!(reopened.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INFLIGHT_FILE), b"{not json").unwrap();
        assert!(matches!(
            InflightStore::open(Some(dir.path().to_path_buf())).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store_does_not_touch_disk() {
        let store = InflightStore::open(None).await.unwrap();
        store.insert(entry("t1", 1)).await.unwrap();
        assert_eq!(store.entries().await.len(), 1);
    }
}
