use log::{ info, error };
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::models::report::AnalysisReport;
use crate::storage::{ get_json, history_key, put_json, KeyValueStore };

/// The working copy of one user's reports, newest first.
struct LoadedHistory {
    owner: String,
    reports: Vec<AnalysisReport>,
}

/// Per-user append-only report log. One user's history is kept in working
/// memory at a time; the store holds everyone's under `history:<email>`.
pub struct HistoryLedger {
    store: Arc<dyn KeyValueStore>,
    working: RwLock<Option<LoadedHistory>>,
}

impl HistoryLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            working: RwLock::new(None),
        }
    }

    async fn read_persisted(&self, user_key: &str) -> Result<Vec<AnalysisReport>, AppError> {
        let key = history_key(user_key);
        Ok(get_json::<Vec<AnalysisReport>>(self.store.as_ref(), &key).await?.unwrap_or_default())
    }

    /// Loads `user_key`'s history from storage and makes it the working copy.
    pub async fn load(&self, user_key: &str) -> Result<Vec<AnalysisReport>, AppError> {
        let reports = self.read_persisted(user_key).await?;
        info!("Loaded {} report(s) for {}", reports.len(), user_key);
        *self.working.write().await = Some(LoadedHistory {
            owner: user_key.to_string(),
            reports: reports.clone(),
        });
        Ok(reports)
    }

    /// Prepends `report` and persists the whole sequence. If the write fails the
    /// working copy already holds the report while storage does not.
    pub async fn append(&self, user_key: &str, report: AnalysisReport) -> Result<(), AppError> {
        let mut working = self.working.write().await;
        let needs_load = working
            .as_ref()
            .map(|loaded| loaded.owner != user_key)
            .unwrap_or(true);
        if needs_load {
            let reports = self.read_persisted(user_key).await?;
            *working = Some(LoadedHistory { owner: user_key.to_string(), reports });
        }

        let loaded = match working.as_mut() {
            Some(loaded) => loaded,
            None => return Err(AppError::Internal("history working copy missing".to_string())),
        };
        loaded.reports.insert(0, report);

        let key = history_key(user_key);
        if let Err(e) = put_json(self.store.as_ref(), &key, &loaded.reports).await {
            error!("Failed to persist history for {}: {}", user_key, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// The working copy, or empty when no user is loaded or `user_key` is not
    /// the loaded user.
    pub async fn entries(&self, user_key: &str) -> Vec<AnalysisReport> {
        match self.working.read().await.as_ref() {
            Some(loaded) if loaded.owner == user_key => loaded.reports.clone(),
            _ => Vec::new(),
        }
    }

    /// Drops the working copy. Storage is untouched.
    pub async fn clear(&self) {
        *self.working.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::report::PossibleCondition;
    use crate::storage::{ MemoryStore, StorageError };
    use async_trait::async_trait;

    fn report(id: &str) -> AnalysisReport {
        AnalysisReport {
            id: id.to_string(),
            date: "1/1/2026, 9:00:00 AM".to_string(),
            image: "data:image/png;base64,AAAA".to_string(),
            possible_conditions: vec![PossibleCondition {
                name: "Acne".to_string(),
                confidence_score: 55.0,
                description: "Clogged pores.".to_string(),
                symptoms: None,
                treatment_suggestions: None,
            }],
            disclaimer: "Consult a dermatologist.".to_string(),
        }
    }

    #[tokio::test]
    async fn load_of_unknown_user_is_empty() {
        let ledger = HistoryLedger::new(Arc::new(MemoryStore::new()));
        assert!(ledger.load("nobody@example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn appends_are_newest_first_and_survive_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ledger = HistoryLedger::new(Arc::clone(&store));
        ledger.load("ada@example.com").await.unwrap();

        for id in ["r1", "r2", "r3"] {
            ledger.append("ada@example.com", report(id)).await.unwrap();
        }
        let ids: Vec<String> = ledger
            .entries("ada@example.com").await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["r3", "r2", "r1"]);

        ledger.clear().await;
        assert!(ledger.entries("ada@example.com").await.is_empty());

        let fresh = HistoryLedger::new(store);
        let restored = fresh.load("ada@example.com").await.unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored[0].id, "r3");
    }

    #[tokio::test]
    async fn histories_are_scoped_per_user() {
        let ledger = HistoryLedger::new(Arc::new(MemoryStore::new()));
        ledger.append("ada@example.com", report("a1")).await.unwrap();
        ledger.append("bob@example.com", report("b1")).await.unwrap();

        assert_eq!(ledger.load("ada@example.com").await.unwrap().len(), 1);
        assert_eq!(ledger.load("bob@example.com").await.unwrap()[0].id, "b1");
        assert!(ledger.entries("ada@example.com").await.is_empty());
    }

    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl KeyValueStore for ReadOnlyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, _key: &str, _value: String) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }

        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key).await
        }
    }

    // Known limitation: no partial-write recovery. A failed persist leaves the
    // report in working memory only.
    #[tokio::test]
    async fn failed_persist_keeps_report_in_memory_only() {
        let store: Arc<dyn KeyValueStore> = Arc::new(ReadOnlyStore { inner: MemoryStore::new() });
        let ledger = HistoryLedger::new(Arc::clone(&store));
        ledger.load("ada@example.com").await.unwrap();

        let err = ledger.append("ada@example.com", report("lost")).await.unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        assert_eq!(ledger.entries("ada@example.com").await.len(), 1);
        assert!(ledger.load("ada@example.com").await.unwrap().is_empty());
    }
}
