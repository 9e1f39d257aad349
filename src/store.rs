// =============================================================================
// store.rs - WHERE THE BIDS GO TO LIVE
// =============================================================================
//
// The datastore is a Supabase project, which means PostgREST, which means
// every query is a URL and every insert is a POST. We need exactly two
// operations from it:
//
//   exists:  GET  /rest/v1/<table>?select=id&date=eq.X&commodity=eq.Y&elevator_name=eq.Z&limit=1
//   insert:  POST /rest/v1/<table>   (Prefer: return=minimal)
//
// The schema, the row ids and the retention policy all belong to whoever
// owns the Supabase project. We never update, never delete.
// =============================================================================

use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{BasisEntry, EntryKey};

/// The two things the pipeline needs from a datastore.
pub trait BasisStore: Send + Sync {
    /// Is there already a row for this (date, commodity, elevator)?
    fn exists<'a>(&'a self, key: &'a EntryKey) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn insert<'a>(&'a self, entry: &'a BasisEntry) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// PostgREST client for the Supabase-hosted table.
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    table: String,
}

impl SupabaseStore {
    pub fn new(
        base_url: &str,
        api_key: &str,
        table: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("CashBidEngine/1.0 (basis-tracker)")
            .build()?;

        info!(
            base_url = base_url,
            table = table,
            "Supabase store configured"
        );

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            table: table.to_string(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn exists_url(&self, key: &EntryKey) -> String {
        format!(
            "{}?select=id&date=eq.{}&commodity=eq.{}&elevator_name=eq.{}&limit=1",
            self.table_url(),
            key.date_string(),
            key.commodity,
            urlencoding::encode(&key.elevator_name),
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

impl BasisStore for SupabaseStore {
    fn exists<'a>(&'a self, key: &'a EntryKey) -> BoxFuture<'a, Result<bool, StoreError>> {
        async move {
            let url = self.exists_url(key);
            let response = self.authorized(self.client.get(&url)).send().await?;
            let response = error_for_status(response).await?;

            let rows: Vec<serde_json::Value> = response
                .json()
                .await
                .map_err(|e| StoreError::Decode(e.to_string()))?;

            debug!(
                key = key.memo_key().as_str(),
                found = !rows.is_empty(),
                "Existence check"
            );
            Ok(!rows.is_empty())
        }
        .boxed()
    }

    fn insert<'a>(&'a self, entry: &'a BasisEntry) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            let response = self
                .authorized(self.client.post(self.table_url()))
                .header("Prefer", "return=minimal")
                .json(entry)
                .send()
                .await?;
            error_for_status(response).await?;
            Ok(())
        }
        .boxed()
    }
}

/// In-process store. Lets the pipeline run without a Supabase project.
#[cfg(test)]
pub struct MemoryStore {
    rows: parking_lot::Mutex<Vec<BasisEntry>>,
    failing_elevators: Vec<String>,
    exists_calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::with_entries(Vec::new())
    }

    pub fn with_entries(rows: Vec<BasisEntry>) -> Self {
        Self {
            rows: parking_lot::Mutex::new(rows),
            failing_elevators: Vec::new(),
            exists_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Inserts for this elevator fail with a 500.
    pub fn failing_for(mut self, elevator: &str) -> Self {
        self.failing_elevators.push(elevator.to_string());
        self
    }

    pub fn rows(&self) -> Vec<BasisEntry> {
        self.rows.lock().clone()
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
impl BasisStore for MemoryStore {
    fn exists<'a>(&'a self, key: &'a EntryKey) -> BoxFuture<'a, Result<bool, StoreError>> {
        self.exists_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let found = self.rows.lock().iter().any(|row| row.key() == *key);
        async move { Ok(found) }.boxed()
    }

    fn insert<'a>(&'a self, entry: &'a BasisEntry) -> BoxFuture<'a, Result<(), StoreError>> {
        let result = if self.failing_elevators.contains(&entry.elevator_name) {
            Err(StoreError::Status {
                status: 500,
                body: "insert rejected".to_string(),
            })
        } else {
            self.rows.lock().push(entry.clone());
            Ok(())
        };
        async move { result }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Commodity;
    use chrono::NaiveDate;

    #[test]
    fn test_exists_url_filters_on_the_uniqueness_triple() {
        let store = SupabaseStore::new(
            "https://project.supabase.co/",
            "anon-key",
            "basis_entries",
            Duration::from_secs(5),
        )
        .unwrap();
        let key = EntryKey {
            date: NaiveDate::from_ymd_opt(2024, 11, 5).unwrap(),
            commodity: Commodity::Soybeans,
            elevator_name: "Hampton Co-op".to_string(),
        };

        assert_eq!(
            store.exists_url(&key),
            "https://project.supabase.co/rest/v1/basis_entries?select=id&date=eq.2024-11-05\
             &commodity=eq.soybeans&elevator_name=eq.Hampton%20Co-op&limit=1"
        );
    }

    #[tokio::test]
    async fn test_memory_store_exists_after_insert() {
        let store = MemoryStore::new();
        let entry = BasisEntry {
            date: NaiveDate::from_ymd_opt(2024, 11, 5).unwrap(),
            commodity: Commodity::Corn,
            elevator_name: "Dows".to_string(),
            basis_value: -40.0,
            cash_price: None,
            futures_month: None,
            notes: String::new(),
        };
        assert!(!store.exists(&entry.key()).await.unwrap());
        store.insert(&entry).await.unwrap();
        assert!(store.exists(&entry.key()).await.unwrap());
    }
}
