//! Per-origin allow list.

use std::sync::Arc;

use crate::broker::{Origin, SiteTrustEntry, timestamp_now};
use crate::db::Database;
use crate::error::BrokerError;

/// Persistent mapping from website origin to the account address it may see.
///
/// Holds no cache: every call goes to the store, so entries written by the
/// approval surface are visible to the ingress immediately.
#[derive(Clone)]
pub struct SiteTrustRegistry {
    store: Arc<dyn Database>,
}

impl SiteTrustRegistry {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    pub async fn lookup(&self, origin: &Origin) -> Result<Option<SiteTrustEntry>, BrokerError> {
        Ok(self.store.get_site(origin).await?)
    }

    /// Record that `origin` may see `account_address`. An existing entry is
    /// updated in place and keeps its `connected_at`.
    pub async fn upsert(
        &self,
        origin: &Origin,
        account_address: &str,
    ) -> Result<SiteTrustEntry, BrokerError> {
        let entry = self
            .store
            .upsert_site(origin, account_address, timestamp_now())
            .await?;
        tracing::info!(origin = %origin, account = %account_address, "Site trusted");
        Ok(entry)
    }

    /// Bump `last_used_at`. Returns false when the site is not trusted.
    pub async fn touch(&self, origin: &Origin) -> Result<bool, BrokerError> {
        Ok(self.store.touch_site(origin, timestamp_now()).await?)
    }

    /// Forget the site. Returns false when it was not trusted.
    pub async fn remove(&self, origin: &Origin) -> Result<bool, BrokerError> {
        let removed = self.store.delete_site(origin).await?;
        if removed {
            tracing::info!(origin = %origin, "Site trust removed");
        }
        Ok(removed)
    }

    /// Every trusted site, oldest connection first.
    pub async fn list(&self) -> Result<Vec<SiteTrustEntry>, BrokerError> {
        Ok(self.store.list_sites().await?)
    }
}
