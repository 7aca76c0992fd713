/*!
Per-run identity and shared resources handed to every check
*/

use std::sync::Arc;

use cloud_inventory::{ApiError, ServiceClients};
use serde_json::Value;
use tokio::time::Instant;

use crate::core::cache::RunCache;
use crate::core::finding::{Finding, FindingBuilder};

/// Account, region and partition being audited plus the run's cache and clients.
///
/// Cloning is cheap; all clones share the same cache.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub account_id: Arc<str>,
    pub region: Arc<str>,
    pub partition: Arc<str>,
    pub cache: Arc<RunCache>,
    pub clients: Arc<ServiceClients>,
    pub deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(
        account_id: impl Into<Arc<str>>,
        region: impl Into<Arc<str>>,
        partition: impl Into<Arc<str>>,
        clients: Arc<ServiceClients>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            partition: partition.into(),
            cache: Arc::new(RunCache::new()),
            clients,
            deadline: None,
        }
    }

    /// Stop starting or continuing checks after `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Finding builder pre-filled with this run's account, region and partition
    pub fn finding(&self, check_slug: &str) -> FindingBuilder {
        Finding::builder(&*self.account_id, &*self.region, &*self.partition).check(check_slug)
    }

    /// Upstream call memoized under `key` for the rest of the run
    pub async fn cached(
        &self,
        key: &str,
        service: &str,
        operation: &str,
        request: Value,
    ) -> Result<Arc<Value>, ApiError> {
        self.cache
            .get_or_compute(key, || self.clients.invoke(service, operation, request))
            .await
    }

    /// Build an ARN in this run's partition
    pub fn arn(&self, service: &str, region: &str, account: &str, resource: &str) -> String {
        format!("arn:{}:{service}:{region}:{account}:{resource}", self.partition)
    }
}
