//! Sideband payload storage.
//!
//! Rows too large for the notification payload cap are spilled by the
//! producer into `collections.large_notifications` and referenced by id.
//! The forwarder resolves such references on demand through a
//! [`SidebandStore`], and only for events that pass the watcher's filter and
//! start-time bound, so filtered-out traffic costs no queries.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_postgres::NoTls;

use crate::config::ListenerConfig;
use crate::error::WatchError;

const SIDEBAND_QUERY: &str = "SELECT proto FROM collections.large_notifications WHERE id = $1";

/// Reads oversized event payloads by sideband row id.
///
/// `Ok(None)` means the row is gone: the producer garbage-collects spilled
/// rows after a retention bound, so a miss means the watcher is lagging and
/// surfaces as the "latency may be too high" error.
#[async_trait]
pub trait SidebandStore: Send + Sync + 'static {
    /// Fetches the serialized row for `id`, or `None` if it no longer
    /// exists.
    async fn fetch(&self, id: &str) -> Result<Option<Bytes>, WatchError>;
}

/// Postgres-backed [`SidebandStore`].
pub struct PgSidebandStore {
    client: Arc<tokio_postgres::Client>,
}

impl PgSidebandStore {
    /// Wraps an existing client whose connection is driven elsewhere.
    #[must_use]
    pub fn new(client: Arc<tokio_postgres::Client>) -> Self {
        Self { client }
    }

    /// Opens a dedicated connection for sideband reads.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Db`] if the connection cannot be established.
    pub async fn connect(config: &ListenerConfig) -> Result<Self, WatchError> {
        let (client, connection) = tokio_postgres::connect(&config.dsn, NoTls)
            .await
            .map_err(|e| WatchError::Db(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "sideband connection terminated");
            }
        });
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl SidebandStore for PgSidebandStore {
    async fn fetch(&self, id: &str) -> Result<Option<Bytes>, WatchError> {
        let row = self
            .client
            .query_opt(SIDEBAND_QUERY, &[&id])
            .await
            .map_err(|e| WatchError::Db(e.to_string()))?;
        Ok(row.map(|r| Bytes::from(r.get::<_, Vec<u8>>(0))))
    }
}
