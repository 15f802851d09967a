//! The process-wide notification listener.
//!
//! One [`Listener`] per DSN multiplexes a single notification connection
//! across every watcher in the process. The registry maps channel name to
//! watcher set; a long-running multiplex task decodes each inbound
//! notification once and routes it to the channel's watchers with
//! non-blocking staging pushes, so one slow consumer can never stall the
//! rest.
//!
//! # Lock discipline
//!
//! A single async mutex guards the registry, the transport handle, and the
//! closed flag. It is held while routing a notification (watcher sets must
//! not mutate mid-dispatch) and across `LISTEN`/`UNLISTEN` round-trips;
//! per-watcher dispatch under it is `try_send`-only, which bounds the
//! critical section. The overflow-abort path re-acquires this mutex and is
//! therefore always dispatched to a fresh task, never run inline.
//!
//! # Failure model
//!
//! Connection loss and `LISTEN`/`UNLISTEN` failures are fatal for every
//! registered watcher: `reset` broadcasts one error event to each and
//! clears the registry. Notifications emitted while the connection is down
//! are unrecoverable, so callers rebuild from a fresh list+watch instead
//! of trusting a silently resubscribed stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec;
use crate::config::ListenerConfig;
use crate::conn::{ConnMessage, Connector, NotifyTransport, PgConnector};
use crate::error::WatchError;
use crate::event::{Staged, TypeTag, WatchFilter};
use crate::metrics::ListenerMetrics;
use crate::sideband::SidebandStore;
use crate::watcher::{Watcher, WatcherCore};

type WatcherSet = HashMap<u64, Arc<WatcherCore>>;

pub(crate) struct ListenerShared {
    config: ListenerConfig,
    connector: Arc<dyn Connector>,
    sideband: Arc<dyn SidebandStore>,
    metrics: Arc<ListenerMetrics>,
    next_watcher_id: AtomicU64,
    state: Mutex<ListenerState>,
}

struct ListenerState {
    channels: HashMap<String, WatcherSet>,
    transport: Option<Arc<dyn NotifyTransport>>,
    multiplex: Option<JoinHandle<()>>,
    closed: bool,
}

/// Process-wide Postgres notification fan-out.
///
/// Cheap to clone; all clones share one connection and registry. The
/// notification connection is created lazily on the first
/// [`listen`](Listener::listen) so an unused listener holds no database
/// resources and can always be closed cleanly.
#[derive(Clone)]
pub struct Listener {
    shared: Arc<ListenerShared>,
}

impl Listener {
    /// Creates a listener that connects with [`PgConnector`].
    ///
    /// The sideband store is passed in by the surrounding service (it
    /// usually shares the service's query connection).
    #[must_use]
    pub fn new(config: ListenerConfig, sideband: Arc<dyn SidebandStore>) -> Self {
        let connector = Arc::new(PgConnector::new(config.clone()));
        Self::with_connector(config, connector, sideband)
    }

    /// Creates a listener over a custom [`Connector`], the seam used by
    /// the in-memory transport in [`crate::testing`].
    #[must_use]
    pub fn with_connector(
        config: ListenerConfig,
        connector: Arc<dyn Connector>,
        sideband: Arc<dyn SidebandStore>,
    ) -> Self {
        Self {
            shared: Arc::new(ListenerShared {
                config,
                connector,
                sideband,
                metrics: Arc::new(ListenerMetrics::default()),
                next_watcher_id: AtomicU64::new(1),
                state: Mutex::new(ListenerState {
                    channels: HashMap::new(),
                    transport: None,
                    multiplex: None,
                    closed: false,
                }),
            }),
        }
    }

    /// Registers a watcher on `channel`.
    ///
    /// The first watcher on a channel issues the database-side `LISTEN`.
    /// The returned watcher is in the pending state: seed it with
    /// [`Watcher::send_initial`] as needed, then call
    /// [`Watcher::start_forwarding`].
    ///
    /// # Errors
    ///
    /// [`WatchError::ListenerClosed`] after [`close`](Listener::close);
    /// a connection or `LISTEN` failure is returned as-is, after resetting
    /// every registered watcher.
    pub async fn listen(
        &self,
        channel: &str,
        tag: impl Into<TypeTag>,
        filter: WatchFilter,
    ) -> Result<Watcher, WatchError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if state.closed {
            return Err(WatchError::ListenerClosed);
        }

        let transport = match state.transport.as_ref() {
            Some(transport) => Arc::clone(transport),
            None => {
                let (transport, messages) = shared.connector.connect().await?;
                state.multiplex = Some(tokio::spawn(multiplex(Arc::clone(shared), messages)));
                state.transport = Some(Arc::clone(&transport));
                transport
            }
        };

        if !state.channels.contains_key(channel) {
            if let Err(err) = transport.listen(channel).await {
                // Error out all watches so listener and database state
                // cannot desync.
                shared.reset_locked(&mut state, err.clone()).await;
                return Err(err);
            }
            state.channels.insert(channel.to_string(), WatcherSet::new());
        }

        let id = shared.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let (out_tx, out_rx) = mpsc::channel(1);
        let (staging_tx, staging_rx) = mpsc::channel(shared.config.staging_capacity.max(1));
        let core = Arc::new(WatcherCore::new(
            id,
            channel,
            filter,
            tag.into(),
            staging_tx,
            Arc::downgrade(shared),
            Arc::clone(&shared.metrics),
        ));
        if let Some(set) = state.channels.get_mut(channel) {
            set.insert(id, Arc::clone(&core));
        }
        debug!(channel, id, "registered watcher");

        Ok(Watcher::new(
            core,
            Arc::clone(shared),
            out_tx,
            out_rx,
            staging_rx,
            Arc::clone(&shared.sideband),
        ))
    }

    /// Closes the listener: tears down the connection, drains the
    /// multiplex task, and errors out any remaining watchers. Idempotent.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps room for teardown
    /// reporting.
    pub async fn close(&self) -> Result<(), WatchError> {
        let (transport, multiplex) = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (state.transport.clone(), state.multiplex.take())
        };

        if let Some(transport) = transport {
            transport.close().await;
        }
        if let Some(multiplex) = multiplex {
            // The transport's message stream ends after close(), which is
            // what terminates the loop.
            let _ = multiplex.await;
        }

        let mut state = self.shared.state.lock().await;
        if !state.channels.is_empty() {
            self.shared
                .reset_locked(&mut state, WatchError::ListenerClosed)
                .await;
        }
        Ok(())
    }

    /// Number of registered watchers across all channels.
    pub async fn watcher_count(&self) -> usize {
        let state = self.shared.state.lock().await;
        state.channels.values().map(WatcherSet::len).sum()
    }

    /// Number of channels with at least one watcher.
    pub async fn channel_count(&self) -> usize {
        let state = self.shared.state.lock().await;
        state.channels.len()
    }

    /// Listener metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<ListenerMetrics> {
        Arc::clone(&self.shared.metrics)
    }
}

impl ListenerShared {
    /// Removes one watcher; the last watcher on a channel also drops the
    /// database-side `LISTEN`.
    pub(crate) async fn unregister(&self, channel: &str, id: u64) {
        let mut state = self.state.lock().await;
        let channel_empty = match state.channels.get_mut(channel) {
            Some(set) => {
                if set.remove(&id).is_none() {
                    return;
                }
                set.is_empty()
            }
            None => return,
        };
        debug!(channel, id, "unregistered watcher");

        if channel_empty {
            state.channels.remove(channel);
            let transport = state.transport.clone();
            if let Some(transport) = transport {
                if let Err(err) = transport.unlisten(channel).await {
                    self.reset_locked(&mut state, err).await;
                }
            }
        }
    }

    /// Errors out every watcher and clears the registry. Must be called
    /// with the state lock held. This is the sole recovery path for
    /// connection loss and registry-level failures.
    async fn reset_locked(&self, state: &mut ListenerState, err: WatchError) {
        self.metrics.resets.fetch_add(1, Ordering::Relaxed);
        let watchers: usize = state.channels.values().map(WatcherSet::len).sum();
        warn!(error = %err, watchers, "resetting all watchers");

        let staged: Staged = Err(err);
        for set in state.channels.values() {
            for core in set.values() {
                core.send_change(&staged);
            }
        }
        state.channels.clear();

        if !state.closed {
            if let Some(transport) = state.transport.clone() {
                // Reset already represents a failure; nothing further to
                // invalidate if this fails too.
                let _ = transport.unlisten_all().await;
            }
        }
    }
}

/// Multiplex loop: routes each inbound notification to the channel's
/// watchers; a connection loss resets everything.
async fn multiplex(
    shared: Arc<ListenerShared>,
    mut messages: mpsc::UnboundedReceiver<ConnMessage>,
) {
    while let Some(message) = messages.recv().await {
        match message {
            ConnMessage::ConnectionLost => {
                let mut state = shared.state.lock().await;
                shared
                    .reset_locked(&mut state, WatchError::ConnectionLost)
                    .await;
            }
            ConnMessage::Notification { channel, payload } => {
                let state = shared.state.lock().await;
                // Channels nobody watches are not even decoded.
                let Some(watchers) = state.channels.get(&channel) else {
                    continue;
                };
                let staged: Staged = match codec::decode_notification(&payload) {
                    Ok(event) => Ok(Arc::new(event)),
                    Err(err) => {
                        shared.metrics.parse_failures.fetch_add(1, Ordering::Relaxed);
                        Err(err)
                    }
                };
                shared
                    .metrics
                    .notifications_routed
                    .fetch_add(1, Ordering::Relaxed);
                for core in watchers.values() {
                    core.send_change(&staged);
                }
            }
        }
    }
    debug!("notification stream ended, multiplex loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for, MockConnector, MockSideband};
    use std::time::Duration;

    fn mock_listener() -> (Listener, MockConnector, Arc<MockSideband>) {
        let connector = MockConnector::new();
        let sideband = Arc::new(MockSideband::default());
        let listener = Listener::with_connector(
            ListenerConfig::new("mock"),
            Arc::new(connector.clone()),
            Arc::clone(&sideband) as Arc<dyn SidebandStore>,
        );
        (listener, connector, sideband)
    }

    #[tokio::test]
    async fn test_connection_is_lazy() {
        let (listener, connector, _) = mock_listener();
        assert!(!connector.is_connected());

        let _watcher = listener
            .listen("c", "tag", WatchFilter::all())
            .await
            .unwrap();
        assert!(connector.is_connected());
        assert_eq!(connector.listening(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_listen_after_close_fails() {
        let (listener, _, _) = mock_listener();
        listener.close().await.unwrap();
        let err = listener
            .listen("c", "tag", WatchFilter::all())
            .await
            .unwrap_err();
        assert_eq!(err, WatchError::ListenerClosed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (listener, _, _) = mock_listener();
        let _watcher = listener
            .listen("c", "tag", WatchFilter::all())
            .await
            .unwrap();
        listener.close().await.unwrap();
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_listen_per_channel() {
        let (listener, connector, _) = mock_listener();
        let _a = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
        let _b = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
        assert_eq!(connector.listen_calls(), 1);
        assert_eq!(listener.watcher_count().await, 2);
        assert_eq!(listener.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_last_watcher_unlistens() {
        let (listener, connector, _) = mock_listener();
        let a = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
        let b = listener.listen("c", "t", WatchFilter::all()).await.unwrap();

        a.close();
        wait_for(|| async { listener.watcher_count().await == 1 }).await;
        assert_eq!(connector.listening(), vec!["c".to_string()]);

        b.close();
        wait_for(|| async { listener.watcher_count().await == 0 }).await;
        assert!(connector.listening().is_empty());
    }

    #[tokio::test]
    async fn test_listen_failure_resets() {
        let (listener, connector, _) = mock_listener();
        let mut survivor = listener.listen("a", "t", WatchFilter::all()).await.unwrap();
        survivor.start_forwarding(chrono::DateTime::UNIX_EPOCH, Default::default());

        connector.fail_next_listen();
        let err = listener
            .listen("b", "t", WatchFilter::all())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Db(_)));

        // The pre-existing watcher was reset with the same error.
        let event = survivor.recv().await.unwrap();
        assert_eq!(event.err, Some(err));
        assert_eq!(listener.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_unlisten_failure_resets() {
        let (listener, connector, _) = mock_listener();
        let mut survivor = listener.listen("a", "t", WatchFilter::all()).await.unwrap();
        survivor.start_forwarding(chrono::DateTime::UNIX_EPOCH, Default::default());
        let doomed = listener.listen("b", "t", WatchFilter::all()).await.unwrap();

        connector.fail_next_unlisten();
        doomed.close();

        let event = tokio::time::timeout(Duration::from_secs(5), survivor.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.err, Some(WatchError::Db(_))));
        assert_eq!(listener.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_broadcasts_to_residual_watchers() {
        let (listener, _, _) = mock_listener();
        let mut watcher = listener.listen("c", "t", WatchFilter::all()).await.unwrap();
        watcher.start_forwarding(chrono::DateTime::UNIX_EPOCH, Default::default());

        listener.close().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.err, Some(WatchError::ListenerClosed));
        assert_eq!(listener.watcher_count().await, 0);
    }
}
