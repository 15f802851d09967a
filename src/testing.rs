//! Testing utilities: in-memory stand-ins for the transport and the
//! sideband store.
//!
//! These drive the listener through its real code paths without a
//! database, and back both the unit tests and the `tests/` scenarios.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::conn::{ConnMessage, Connector, NotifyTransport};
use crate::error::WatchError;
use crate::sideband::SidebandStore;

#[derive(Default)]
struct MockConnectorState {
    msg_tx: Mutex<Option<mpsc::UnboundedSender<ConnMessage>>>,
    listening: Mutex<BTreeSet<String>>,
    connected: AtomicBool,
    listen_calls: AtomicU64,
    fail_next_listen: AtomicBool,
    fail_next_unlisten: AtomicBool,
}

/// In-memory [`Connector`] + notification injector.
///
/// Clone it before handing it to the listener; the clone shares state and
/// acts as the test's handle for injecting notifications, dropping the
/// connection, and inspecting `LISTEN` state.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockConnectorState>,
}

impl MockConnector {
    /// Creates a disconnected mock connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a notification on `channel`.
    pub fn notify(&self, channel: &str, payload: &str) {
        let tx = self.state.msg_tx.lock().expect("mock lock");
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(ConnMessage::Notification {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
    }

    /// Simulates connection loss: emits [`ConnMessage::ConnectionLost`]
    /// and forgets all server-side `LISTEN` state, like a real reconnect.
    pub fn drop_connection(&self) {
        self.state.listening.lock().expect("mock lock").clear();
        let tx = self.state.msg_tx.lock().expect("mock lock");
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(ConnMessage::ConnectionLost);
        }
    }

    /// Channels currently `LISTEN`ed on, sorted.
    #[must_use]
    pub fn listening(&self) -> Vec<String> {
        self.state
            .listening
            .lock()
            .expect("mock lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Whether [`Connector::connect`] has been called.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Total `LISTEN` commands issued.
    #[must_use]
    pub fn listen_calls(&self) -> u64 {
        self.state.listen_calls.load(Ordering::SeqCst)
    }

    /// Makes the next `LISTEN` fail with a database error.
    pub fn fail_next_listen(&self) {
        self.state.fail_next_listen.store(true, Ordering::SeqCst);
    }

    /// Makes the next `UNLISTEN` fail with a database error.
    pub fn fail_next_unlisten(&self) {
        self.state.fail_next_unlisten.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn NotifyTransport>, mpsc::UnboundedReceiver<ConnMessage>), WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.msg_tx.lock().expect("mock lock") = Some(tx);
        self.state.connected.store(true, Ordering::SeqCst);
        Ok((
            Arc::new(MockTransport {
                state: Arc::clone(&self.state),
            }),
            rx,
        ))
    }
}

struct MockTransport {
    state: Arc<MockConnectorState>,
}

#[async_trait]
impl NotifyTransport for MockTransport {
    async fn listen(&self, channel: &str) -> Result<(), WatchError> {
        self.state.listen_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_next_listen.swap(false, Ordering::SeqCst) {
            return Err(WatchError::Db("induced LISTEN failure".to_string()));
        }
        self.state
            .listening
            .lock()
            .expect("mock lock")
            .insert(channel.to_string());
        Ok(())
    }

    async fn unlisten(&self, channel: &str) -> Result<(), WatchError> {
        if self.state.fail_next_unlisten.swap(false, Ordering::SeqCst) {
            return Err(WatchError::Db("induced UNLISTEN failure".to_string()));
        }
        self.state.listening.lock().expect("mock lock").remove(channel);
        Ok(())
    }

    async fn unlisten_all(&self) -> Result<(), WatchError> {
        self.state.listening.lock().expect("mock lock").clear();
        Ok(())
    }

    async fn close(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        // Ends the message stream, which terminates the multiplex loop.
        *self.state.msg_tx.lock().expect("mock lock") = None;
    }
}

/// In-memory [`SidebandStore`] with a fetch counter.
#[derive(Default)]
pub struct MockSideband {
    rows: Mutex<HashMap<String, Bytes>>,
    fetches: AtomicU64,
}

impl MockSideband {
    /// Inserts a spilled row.
    pub fn insert(&self, id: &str, data: &[u8]) {
        self.rows
            .lock()
            .expect("mock lock")
            .insert(id.to_string(), Bytes::copy_from_slice(data));
    }

    /// Removes a spilled row, as the producer's garbage collection would.
    pub fn remove(&self, id: &str) {
        self.rows.lock().expect("mock lock").remove(id);
    }

    /// Number of fetches issued so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SidebandStore for MockSideband {
    async fn fetch(&self, id: &str) -> Result<Option<Bytes>, WatchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.lock().expect("mock lock").get(id).cloned())
    }
}

/// Polls `condition` until it holds, panicking after five seconds. Used by
/// tests that wait on detached unregister tasks.
pub async fn wait_for<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within five seconds");
}
