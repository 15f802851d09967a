//! Per-subscription watcher machinery.
//!
//! Delivery is two-phase. The listener's multiplex loop stages events with
//! a non-blocking push into the watcher's bounded buffer; a per-watcher
//! forwarder task drains the buffer, resolves sideband payloads, applies
//! the start-time lower bound, and hands events to the subscriber through
//! a blocking handoff. A watcher whose staging buffer fills is ejected:
//! slow consumers are aborted, never allowed to stall the delivery loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::WatchError;
use crate::event::{ChangeEvent, Operation, PayloadRef, Staged, TypeTag, WatchEvent, WatchFilter};
use crate::listener::ListenerShared;
use crate::metrics::ListenerMetrics;
use crate::sideband::SidebandStore;
use crate::stream::EventStream;

/// Registry-side half of a watcher: everything the listener needs to route
/// events to it and tear it down.
pub(crate) struct WatcherCore {
    pub(crate) id: u64,
    pub(crate) channel: String,
    pub(crate) filter: WatchFilter,
    pub(crate) tag: TypeTag,
    pub(crate) staging_tx: mpsc::Sender<Staged>,
    pub(crate) done: CancellationToken,
    closed: AtomicBool,
    listener: Weak<ListenerShared>,
    metrics: Arc<ListenerMetrics>,
}

impl WatcherCore {
    pub(crate) fn new(
        id: u64,
        channel: &str,
        filter: WatchFilter,
        tag: TypeTag,
        staging_tx: mpsc::Sender<Staged>,
        listener: Weak<ListenerShared>,
        metrics: Arc<ListenerMetrics>,
    ) -> Self {
        Self {
            id,
            channel: channel.to_string(),
            filter,
            tag,
            staging_tx,
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
            listener,
            metrics,
        }
    }

    /// Routes one staged event to this watcher. Called by the listener with
    /// the registry lock held, so it must never block.
    ///
    /// Error items bypass the filter; they concern every watcher on the
    /// channel. A full staging buffer aborts the watch: the unregistration
    /// re-acquires the registry lock, so it runs on a fresh task.
    pub(crate) fn send_change(&self, staged: &Staged) {
        let interested = match staged {
            Ok(event) => self.filter.matches(event),
            Err(_) => true,
        };
        if !interested {
            return;
        }

        match self.staging_tx.try_send(staged.clone()) {
            Ok(()) => {
                self.metrics.events_staged.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.watchers_aborted.fetch_add(1, Ordering::Relaxed);
                let staging_tx = self.staging_tx.clone();
                let done = self.done.clone();
                let listener = self.listener.clone();
                let channel = self.channel.clone();
                let id = self.id;
                tokio::spawn(async move {
                    // Unregister first so no further events are routed here,
                    // then surface the abort to the subscriber.
                    if let Some(listener) = listener.upgrade() {
                        listener.unregister(&channel, id).await;
                    }
                    tokio::select! {
                        _ = staging_tx.send(Err(WatchError::WatcherFull)) => {}
                        () = done.cancelled() => {}
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// A single subscription to a notification channel.
///
/// Created by [`Listener::listen`](crate::Listener::listen). Events arrive
/// through [`recv`](Watcher::recv) (or [`into_stream`](Watcher::into_stream))
/// once [`start_forwarding`](Watcher::start_forwarding) has been called;
/// before that, [`send_initial`](Watcher::send_initial) seeds the stream
/// with the results of a synchronous list so the caller can align a
/// snapshot with the live feed.
///
/// Dropping a watcher closes it.
pub struct Watcher {
    core: Arc<WatcherCore>,
    listener: Arc<ListenerShared>,
    out_tx: mpsc::Sender<WatchEvent>,
    events: mpsc::Receiver<WatchEvent>,
    staging_rx: Option<mpsc::Receiver<Staged>>,
    sideband: Arc<dyn SidebandStore>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").finish_non_exhaustive()
    }
}

impl Watcher {
    pub(crate) fn new(
        core: Arc<WatcherCore>,
        listener: Arc<ListenerShared>,
        out_tx: mpsc::Sender<WatchEvent>,
        events: mpsc::Receiver<WatchEvent>,
        staging_rx: mpsc::Receiver<Staged>,
        sideband: Arc<dyn SidebandStore>,
    ) -> Self {
        Self {
            core,
            listener,
            out_tx,
            events,
            staging_rx: Some(staging_rx),
            sideband,
        }
    }

    /// The channel this watcher subscribes to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.core.channel
    }

    /// The tag echoed on every delivered event.
    #[must_use]
    pub fn tag(&self) -> &TypeTag {
        &self.core.tag
    }

    /// Receives the next event.
    ///
    /// Events for this channel arrive in listener order. After a fatal
    /// error event (overflow, connection loss, cancellation) the stream is
    /// quiescent; per-event parse errors are followed by further events.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Receives without waiting; `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.events.try_recv().ok()
    }

    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<WatchEvent>> {
        self.events.poll_recv(cx)
    }

    /// Delivers a seed event directly to the subscriber stream, before the
    /// forwarder is started. Blocks until the subscriber takes it.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::WatcherClosed`] if the watcher was closed
    /// while waiting.
    pub async fn send_initial(&self, event: WatchEvent) -> Result<(), WatchError> {
        tokio::select! {
            res = self.out_tx.send(event) => res.map_err(|_| WatchError::WatcherClosed),
            () = self.core.done.cancelled() => Err(WatchError::WatcherClosed),
        }
    }

    /// A detachable handle for seeding initial events from another task
    /// while this task consumes the stream.
    #[must_use]
    pub fn initial_seeder(&self) -> InitialSeeder {
        InitialSeeder {
            out_tx: self.out_tx.clone(),
            done: self.core.done.clone(),
        }
    }

    /// Starts the forwarder task.
    ///
    /// Events older than `start_time` are suppressed, which lets the caller
    /// run a synchronous list first and then watch without a gap: the
    /// boundary event may be delivered twice, but never missed. `cancel`
    /// is the subscriber's own cancellation; firing it surfaces one
    /// cancellation error event and unregisters the watcher.
    ///
    /// Calling this more than once is a no-op.
    pub fn start_forwarding(&mut self, start_time: DateTime<Utc>, cancel: CancellationToken) {
        let Some(staging_rx) = self.staging_rx.take() else {
            debug!(channel = %self.core.channel, id = self.core.id, "forwarder already started");
            return;
        };
        tokio::spawn(forward(
            Arc::clone(&self.core),
            Arc::clone(&self.listener),
            self.out_tx.clone(),
            staging_rx,
            Arc::clone(&self.sideband),
            start_time,
            cancel,
        ));
    }

    /// Closes the watcher and unregisters it from the listener.
    /// Idempotent; in-flight events may still be dropped.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.done.cancel();
        let listener = Arc::clone(&self.listener);
        let channel = self.core.channel.clone();
        let id = self.core.id;
        // Drop can run outside a runtime; skip the unregister there, the
        // registry dies with the process.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                listener.unregister(&channel, id).await;
            });
        }
    }

    /// Converts this watcher into a [`Stream`](tokio_stream::Stream) of
    /// events. Call [`start_forwarding`](Watcher::start_forwarding) first.
    #[must_use]
    pub fn into_stream(self) -> EventStream {
        EventStream::new(self)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Seeding handle returned by [`Watcher::initial_seeder`].
pub struct InitialSeeder {
    out_tx: mpsc::Sender<WatchEvent>,
    done: CancellationToken,
}

impl InitialSeeder {
    /// Same contract as [`Watcher::send_initial`].
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::WatcherClosed`] if the watcher was closed
    /// while waiting.
    pub async fn send(&self, event: WatchEvent) -> Result<(), WatchError> {
        tokio::select! {
            res = self.out_tx.send(event) => res.map_err(|_| WatchError::WatcherClosed),
            () = self.done.cancelled() => Err(WatchError::WatcherClosed),
        }
    }
}

/// Forwarder loop: staging buffer → subscriber stream.
async fn forward(
    core: Arc<WatcherCore>,
    listener: Arc<ListenerShared>,
    out: mpsc::Sender<WatchEvent>,
    mut staging: mpsc::Receiver<Staged>,
    sideband: Arc<dyn SidebandStore>,
    start_time: DateTime<Utc>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = core.done.cancelled() => return,
            () = cancel.cancelled() => {
                let event = WatchEvent::error(WatchError::Canceled, core.tag.clone());
                tokio::select! {
                    _ = out.send(event) => {}
                    () = core.done.cancelled() => {}
                }
                listener.unregister(&core.channel, core.id).await;
                return;
            }
            staged = staging.recv() => {
                let Some(staged) = staged else { return };
                let event = match staged {
                    Err(err) => WatchEvent::error(err, core.tag.clone()),
                    Ok(change) => {
                        // A change at exactly start_time may already have
                        // been seen by the caller's initial list; double
                        // delivery there beats missing the boundary event.
                        if change.time < start_time {
                            continue;
                        }
                        resolve_payload(sideband.as_ref(), &change, core.tag.clone(), &core.metrics)
                            .await
                    }
                };
                tokio::select! {
                    res = out.send(event) => {
                        if res.is_err() {
                            return;
                        }
                    }
                    () = core.done.cancelled() => return,
                }
            }
        }
    }
}

/// Turns a decoded change into the subscriber-visible event, fetching the
/// sideband row when the payload was spilled.
async fn resolve_payload(
    sideband: &dyn SidebandStore,
    change: &ChangeEvent,
    tag: TypeTag,
    metrics: &ListenerMetrics,
) -> WatchEvent {
    match change.op {
        Operation::Delete => WatchEvent::delete(change.key.clone(), tag),
        Operation::Put => match &change.payload {
            Some(PayloadRef::Inline(data)) => {
                WatchEvent::put(change.key.clone(), data.clone(), tag)
            }
            Some(PayloadRef::Stored(id)) => {
                metrics.sideband_fetches.fetch_add(1, Ordering::Relaxed);
                match sideband.fetch(id).await {
                    Ok(Some(data)) => WatchEvent::put(change.key.clone(), data, tag),
                    Ok(None) => {
                        metrics.sideband_misses.fetch_add(1, Ordering::Relaxed);
                        WatchEvent::error(
                            WatchError::LatencyTooHigh(format!("row {id} not found")),
                            tag,
                        )
                    }
                    Err(e) => {
                        metrics.sideband_misses.fetch_add(1, Ordering::Relaxed);
                        WatchEvent::error(WatchError::LatencyTooHigh(e.to_string()), tag)
                    }
                }
            }
            None => WatchEvent::put(change.key.clone(), bytes::Bytes::new(), tag),
        },
    }
}
