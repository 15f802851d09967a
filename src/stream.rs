//! Async `Stream` adapter for watchers.
//!
//! Wraps a [`Watcher`] in a `tokio_stream`-compatible stream so consumers
//! can use combinators (`filter`, `take`, `timeout`, …):
//!
//! ```rust,ignore
//! use tokio_stream::StreamExt;
//!
//! let mut watcher = listener.listen("repos", "repo", WatchFilter::all()).await?;
//! watcher.start_forwarding(start, CancellationToken::new());
//! let mut stream = watcher.into_stream();
//!
//! while let Some(event) = stream.next().await {
//!     process(event);
//! }
//! ```
//!
//! Dropping the stream closes the underlying watcher.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio_stream::Stream;

use crate::event::WatchEvent;
use crate::watcher::Watcher;

/// `Stream<Item = WatchEvent>` over a watcher's subscriber channel.
///
/// All fields are `Unpin`, so the stream works directly inside
/// `tokio::select!` without explicit pinning.
pub struct EventStream {
    watcher: Watcher,
}

impl EventStream {
    pub(crate) fn new(watcher: Watcher) -> Self {
        Self { watcher }
    }

    /// The channel the underlying watcher subscribes to.
    #[must_use]
    pub fn channel(&self) -> &str {
        self.watcher.channel()
    }

    /// Closes the underlying watcher; the stream then terminates.
    pub fn close(&self) {
        self.watcher.close();
    }
}

impl Stream for EventStream {
    type Item = WatchEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().watcher.poll_recv(cx)
    }
}
