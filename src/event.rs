//! Change-event types and the watch filter.
//!
//! Two event shapes flow through the engine:
//!
//! - [`ChangeEvent`] — the decoded notification, shared (`Arc`) across every
//!   watcher on the channel. Its payload may still be a sideband reference.
//! - [`WatchEvent`] — what a subscriber receives: payload resolved, filter
//!   applied, type tag attached.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::WatchError;

/// The database operation that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Row inserted or updated.
    Put,
    /// Row deleted.
    Delete,
}

/// Discriminant of a subscriber-visible [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Row inserted or updated; `value` carries the serialized row.
    Put,
    /// Row deleted; only `key` is populated.
    Delete,
    /// A fatal or per-event error; `err` is populated.
    Error,
}

impl From<Operation> for EventKind {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Put => EventKind::Put,
            Operation::Delete => EventKind::Delete,
        }
    }
}

/// Opaque marker echoed on every delivered event so callers can decode the
/// payload bytes. The engine never interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeTag(Arc<str>);

impl TypeTag {
    /// Creates a tag from any string-ish value.
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        Self(tag.into())
    }

    /// The tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TypeTag {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the serialized row lives.
///
/// Oversized rows exceed the notification payload cap and are spilled into
/// the sideband table by the producer; the event then carries only a row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PayloadRef {
    /// The serialized row, carried inline in the notification.
    Inline(Bytes),
    /// Row id in the sideband table.
    Stored(String),
}

/// A decoded change notification.
///
/// `payload` is `None` when the producer sent an unrecognized payload kind;
/// such events are delivered with an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChangeEvent {
    pub key: Bytes,
    pub index: String,
    pub value: Bytes,
    pub op: Operation,
    pub time: DateTime<Utc>,
    pub payload: Option<PayloadRef>,
}

/// Item type of every staging buffer: one decoded event shared across the
/// channel's watchers, or the error that stands in for it.
pub(crate) type Staged = Result<Arc<ChangeEvent>, WatchError>;

/// An event delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// What happened.
    pub kind: EventKind,
    /// Primary-key bytes. Empty for [`EventKind::Error`].
    pub key: Bytes,
    /// Serialized row bytes. Empty for [`EventKind::Delete`] and
    /// [`EventKind::Error`].
    pub value: Bytes,
    /// The tag supplied to [`Listener::listen`](crate::Listener::listen).
    pub tag: TypeTag,
    /// Set iff `kind == Error`.
    pub err: Option<WatchError>,
}

impl WatchEvent {
    /// A put event.
    #[must_use]
    pub fn put(key: Bytes, value: Bytes, tag: TypeTag) -> Self {
        Self {
            kind: EventKind::Put,
            key,
            value,
            tag,
            err: None,
        }
    }

    /// A delete event. Deleted row values are not reported.
    #[must_use]
    pub fn delete(key: Bytes, tag: TypeTag) -> Self {
        Self {
            kind: EventKind::Delete,
            key,
            value: Bytes::new(),
            tag,
            err: None,
        }
    }

    /// An error event.
    #[must_use]
    pub fn error(err: WatchError, tag: TypeTag) -> Self {
        Self {
            kind: EventKind::Error,
            key: Bytes::new(),
            value: Bytes::new(),
            tag,
            err: Some(err),
        }
    }

    /// `true` iff this is an error event.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == EventKind::Error
    }
}

/// Secondary-index equality filter: only events whose index name and value
/// both match are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFilter {
    /// Name of the secondary index.
    pub name: String,
    /// Required index value, compared byte-for-byte.
    pub value: String,
}

/// Which events a watcher wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchFilter {
    /// Deliver puts (inserts and updates).
    pub include_put: bool,
    /// Deliver deletes.
    pub include_delete: bool,
    /// Optional secondary-index filter.
    pub index: Option<IndexFilter>,
}

impl WatchFilter {
    /// Puts and deletes, no index filter.
    #[must_use]
    pub fn all() -> Self {
        Self {
            include_put: true,
            include_delete: true,
            index: None,
        }
    }

    /// Puts only.
    #[must_use]
    pub fn puts() -> Self {
        Self {
            include_put: true,
            include_delete: false,
            index: None,
        }
    }

    /// Deletes only.
    #[must_use]
    pub fn deletes() -> Self {
        Self {
            include_put: false,
            include_delete: true,
            index: None,
        }
    }

    /// Restricts this filter to one `(index, value)` pair.
    #[must_use]
    pub fn with_index(mut self, name: &str, value: &str) -> Self {
        self.index = Some(IndexFilter {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Whether `event` passes both the operation-type and the index match.
    pub(crate) fn matches(&self, event: &ChangeEvent) -> bool {
        let type_match = match event.op {
            Operation::Put => self.include_put,
            Operation::Delete => self.include_delete,
        };
        let index_match = match &self.index {
            None => true,
            Some(f) => event.index == f.name && event.value.as_ref() == f.value.as_bytes(),
        };
        type_match && index_match
    }
}
