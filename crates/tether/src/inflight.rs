//! The in-flight guard: one live operation per key.
//!
//! Joins and authorizations are singular: a second one with the same key
//! while the first is pending is a conflict. Requests are coalesced: a
//! duplicate subscribes to the future already running and gets the same
//! result.
//!
//! Check-and-insert happens under one lock, so two concurrent identical
//! operations can never both see the key as absent. An entry is removed
//! when its [`InflightEntry`] drops, which happens when the operation
//! settles no matter how.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use tether_group::GroupKey;
use tether_protocol::ConnectionId;

use crate::ServiceError;

/// The future every duplicate of a request awaits.
pub(crate) type SharedReply = Shared<BoxFuture<'static, Result<Value, ServiceError>>>;

/// What makes two operations "the same".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum InflightKey {
    /// Same connection, method and arguments.
    Request {
        client: ConnectionId,
        service: String,
        method: String,
        fingerprint: String,
    },
    /// Same connection and target group.
    Join { client: ConnectionId, group: GroupKey },
    /// Same connection and service. Arguments are ignored: a session
    /// authorizes with a service once at a time.
    Authorize { client: ConnectionId, service: String },
}

impl InflightKey {
    pub(crate) fn request(
        client: ConnectionId,
        service: &str,
        method: &str,
        args: &[Value],
    ) -> Self {
        Self::Request {
            client,
            service: service.to_owned(),
            method: method.to_owned(),
            // Object keys serialize sorted, so equal arguments always
            // produce equal fingerprints.
            fingerprint: serde_json::to_string(args).unwrap_or_default(),
        }
    }

    pub(crate) fn join(client: ConnectionId, group: &GroupKey) -> Self {
        Self::Join {
            client,
            group: group.clone(),
        }
    }

    pub(crate) fn authorize(client: ConnectionId, service: &str) -> Self {
        Self::Authorize {
            client,
            service: service.to_owned(),
        }
    }
}

type Entries = HashMap<InflightKey, Option<SharedReply>>;

/// The set of operations currently in flight.
#[derive(Clone, Default)]
pub(crate) struct Inflight {
    entries: Arc<Mutex<Entries>>,
}

impl Inflight {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `key`, or returns `None` if it is already in flight.
    pub(crate) fn try_begin(&self, key: InflightKey) -> Option<InflightEntry> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return None;
        }
        entries.insert(key.clone(), None);
        Some(InflightEntry {
            key,
            entries: Arc::clone(&self.entries),
        })
    }

    /// Returns the reply already in flight for `key`, or claims `key` and
    /// starts a new one with `start`.
    ///
    /// `start` runs under the lock and must only spawn; the entry it is
    /// given should be dropped when the operation settles. The flag is
    /// `true` when an existing reply was shared.
    pub(crate) fn coalesce<F>(&self, key: InflightKey, start: F) -> (SharedReply, bool)
    where
        F: FnOnce(InflightEntry) -> SharedReply,
    {
        let mut entries = self.lock();
        if let Some(Some(reply)) = entries.get(&key) {
            return (reply.clone(), true);
        }

        let entry = InflightEntry {
            key: key.clone(),
            entries: Arc::clone(&self.entries),
        };
        let reply = start(entry);
        entries.insert(key, Some(reply.clone()));
        (reply, false)
    }

    pub(crate) fn contains(&self, key: &InflightKey) -> bool {
        self.lock().contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Ownership of one in-flight key. Dropping it frees the key.
pub(crate) struct InflightEntry {
    key: InflightKey,
    entries: Arc<Mutex<Entries>>,
}

impl Drop for InflightEntry {
    fn drop(&mut self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
