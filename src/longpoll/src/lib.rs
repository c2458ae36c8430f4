//! Long-poll notifier (§4.4): a versioned snapshot broadcaster. Subscribers
//! present `key -> last-known version` and block until any key's version
//! exceeds theirs.
//!
//! Ordering guarantee: a subscriber that calls [`LongPollHost::listen_for_change`]
//! after a [`LongPollHost::notify`] returns will never miss that
//! notification for the affected key. Multiple rapid `notify`s coalesce to
//! the latest value per key; intermediate values may be skipped, but the
//! final value is always delivered.

use std::collections::HashMap;
use std::pin::Pin;

use futures::future::{select_all, Future};
use parking_lot::Mutex;
use tokio::sync::watch;

/// `(version, value)` pair held per key.
type Entry = (u64, Vec<u8>);

struct Channel {
    sender: watch::Sender<Entry>,
    /// Keeps the channel alive: `watch::Sender::send` errors once every
    /// receiver is dropped, and subscribers may come and go freely.
    _keepalive: watch::Receiver<Entry>,
}

impl Channel {
    fn new() -> Self {
        let (sender, receiver) = watch::channel((0, Vec::new()));
        Channel {
            sender,
            _keepalive: receiver,
        }
    }
}

/// The notifier owned exclusively by one serve controller task.
#[derive(Default)]
pub struct LongPollHost {
    channels: Mutex<HashMap<String, Channel>>,
}

impl LongPollHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically assigns `value` and increments the key's version, waking
    /// all subscribers whose last-known version for that key is older.
    pub fn notify(&self, key: &str, value: Vec<u8>) {
        let mut channels = self.channels.lock();
        let channel = channels
            .entry(key.to_string())
            .or_insert_with(Channel::new);
        // `send_modify` runs under the watch channel's own lock, so a
        // concurrent `listen_for_change` either observes the old value (and
        // subscribes to be woken for this update) or the new one — never a
        // half-applied state.
        channel.sender.send_modify(|(version, current)| {
            *version += 1;
            *current = value;
        });
    }

    /// Returns the subset of `known_versions` that is already stale. If
    /// none is stale yet, blocks until `notify` touches any requested key,
    /// then returns the resulting stale subset. Cancellation of the
    /// returned future is honored: dropping it takes no action on the host.
    pub async fn listen_for_change(
        &self,
        known_versions: HashMap<String, u64>,
    ) -> HashMap<String, (u64, Vec<u8>)> {
        let subscriptions: Vec<(String, watch::Receiver<Entry>, u64)> = {
            let mut channels = self.channels.lock();
            known_versions
                .into_iter()
                .map(|(key, known)| {
                    let receiver = channels
                        .entry(key.clone())
                        .or_insert_with(Channel::new)
                        .sender
                        .subscribe();
                    (key, receiver, known)
                })
                .collect()
        };

        if subscriptions.is_empty() {
            return HashMap::new();
        }

        loop {
            let stale = Self::stale_subset(&subscriptions);
            if !stale.is_empty() {
                return stale;
            }

            let waits: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = subscriptions
                .iter()
                .map(|(_, receiver, _)| {
                    let mut receiver = receiver.clone();
                    Box::pin(async move {
                        let _ = receiver.changed().await;
                    }) as Pin<Box<dyn Future<Output = ()> + Send>>
                })
                .collect();
            // Any one key changing is enough to re-check the whole set;
            // rapid repeated notifies before we wake up just coalesce.
            select_all(waits).await;
        }
    }

    fn stale_subset(
        subscriptions: &[(String, watch::Receiver<Entry>, u64)],
    ) -> HashMap<String, (u64, Vec<u8>)> {
        subscriptions
            .iter()
            .filter_map(|(key, receiver, known)| {
                let (version, value) = receiver.borrow().clone();
                (version > *known).then(|| (key.clone(), (version, value)))
            })
            .collect()
    }
}
