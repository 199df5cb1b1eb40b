//! Per-`content_hash` rebuild deduplication (spec.md §4.8). Grounded on the
//! same `DashMap`-of-fine-grained-locks shape used throughout this crate for
//! content-addressed coordination, here holding a `tokio::sync::broadcast`
//! slot per in-flight key instead of a data value.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::{CoreError, Result};
use crate::models::ContentHash;

/// `Ok` results can't cross a broadcast channel by value without `Clone`;
/// rather than requiring every caller's result type to implement it, we
/// carry the leader's outcome as `Result<Arc<T>, String>` to every waiter,
/// so the error message (not the original typed error) is what followers
/// see. The leader still gets back the original `Result<T>`.
type SharedOutcome<T> = Result<Arc<T>, String>;

struct InFlight<T> {
    sender: broadcast::Sender<SharedOutcome<T>>,
}

pub struct SingleFlight<T> {
    inflight: DashMap<ContentHash, InFlight<T>>,
}

impl<T: Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Runs `f` if no other caller is currently rebuilding this
    /// `content_hash`; otherwise waits for that caller's result. Returns
    /// `(result, shared)` where `shared` is true for followers.
    pub async fn do_<F, Fut>(&self, content_hash: ContentHash, f: F) -> (Result<Arc<T>>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        // `entry` locks the shard for the duration of the match, so the
        // "is someone already running this key" check, the subscribe, and
        // the insert that makes us the leader are all atomic with respect
        // to other callers — a plain get-then-insert would let two
        // concurrent callers both see no entry and both become leaders for
        // the same content_hash.
        enum Role<T> {
            Follower(broadcast::Receiver<SharedOutcome<T>>),
            Leader(broadcast::Sender<SharedOutcome<T>>),
        }

        let role = match self.inflight.entry(content_hash) {
            Entry::Occupied(existing) => Role::Follower(existing.get().sender.subscribe()),
            Entry::Vacant(slot) => {
                let (sender, _) = broadcast::channel(1);
                slot.insert(InFlight { sender: sender.clone() });
                Role::Leader(sender)
            }
        };

        let sender = match role {
            Role::Follower(mut rx) => {
                return match rx.recv().await {
                    Ok(Ok(value)) => (Ok(value), true),
                    Ok(Err(message)) => (Err(CoreError::Internal(anyhow::anyhow!(message))), true),
                    Err(_) => (
                        Err(CoreError::Internal(anyhow::anyhow!(
                            "single-flight leader dropped without publishing a result"
                        ))),
                        true,
                    ),
                };
            }
            Role::Leader(sender) => sender,
        };

        let outcome = f().await;

        self.inflight.remove_if(&content_hash, |_, slot| {
            slot.sender.same_channel(&sender)
        });

        match outcome {
            Ok(value) => {
                let shared = Arc::new(value);
                let _ = sender.send(Ok(shared.clone()));
                (Ok(shared), false)
            }
            Err(err) => {
                let _ = sender.send(Err(err.to_string()));
                (Err(err), false)
            }
        }
    }
}

impl<T: Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
