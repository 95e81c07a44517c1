//! Local mirrors of parts of the tree, kept current by watches.
//!
//! Each cache runs one driver task. The driver reads what it mirrors and re-arms its watch in the
//! same request, updates its belief, and only then emits the derived [`CacheEvent`]. A watch that
//! is invalidated (the connection or session went away) makes the driver wait for the session
//! and re-read everything, emitting synthetic events for whatever changed in the meantime.
//!
//! Events go through a bounded channel. When it is full the driver waits for the consumer;
//! watches that fire in the meantime wait in their one-shot slots, so nothing is lost.

use crate::{error, NodeStore, Stat};
use futures::{channel::mpsc, SinkExt};
use slog::{debug, trace};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

mod children;
mod node;

pub use self::children::ChildrenCache;
pub use self::node::NodeCache;

/// The value of one cached node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildData {
    /// Full path of the node.
    pub path: String,
    /// The node's data.
    pub data: Vec<u8>,
    /// The node's metadata at the time `data` was read.
    pub stat: Stat,
}

/// A change to what a cache mirrors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    /// A node that was not in the cache is now.
    Added(ChildData),
    /// A cached node was modified (or deleted and re-created); carries the new value.
    Updated(ChildData),
    /// A cached node is gone; carries the last value the cache held.
    Removed(ChildData),
    /// The initial population finished. Only sent in [`StartMode::PostInitializedEvent`].
    Initialized,
}

/// How a cache populates itself when it starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// Populate in the background, emitting `Added` for every initial entry.
    Normal,
    /// Populate before `start` returns. The initial content produces no events.
    BuildInitialCache,
    /// Populate in the background, emitting `Added` for every initial entry and then
    /// `Initialized`.
    PostInitializedEvent,
}

/// Tunables shared by all caches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// How many events may wait for the consumer before the driver blocks.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { event_capacity: 128 }
    }
}

/// The receiving end of a cache's events.
pub type CacheEvents = mpsc::Receiver<CacheEvent>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a change from `old` to `new` looks like to a consumer, if anything.
fn classify(old: Option<&ChildData>, new: Option<&ChildData>) -> Option<CacheEvent> {
    match (old, new) {
        (None, Some(new)) => Some(CacheEvent::Added(new.clone())),
        (Some(old), None) => Some(CacheEvent::Removed(old.clone())),
        (Some(old), Some(new))
            if old.stat.mzxid != new.stat.mzxid || old.stat.czxid != new.stat.czxid =>
        {
            Some(CacheEvent::Updated(new.clone()))
        }
        _ => None,
    }
}

/// The sending side shared by the drivers.
struct Emitter {
    tx: mpsc::Sender<CacheEvent>,
    quiet: bool,
    log: slog::Logger,
}

impl Emitter {
    async fn emit(&mut self, event: CacheEvent) {
        if self.quiet {
            return;
        }
        trace!(self.log, "emitting {:?}", event);
        if self.tx.send(event).await.is_err() {
            // nobody is listening; the belief is still kept current
            trace!(self.log, "event receiver dropped");
        }
    }
}

/// Waits until `store`'s session is usable again. Returns false once it is closed for good.
async fn wait_for_session(store: &NodeStore, log: &slog::Logger) -> bool {
    let session = store.session();
    loop {
        match session.wait_until_connected(session.connect_timeout()).await {
            Ok(()) => return true,
            Err(e) => match error::session_error(&e) {
                Some(error::Session::Closed) => {
                    debug!(log, "session closed; cache driver exiting");
                    return false;
                }
                _ => trace!(log, "still waiting for the session: {}", e),
            },
        }
    }
}

/// The driver task of a cache, stopped on request or when the cache is dropped.
struct Driver(Mutex<Option<JoinHandle<()>>>);

impl Driver {
    fn new(handle: JoinHandle<()>) -> Self {
        Driver(Mutex::new(Some(handle)))
    }

    async fn stop(&self) {
        let handle = lock(&self.0).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.0).take() {
            handle.abort();
        }
    }
}
