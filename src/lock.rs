//! A cluster-wide mutex built from ephemeral-sequential nodes.
//!
//! Every contender creates a *candidate* node `<dir>/_c_<uuid>-lock-NNNNNNNNNN`. The candidate
//! with the lowest sequence number holds the lock; every other one watches its immediate
//! predecessor and looks again when that one goes away, so contenders are served in creation
//! order and a release wakes exactly one waiter. Candidates are ephemeral: a holder whose session
//! expires loses the lock without having to release it.
//!
//! The random `_c_<uuid>` prefix lets a contender find its own candidate if the reply to the
//! create request is lost.

use crate::path;
use crate::session::SessionState;
use crate::{error, Acl, ChangeEvent, CreateMode, NodeStore, WatchKind};
use failure::bail;
use futures::StreamExt;
use slog::{debug, info, o, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const LOCK_NAME: &str = "-lock-";

/// Where one [`DistributedMutex`] stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutexState {
    /// Nothing was attempted yet.
    Idle,
    /// Queued behind other candidates.
    Candidate,
    /// The lock is held.
    Holding,
    /// The lock was released.
    Released,
    /// The last acquire did not get the lock.
    Failed,
    /// The lock was held, but the session carrying it expired or the candidate vanished.
    Lost,
}

struct Held {
    node: String,
    monitor: JoinHandle<()>,
}

/// A mutual-exclusion lock shared by every process that uses the same directory.
///
/// One instance stands for one contender. It is not reentrant: acquiring it again while holding
/// it queues behind itself, and only succeeds once the first hold ends.
pub struct DistributedMutex {
    store: NodeStore,
    dir: String,
    state: Arc<watch::Sender<MutexState>>,
    held: Arc<Mutex<Option<Held>>>,
    log: slog::Logger,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DistributedMutex {
    /// A contender for the lock whose candidates live under `dir`. The directory is created on
    /// first use.
    pub fn new(store: NodeStore, dir: &str) -> Result<Self, failure::Error> {
        path::validate(dir)?;
        let (state, _) = watch::channel(MutexState::Idle);
        let log = store
            .session()
            .logger()
            .new(o!("lock" => dir.to_string()));
        Ok(DistributedMutex {
            store,
            dir: dir.to_string(),
            state: Arc::new(state),
            held: Arc::new(Mutex::new(None)),
            log,
        })
    }

    /// The directory holding the candidates.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// The current state.
    pub fn state(&self) -> MutexState {
        *self.state.borrow()
    }

    /// Observe state changes, including `Lost`, as they happen.
    pub fn subscribe(&self) -> watch::Receiver<MutexState> {
        self.state.subscribe()
    }

    /// True while the lock is held by this instance.
    pub fn is_held(&self) -> bool {
        lock(&self.held).is_some()
    }

    /// The candidate node through which the lock is held, if it is.
    pub fn holder_path(&self) -> Option<String> {
        lock(&self.held).as_ref().map(|h| h.node.clone())
    }

    fn set_state(&self, state: MutexState) {
        trace!(self.log, "lock state changed"; "state" => ?state);
        self.state.send_replace(state);
    }

    /// Waits for the lock, for at most `timeout` if given.
    ///
    /// Returns `error::Acquire::Timeout` if the lock was still taken when the timeout elapsed; the
    /// candidate is removed again. Dropping the returned future also removes the candidate, in
    /// the background.
    pub async fn acquire(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Result<(), error::Acquire>, failure::Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let reentry = self.is_held();
        if !reentry {
            self.set_state(MutexState::Candidate);
        }

        let prefix = format!("_c_{}{}", uuid::Uuid::new_v4(), LOCK_NAME);
        let mut guard = CandidateGuard {
            store: self.store.clone(),
            dir: self.dir.clone(),
            prefix: prefix.clone(),
            node: None,
            armed: true,
        };

        let attempt = async {
            let node = self.create_candidate(&prefix, deadline).await?;
            guard.node = Some(node.clone());
            debug!(self.log, "created candidate"; "node" => &node);
            let turn = self.wait_turn(&node, deadline).await?;
            Ok::<_, failure::Error>(turn.map(|()| node))
        };
        // the deadline also bounds waiting out a suspended session
        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, attempt)
                .await
                .unwrap_or(Ok(Err(error::Acquire::Timeout))),
            None => attempt.await,
        };

        match outcome {
            Ok(Ok(node)) => {
                guard.armed = false;
                let session_id = self.store.session().session_id().unwrap_or(0);
                info!(self.log, "lock acquired"; "node" => &node, "session_id" => session_id);
                let monitor = self.spawn_monitor(node.clone());
                *lock(&self.held) = Some(Held { node, monitor });
                self.set_state(MutexState::Holding);
                Ok(Ok(()))
            }
            Ok(Err(error::Acquire::Timeout)) => {
                debug!(self.log, "timed out waiting for the lock"; "node" => ?guard.node);
                let connected = self.store.session().state() == SessionState::Connected;
                if let (Some(node), true) = (guard.node.clone(), connected) {
                    if let Ok(Ok(())) | Ok(Err(error::Delete::NoNode)) =
                        self.store.delete(&node, None).await
                    {
                        guard.armed = false;
                    }
                }
                if !reentry {
                    self.set_state(MutexState::Failed);
                }
                Ok(Err(error::Acquire::Timeout))
            }
            Err(e) => {
                warn!(self.log, "acquire failed: {}", e);
                if !reentry {
                    match error::session_error(&e) {
                        Some(error::Session::Expired { .. }) => self.set_state(MutexState::Lost),
                        _ => self.set_state(MutexState::Failed),
                    }
                }
                Err(e)
            }
        }
    }

    /// Creates our candidate, recovering it by its prefix if the reply got lost.
    async fn create_candidate(
        &self,
        prefix: &str,
        deadline: Option<Instant>,
    ) -> Result<String, failure::Error> {
        let path = path::join(&self.dir, prefix);
        loop {
            let created = self
                .store
                .create_with_parents(
                    &path,
                    &b""[..],
                    Acl::open_unsafe(),
                    CreateMode::EphemeralSequential,
                )
                .await;
            match created {
                Ok(Ok(node)) => return Ok(node),
                Ok(Err(e)) => bail!("could not create lock candidate in {}: {}", self.dir, e),
                Err(e) if error::session_error(&e) == Some(error::Session::ConnectionLost) => {
                    if let Ok(Some(children)) = self.store.get_children(&self.dir).await {
                        if let Some(name) = children.iter().find(|n| n.starts_with(prefix)) {
                            debug!(self.log, "recovered candidate after lost reply"; "name" => name);
                            return Ok(path::join(&self.dir, name));
                        }
                    }
                    if deadline.map_or(false, |d| Instant::now() >= d) {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits until `node` is the lowest candidate, or the deadline passes.
    async fn wait_turn(
        &self,
        node: &str,
        deadline: Option<Instant>,
    ) -> Result<Result<(), error::Acquire>, failure::Error> {
        let ours = path::node_name(node);
        loop {
            let children = self.store.get_children(&self.dir).await?.unwrap_or_default();
            let mut candidates: Vec<(u64, String)> = children
                .into_iter()
                .filter(|name| name.contains(LOCK_NAME))
                .filter_map(|name| path::sequence_of(&name).map(|seq| (seq, name)))
                .collect();
            candidates.sort();

            let position = match candidates.iter().position(|(_, name)| name == ours) {
                Some(position) => position,
                None => {
                    // ephemeral nodes only vanish with their session
                    let session_id = self.store.session().session_id().unwrap_or(0);
                    bail!(error::Session::Expired { session_id });
                }
            };
            if position == 0 {
                return Ok(Ok(()));
            }

            let predecessor = path::join(&self.dir, &candidates[position - 1].1);
            trace!(self.log, "waiting for predecessor"; "predecessor" => &predecessor);
            let (watch, stat) = self.store.with_watcher().exists(&predecessor).await?;
            if stat.is_none() {
                continue;
            }
            match deadline {
                None => {
                    watch.await;
                }
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, watch).await.is_err() {
                        return Ok(Err(error::Acquire::Timeout));
                    }
                }
            }
        }
    }

    /// Watches a held lock, and declares it lost when its session ends or its node vanishes.
    fn spawn_monitor(&self, node: String) -> JoinHandle<()> {
        let store = self.store.clone();
        let held = Arc::clone(&self.held);
        let state = Arc::clone(&self.state);
        let log = self.log.clone();
        let mut events = store.session().subscribe();
        tokio::spawn(async move {
            'arm: loop {
                let mut watch = match store.watch_once(&node, WatchKind::Deleted).await {
                    Ok(watch) => watch,
                    Err(e) => match error::session_error(&e) {
                        Some(error::Session::Expired { .. }) | Some(error::Session::Closed) => {
                            break 'arm
                        }
                        _ => {
                            trace!(log, "could not watch held lock: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue 'arm;
                        }
                    },
                };
                loop {
                    tokio::select! {
                        event = events.next() => match event.map(|e| e.state) {
                            Some(SessionState::Expired) | Some(SessionState::Closed) | None => {
                                break 'arm
                            }
                            _ => {}
                        },
                        change = &mut watch => match change {
                            ChangeEvent::Invalidated { .. } => continue 'arm,
                            _ => break 'arm,
                        },
                    }
                }
            }

            let lost = lock(&held).take();
            if let Some(lost) = lost {
                warn!(log, "lock lost"; "node" => lost.node);
                state.send_replace(MutexState::Lost);
            }
        })
    }

    /// Releases the lock by deleting the candidate node.
    ///
    /// Returns `false` if the lock was not held, which makes a repeated release harmless. If the
    /// delete cannot be confirmed, it is retried in the background and the error is returned; the
    /// lock counts as released either way.
    pub async fn release(&self) -> Result<bool, failure::Error> {
        let held = lock(&self.held).take();
        let held = match held {
            Some(held) => held,
            None => return Ok(false),
        };
        held.monitor.abort();
        self.set_state(MutexState::Released);

        match self.store.delete(&held.node, None).await {
            Ok(Ok(())) | Ok(Err(error::Delete::NoNode)) => {
                info!(self.log, "lock released"; "node" => held.node);
                Ok(true)
            }
            Ok(Err(e)) => bail!("could not release {}: {}", held.node, e),
            Err(e) => {
                if error::session_error(&e) != Some(error::Session::Closed) {
                    self.store.delete_in_background(&held.node);
                }
                Err(e)
            }
        }
    }
}

impl Drop for DistributedMutex {
    fn drop(&mut self) {
        if let Some(held) = lock(&self.held).take() {
            held.monitor.abort();
            debug!(self.log, "dropped while held; releasing"; "node" => &held.node);
            self.store.delete_in_background(&held.node);
        }
    }
}

/// Removes the candidate of an acquire that did not finish.
struct CandidateGuard {
    store: NodeStore,
    dir: String,
    prefix: String,
    node: Option<String>,
    armed: bool,
}

impl Drop for CandidateGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(ref node) = self.node {
            self.store.delete_in_background(node);
            return;
        }

        // the create may still be in flight; look for it by prefix
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => return,
        };
        let store = self.store.clone();
        let dir = self.dir.clone();
        let prefix = self.prefix.clone();
        runtime.spawn(async move {
            if let Ok(Some(children)) = store.get_children(&dir).await {
                for name in children.iter().filter(|n| n.starts_with(&prefix)) {
                    store.delete_in_background(&path::join(&dir, name));
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Ensemble;
    use crate::{RetryNTimes, SessionManager};

    async fn store(ensemble: &Ensemble) -> NodeStore {
        let mut builder = SessionManager::builder("sim:1").unwrap();
        builder.set_retry_policy(RetryNTimes::new(5, Duration::from_millis(10)));
        NodeStore::new(builder.connect(ensemble.clone()).await.unwrap())
    }

    #[tokio::test]
    async fn uncontended() {
        let ensemble = Ensemble::new();
        let mutex = DistributedMutex::new(store(&ensemble).await, "/locks/a").unwrap();
        assert_eq!(MutexState::Idle, mutex.state());

        assert_eq!(Ok(()), mutex.acquire(None).await.unwrap());
        assert!(mutex.is_held());
        assert_eq!(MutexState::Holding, mutex.state());
        let node = mutex.holder_path().unwrap();
        assert!(path::node_name(&node).starts_with("_c_"));
        assert!(ensemble.node(&node).is_some());

        assert!(mutex.release().await.unwrap());
        assert!(!mutex.release().await.unwrap());
        assert_eq!(MutexState::Released, mutex.state());
        assert_eq!(Some(vec![]), ensemble.children("/locks/a"));
    }

    #[tokio::test]
    async fn not_reentrant() {
        let ensemble = Ensemble::new();
        let mutex = DistributedMutex::new(store(&ensemble).await, "/locks/r").unwrap();
        mutex.acquire(None).await.unwrap().unwrap();
        assert_eq!(
            Err(error::Acquire::Timeout),
            mutex
                .acquire(Some(Duration::from_millis(100)))
                .await
                .unwrap()
        );
        // the first hold is untouched and the second candidate is gone
        assert_eq!(MutexState::Holding, mutex.state());
        assert_eq!(1, ensemble.children("/locks/r").unwrap().len());
    }

    #[tokio::test]
    async fn expiry_loses_the_lock() {
        let ensemble = Ensemble::new();
        let zk = store(&ensemble).await;
        let mutex = DistributedMutex::new(zk.clone(), "/locks/x").unwrap();
        let mut states = mutex.subscribe();
        mutex.acquire(None).await.unwrap().unwrap();

        ensemble.expire_session(zk.session().session_id().unwrap());
        while *states.borrow_and_update() != MutexState::Lost {
            states.changed().await.unwrap();
        }
        assert!(!mutex.is_held());
        assert!(!mutex.release().await.unwrap());
    }

    #[tokio::test]
    async fn foreign_siblings_are_ignored() {
        let ensemble = Ensemble::new();
        let other = store(&ensemble).await;
        other
            .create_with_parents(
                "/locks/m/-lock-ééééé1",
                &b""[..],
                Acl::open_unsafe(),
                CreateMode::Persistent,
            )
            .await
            .unwrap()
            .unwrap();

        let mutex = DistributedMutex::new(store(&ensemble).await, "/locks/m").unwrap();
        assert_eq!(
            Ok(()),
            mutex
                .acquire(Some(Duration::from_millis(200)))
                .await
                .unwrap()
        );
        assert!(mutex.release().await.unwrap());
    }

    #[tokio::test]
    async fn timeout_holds_while_suspended() {
        let ensemble = Ensemble::new();
        let mut builder = SessionManager::builder("sim:1").unwrap();
        builder
            .set_connect_timeout(Duration::from_secs(3))
            .set_retry_policy(RetryNTimes::new(500, Duration::from_millis(10)));
        let zk = NodeStore::new(builder.connect(ensemble.clone()).await.unwrap());
        let mutex = DistributedMutex::new(zk.clone(), "/locks/s").unwrap();

        ensemble.set_available(false);
        ensemble.disconnect(zk.session().session_id().unwrap());
        let started = Instant::now();
        assert_eq!(
            Err(error::Acquire::Timeout),
            mutex
                .acquire(Some(Duration::from_millis(200)))
                .await
                .unwrap()
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(MutexState::Failed, mutex.state());

        ensemble.set_available(true);
        zk.session()
            .wait_until_connected(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            Ok(()),
            mutex.acquire(Some(Duration::from_secs(1))).await.unwrap()
        );
        assert_eq!(1, ensemble.children("/locks/s").unwrap().len());
    }

    #[tokio::test]
    async fn dropping_the_holder_frees_the_lock() {
        let ensemble = Ensemble::new();
        let zk = store(&ensemble).await;
        let first = DistributedMutex::new(zk.clone(), "/locks/d").unwrap();
        first.acquire(None).await.unwrap().unwrap();
        drop(first);

        let second = DistributedMutex::new(zk, "/locks/d").unwrap();
        assert_eq!(
            Ok(()),
            second
                .acquire(Some(Duration::from_secs(1)))
                .await
                .unwrap()
        );
    }
}
