//! An in-process coordination service.
//!
//! [`Ensemble`] keeps a node tree, sessions with leases, ephemeral ownership, sequence numbers and
//! one-shot watches, and hands out links through the same [`Connector`] seam as the wire backend.
//! It also lets a test misbehave on purpose: drop a session's connection, expire a session or
//! refuse new connections.
//!
//! ```no_run
//! # async fn demo() -> Result<(), failure::Error> {
//! use tokio_coordination::{sim::Ensemble, SessionManager};
//!
//! let ensemble = Ensemble::new();
//! let _session = SessionManager::builder("sim:2181")?
//!     .connect(ensemble.clone())
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod tree;

use self::tree::{Fired, LinkId, Tree};
use crate::connector::{Connector, Handshake, Link, SessionInfo};
use crate::proto::{Enqueuer, Reply, Request, Response, WatchRegistry, ZkError};
use crate::{error, KeeperState, Stat, WatchedEvent};
use async_trait::async_trait;
use failure::bail;
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use slog::{debug, info, o, trace};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const MIN_SESSION_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// What the service pushes down one link.
#[derive(Debug)]
enum Note {
    Event(WatchedEvent),
    /// The link is torn down; the client is told `KeeperState` and nothing else.
    Drop(KeeperState),
}

struct Lease {
    password: Vec<u8>,
    timeout: Duration,
    ephemerals: BTreeSet<String>,
    link: Option<LinkId>,
    /// Bumped whenever the session gains or loses its link, so a stale reaper can tell.
    epoch: u64,
}

struct State {
    tree: Tree,
    sessions: HashMap<i64, Lease>,
    links: HashMap<LinkId, (i64, mpsc::UnboundedSender<Note>)>,
    next_session: i64,
    next_link: LinkId,
    available: bool,
}

impl State {
    fn notify(&self, fired: Fired) {
        for (link, e) in fired {
            if let Some((_, notes)) = self.links.get(&link) {
                let _ = notes.unbounded_send(Note::Event(e));
            }
        }
    }

    /// Tears down `link`. Returns what a lease reaper needs if its session is now unattended.
    fn detach(&mut self, link: LinkId, reason: KeeperState) -> Option<(i64, u64, Duration)> {
        let (session_id, notes) = self.links.remove(&link)?;
        let _ = notes.unbounded_send(Note::Drop(reason));
        self.tree.drop_watches(link);
        let lease = self.sessions.get_mut(&session_id)?;
        if lease.link != Some(link) {
            return None;
        }
        lease.link = None;
        lease.epoch += 1;
        Some((session_id, lease.epoch, lease.timeout))
    }

    /// Ends `session_id`, removing every ephemeral node it owned.
    fn end_session(&mut self, session_id: i64, reason: KeeperState) -> bool {
        let lease = match self.sessions.remove(&session_id) {
            Some(lease) => lease,
            None => return false,
        };
        if let Some(link) = lease.link {
            self.detach(link, reason);
        }
        let mut fired = Vec::new();
        // deepest first, although ephemerals cannot have children
        for path in lease.ephemerals.iter().rev() {
            let _ = self.tree.delete(path, -1, &mut fired);
        }
        self.notify(fired);
        true
    }

    fn forget_ephemeral(&mut self, owner: i64, path: &str) {
        if let Some(lease) = self.sessions.get_mut(&owner) {
            lease.ephemerals.remove(path);
        }
    }

    fn apply(&mut self, link: LinkId, session_id: i64, request: &Request) -> Reply {
        match self.sessions.get(&session_id) {
            None => return Err(ZkError::SessionExpired),
            Some(lease) if lease.link != Some(link) => return Err(ZkError::SessionMoved),
            Some(_) => {}
        }

        let mut fired = Vec::new();
        let reply = match *request {
            Request::Connect { .. } => Err(ZkError::BadArguments),
            Request::Exists { ref path, ref watch } => {
                let watch = Some(link).filter(|_| watch.to_u8() == 1);
                self.tree.exists(path, watch).map(Response::Stat)
            }
            Request::GetData { ref path, ref watch } => {
                let watch = Some(link).filter(|_| watch.to_u8() == 1);
                self.tree
                    .get_data(path, watch)
                    .map(|(bytes, stat)| Response::GetData { bytes, stat })
            }
            Request::GetChildren { ref path, ref watch } => {
                let watch = Some(link).filter(|_| watch.to_u8() == 1);
                self.tree.get_children(path, watch).map(Response::Strings)
            }
            Request::SetData {
                ref path,
                ref data,
                version,
            } => self
                .tree
                .set_data(path, data, version, &mut fired)
                .map(Response::Stat),
            Request::Delete { ref path, version } => {
                match self.tree.delete(path, version, &mut fired) {
                    Ok(owner) => {
                        self.forget_ephemeral(owner, path);
                        Ok(Response::Empty)
                    }
                    Err(e) => Err(e),
                }
            }
            Request::Create {
                ref path,
                ref data,
                ref acl,
                mode,
            } => {
                let created = self
                    .tree
                    .create(path, data, acl, mode, session_id, &mut fired);
                if let (Ok(actual), true) = (&created, mode.is_ephemeral()) {
                    if let Some(lease) = self.sessions.get_mut(&session_id) {
                        lease.ephemerals.insert(actual.clone());
                    }
                }
                created.map(Response::String)
            }
        };
        self.notify(fired);
        reply
    }
}

struct Shared {
    state: Mutex<State>,
    logger: slog::Logger,
}

/// An in-memory coordination service.
///
/// Cloning an `Ensemble` gives another handle to the same service.
#[derive(Clone)]
pub struct Ensemble {
    shared: Arc<Shared>,
}

impl Default for Ensemble {
    fn default() -> Self {
        Ensemble::with_logger(slog::Logger::root(slog::Discard, o!()))
    }
}

impl Ensemble {
    /// An empty service containing only the root node.
    pub fn new() -> Self {
        Ensemble::default()
    }

    /// An empty service that logs what it does to `logger`.
    pub fn with_logger(logger: slog::Logger) -> Self {
        Ensemble {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    tree: Tree::default(),
                    sessions: HashMap::new(),
                    links: HashMap::new(),
                    next_session: 0x100,
                    next_link: 0,
                    available: true,
                }),
                logger: logger.new(o!("component" => "ensemble")),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the service accept (`true`) or refuse (`false`) new connections. Existing links are
    /// not affected.
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// The sessions the service currently holds a lease for.
    pub fn sessions(&self) -> Vec<i64> {
        let mut ids: Vec<_> = self.state().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drops the connection of `session_id` without ending the session. Unless the client
    /// reconnects within the session timeout, the lease runs out and the session expires.
    pub fn disconnect(&self, session_id: i64) -> bool {
        let mut state = self.state();
        let link = match state.sessions.get(&session_id).and_then(|l| l.link) {
            Some(link) => link,
            None => return false,
        };
        info!(self.shared.logger, "dropping connection"; "session_id" => session_id);
        if let Some(reap) = state.detach(link, KeeperState::Disconnected) {
            self.spawn_reaper(reap);
        }
        true
    }

    /// Expires `session_id` right away, as if its lease had run out.
    pub fn expire_session(&self, session_id: i64) -> bool {
        info!(self.shared.logger, "expiring session"; "session_id" => session_id);
        self.state().end_session(session_id, KeeperState::Expired)
    }

    /// The data and metadata of the node at `path`, read outside of any session.
    pub fn node(&self, path: &str) -> Option<(Vec<u8>, Stat)> {
        self.state().tree.get_data(path, None).ok()
    }

    /// The children of the node at `path`, sorted, read outside of any session.
    pub fn children(&self, path: &str) -> Option<Vec<String>> {
        self.state().tree.get_children(path, None).ok()
    }

    fn spawn_reaper(&self, (session_id, epoch, timeout): (i64, u64, Duration)) {
        let ensemble = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = ensemble.state();
            let unattended = state
                .sessions
                .get(&session_id)
                .map_or(false, |l| l.link.is_none() && l.epoch == epoch);
            if unattended {
                info!(ensemble.shared.logger, "lease ran out"; "session_id" => session_id);
                state.end_session(session_id, KeeperState::Expired);
            }
        });
    }

    /// Serves one link until either side lets go of it.
    async fn serve(
        self,
        link: LinkId,
        session_id: i64,
        mut requests: mpsc::UnboundedReceiver<(Request, oneshot::Sender<Reply>)>,
        mut notes: mpsc::UnboundedReceiver<Note>,
        events: mpsc::UnboundedSender<WatchedEvent>,
        last_zxid: Arc<AtomicI64>,
        log: slog::Logger,
    ) {
        let mut watchers = WatchRegistry::default();
        loop {
            tokio::select! {
                request = requests.next() => {
                    let (mut request, tx) = match request {
                        Some(r) => r,
                        None => {
                            debug!(log, "client let go; closing session");
                            self.state().end_session(session_id, KeeperState::Disconnected);
                            break;
                        }
                    };
                    let custom = request.take_custom_watch();
                    let (reply, zxid) = {
                        let mut state = self.state();
                        let reply = state.apply(link, session_id, &request);
                        (reply, state.tree.zxid())
                    };
                    last_zxid.fetch_max(zxid, Ordering::Relaxed);
                    trace!(log, "served {:?}", request; "ok" => reply.is_ok());
                    if let Some((path, w, wtype)) = custom {
                        let armed = match reply {
                            Ok(_) => true,
                            Err(ZkError::NoNode) => matches!(request, Request::Exists { .. }),
                            Err(_) => false,
                        };
                        if armed {
                            watchers.add(path, w, wtype);
                        }
                    }
                    let _ = tx.send(reply);
                }
                note = notes.next() => match note {
                    Some(Note::Event(e)) => {
                        watchers.dispatch(&e, &log);
                        let _ = events.unbounded_send(e);
                    }
                    Some(Note::Drop(state)) => {
                        let _ = events.unbounded_send(WatchedEvent::session(state));
                        break;
                    }
                    None => {
                        let _ = events.unbounded_send(WatchedEvent::session(KeeperState::Disconnected));
                        break;
                    }
                },
            }
        }
        // anything still outstanding is invalidated when `watchers` goes away
        if let Some(reap) = self.state().detach(link, KeeperState::Disconnected) {
            self.spawn_reaper(reap);
        }
    }
}

#[async_trait]
impl Connector for Ensemble {
    async fn open(
        &self,
        endpoint: &str,
        handshake: Handshake,
        log: slog::Logger,
    ) -> Result<Link, failure::Error> {
        let (notes_tx, notes_rx) = mpsc::unbounded();
        let (link, session) = {
            let mut state = self.state();
            if !state.available {
                bail!("{} refused the connection", endpoint);
            }

            let link = state.next_link;
            state.next_link += 1;

            if handshake.last_zxid_seen > state.tree.zxid() {
                bail!(
                    "client has seen zxid {:#x}, beyond the service's {:#x}",
                    handshake.last_zxid_seen,
                    state.tree.zxid()
                );
            }

            let session = if handshake.session_id != 0 {
                let lease = match state.sessions.get_mut(&handshake.session_id) {
                    Some(lease) if lease.password == handshake.password => lease,
                    _ => bail!(error::Session::Expired {
                        session_id: handshake.session_id
                    }),
                };
                let previous = lease.link.replace(link);
                lease.epoch += 1;
                let info = SessionInfo {
                    session_id: handshake.session_id,
                    password: lease.password.clone(),
                    timeout: lease.timeout,
                };
                if let Some(previous) = previous {
                    state.detach(previous, KeeperState::Disconnected);
                }
                info
            } else {
                let session_id = state.next_session;
                state.next_session += 1;
                let password = uuid::Uuid::new_v4().as_bytes().to_vec();
                let timeout = handshake
                    .timeout
                    .clamp(MIN_SESSION_TIMEOUT, MAX_SESSION_TIMEOUT);
                state.sessions.insert(
                    session_id,
                    Lease {
                        password: password.clone(),
                        timeout,
                        ephemerals: BTreeSet::new(),
                        link: Some(link),
                        epoch: 0,
                    },
                );
                SessionInfo {
                    session_id,
                    password,
                    timeout,
                }
            };
            state.links.insert(link, (session.session_id, notes_tx));
            (link, session)
        };

        let log = log.new(o!("link" => link, "session_id" => session.session_id));
        debug!(log, "link established");
        let (enqueuer, requests) = Enqueuer::new();
        let (events_tx, events) = mpsc::unbounded();
        let last_zxid = Arc::new(AtomicI64::new(handshake.last_zxid_seen));
        tokio::spawn(self.clone().serve(
            link,
            session.session_id,
            requests,
            notes_rx,
            events_tx,
            Arc::clone(&last_zxid),
            log,
        ));
        Ok(Link::new(enqueuer, events, session, last_zxid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Watch;
    use crate::{Acl, CreateMode, WatchedEventType};
    use std::borrow::Cow;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    async fn open(ensemble: &Ensemble) -> Link {
        ensemble
            .open("sim", Handshake::fresh(Duration::from_secs(5)), logger())
            .await
            .unwrap()
    }

    fn create(path: &str, mode: CreateMode) -> Request {
        Request::Create {
            path: path.to_string(),
            data: Cow::Borrowed(&b""[..]),
            acl: Cow::Borrowed(Acl::open_unsafe()),
            mode,
        }
    }

    #[tokio::test]
    async fn ephemerals_go_with_their_session() {
        let ensemble = Ensemble::new();
        let link = open(&ensemble).await;
        let id = link.session().session_id;
        let reply = link
            .enqueuer
            .enqueue(create("/e", CreateMode::Ephemeral))
            .await
            .unwrap();
        assert_eq!(Ok(Response::String("/e".to_string())), reply);
        assert!(ensemble.node("/e").is_some());

        assert!(ensemble.expire_session(id));
        assert!(ensemble.node("/e").is_none());
        assert!(ensemble.sessions().is_empty());
    }

    #[tokio::test]
    async fn custom_watch_fires_after_reply() {
        let ensemble = Ensemble::new();
        let a = open(&ensemble).await;
        let b = open(&ensemble).await;

        let (tx, rx) = oneshot::channel();
        let reply = a
            .enqueuer
            .enqueue(Request::Exists {
                path: "/w".to_string(),
                watch: Watch::Custom(tx),
            })
            .await
            .unwrap();
        assert_eq!(Err(ZkError::NoNode), reply);

        b.enqueuer
            .enqueue(create("/w", CreateMode::Persistent))
            .await
            .unwrap()
            .unwrap();
        let e = rx.await.unwrap();
        assert_eq!(WatchedEventType::NodeCreated, e.event_type);
    }

    #[tokio::test]
    async fn resume_requires_the_password() {
        let ensemble = Ensemble::new();
        let link = open(&ensemble).await;
        let info = link.session().clone();
        assert!(ensemble.disconnect(info.session_id));

        let forged = Handshake {
            session_id: info.session_id,
            password: b"nope".to_vec(),
            timeout: info.timeout,
            last_zxid_seen: 0,
        };
        let err = ensemble.open("sim", forged, logger()).await.err().unwrap();
        assert_eq!(
            Some(error::Session::Expired {
                session_id: info.session_id
            }),
            error::session_error(&err)
        );

        let resumed = Handshake {
            session_id: info.session_id,
            password: info.password.clone(),
            timeout: info.timeout,
            last_zxid_seen: 0,
        };
        let link = ensemble.open("sim", resumed, logger()).await.unwrap();
        assert_eq!(info.session_id, link.session().session_id);
    }

    #[tokio::test]
    async fn unattended_lease_runs_out() {
        let ensemble = Ensemble::new();
        let link = ensemble
            .open("sim", Handshake::fresh(Duration::from_millis(100)), logger())
            .await
            .unwrap();
        let id = link.session().session_id;
        link.enqueuer
            .enqueue(create("/lease", CreateMode::Ephemeral))
            .await
            .unwrap()
            .unwrap();

        let mut events = link.events;
        ensemble.disconnect(id);
        assert_eq!(
            Some(WatchedEvent::session(KeeperState::Disconnected)),
            events.next().await
        );
        assert!(ensemble.node("/lease").is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(ensemble.node("/lease").is_none());
        assert!(ensemble.sessions().is_empty());
    }

    #[tokio::test]
    async fn refuses_when_unavailable() {
        let ensemble = Ensemble::new();
        ensemble.set_available(false);
        assert!(ensemble
            .open("sim", Handshake::fresh(Duration::from_secs(1)), logger())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn resume_carries_the_last_zxid() {
        let ensemble = Ensemble::new();
        let link = open(&ensemble).await;
        link.enqueuer
            .enqueue(create("/z", CreateMode::Persistent))
            .await
            .unwrap()
            .unwrap();
        let seen = link.last_zxid_seen();
        assert!(seen > 0);
        let info = link.session().clone();
        ensemble.disconnect(info.session_id);

        let ahead = Handshake {
            session_id: info.session_id,
            password: info.password.clone(),
            timeout: info.timeout,
            last_zxid_seen: seen + 100,
        };
        let err = ensemble.open("sim", ahead, logger()).await.err().unwrap();
        assert_eq!(None, error::session_error(&err));

        let resumed = Handshake {
            last_zxid_seen: seen,
            session_id: info.session_id,
            password: info.password,
            timeout: info.timeout,
        };
        let link = ensemble.open("sim", resumed, logger()).await.unwrap();
        assert_eq!(seen, link.last_zxid_seen());
    }
}
