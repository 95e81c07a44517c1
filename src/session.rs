//! Session lifecycle: connect, resume, expire, close.
//!
//! A [`SessionManager`] owns one logical session with the service. A supervisor task watches the
//! current link; when the link dies the session is *suspended* and the supervisor reconnects,
//! presenting the old session credentials. If the service still knows the session, nothing was
//! lost. If the session timeout passes first, or the service rejects the credentials, the session
//! is *expired*: every ephemeral node and watch it had is gone, subscribers are told, and a brand
//! new session is established in its place.

use crate::connector::{Connector, Handshake, Link, SessionInfo};
use crate::path::Namespace;
use crate::proto::{Enqueuer, Reply, Request, ZkError};
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::{error, KeeperState, WatchedEvent, WatchedEventType};
use failure::bail;
use futures::{channel::mpsc, StreamExt};
use slog::{debug, info, o, trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// The lifecycle states of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No connection has been attempted yet.
    Disconnected,
    /// A new session is being established.
    Connecting,
    /// The session is usable.
    Connected,
    /// The connection was lost; the session may still be alive on the service, and the client is
    /// trying to resume it. Ephemeral nodes are not yet considered gone.
    Suspended,
    /// The session expired. Its ephemeral nodes and watches are gone. A new session follows.
    Expired,
    /// The session was closed, or the client gave up reconnecting. Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A state transition of a session, as seen by [`SessionManager::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionEvent {
    /// The state the session moved to.
    pub state: SessionState,
    /// The session the transition is about. For `Expired`, this is the session that was lost.
    pub session_id: i64,
}

/// Builder for a [`SessionManager`].
#[derive(Debug)]
pub struct SessionBuilder {
    endpoints: Vec<String>,
    namespace: Option<String>,
    session_timeout: Duration,
    connect_timeout: Duration,
    retry_policy: Arc<dyn RetryPolicy>,
    logger: slog::Logger,
}

impl SessionBuilder {
    /// Starts from a connect string of the form `host:port,host:port[/chroot]`.
    ///
    /// The optional chroot becomes the namespace every path is resolved under.
    pub fn new(connect_string: &str) -> Result<Self, failure::Error> {
        let (hosts, chroot) = match connect_string.find('/') {
            Some(i) => (&connect_string[..i], Some(&connect_string[i..])),
            None => (connect_string, None),
        };
        let endpoints: Vec<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(String::from)
            .collect();
        if endpoints.is_empty() {
            bail!("connect string {:?} names no endpoints", connect_string);
        }

        Ok(SessionBuilder {
            endpoints,
            namespace: chroot.map(String::from),
            session_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            retry_policy: Arc::new(ExponentialBackoff::new(Duration::from_secs(1), 3)),
            logger: slog::Logger::root(slog::Discard, o!()),
        })
    }

    /// Set the session timeout asked of the service. The service may negotiate it.
    pub fn set_session_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.session_timeout = timeout;
        self
    }

    /// Set how long one connection attempt, and one wait for a usable session, may take.
    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the policy used between failed connection attempts.
    pub fn set_retry_policy<P: RetryPolicy + 'static>(&mut self, policy: P) -> &mut Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    /// Resolve every path under `namespace` on the service.
    pub fn set_namespace(&mut self, namespace: impl Into<String>) -> &mut Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set a logger for the session and everything built on it.
    pub fn set_logger(&mut self, logger: slog::Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// Establishes the first session, retrying per the policy, and starts supervising it.
    pub async fn connect<C: Connector>(&self, connector: C) -> Result<SessionManager, failure::Error> {
        let namespace = Namespace::new(self.namespace.clone())?;
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (closing, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            connector: Box::new(connector),
            endpoints: self.endpoints.clone(),
            next_endpoint: AtomicUsize::new(0),
            namespace,
            session_timeout: self.session_timeout,
            connect_timeout: self.connect_timeout,
            retry_policy: Arc::clone(&self.retry_policy),
            link: Mutex::new(None),
            session: Mutex::new(None),
            last_zxid: Mutex::new(Arc::new(AtomicI64::new(0))),
            state,
            closing,
            subscribers: Mutex::new(Vec::new()),
            logger: self.logger.new(o!("component" => "session")),
        });

        inner.set_state(SessionState::Connecting, 0);
        let link = match inner.establish(Handshake::fresh(self.session_timeout), None).await {
            Ok(link) => link,
            Err(e) => {
                inner.set_state(SessionState::Closed, 0);
                return Err(e);
            }
        };
        let events = inner.install(link);
        tokio::spawn(supervise(Arc::clone(&inner), events));

        Ok(SessionManager {
            guard: Arc::new(CloseOnDrop(Arc::clone(&inner))),
            inner,
        })
    }
}

/// A handle to one logical session with the coordination service.
///
/// Handles are cheap to clone and can be shared by any number of caches and locks. The session is
/// closed by [`close`](SessionManager::close), or when the last handle is dropped.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
    guard: Arc<CloseOnDrop>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish()
    }
}

struct CloseOnDrop(Arc<Inner>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.closing.send_replace(true);
    }
}

impl SessionManager {
    /// Begins configuring a session for the given connect string.
    pub fn builder(connect_string: &str) -> Result<SessionBuilder, failure::Error> {
        SessionBuilder::new(connect_string)
    }

    /// The current state of the session.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// The identifier of the current session, if one is established.
    pub fn session_id(&self) -> Option<i64> {
        lock(&self.inner.session).as_ref().map(|s| s.session_id)
    }

    /// The newest transaction this session has seen. A resumed session starts from it.
    pub fn last_zxid_seen(&self) -> i64 {
        lock(&self.inner.last_zxid).load(Ordering::Relaxed)
    }

    /// Every subsequent state transition, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// The latest state, for callers that only care about where the session is now.
    pub fn state_watcher(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Waits until the session is `Connected`, for at most `timeout`.
    ///
    /// Fails with `error::Session::Closed` if the session closes in the meantime, and with
    /// `error::Session::ConnectionLost` on timeout.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), failure::Error> {
        self.inner.link(timeout).await.map(|_| ())
    }

    /// Closes the session. The service removes every ephemeral node it owns.
    ///
    /// Calling this more than once is harmless; every call returns once the session is closed.
    pub async fn close(&self) {
        self.inner.closing.send_replace(true);
        let mut state = self.inner.state.subscribe();
        loop {
            if *state.borrow_and_update() == SessionState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    pub(crate) fn logger(&self) -> &slog::Logger {
        &self.inner.logger
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.inner.connect_timeout
    }

    /// Sends `request` on the current link, waiting for one if the session is reconnecting.
    pub(crate) async fn request(&self, request: Request) -> Result<Reply, failure::Error> {
        let (enqueuer, session_id) = self.inner.link(self.inner.connect_timeout).await?;
        match enqueuer.enqueue(request).await? {
            Err(ZkError::SessionExpired) => Err(error::Session::Expired { session_id }.into()),
            Err(ZkError::ConnectionLoss) | Err(ZkError::SessionMoved) => {
                Err(error::Session::ConnectionLost.into())
            }
            reply => Ok(reply),
        }
    }
}

struct Inner {
    connector: Box<dyn Connector>,
    endpoints: Vec<String>,
    next_endpoint: AtomicUsize,
    namespace: Namespace,
    session_timeout: Duration,
    connect_timeout: Duration,
    retry_policy: Arc<dyn RetryPolicy>,

    /// The link to send requests on, while connected.
    link: Mutex<Option<Enqueuer>>,
    /// The established session, also while suspended.
    session: Mutex<Option<SessionInfo>>,
    /// The newest transaction seen by the current (or last) link.
    last_zxid: Mutex<Arc<AtomicI64>>,

    state: watch::Sender<SessionState>,
    closing: watch::Sender<bool>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    logger: slog::Logger,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why the supervisor stopped watching a link.
#[derive(Debug)]
enum LinkEnd {
    Lost,
    Expired,
    Close,
}

impl Inner {
    fn set_state(&self, state: SessionState, session_id: i64) {
        info!(self.logger, "session state changed"; "state" => %state, "session_id" => session_id);
        self.state.send_replace(state);
        let event = SessionEvent { state, session_id };
        lock(&self.subscribers).retain(|tx| tx.unbounded_send(event).is_ok());
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Makes `link` the current link, and hands back its event stream.
    fn install(&self, link: Link) -> (Enqueuer, mpsc::UnboundedReceiver<WatchedEvent>) {
        let session_id = link.session.session_id;
        *lock(&self.link) = Some(link.enqueuer.clone());
        *lock(&self.session) = Some(link.session);
        *lock(&self.last_zxid) = link.last_zxid;
        self.set_state(SessionState::Connected, session_id);
        (link.enqueuer, link.events)
    }

    async fn link(&self, timeout: Duration) -> Result<(Enqueuer, i64), failure::Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current == SessionState::Closed {
                bail!(error::Session::Closed);
            }
            if let Some(enqueuer) = lock(&self.link).as_ref().filter(|e| !e.is_closed()) {
                let session_id = lock(&self.session).as_ref().map_or(0, |s| s.session_id);
                return Ok((enqueuer.clone(), session_id));
            }
            match tokio::time::timeout_at(deadline, state.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => bail!(error::Session::Closed),
                Err(_) => bail!(error::Session::ConnectionLost),
            }
        }
    }

    /// Credentials to resume the current session with, or a fresh request if there is none.
    fn resume_handshake(&self) -> Handshake {
        match lock(&self.session).as_ref() {
            Some(s) => Handshake {
                session_id: s.session_id,
                password: s.password.clone(),
                timeout: self.session_timeout,
                last_zxid_seen: lock(&self.last_zxid).load(Ordering::Relaxed),
            },
            None => Handshake::fresh(self.session_timeout),
        }
    }

    fn next_endpoint(&self) -> &str {
        let i = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        &self.endpoints[i % self.endpoints.len()]
    }

    /// Announces that the session `session_id` is gone, and forgets its credentials.
    fn expire(&self, session_id: i64) {
        warn!(self.logger, "session expired"; "session_id" => session_id);
        *lock(&self.session) = None;
        self.set_state(SessionState::Expired, session_id);
    }

    /// Opens a link, retrying per the policy.
    ///
    /// When resuming a session, `resume_deadline` is the moment the service will have expired it;
    /// past that point the session is declared expired and a fresh one is requested instead.
    async fn establish(
        &self,
        mut handshake: Handshake,
        mut resume_deadline: Option<Instant>,
    ) -> Result<Link, failure::Error> {
        let start = Instant::now();
        let mut attempt = 0;
        let mut closing = self.closing.subscribe();
        loop {
            if self.is_closing() {
                bail!(error::Session::Closed);
            }

            if handshake.session_id != 0 && resume_deadline.map_or(false, |d| Instant::now() >= d)
            {
                self.expire(handshake.session_id);
                self.set_state(SessionState::Connecting, 0);
                handshake = Handshake::fresh(self.session_timeout);
                resume_deadline = None;
            }

            let endpoint = self.next_endpoint().to_string();
            let log = self.logger.new(o!("endpoint" => endpoint.clone()));
            debug!(log, "connecting"; "attempt" => attempt, "session_id" => handshake.session_id);
            let open = self.connector.open(&endpoint, handshake.clone(), log.clone());
            match tokio::time::timeout(self.connect_timeout, open).await {
                Ok(Ok(link)) => {
                    info!(log, "connected";
                          "session_id" => link.session.session_id,
                          "timeout" => ?link.session.timeout);
                    return Ok(link);
                }
                Ok(Err(e)) => match error::session_error(&e) {
                    Some(error::Session::Expired { session_id }) if session_id != 0 => {
                        // the service no longer knows us; no point in waiting to retry
                        self.expire(session_id);
                        self.set_state(SessionState::Connecting, 0);
                        handshake = Handshake::fresh(self.session_timeout);
                        resume_deadline = None;
                        continue;
                    }
                    _ => warn!(log, "connection attempt failed: {}", e; "attempt" => attempt),
                },
                Err(_) => warn!(log, "connection attempt timed out"; "attempt" => attempt),
            }

            let delay = match self.retry_policy.allow_retry(attempt, start.elapsed()) {
                Some(delay) => delay,
                None => bail!(error::Session::ConnectFailed {
                    attempts: attempt + 1
                }),
            };
            attempt += 1;
            trace!(self.logger, "backing off"; "delay" => ?delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closing.changed() => {}
            }
        }
    }
}

async fn watch_link(
    inner: &Inner,
    events: &mut mpsc::UnboundedReceiver<WatchedEvent>,
    closing: &mut watch::Receiver<bool>,
) -> LinkEnd {
    loop {
        if *closing.borrow_and_update() {
            return LinkEnd::Close;
        }
        tokio::select! {
            changed = closing.changed() => {
                if changed.is_err() {
                    return LinkEnd::Close;
                }
            }
            e = events.next() => match e {
                Some(WatchedEvent { event_type: WatchedEventType::None, keeper_state, .. }) => {
                    match keeper_state {
                        KeeperState::Expired => return LinkEnd::Expired,
                        KeeperState::Disconnected => return LinkEnd::Lost,
                        KeeperState::AuthFailed => {
                            warn!(inner.logger, "authentication failed");
                            return LinkEnd::Close;
                        }
                        _ => {}
                    }
                }
                // node events were already routed to their watchers by the link
                Some(e) => trace!(inner.logger, "unclaimed watch event"; "path" => e.path),
                None => return LinkEnd::Lost,
            },
        }
    }
}

async fn supervise(inner: Arc<Inner>, link: (Enqueuer, mpsc::UnboundedReceiver<WatchedEvent>)) {
    let (mut enqueuer, mut events) = link;
    let mut closing = inner.closing.subscribe();
    loop {
        let session_id = lock(&inner.session).as_ref().map_or(0, |s| s.session_id);
        let end = watch_link(&inner, &mut events, &mut closing).await;
        *lock(&inner.link) = None;
        debug!(inner.logger, "link ended: {:?}", end; "session_id" => session_id);

        let handshake = match end {
            LinkEnd::Close => {
                // dropping the last sender makes the link close the session
                drop(enqueuer);
                let drained = async {
                    while let Some(e) = events.next().await {
                        if e.event_type == WatchedEventType::None {
                            break;
                        }
                    }
                };
                let _ = tokio::time::timeout(inner.connect_timeout, drained).await;
                *lock(&inner.session) = None;
                inner.set_state(SessionState::Closed, session_id);
                return;
            }
            LinkEnd::Expired => {
                inner.expire(session_id);
                inner.set_state(SessionState::Connecting, 0);
                Handshake::fresh(inner.session_timeout)
            }
            LinkEnd::Lost => {
                info!(inner.logger, "connection lost; reconnecting"; "session_id" => session_id);
                inner.set_state(SessionState::Suspended, session_id);
                inner.resume_handshake()
            }
        };

        let deadline = lock(&inner.session)
            .as_ref()
            .map(|s| Instant::now() + s.timeout);
        match inner.establish(handshake, deadline).await {
            Ok(link) => {
                let (e, ev) = inner.install(link);
                enqueuer = e;
                events = ev;
            }
            Err(e) => {
                let lost = lock(&inner.session).take();
                if let Some(s) = lost {
                    if !inner.is_closing() {
                        inner.set_state(SessionState::Expired, s.session_id);
                    }
                }
                if !inner.is_closing() {
                    warn!(inner.logger, "giving up on the session: {}", e);
                }
                inner.set_state(SessionState::Closed, session_id);
                return;
            }
        }
    }
}
