//! The seam between a session and the service it talks to.
//!
//! A [`Connector`] opens one *link*: a single connection carrying an established session. Links
//! never outlive their connection. Reconnecting, resuming the same session and detecting expiry
//! is done by the session supervisor on top, so every backend gets the same lifecycle.

use crate::proto::{Enqueuer, Packetizer, Request, Response, ZooKeeperTransport};
use crate::{error, WatchedEvent};
use async_trait::async_trait;
use failure::bail;
use futures::channel::mpsc;
use slog::debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Session credentials presented when opening a link.
///
/// A zero `session_id` asks the service for a brand new session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// The session to resume, or 0.
    pub session_id: i64,
    /// The password of the session to resume.
    pub password: Vec<u8>,
    /// The session timeout the client asks for.
    pub timeout: Duration,
    /// The newest transaction the client has seen. The service refuses a client that is ahead
    /// of it.
    pub last_zxid_seen: i64,
}

impl Handshake {
    pub(crate) fn fresh(timeout: Duration) -> Self {
        Handshake {
            session_id: 0,
            password: Vec::new(),
            timeout,
            last_zxid_seen: 0,
        }
    }
}

/// What the service granted in reply to a [`Handshake`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// The opaque session identifier.
    pub session_id: i64,
    /// The password needed to resume the session on another link.
    pub password: Vec<u8>,
    /// The negotiated session timeout.
    pub timeout: Duration,
}

/// An open link to the service.
pub struct Link {
    pub(crate) enqueuer: Enqueuer,
    /// Every notification the service pushes, plus a final `KeeperState::Disconnected` (or
    /// `KeeperState::Expired`) event when the link goes away.
    pub(crate) events: mpsc::UnboundedReceiver<WatchedEvent>,
    pub(crate) session: SessionInfo,
    /// Raised by the link as replies come in.
    pub(crate) last_zxid: Arc<AtomicI64>,
}

impl Link {
    pub(crate) fn new(
        enqueuer: Enqueuer,
        events: mpsc::UnboundedReceiver<WatchedEvent>,
        session: SessionInfo,
        last_zxid: Arc<AtomicI64>,
    ) -> Self {
        Link {
            enqueuer,
            events,
            session,
            last_zxid,
        }
    }

    /// The newest transaction seen on this link, or the one the handshake started from.
    pub fn last_zxid_seen(&self) -> i64 {
        self.last_zxid.load(Ordering::Relaxed)
    }

    /// The session this link carries.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }
}

/// Opens links to a coordination service.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects to `endpoint` and establishes (or resumes) the session described by `handshake`.
    ///
    /// Fails with `error::Session::Expired` if the service no longer knows the session being
    /// resumed.
    async fn open(
        &self,
        endpoint: &str,
        handshake: Handshake,
        log: slog::Logger,
    ) -> Result<Link, failure::Error>;
}

/// Opens links speaking the ZooKeeper wire protocol over a byte stream transport.
pub struct WireConnector<S = tokio::net::TcpStream> {
    _transport: PhantomData<fn() -> S>,
}

impl<S> Default for WireConnector<S> {
    fn default() -> Self {
        WireConnector {
            _transport: PhantomData,
        }
    }
}

impl WireConnector {
    /// A connector using plain TCP.
    pub fn tcp() -> Self {
        WireConnector::default()
    }
}

#[async_trait]
impl<S> Connector for WireConnector<S>
where
    S: ZooKeeperTransport<Addr = String>,
{
    async fn open(
        &self,
        endpoint: &str,
        handshake: Handshake,
        log: slog::Logger,
    ) -> Result<Link, failure::Error> {
        let stream = match S::connect(endpoint.to_string()).await {
            Ok(stream) => stream,
            Err(e) => return Err(e.into()),
        };

        let (tx, rx) = mpsc::unbounded();
        let last_zxid = Arc::new(AtomicI64::new(handshake.last_zxid_seen));
        let enqueuer = Packetizer::spawn(stream, log.clone(), tx, Arc::clone(&last_zxid));

        let requested = handshake.session_id;
        let request = Request::Connect {
            protocol_version: 0,
            last_zxid_seen: handshake.last_zxid_seen,
            timeout: handshake.timeout.as_millis().min(i32::MAX as u128) as i32,
            session_id: handshake.session_id,
            passwd: handshake.password,
            read_only: false,
        };
        debug!(log, "about to handshake"; "session_id" => requested);

        match enqueuer.enqueue(request).await? {
            Ok(Response::Connect {
                timeout,
                session_id,
                password,
                ..
            }) if timeout > 0 => Ok(Link::new(
                enqueuer,
                rx,
                SessionInfo {
                    session_id,
                    password,
                    timeout: Duration::from_millis(timeout as u64),
                },
                last_zxid,
            )),
            Ok(Response::Connect { .. }) => Err(error::Session::Expired {
                session_id: requested,
            }
            .into()),
            Ok(r) => bail!("got a non-connect response to a handshake: {:?}", r),
            Err(e) => bail!("handshake failed: {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Watch;
    use crate::{
        ChangeEvent, KeeperState, NodeStore, RetryNTimes, SessionManager, SessionState,
        WatchedEventType,
    };
    use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
    use failure::format_err;
    use futures::StreamExt;
    use once_cell::sync::Lazy;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    const GET_DATA: i32 = 4;

    /// Client halves of in-memory pipes, waiting to be picked up by `connect`.
    static LISTENING: Lazy<Mutex<HashMap<String, DuplexStream>>> = Lazy::new(Default::default);

    #[async_trait]
    impl ZooKeeperTransport for DuplexStream {
        type Addr = String;
        type ConnectError = failure::Error;
        async fn connect(addr: String) -> Result<Self, failure::Error> {
            let stream = LISTENING.lock().unwrap().remove(&addr);
            stream.ok_or_else(|| format_err!("nothing listening on {}", addr))
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    /// The service end of one pipe, driven step by step by the test.
    struct Server(DuplexStream);

    fn listen(addr: &str) -> Server {
        let (client, server) = tokio::io::duplex(64 * 1024);
        LISTENING.lock().unwrap().insert(addr.to_string(), client);
        Server(server)
    }

    fn string(buf: &mut &[u8]) -> String {
        let len = buf.read_i32::<BigEndian>().unwrap() as usize;
        let (s, rest) = buf.split_at(len);
        *buf = rest;
        String::from_utf8(s.to_vec()).unwrap()
    }

    fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
        buf.write_i32::<BigEndian>(bytes.len() as i32).unwrap();
        buf.extend_from_slice(bytes);
    }

    fn get_data_reply(data: &[u8], version: i32) -> Vec<u8> {
        let mut body = Vec::new();
        put_bytes(&mut body, data);
        for v in &[1i64, 2, 3, 4] {
            body.write_i64::<BigEndian>(*v).unwrap();
        }
        body.write_i32::<BigEndian>(version).unwrap();
        body.write_i32::<BigEndian>(0).unwrap();
        body.write_i32::<BigEndian>(0).unwrap();
        body.write_i64::<BigEndian>(0).unwrap();
        body.write_i32::<BigEndian>(data.len() as i32).unwrap();
        body.write_i32::<BigEndian>(0).unwrap();
        body.write_i64::<BigEndian>(2).unwrap();
        body
    }

    impl Server {
        async fn frame(&mut self) -> Vec<u8> {
            use tokio::io::AsyncReadExt;
            let len = self.0.read_i32().await.unwrap() as usize;
            let mut body = vec![0; len];
            self.0.read_exact(&mut body).await.unwrap();
            body
        }

        async fn send(&mut self, body: &[u8]) {
            use tokio::io::AsyncWriteExt;
            self.0.write_i32(body.len() as i32).await.unwrap();
            self.0.write_all(body).await.unwrap();
        }

        /// Reads the connect request, returning the session id and last zxid it carries.
        async fn hello(&mut self) -> (i64, i64) {
            let body = self.frame().await;
            let mut buf = &body[..];
            assert_eq!(0, buf.read_i32::<BigEndian>().unwrap());
            let last_zxid = buf.read_i64::<BigEndian>().unwrap();
            assert_eq!(30_000, buf.read_i32::<BigEndian>().unwrap());
            let session_id = buf.read_i64::<BigEndian>().unwrap();
            (session_id, last_zxid)
        }

        async fn welcome(&mut self, timeout: i32, session_id: i64, password: &[u8]) {
            let mut body = Vec::new();
            body.write_i32::<BigEndian>(0).unwrap();
            body.write_i32::<BigEndian>(timeout).unwrap();
            body.write_i64::<BigEndian>(session_id).unwrap();
            put_bytes(&mut body, password);
            body.push(0);
            self.send(&body).await;
        }

        /// Reads a read request, returning its xid, opcode, path and watch flag.
        async fn read_request(&mut self) -> (i32, i32, String, u8) {
            let body = self.frame().await;
            let mut buf = &body[..];
            let xid = buf.read_i32::<BigEndian>().unwrap();
            let opcode = buf.read_i32::<BigEndian>().unwrap();
            let path = string(&mut buf);
            (xid, opcode, path, buf.read_u8().unwrap())
        }

        async fn reply(&mut self, xid: i32, zxid: i64, body: &[u8]) {
            let mut frame = Vec::new();
            frame.write_i32::<BigEndian>(xid).unwrap();
            frame.write_i64::<BigEndian>(zxid).unwrap();
            frame.write_i32::<BigEndian>(0).unwrap();
            frame.extend_from_slice(body);
            self.send(&frame).await;
        }

        async fn notify(&mut self, event_type: WatchedEventType, path: &str) {
            let mut body = Vec::new();
            body.write_i32::<BigEndian>(event_type as i32).unwrap();
            let state = KeeperState::SyncConnected as i32;
            body.write_i32::<BigEndian>(state).unwrap();
            put_bytes(&mut body, path.as_bytes());
            self.reply(-1, -1, &body).await;
        }
    }


    fn handshake(session_id: i64, password: &[u8], last_zxid_seen: i64) -> Handshake {
        Handshake {
            session_id,
            password: password.to_vec(),
            timeout: Duration::from_secs(30),
            last_zxid_seen,
        }
    }

    #[tokio::test]
    async fn fresh_session_then_a_read() {
        let mut server = listen("wire:fresh");
        let connector = WireConnector::<DuplexStream>::default();
        let (link, ()) = tokio::join!(
            connector.open("wire:fresh", Handshake::fresh(Duration::from_secs(30)), logger()),
            async {
                assert_eq!((0, 0), server.hello().await);
                server.welcome(20_000, 0x42, b"secret").await;
            }
        );
        let link = link.unwrap();
        assert_eq!(
            &SessionInfo {
                session_id: 0x42,
                password: b"secret".to_vec(),
                timeout: Duration::from_secs(20),
            },
            link.session()
        );
        assert_eq!(0, link.last_zxid_seen());

        let read = link.enqueuer.enqueue(Request::GetData {
            path: "/a".to_string(),
            watch: Watch::None,
        });
        let (reply, ()) = tokio::join!(read, async {
            let (xid, opcode, path, watch) = server.read_request().await;
            assert_eq!((GET_DATA, "/a", 0), (opcode, path.as_str(), watch));
            server.reply(xid, 7, &get_data_reply(b"x", 3)).await;
        });
        match reply.unwrap() {
            Ok(Response::GetData { bytes, stat }) => {
                assert_eq!(b"x".to_vec(), bytes);
                assert_eq!(3, stat.version);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(7, link.last_zxid_seen());
    }

    #[tokio::test]
    async fn refused_resume_is_expiry() {
        let mut server = listen("wire:refused");
        let connector = WireConnector::<DuplexStream>::default();
        let (opened, ()) = tokio::join!(
            connector.open("wire:refused", handshake(0x42, b"secret", 9), logger()),
            async {
                assert_eq!((0x42, 9), server.hello().await);
                server.welcome(0, 0, b"").await;
            }
        );
        let err = opened.err().unwrap();
        assert_eq!(
            Some(error::Session::Expired { session_id: 0x42 }),
            error::session_error(&err)
        );
    }

    #[tokio::test]
    async fn watches_fire_and_die_with_the_link() {
        let mut server = listen("wire:watch");
        let mut builder = SessionManager::builder("wire:watch").unwrap();
        builder
            .set_session_timeout(Duration::from_secs(30))
            .set_retry_policy(RetryNTimes::new(0, Duration::from_millis(10)))
            .set_logger(logger());
        let (session, ()) = tokio::join!(
            builder.connect(WireConnector::<DuplexStream>::default()),
            async {
                assert_eq!((0, 0), server.hello().await);
                server.welcome(30_000, 0x42, b"secret").await;
            }
        );
        let zk = NodeStore::new(session.unwrap());

        let (read, ()) = tokio::join!(zk.with_watcher().get_data("/w"), async {
            let (xid, opcode, path, watch) = server.read_request().await;
            assert_eq!((GET_DATA, "/w", 1), (opcode, path.as_str(), watch));
            server.reply(xid, 5, &get_data_reply(b"v0", 0)).await;
        });
        let (watch, data) = read.unwrap();
        assert_eq!(Some(b"v0".to_vec()), data.map(|(bytes, _)| bytes));
        server.notify(WatchedEventType::NodeDataChanged, "/w").await;
        assert_eq!(
            ChangeEvent::DataChanged {
                path: "/w".to_string()
            },
            watch.await
        );

        let (read, ()) = tokio::join!(zk.with_watcher().get_data("/w"), async {
            let (xid, _, _, watch) = server.read_request().await;
            assert_eq!(1, watch);
            server.reply(xid, 6, &get_data_reply(b"v1", 1)).await;
        });
        let (pending, _) = read.unwrap();
        let mut events = zk.session().subscribe();
        drop(server);
        assert_eq!(
            ChangeEvent::Invalidated {
                path: "/w".to_string()
            },
            pending.await
        );
        assert_eq!(SessionState::Suspended, events.next().await.unwrap().state);
    }
}
