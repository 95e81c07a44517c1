use async_trait::async_trait;
use futures::{
    channel::{mpsc, oneshot},
    future::Either,
    FutureExt,
};
use std::future::{self, Future};
use tokio::io::{AsyncRead, AsyncWrite};

mod active_packetizer;
mod error;
mod packetizer;
mod request;
mod response;
mod watch;

pub use self::error::ZkError;
pub(crate) use self::packetizer::Packetizer;
pub(crate) use self::request::Request;
pub(crate) use self::response::Response;
pub(crate) use self::watch::{Watch, WatchRegistry, WatchType};

/// A byte stream that can carry the coordination wire protocol.
#[async_trait]
pub trait ZooKeeperTransport: AsyncRead + AsyncWrite + Sized + Send + 'static {
    /// The address type used to reach a server.
    type Addr: Send + Sync + Clone;
    /// The error returned when a connection cannot be made.
    type ConnectError: Into<failure::Error> + 'static;
    /// Connect to the server at `addr`.
    async fn connect(addr: Self::Addr) -> Result<Self, Self::ConnectError>;
}

#[async_trait]
impl ZooKeeperTransport for tokio::net::TcpStream {
    type Addr = String;
    type ConnectError = tokio::io::Error;
    async fn connect(addr: String) -> Result<Self, Self::ConnectError> {
        tokio::net::TcpStream::connect(addr.as_str()).await
    }
}

pub(crate) type Reply = Result<Response, ZkError>;

/// The sending half of a link: every request gets its own reply slot, so any number of requests
/// can be in flight at once.
#[derive(Clone, Debug)]
pub(crate) struct Enqueuer(mpsc::UnboundedSender<(Request, oneshot::Sender<Reply>)>);

impl Enqueuer {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<(Request, oneshot::Sender<Reply>)>) {
        let (tx, rx) = mpsc::unbounded();
        (Enqueuer(tx), rx)
    }

    /// Submits `request`; the returned future fails with `error::Session::ConnectionLost` if the
    /// link goes away before the reply arrives.
    pub(crate) fn enqueue(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Reply, failure::Error>> {
        let (tx, rx) = oneshot::channel();
        match self.0.unbounded_send((request, tx)) {
            Ok(()) => Either::Left(rx.map(|r| r.map_err(|_| connection_lost()))),
            Err(_) => Either::Right(future::ready(Err(connection_lost()))),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

fn connection_lost() -> failure::Error {
    crate::error::Session::ConnectionLost.into()
}
