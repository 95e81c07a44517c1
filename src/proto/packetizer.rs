use super::{
    active_packetizer::ActivePacketizer, request::OpCode, Enqueuer, Reply, Request,
    ZooKeeperTransport,
};
use crate::{KeeperState, WatchedEvent};
use futures::{
    channel::{mpsc, oneshot},
    FutureExt, StreamExt,
};
use slog::{debug, error, trace};
use std::{
    future::Future,
    pin::Pin,
    sync::{atomic::AtomicI64, Arc},
    task::{Context, Poll},
};

/// Drives one TCP link: serializes requests, routes replies by xid, dispatches watch events and
/// keeps the session alive with heartbeats.
///
/// A link never reconnects by itself. When it dies it reports `KeeperState::Disconnected` on the
/// default watcher and drops every pending reply and watcher; the session supervisor decides what
/// happens next.
pub(crate) struct Packetizer<S> {
    ap: ActivePacketizer<S>,

    /// Watcher to send watch events to.
    default_watcher: mpsc::UnboundedSender<WatchedEvent>,

    /// Incoming requests
    rx: mpsc::UnboundedReceiver<(Request, oneshot::Sender<Reply>)>,

    /// Next xid to issue
    xid: i32,

    logger: slog::Logger,

    exiting: bool,
}

impl<S> Packetizer<S>
where
    S: ZooKeeperTransport,
{
    /// Spawns the link onto the current runtime, and returns the entry point for submitting
    /// requests to it.
    pub(crate) fn spawn(
        stream: S,
        log: slog::Logger,
        default_watcher: mpsc::UnboundedSender<WatchedEvent>,
        last_zxid: Arc<AtomicI64>,
    ) -> Enqueuer {
        let (enqueuer, rx) = Enqueuer::new();

        let exitlogger = log.clone();
        let notify = default_watcher.clone();
        tokio::spawn(
            Packetizer {
                ap: ActivePacketizer::new(stream, last_zxid),
                xid: 0,
                default_watcher,
                rx,
                logger: log,
                exiting: false,
            }
            .map(move |r| {
                if let Err(e) = r {
                    error!(exitlogger, "packetizer exiting: {:?}", e);
                }
                let _ = notify.unbounded_send(WatchedEvent::session(KeeperState::Disconnected));
            }),
        );

        enqueuer
    }

    fn poll_enqueue(&mut self, cx: &mut Context) -> Poll<Result<(), ()>> {
        loop {
            let (mut item, tx) = match futures::ready!(self.rx.poll_next_unpin(cx)) {
                Some((request, response)) => (request, response),
                None => return Poll::Ready(Err(())),
            };
            debug!(self.logger, "enqueueing request {:?}", item; "xid" => self.xid);

            if let Some((path, w, wtype)) = item.take_custom_watch() {
                trace!(
                    self.logger,
                    "adding pending watcher";
                    "xid" => self.xid,
                    "path" => &path,
                    "wtype" => ?wtype
                );
                self.ap.add_pending_watcher(self.xid, path, w, wtype);
            }

            self.ap.enqueue(self.xid, item, tx);
            self.xid += 1;
        }
    }
}

impl<S> Future for Packetizer<S>
where
    S: ZooKeeperTransport,
{
    type Output = Result<(), failure::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = &mut *self;
        trace!(this.logger, "packetizer polled");
        if !this.exiting {
            trace!(this.logger, "poll_enqueue");
            match this.poll_enqueue(cx) {
                Poll::Ready(Ok(())) | Poll::Pending => {}
                Poll::Ready(Err(())) => {
                    // no more requests will be enqueued
                    this.exiting = true;
                    // send CloseSession
                    this.ap.enqueue_bare(0, OpCode::CloseSession);
                }
            }
        }

        this.ap
            .poll(cx, this.exiting, &this.logger, &this.default_watcher)
    }
}
