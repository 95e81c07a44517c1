//! Reading and writing nodes on a live session.
//!
//! Every operation waits (up to the connect timeout) for the session to be usable, and returns a
//! nested result: the outer `failure::Error` is a session or transport failure (inspect it with
//! [`error::session_error`]), the inner error is a logic error the caller has to decide about.

use crate::path::{self, Namespace};
use crate::proto::{Request, Watch};
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::session::SessionManager;
use crate::{error, transform, Acl, ChangeEvent, CreateMode, Stat, WatchKind, WatchedEvent};
use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt},
};
use slog::{debug, trace, warn};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// How [`NodeStore::delete_with`] goes about a delete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Delete the whole subtree, children first.
    pub recursive: bool,
    /// If the delete fails for session reasons, keep retrying in the background until it is
    /// confirmed. A node that is gone by then counts as deleted.
    pub guaranteed: bool,
}

/// The outcome of a one-shot watch.
///
/// Resolves exactly once, to the change that fired it, or to `ChangeEvent::Invalidated` when the
/// connection or session carrying the watch goes away first. Dropping it abandons the watch.
#[must_use = "futures do nothing unless polled"]
pub struct WatchOnce {
    inner: BoxFuture<'static, ChangeEvent>,
}

impl fmt::Debug for WatchOnce {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WatchOnce")
    }
}

impl WatchOnce {
    fn new(rx: oneshot::Receiver<WatchedEvent>, path: String, namespace: Namespace) -> Self {
        WatchOnce {
            inner: async move {
                match rx.await {
                    Ok(e) => {
                        let path = if e.path.is_empty() {
                            path
                        } else {
                            namespace.strip(&e.path)
                        };
                        ChangeEvent::from_watched(&e, path)
                    }
                    Err(oneshot::Canceled) => ChangeEvent::Invalidated { path },
                }
            }
            .boxed(),
        }
    }

    fn ready(event: ChangeEvent) -> Self {
        WatchOnce {
            inner: futures::future::ready(event).boxed(),
        }
    }
}

impl Future for WatchOnce {
    type Output = ChangeEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// Create, read, update and delete nodes, and watch them for changes.
///
/// A `NodeStore` is a thin, cloneable view of a [`SessionManager`]; all paths are relative to the
/// session's namespace.
#[derive(Clone, Debug)]
pub struct NodeStore {
    session: SessionManager,
}

impl NodeStore {
    /// Operate on nodes through `session`.
    pub fn new(session: SessionManager) -> Self {
        NodeStore { session }
    }

    /// The session this store talks through.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    fn logger(&self) -> &slog::Logger {
        self.session.logger()
    }

    fn resolve(&self, path: &str) -> Result<String, failure::Error> {
        path::validate(path)?;
        Ok(self.session.namespace().apply(path))
    }

    /// Create a node at `path`, and return the path it was actually created at (it differs from
    /// `path` for sequential nodes).
    ///
    /// Fails with `error::Create::NoParent` if the parent does not exist; see
    /// [`create_with_parents`](NodeStore::create_with_parents).
    pub async fn create<D, A>(
        &self,
        path: &str,
        data: D,
        acl: A,
        mode: CreateMode,
    ) -> Result<Result<String, error::Create>, failure::Error>
    where
        D: Into<Cow<'static, [u8]>>,
        A: Into<Cow<'static, [Acl]>>,
    {
        let target = self.resolve(path)?;
        debug!(self.logger(), "create"; "path" => path, "mode" => ?mode);
        self.create_at(target, data.into(), acl.into(), mode).await
    }

    /// Like [`create`](NodeStore::create), but first creates every missing ancestor as an empty
    /// persistent node.
    pub async fn create_with_parents<D, A>(
        &self,
        path: &str,
        data: D,
        acl: A,
        mode: CreateMode,
    ) -> Result<Result<String, error::Create>, failure::Error>
    where
        D: Into<Cow<'static, [u8]>>,
        A: Into<Cow<'static, [Acl]>>,
    {
        let target = self.resolve(path)?;
        for ancestor in path::ancestors(&target) {
            let created = self
                .create_at(
                    ancestor.to_string(),
                    Cow::Borrowed(&b""[..]),
                    Cow::Borrowed(Acl::open_unsafe()),
                    CreateMode::Persistent,
                )
                .await?;
            match created {
                Ok(_) => trace!(self.logger(), "created parent"; "path" => ancestor),
                Err(error::Create::NodeExists) => {}
                Err(e) => return Ok(Err(e)),
            }
        }
        debug!(self.logger(), "create"; "path" => path, "mode" => ?mode);
        self.create_at(target, data.into(), acl.into(), mode).await
    }

    async fn create_at(
        &self,
        target: String,
        data: Cow<'static, [u8]>,
        acl: Cow<'static, [Acl]>,
        mode: CreateMode,
    ) -> Result<Result<String, error::Create>, failure::Error> {
        let reply = self
            .session
            .request(Request::Create {
                path: target,
                data,
                acl,
                mode,
            })
            .await?;
        let namespace = self.session.namespace();
        Ok(transform::create(reply)?.map(|actual| namespace.strip(&actual)))
    }

    /// Set the data of the node at `path`.
    ///
    /// With `Some(version)`, the write only succeeds if the node is still at that version. The
    /// returned `Stat` describes the node after the write.
    pub async fn set_data<D>(
        &self,
        path: &str,
        version: Option<i32>,
        data: D,
    ) -> Result<Result<Stat, error::SetData>, failure::Error>
    where
        D: Into<Cow<'static, [u8]>>,
    {
        let target = self.resolve(path)?;
        let version = version.unwrap_or(-1);
        debug!(self.logger(), "set_data"; "path" => path, "version" => version);
        let reply = self
            .session
            .request(Request::SetData {
                path: target,
                data: data.into(),
                version,
            })
            .await?;
        let res = transform::set_data(version, reply)?;
        if let Err(ref e) = res {
            debug!(self.logger(), "set_data refused: {}", e; "path" => path, "expected" => version);
        }
        Ok(res)
    }

    /// Delete the node at `path`, if it is still at `version` (any version if `None`).
    pub async fn delete(
        &self,
        path: &str,
        version: Option<i32>,
    ) -> Result<Result<(), error::Delete>, failure::Error> {
        self.delete_with(path, version, DeleteOptions::default())
            .await
    }

    /// Delete the node at `path` as `options` direct.
    ///
    /// `version` applies to the node at `path` only; descendants are deleted at whatever version
    /// they are.
    pub async fn delete_with(
        &self,
        path: &str,
        version: Option<i32>,
        options: DeleteOptions,
    ) -> Result<Result<(), error::Delete>, failure::Error> {
        let target = self.resolve(path)?;
        let version = version.unwrap_or(-1);
        debug!(self.logger(), "delete";
               "path" => path,
               "version" => version,
               "recursive" => options.recursive,
               "guaranteed" => options.guaranteed);
        let res = self.delete_at(&target, version, options.recursive).await;
        if let (Err(e), true) = (&res, options.guaranteed) {
            if error::session_error(e) != Some(error::Session::Closed) {
                warn!(self.logger(), "delete failed, retrying in the background: {}", e;
                      "path" => path);
                self.spawn_delete(target, version, options.recursive);
            }
        }
        res
    }

    async fn delete_at(
        &self,
        target: &str,
        version: i32,
        recursive: bool,
    ) -> Result<Result<(), error::Delete>, failure::Error> {
        loop {
            if recursive {
                self.delete_children(target.to_string()).await?;
            }
            let reply = self
                .session
                .request(Request::Delete {
                    path: target.to_string(),
                    version,
                })
                .await?;
            match transform::delete(version, reply)? {
                // somebody added a child in the meantime
                Err(error::Delete::NotEmpty) if recursive => continue,
                res => return Ok(res),
            }
        }
    }

    fn delete_children(&self, target: String) -> BoxFuture<'_, Result<(), failure::Error>> {
        async move {
            let children = self
                .session
                .request(Request::GetChildren {
                    path: target.clone(),
                    watch: Watch::None,
                })
                .await?;
            for child in transform::get_children(children)?.unwrap_or_default() {
                let child = path::join(&target, &child);
                match self.delete_at(&child, -1, true).await? {
                    Ok(()) | Err(error::Delete::NoNode) => {}
                    Err(e) => failure::bail!("could not delete {}: {}", child, e),
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Deletes the node at `path` in the background until confirmed.
    pub(crate) fn delete_in_background(&self, path: &str) {
        match self.resolve(path) {
            Ok(target) => self.spawn_delete(target, -1, false),
            Err(e) => warn!(self.logger(), "not deleting: {}", e; "path" => path),
        }
    }

    /// Deletes `target` (a path on the service) in the background until confirmed.
    fn spawn_delete(&self, target: String, version: i32, recursive: bool) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(self.logger(), "no runtime to delete on; giving up"; "path" => target);
                return;
            }
        };
        let store = self.clone();
        runtime.spawn(async move {
            let backoff =
                ExponentialBackoff::new(Duration::from_millis(50), u32::MAX)
                    .with_max_delay(Duration::from_secs(5));
            let mut attempt = 0;
            loop {
                match store.delete_at(&target, version, recursive).await {
                    Ok(Ok(())) | Ok(Err(error::Delete::NoNode)) => {
                        debug!(store.logger(), "background delete confirmed"; "path" => target);
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(store.logger(), "background delete refused: {}", e; "path" => target);
                        return;
                    }
                    Err(e) => {
                        if error::session_error(&e) == Some(error::Session::Closed) {
                            warn!(store.logger(), "session closed before delete was confirmed";
                                  "path" => target);
                            return;
                        }
                        trace!(store.logger(), "background delete failed: {}", e; "path" => &target);
                    }
                }
                let delay = backoff
                    .allow_retry(attempt, Duration::ZERO)
                    .unwrap_or(Duration::from_secs(5));
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        });
    }

    /// The data and metadata of the node at `path`, or `None` if there is no such node.
    pub async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>, failure::Error> {
        let target = self.resolve(path)?;
        let reply = self
            .session
            .request(Request::GetData {
                path: target,
                watch: Watch::None,
            })
            .await?;
        transform::get_data(reply)
    }

    /// The names of the children of the node at `path`, or `None` if there is no such node.
    pub async fn get_children(&self, path: &str) -> Result<Option<Vec<String>>, failure::Error> {
        let target = self.resolve(path)?;
        let reply = self
            .session
            .request(Request::GetChildren {
                path: target,
                watch: Watch::None,
            })
            .await?;
        transform::get_children(reply)
    }

    /// The metadata of the node at `path`, or `None` if there is no such node.
    pub async fn exists(&self, path: &str) -> Result<Option<Stat>, failure::Error> {
        let target = self.resolve(path)?;
        let reply = self
            .session
            .request(Request::Exists {
                path: target,
                watch: Watch::None,
            })
            .await?;
        transform::exists(reply)
    }

    /// Read operations that also leave a one-shot watch on what they read.
    pub fn with_watcher(&self) -> WithWatcher<'_> {
        WithWatcher(self)
    }

    /// Waits for the next change of `kind` to the node at `path`.
    ///
    /// - `DataChanged` fires on the next modification or deletion of the node, or on its
    ///   creation if it does not exist yet.
    /// - `Deleted` fires when the node is deleted, and right away if it does not exist.
    /// - `ChildrenChanged` fires when a child is added or removed, or the node is deleted. If the
    ///   node does not exist, it fires `Deleted` right away.
    /// - `Created` fires the next time a node appears at the path.
    pub async fn watch_once(&self, path: &str, kind: WatchKind) -> Result<WatchOnce, failure::Error> {
        match kind {
            WatchKind::DataChanged => Ok(self.with_watcher().exists(path).await?.0),
            WatchKind::ChildrenChanged => match self.with_watcher().get_children(path).await? {
                (watch, Some(_)) => Ok(watch),
                (_, None) => Ok(WatchOnce::ready(ChangeEvent::Deleted {
                    path: path.to_string(),
                })),
            },
            WatchKind::Deleted | WatchKind::Created => {
                let (first, stat) = self.with_watcher().exists(path).await?;
                if kind == WatchKind::Deleted && stat.is_none() {
                    return Ok(WatchOnce::ready(ChangeEvent::Deleted {
                        path: path.to_string(),
                    }));
                }
                let store = self.clone();
                let path = path.to_string();
                Ok(WatchOnce {
                    inner: async move {
                        let mut watch = first;
                        loop {
                            let event = watch.await;
                            let wanted = match event {
                                ChangeEvent::Deleted { .. } => kind == WatchKind::Deleted,
                                ChangeEvent::Created { .. } => kind == WatchKind::Created,
                                ChangeEvent::Invalidated { .. } => true,
                                _ => false,
                            };
                            if wanted {
                                return event;
                            }
                            // not what we are waiting for; look again
                            match store.with_watcher().exists(&path).await {
                                Ok((_, None)) if kind == WatchKind::Deleted => {
                                    return ChangeEvent::Deleted { path }
                                }
                                Ok((next, _)) => watch = next,
                                Err(_) => return ChangeEvent::Invalidated { path },
                            }
                        }
                    }
                    .boxed(),
                })
            }
        }
    }
}

/// Read operations that leave a one-shot watch, see [`NodeStore::with_watcher`].
///
/// Reading and arming happen in one request, so no change between the two can be missed.
#[derive(Debug)]
pub struct WithWatcher<'a>(&'a NodeStore);

impl WithWatcher<'_> {
    fn arm(&self, path: &str) -> (Watch, WatchOnce) {
        let (tx, rx) = oneshot::channel();
        let namespace = self.0.session.namespace().clone();
        (Watch::Custom(tx), WatchOnce::new(rx, path.to_string(), namespace))
    }

    /// Like [`NodeStore::get_data`]; the watch fires on the next modification or deletion.
    ///
    /// If the node does not exist, no watch is left and the `WatchOnce` resolves to
    /// `Invalidated` right away.
    pub async fn get_data(
        self,
        path: &str,
    ) -> Result<(WatchOnce, Option<(Vec<u8>, Stat)>), failure::Error> {
        let target = self.0.resolve(path)?;
        let (watch, once) = self.arm(path);
        let reply = self
            .0
            .session
            .request(Request::GetData {
                path: target,
                watch,
            })
            .await?;
        Ok((once, transform::get_data(reply)?))
    }

    /// Like [`NodeStore::exists`]; the watch fires on the next modification or deletion, or on
    /// creation if the node does not exist.
    pub async fn exists(self, path: &str) -> Result<(WatchOnce, Option<Stat>), failure::Error> {
        let target = self.0.resolve(path)?;
        let (watch, once) = self.arm(path);
        let reply = self
            .0
            .session
            .request(Request::Exists {
                path: target,
                watch,
            })
            .await?;
        Ok((once, transform::exists(reply)?))
    }

    /// Like [`NodeStore::get_children`]; the watch fires when a child is added or removed, or the
    /// node is deleted.
    ///
    /// If the node does not exist, no watch is left and the `WatchOnce` resolves to
    /// `Invalidated` right away.
    pub async fn get_children(
        self,
        path: &str,
    ) -> Result<(WatchOnce, Option<Vec<String>>), failure::Error> {
        let target = self.0.resolve(path)?;
        let (watch, once) = self.arm(path);
        let reply = self
            .0
            .session
            .request(Request::GetChildren {
                path: target,
                watch,
            })
            .await?;
        Ok((once, transform::get_children(reply)?))
    }
}
