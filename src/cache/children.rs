use super::{classify, lock, wait_for_session, CacheConfig, CacheEvent, CacheEvents, ChildData};
use super::{Driver, Emitter, StartMode};
use crate::{path, ChangeEvent, NodeStore, WatchOnce};
use futures::{
    channel::mpsc,
    future::{BoxFuture, FutureExt},
    stream::FuturesUnordered,
    StreamExt,
};
use slog::{debug, o, trace, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

type Belief = BTreeMap<String, ChildData>;

/// Mirrors the direct children of a node, with their data.
///
/// Grandchildren are not mirrored. If the parent node does not exist the cache is empty, and
/// fills up once it is created.
pub struct ChildrenCache {
    path: String,
    belief: Arc<Mutex<Belief>>,
    driver: Driver,
}

impl ChildrenCache {
    /// Starts mirroring the children of `path` with the default configuration.
    pub async fn start(
        store: NodeStore,
        path: &str,
        mode: StartMode,
    ) -> Result<(ChildrenCache, CacheEvents), failure::Error> {
        ChildrenCache::start_with(store, path, mode, CacheConfig::default()).await
    }

    /// Starts mirroring the children of `path`.
    ///
    /// With `StartMode::BuildInitialCache`, every child is read before this returns, and failing
    /// to read them fails the start.
    pub async fn start_with(
        store: NodeStore,
        path: &str,
        mode: StartMode,
        config: CacheConfig,
    ) -> Result<(ChildrenCache, CacheEvents), failure::Error> {
        path::validate(path)?;
        let (tx, rx) = mpsc::channel(config.event_capacity);
        let log = store.session().logger().new(o!("cache" => path.to_string()));
        let belief = Arc::new(Mutex::new(Belief::new()));
        let mut worker = Worker {
            store,
            path: path.to_string(),
            belief: Arc::clone(&belief),
            emitter: Emitter {
                tx,
                quiet: false,
                log: log.clone(),
            },
            child_watches: FuturesUnordered::new(),
            log,
        };

        let first = if mode == StartMode::BuildInitialCache {
            worker.emitter.quiet = true;
            let watch = worker.refresh(true).await?;
            worker.emitter.quiet = false;
            Some(watch)
        } else {
            None
        };
        let handle = tokio::spawn(worker.run(mode, first));

        Ok((
            ChildrenCache {
                path: path.to_string(),
                belief,
                driver: Driver::new(handle),
            },
            rx,
        ))
    }

    /// The path whose children are mirrored.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Every child as last seen, ordered by name.
    pub fn current(&self) -> Vec<ChildData> {
        lock(&self.belief).values().cloned().collect()
    }

    /// The child called `name`, as last seen.
    pub fn get(&self, name: &str) -> Option<ChildData> {
        lock(&self.belief).get(name).cloned()
    }

    /// Stops the driver. No event is produced after this returns. Calling it again is harmless.
    pub async fn stop(&self) {
        self.driver.stop().await
    }
}

struct Worker {
    store: NodeStore,
    path: String,
    belief: Arc<Mutex<Belief>>,
    emitter: Emitter,
    /// One pending data watch per child, tagged with the child's name.
    child_watches: FuturesUnordered<BoxFuture<'static, (String, ChangeEvent)>>,
    log: slog::Logger,
}

impl Worker {
    async fn run(mut self, mode: StartMode, first: Option<WatchOnce>) {
        let mut watch = match first {
            Some(watch) => watch,
            None => match self.refresh_until_ok(true).await {
                Some(watch) => watch,
                None => return,
            },
        };
        if mode == StartMode::PostInitializedEvent {
            self.emitter.emit(CacheEvent::Initialized).await;
        }

        loop {
            tokio::select! {
                change = &mut watch => {
                    let full = change.is_invalidated();
                    if full {
                        debug!(self.log, "watch invalidated; resynchronizing");
                        if !wait_for_session(&self.store, &self.log).await {
                            return;
                        }
                    }
                    watch = match self.refresh_until_ok(full).await {
                        Some(watch) => watch,
                        None => return,
                    };
                }
                Some((name, change)) = self.child_watches.next(), if !self.child_watches.is_empty() => {
                    // an invalidated child watch comes with an invalidated parent watch
                    if !change.is_invalidated() {
                        if let Err(e) = self.refresh_child(&name).await {
                            warn!(self.log, "could not re-read child: {}", e; "child" => &name);
                        }
                    }
                }
            }
        }
    }

    async fn refresh_until_ok(&mut self, mut full: bool) -> Option<WatchOnce> {
        loop {
            match self.refresh(full).await {
                Ok(watch) => return Some(watch),
                Err(e) => {
                    warn!(self.log, "refresh failed: {}", e);
                    if !wait_for_session(&self.store, &self.log).await {
                        return None;
                    }
                    full = true;
                }
            }
        }
    }

    /// Lists the children and re-arms the watch on the child set.
    ///
    /// New children are read (arming a data watch on each); vanished ones are dropped. With
    /// `full`, every child is read again, as after losing all watches.
    async fn refresh(&mut self, full: bool) -> Result<WatchOnce, failure::Error> {
        if full {
            self.child_watches = FuturesUnordered::new();
        }
        loop {
            let (watch, listed) = self.store.with_watcher().get_children(&self.path).await?;
            let names: BTreeSet<String> = match listed {
                Some(names) => names.into_iter().collect(),
                None => {
                    let (watch, stat) = self.store.with_watcher().exists(&self.path).await?;
                    if stat.is_some() {
                        // created in between
                        continue;
                    }
                    self.reconcile(&BTreeSet::new(), full).await?;
                    return Ok(watch);
                }
            };
            self.reconcile(&names, full).await?;
            return Ok(watch);
        }
    }

    async fn reconcile(
        &mut self,
        names: &BTreeSet<String>,
        full: bool,
    ) -> Result<(), failure::Error> {
        let gone: Vec<String> = lock(&self.belief)
            .keys()
            .filter(|name| !names.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            self.apply(&name, None).await;
        }

        for name in names {
            let known = lock(&self.belief).contains_key(name);
            if full || !known {
                self.refresh_child(name).await?;
            }
        }
        Ok(())
    }

    /// Reads one child, re-arming its data watch, and updates the belief.
    async fn refresh_child(&mut self, name: &str) -> Result<(), failure::Error> {
        let child = path::join(&self.path, name);
        let (watch, found) = self.store.with_watcher().get_data(&child).await?;
        let new = match found {
            Some((data, stat)) => {
                let name = name.to_string();
                self.child_watches
                    .push(watch.map(move |change| (name, change)).boxed());
                Some(ChildData {
                    path: child,
                    data,
                    stat,
                })
            }
            // the child-set watch reports this as well
            None => None,
        };
        self.apply(name, new).await;
        Ok(())
    }

    async fn apply(&mut self, name: &str, new: Option<ChildData>) {
        let event = {
            let mut belief = lock(&self.belief);
            let event = classify(belief.get(name), new.as_ref());
            match new {
                Some(new) => belief.insert(name.to_string(), new),
                None => belief.remove(name),
            };
            event
        };
        if let Some(event) = event {
            trace!(self.log, "child changed"; "child" => name);
            self.emitter.emit(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Ensemble;
    use crate::{Acl, CreateMode, RetryNTimes, SessionManager};
    use std::time::Duration;

    async fn store(ensemble: &Ensemble) -> NodeStore {
        let mut builder = SessionManager::builder("sim:1").unwrap();
        builder.set_retry_policy(RetryNTimes::new(200, Duration::from_millis(10)));
        NodeStore::new(builder.connect(ensemble.clone()).await.unwrap())
    }

    async fn put(zk: &NodeStore, path: &str, data: &'static [u8]) {
        zk.create_with_parents(path, data, Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn initial_entries_then_initialized() {
        let ensemble = Ensemble::new();
        let zk = store(&ensemble).await;
        put(&zk, "/cfg/a", b"1").await;
        put(&zk, "/cfg/b", b"2").await;

        let (cache, mut events) =
            ChildrenCache::start(zk.clone(), "/cfg", StartMode::PostInitializedEvent)
                .await
                .unwrap();
        let mut added = Vec::new();
        loop {
            match events.next().await.unwrap() {
                CacheEvent::Added(d) => added.push(d.path),
                CacheEvent::Initialized => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(vec!["/cfg/a".to_string(), "/cfg/b".to_string()], added);
        assert_eq!(Some(b"2".to_vec()), cache.get("b").map(|d| d.data));
    }

    #[tokio::test]
    async fn tracks_children_and_their_data() {
        let ensemble = Ensemble::new();
        let zk = store(&ensemble).await;
        put(&zk, "/dir/x", b"0").await;

        let (cache, mut events) =
            ChildrenCache::start(zk.clone(), "/dir", StartMode::BuildInitialCache)
                .await
                .unwrap();
        assert_eq!(1, cache.current().len());

        put(&zk, "/dir/y", b"new").await;
        match events.next().await {
            Some(CacheEvent::Added(d)) => assert_eq!("/dir/y", d.path),
            other => panic!("expected an addition, got {:?}", other),
        }

        zk.set_data("/dir/x", None, &b"1"[..]).await.unwrap().unwrap();
        match events.next().await {
            Some(CacheEvent::Updated(d)) => assert_eq!(b"1".to_vec(), d.data),
            other => panic!("expected an update, got {:?}", other),
        }

        zk.delete("/dir/y", None).await.unwrap().unwrap();
        match events.next().await {
            Some(CacheEvent::Removed(d)) => assert_eq!("/dir/y", d.path),
            other => panic!("expected a removal, got {:?}", other),
        }
        let paths: Vec<_> = cache.current().into_iter().map(|d| d.path).collect();
        assert_eq!(vec!["/dir/x".to_string()], paths);

        cache.stop().await;
    }

    #[tokio::test]
    async fn resync_after_reconnect_reports_the_gap() {
        let ensemble = Ensemble::new();
        let zk = store(&ensemble).await;
        let other = store(&ensemble).await;
        put(&zk, "/r/keep", b"k").await;
        put(&zk, "/r/drop", b"d").await;

        let (cache, mut events) =
            ChildrenCache::start(zk.clone(), "/r", StartMode::BuildInitialCache)
                .await
                .unwrap();

        // refuse reconnects while the other session changes things
        ensemble.set_available(false);
        ensemble.disconnect(zk.session().session_id().unwrap());
        other.delete("/r/drop", None).await.unwrap().unwrap();
        other
            .set_data("/r/keep", None, &b"k2"[..])
            .await
            .unwrap()
            .unwrap();
        put(&other, "/r/new", b"n").await;
        ensemble.set_available(true);

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match events.next().await.unwrap() {
                CacheEvent::Added(d) => seen.push(format!("+{}", d.path)),
                CacheEvent::Updated(d) => seen.push(format!("~{}", d.path)),
                CacheEvent::Removed(d) => seen.push(format!("-{}", d.path)),
                CacheEvent::Initialized => {}
            }
        }
        seen.sort();
        assert_eq!(vec!["+/r/new", "-/r/drop", "~/r/keep"], seen);
        assert_eq!(2, cache.current().len());
    }

    #[tokio::test]
    async fn resync_after_expiry_reports_the_gap() {
        let ensemble = Ensemble::new();
        let zk = store(&ensemble).await;
        let other = store(&ensemble).await;
        put(&zk, "/e/keep", b"k").await;
        put(&zk, "/e/drop", b"d").await;
        zk.create("/e/mine", &b"m"[..], Acl::open_unsafe(), CreateMode::Ephemeral)
            .await
            .unwrap()
            .unwrap();

        let (cache, mut events) =
            ChildrenCache::start(zk.clone(), "/e", StartMode::BuildInitialCache)
                .await
                .unwrap();
        assert_eq!(3, cache.current().len());
        let expired = zk.session().session_id().unwrap();
        let mut session_events = zk.session().subscribe();

        ensemble.set_available(false);
        ensemble.expire_session(expired);
        other.delete("/e/drop", None).await.unwrap().unwrap();
        other
            .set_data("/e/keep", None, &b"k2"[..])
            .await
            .unwrap()
            .unwrap();
        ensemble.set_available(true);

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match events.next().await.unwrap() {
                CacheEvent::Added(d) => seen.push(format!("+{}", d.path)),
                CacheEvent::Updated(d) => seen.push(format!("~{}", d.path)),
                CacheEvent::Removed(d) => seen.push(format!("-{}", d.path)),
                CacheEvent::Initialized => {}
            }
        }
        seen.sort();
        assert_eq!(vec!["-/e/drop", "-/e/mine", "~/e/keep"], seen);
        assert_eq!(Some(b"k2".to_vec()), cache.get("keep").map(|d| d.data));
        assert_eq!(1, cache.current().len());

        let first = session_events.next().await.unwrap();
        assert_eq!(crate::SessionState::Expired, first.state);
        assert_eq!(expired, first.session_id);
        assert_ne!(Some(expired), zk.session().session_id());
    }
}
