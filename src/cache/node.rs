use super::{classify, lock, wait_for_session, CacheConfig, CacheEvent, CacheEvents, ChildData};
use super::{Driver, Emitter, StartMode};
use crate::{path, ChangeEvent, NodeStore, WatchOnce};
use futures::channel::mpsc;
use slog::{debug, o, warn};
use std::sync::{Arc, Mutex};

/// Mirrors the data of a single node, which may or may not exist.
pub struct NodeCache {
    path: String,
    belief: Arc<Mutex<Option<ChildData>>>,
    driver: Driver,
}

impl NodeCache {
    /// Starts mirroring the node at `path` with the default configuration.
    pub async fn start(
        store: NodeStore,
        path: &str,
        mode: StartMode,
    ) -> Result<(NodeCache, CacheEvents), failure::Error> {
        NodeCache::start_with(store, path, mode, CacheConfig::default()).await
    }

    /// Starts mirroring the node at `path`.
    ///
    /// With `StartMode::BuildInitialCache`, the node is read before this returns, and failing to
    /// read it fails the start.
    pub async fn start_with(
        store: NodeStore,
        path: &str,
        mode: StartMode,
        config: CacheConfig,
    ) -> Result<(NodeCache, CacheEvents), failure::Error> {
        path::validate(path)?;
        let (tx, rx) = mpsc::channel(config.event_capacity);
        let log = store.session().logger().new(o!("cache" => path.to_string()));
        let belief = Arc::new(Mutex::new(None));
        let mut worker = Worker {
            store,
            path: path.to_string(),
            belief: Arc::clone(&belief),
            emitter: Emitter {
                tx,
                quiet: false,
                log: log.clone(),
            },
            log,
        };

        let first = if mode == StartMode::BuildInitialCache {
            worker.emitter.quiet = true;
            let watch = worker.refresh().await?;
            worker.emitter.quiet = false;
            Some(watch)
        } else {
            None
        };
        let handle = tokio::spawn(worker.run(mode, first));

        Ok((
            NodeCache {
                path: path.to_string(),
                belief,
                driver: Driver::new(handle),
            },
            rx,
        ))
    }

    /// The path being mirrored.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The node as last seen, or `None` if it did not exist (or has not been read yet).
    pub fn current(&self) -> Option<ChildData> {
        lock(&self.belief).clone()
    }

    /// Stops the driver. No event is produced after this returns. Calling it again is harmless.
    pub async fn stop(&self) {
        self.driver.stop().await
    }
}

struct Worker {
    store: NodeStore,
    path: String,
    belief: Arc<Mutex<Option<ChildData>>>,
    emitter: Emitter,
    log: slog::Logger,
}

impl Worker {
    async fn run(mut self, mode: StartMode, first: Option<WatchOnce>) {
        let mut watch = match first {
            Some(watch) => watch,
            None => match self.refresh_until_ok().await {
                Some(watch) => watch,
                None => return,
            },
        };
        if mode == StartMode::PostInitializedEvent {
            self.emitter.emit(CacheEvent::Initialized).await;
        }

        loop {
            let change = watch.await;
            if let ChangeEvent::Invalidated { .. } = change {
                debug!(self.log, "watch invalidated; resynchronizing");
                if !wait_for_session(&self.store, &self.log).await {
                    return;
                }
            }
            watch = match self.refresh_until_ok().await {
                Some(watch) => watch,
                None => return,
            };
        }
    }

    async fn refresh_until_ok(&mut self) -> Option<WatchOnce> {
        loop {
            match self.refresh().await {
                Ok(watch) => return Some(watch),
                Err(e) => {
                    warn!(self.log, "refresh failed: {}", e);
                    if !wait_for_session(&self.store, &self.log).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Reads the node, re-arms the watch on it and updates the belief.
    async fn refresh(&mut self) -> Result<WatchOnce, failure::Error> {
        loop {
            let (watch, found) = self.store.with_watcher().get_data(&self.path).await?;
            if let Some((data, stat)) = found {
                let path = self.path.clone();
                self.apply(Some(ChildData { path, data, stat })).await;
                return Ok(watch);
            }

            // gone: wait for it to come back instead
            let (watch, stat) = self.store.with_watcher().exists(&self.path).await?;
            if stat.is_none() {
                self.apply(None).await;
                return Ok(watch);
            }
        }
    }

    async fn apply(&mut self, new: Option<ChildData>) {
        let event = {
            let mut belief = lock(&self.belief);
            let event = classify(belief.as_ref(), new.as_ref());
            *belief = new;
            event
        };
        if let Some(event) = event {
            self.emitter.emit(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Ensemble;
    use crate::{Acl, CreateMode, RetryNTimes, SessionManager};
    use futures::StreamExt;
    use std::time::Duration;

    async fn store(ensemble: &Ensemble) -> NodeStore {
        let mut builder = SessionManager::builder("sim:1").unwrap();
        builder.set_retry_policy(RetryNTimes::new(5, Duration::from_millis(10)));
        NodeStore::new(builder.connect(ensemble.clone()).await.unwrap())
    }

    #[tokio::test]
    async fn initial_build_is_silent() {
        let ensemble = Ensemble::new();
        let zk = store(&ensemble).await;
        zk.create("/n", &b"D0"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();

        let (cache, mut events) = NodeCache::start(zk.clone(), "/n", StartMode::BuildInitialCache)
            .await
            .unwrap();
        assert_eq!(b"D0".to_vec(), cache.current().unwrap().data);

        zk.set_data("/n", None, &b"D1"[..]).await.unwrap().unwrap();
        match events.next().await {
            Some(CacheEvent::Updated(d)) => {
                assert_eq!(b"D1".to_vec(), d.data);
                assert_eq!(1, d.stat.version);
            }
            other => panic!("expected an update, got {:?}", other),
        }
        cache.stop().await;
        cache.stop().await;
    }

    #[tokio::test]
    async fn follows_the_node_through_deletion() {
        let ensemble = Ensemble::new();
        let zk = store(&ensemble).await;

        let (cache, mut events) =
            NodeCache::start(zk.clone(), "/later", StartMode::PostInitializedEvent)
                .await
                .unwrap();
        assert_eq!(Some(CacheEvent::Initialized), events.next().await);
        assert_eq!(None, cache.current());

        zk.create("/later", &b"x"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(events.next().await, Some(CacheEvent::Added(_))));

        zk.delete("/later", None).await.unwrap().unwrap();
        match events.next().await {
            Some(CacheEvent::Removed(d)) => assert_eq!(b"x".to_vec(), d.data),
            other => panic!("expected a removal, got {:?}", other),
        }
        assert_eq!(None, cache.current());
    }

    #[tokio::test]
    async fn slow_consumer_loses_nothing() {
        let ensemble = Ensemble::new();
        let zk = store(&ensemble).await;
        let writer = store(&ensemble).await;
        zk.create("/busy", &b"0"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();

        let config = CacheConfig { event_capacity: 1 };
        let (cache, mut events) =
            NodeCache::start_with(zk.clone(), "/busy", StartMode::BuildInitialCache, config)
                .await
                .unwrap();
        for i in 1..=20 {
            writer
                .set_data("/busy", None, i.to_string().into_bytes())
                .await
                .unwrap()
                .unwrap();
        }

        let mut last_version = 0;
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.next().await {
                    Some(CacheEvent::Updated(d)) => {
                        assert!(d.stat.version > last_version);
                        last_version = d.stat.version;
                        if d.data == b"20" {
                            return;
                        }
                    }
                    other => panic!("expected an update, got {:?}", other),
                }
            }
        })
        .await;
        assert!(drained.is_ok());
        assert_eq!(b"20".to_vec(), cache.current().unwrap().data);
        assert_eq!(20, cache.current().unwrap().stat.version);
    }
}
