//! Applies configuration directives published as children of a node.
//!
//! Every child of the configuration node carries one JSON directive:
//!
//! ```json
//! {"type": "add", "url": "redis://10.0.0.7:6379", "remark": "primary"}
//! ```
//!
//! `add` and `update` put the entry under the child's name, `delete` drops it, and so does
//! removing the child. Payloads that do not parse are logged and skipped.

use crate::cache::{CacheEvent, ChildData, ChildrenCache, StartMode};
use crate::{path, Acl, CreateMode, NodeStore};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use slog::{debug, o, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// What a directive asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveKind {
    /// Add an entry.
    Add,
    /// Replace an entry.
    Update,
    /// Drop an entry.
    Delete,
}

/// One published configuration change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    /// What to do.
    #[serde(rename = "type")]
    pub kind: DirectiveKind,
    /// Where the configured resource lives.
    pub url: String,
    /// Free-form note.
    #[serde(default)]
    pub remark: String,
}

impl Directive {
    /// The JSON payload for this directive.
    pub fn to_bytes(&self) -> Result<Vec<u8>, failure::Error> {
        Ok(serde_json::to_vec(self)?)
    }

    fn parse(bytes: &[u8]) -> Result<Self, failure::Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An applied configuration entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigEntry {
    /// Where the configured resource lives.
    pub url: String,
    /// Free-form note.
    pub remark: String,
}

type Entries = BTreeMap<String, ConfigEntry>;

fn lock(m: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a local set of configuration entries in line with the directives under one node.
pub struct ConfigSync {
    entries: Arc<Mutex<Entries>>,
    cache: ChildrenCache,
    task: JoinHandle<()>,
}

impl ConfigSync {
    /// Reads the directives under `path`, applies them, and keeps applying changes until stopped.
    pub async fn start(store: NodeStore, path: &str) -> Result<Self, failure::Error> {
        let log = store.session().logger().new(o!("config" => path.to_string()));
        let (cache, mut events) =
            ChildrenCache::start(store, path, StartMode::BuildInitialCache).await?;

        let entries = Arc::new(Mutex::new(Entries::new()));
        for child in cache.current() {
            apply(&entries, &child, false, &log);
        }

        let task = tokio::spawn({
            let entries = Arc::clone(&entries);
            async move {
                while let Some(event) = events.next().await {
                    match event {
                        CacheEvent::Added(child) | CacheEvent::Updated(child) => {
                            apply(&entries, &child, false, &log)
                        }
                        CacheEvent::Removed(child) => apply(&entries, &child, true, &log),
                        CacheEvent::Initialized => {}
                    }
                }
            }
        });

        Ok(ConfigSync {
            entries,
            cache,
            task,
        })
    }

    /// Publishes `directive` as the child `name` of `path`, creating or overwriting it.
    pub async fn publish(
        store: &NodeStore,
        path: &str,
        name: &str,
        directive: &Directive,
    ) -> Result<(), failure::Error> {
        let child = path::join(path, name);
        let bytes = directive.to_bytes()?;
        let created = store
            .create_with_parents(&child, bytes.clone(), Acl::open_unsafe(), CreateMode::Persistent)
            .await?;
        match created {
            Ok(_) => Ok(()),
            Err(crate::error::Create::NodeExists) => {
                store.set_data(&child, None, bytes).await??;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The entries as currently applied, by child name.
    pub fn snapshot(&self) -> BTreeMap<String, ConfigEntry> {
        lock(&self.entries).clone()
    }

    /// Stops following changes. The applied entries stay as they are.
    pub async fn stop(&self) {
        self.cache.stop().await;
        self.task.abort();
    }
}

impl Drop for ConfigSync {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn apply(entries: &Mutex<Entries>, child: &ChildData, removed: bool, log: &slog::Logger) {
    let name = path::node_name(&child.path).to_string();
    if removed {
        debug!(log, "directive withdrawn"; "name" => &name);
        lock(entries).remove(&name);
        return;
    }
    let directive = match Directive::parse(&child.data) {
        Ok(directive) => directive,
        Err(e) => {
            warn!(log, "skipping malformed directive: {}", e; "name" => name);
            return;
        }
    };
    debug!(log, "applying directive"; "name" => &name, "kind" => ?directive.kind);
    match directive.kind {
        DirectiveKind::Add | DirectiveKind::Update => {
            lock(entries).insert(
                name,
                ConfigEntry {
                    url: directive.url,
                    remark: directive.remark,
                },
            );
        }
        DirectiveKind::Delete => {
            lock(entries).remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Ensemble;
    use crate::{RetryNTimes, SessionManager};
    use std::time::Duration;

    #[test]
    fn directive_json() {
        let d = Directive::parse(br#"{"type":"update","url":"redis://r:6379"}"#).unwrap();
        assert_eq!(DirectiveKind::Update, d.kind);
        assert_eq!("", d.remark);
        assert!(Directive::parse(b"{\"type\":\"upsert\",\"url\":\"x\"}").is_err());
        assert_eq!(d, Directive::parse(&d.to_bytes().unwrap()).unwrap());
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn follows_published_directives() {
        let ensemble = Ensemble::new();
        let mut builder = SessionManager::builder("sim:1/workspace").unwrap();
        builder.set_retry_policy(RetryNTimes::new(3, Duration::from_millis(10)));
        let zk = NodeStore::new(builder.connect(ensemble).await.unwrap());

        let primary = Directive {
            kind: DirectiveKind::Add,
            url: "redis://a:6379".to_string(),
            remark: "primary".to_string(),
        };
        ConfigSync::publish(&zk, "/redis", "a", &primary).await.unwrap();

        let sync = ConfigSync::start(zk.clone(), "/redis").await.unwrap();
        assert_eq!("redis://a:6379", sync.snapshot()["a"].url);

        zk.create("/redis/junk", &b"not json"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();
        let moved = Directive {
            kind: DirectiveKind::Update,
            url: "redis://b:6379".to_string(),
            remark: "moved".to_string(),
        };
        ConfigSync::publish(&zk, "/redis", "a", &moved).await.unwrap();
        eventually(|| sync.snapshot()["a"].url == "redis://b:6379").await;
        assert!(!sync.snapshot().contains_key("junk"));

        zk.delete("/redis/a", None).await.unwrap().unwrap();
        eventually(|| sync.snapshot().is_empty()).await;
        sync.stop().await;
    }
}
