//! An asynchronous client for a ZooKeeper-style coordination service, with the recipes most
//! applications end up building on top of one.
//!
//! The layers, bottom to top:
//!
//!  - A [`Connector`] opens a [`Link`]: one connection, one session handshake. [`WireConnector`]
//!    speaks the binary protocol over TCP; [`sim::Ensemble`] is an in-process service used by the
//!    tests.
//!  - [`SessionManager`] owns the session. It reconnects with a [`RetryPolicy`], resumes the
//!    session while the service still holds it, and reports every state change to subscribers as
//!    a [`SessionEvent`].
//!  - [`NodeStore`] is the tree API: create, read, update and delete nodes, optionally arming a
//!    one-shot watch ([`WatchOnce`]) with a read.
//!  - [`cache`] mirrors a node or the children of a node and reports changes as
//!    [`cache::CacheEvent`]s, resynchronizing after a reconnect.
//!  - [`DistributedMutex`] is a fair lock across processes, and [`config_sync::ConfigSync`]
//!    applies JSON directives published under a node.
//!
//! # Errors
//!
//! Operations that talk to the service return `Result<Result<T, E>, failure::Error>`. The outer
//! error means the operation could not be carried out (no session, connection lost, session
//! expired; see [`error::session_error`]). The inner error is the service's well-defined refusal,
//! such as [`error::Create::NodeExists`].
//!
//! # Example
//!
//! ```no_run
//! use tokio_coordination::*;
//!
//! # async fn run() -> Result<(), failure::Error> {
//! let session = SessionManager::builder("127.0.0.1:2181/app")?
//!     .connect(WireConnector::tcp())
//!     .await?;
//! let zk = NodeStore::new(session);
//!
//! let path = zk
//!     .create("/example", &b"hello"[..], Acl::open_unsafe(), CreateMode::Persistent)
//!     .await?;
//! assert_eq!(path.as_deref(), Ok("/example"));
//!
//! let (watch, data) = zk.with_watcher().get_data("/example").await?;
//! assert_eq!(data.map(|(bytes, _)| bytes), Some(b"hello".to_vec()));
//!
//! zk.set_data("/example", None, &b"world"[..]).await??;
//! assert!(matches!(watch.await, ChangeEvent::DataChanged { .. }));
//!
//! let lock = DistributedMutex::new(zk.clone(), "/locks/example")?;
//! lock.acquire(None).await??;
//! lock.release().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod authz;
pub mod cache;
pub mod config_sync;
mod connector;
pub mod error;
mod lock;
pub mod path;
mod proto;
mod retry;
mod session;
pub mod sim;
mod store;
mod transform;
mod types;

pub use self::connector::{Connector, Handshake, Link, SessionInfo, WireConnector};
pub use self::lock::{DistributedMutex, MutexState};
pub use self::proto::{ZkError, ZooKeeperTransport};
pub use self::retry::*;
pub use self::session::{SessionBuilder, SessionEvent, SessionManager, SessionState};
pub use self::store::{DeleteOptions, NodeStore, WatchOnce, WithWatcher};
pub use self::types::*;
