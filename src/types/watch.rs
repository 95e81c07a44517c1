/// Represents a change on the service that a watcher is able to respond to.
///
/// The `WatchedEvent` includes exactly what happened, the current state of the session, and the
/// path of the node that was involved in the event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    /// The trigger that caused the watch to hit.
    pub event_type: WatchedEventType,
    /// The current state of the session (and the client's connection to it).
    pub keeper_state: KeeperState,
    /// The path of the node that was involved.
    // This will be empty for session-related triggers.
    pub path: String,
}

impl WatchedEvent {
    pub(crate) fn session(keeper_state: KeeperState) -> Self {
        WatchedEvent {
            event_type: WatchedEventType::None,
            keeper_state,
            path: String::new(),
        }
    }

    pub(crate) fn node(event_type: WatchedEventType, path: impl Into<String>) -> Self {
        WatchedEvent {
            event_type,
            keeper_state: KeeperState::SyncConnected,
            path: path.into(),
        }
    }
}

/// Enumeration of states the client may be at a watcher event. It represents the state of the
/// server at the time the event was generated.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeeperState {
    /// The client is in the disconnected state - it is not connected to any server in the ensemble.
    Disconnected = 0,
    /// The client is in the connected state - it is connected to a server in the ensemble (one of
    /// the endpoints given when the session was created).
    SyncConnected = 3,
    /// Authentication has failed -- connection requires a new session.
    AuthFailed = 4,
    /// The client is connected to a read-only server, that is the server which is not currently
    /// connected to the majority.
    ConnectedReadOnly = 5,
    /// Used to notify clients that they are SASL-authenticated.
    SaslAuthenticated = 6,
    /// The serving cluster has expired this session. Every ephemeral node owned by the session is
    /// gone, and a new session has to be established.
    Expired = -112,
}

impl KeeperState {
    pub(crate) fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(KeeperState::Disconnected),
            3 => Some(KeeperState::SyncConnected),
            4 => Some(KeeperState::AuthFailed),
            5 => Some(KeeperState::ConnectedReadOnly),
            6 => Some(KeeperState::SaslAuthenticated),
            -112 => Some(KeeperState::Expired),
            _ => None,
        }
    }
}

/// Enumeration of types of events that may occur on the node.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedEventType {
    /// Nothing known has occurred on the node. This value is issued as part of a `WatchedEvent`
    /// when the `KeeperState` changes.
    None = -1,
    /// Issued when a node at a given path is created.
    NodeCreated = 1,
    /// Issued when a node at a given path is deleted.
    NodeDeleted = 2,
    /// Issued when the data of a watched node are altered. This event value is issued whenever a
    /// *set* operation occurs without an actual contents check, so there is no guarantee the data
    /// actually changed.
    NodeDataChanged = 3,
    /// Issued when the children of a watched node are created or deleted. This event is not issued
    /// when the data within children is altered.
    NodeChildrenChanged = 4,
    /// Issued when the client removes a data watcher.
    DataWatchRemoved = 5,
    /// Issued when the client removes a child watcher.
    ChildWatchRemoved = 6,
}

impl WatchedEventType {
    pub(crate) fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(WatchedEventType::None),
            1 => Some(WatchedEventType::NodeCreated),
            2 => Some(WatchedEventType::NodeDeleted),
            3 => Some(WatchedEventType::NodeDataChanged),
            4 => Some(WatchedEventType::NodeChildrenChanged),
            5 => Some(WatchedEventType::DataWatchRemoved),
            6 => Some(WatchedEventType::ChildWatchRemoved),
            _ => None,
        }
    }
}

/// What a one-shot watch registered through [`NodeStore::watch_once`](crate::NodeStore::watch_once)
/// is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// The node's data is modified, or the node is deleted.
    DataChanged,
    /// The node is deleted. Data modifications in the meantime are ignored.
    Deleted,
    /// A child is added to or removed from the node, or the node itself is deleted.
    ChildrenChanged,
    /// A node appears at the path.
    Created,
}

/// The single outcome of a one-shot watch.
///
/// `Invalidated` is delivered in place of a change when the connection or session carrying the
/// watch went away before it fired. It is terminal for that watch: the holder must read the
/// current state again and re-register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A node was created at `path`.
    Created {
        /// Path of the node.
        path: String,
    },
    /// The data of the node at `path` changed.
    DataChanged {
        /// Path of the node.
        path: String,
    },
    /// The node at `path` was deleted.
    Deleted {
        /// Path of the node.
        path: String,
    },
    /// The child set of the node at `path` changed.
    ChildrenChanged {
        /// Path of the node.
        path: String,
    },
    /// The watch on `path` can no longer fire.
    Invalidated {
        /// Path of the node.
        path: String,
    },
}

impl ChangeEvent {
    pub(crate) fn from_watched(e: &WatchedEvent, path: String) -> Self {
        match e.event_type {
            WatchedEventType::NodeCreated => ChangeEvent::Created { path },
            WatchedEventType::NodeDeleted => ChangeEvent::Deleted { path },
            WatchedEventType::NodeDataChanged => ChangeEvent::DataChanged { path },
            WatchedEventType::NodeChildrenChanged => ChangeEvent::ChildrenChanged { path },
            WatchedEventType::None
            | WatchedEventType::DataWatchRemoved
            | WatchedEventType::ChildWatchRemoved => ChangeEvent::Invalidated { path },
        }
    }

    /// The path of the node this event is about.
    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::Created { path }
            | ChangeEvent::DataChanged { path }
            | ChangeEvent::Deleted { path }
            | ChangeEvent::ChildrenChanged { path }
            | ChangeEvent::Invalidated { path } => path,
        }
    }

    /// True if the watch was dropped without observing a change.
    pub fn is_invalidated(&self) -> bool {
        matches!(self, ChangeEvent::Invalidated { .. })
    }
}
