mod acl;
pub use self::acl::*;

mod watch;
pub use self::watch::*;

/// Statistics about a node, similar to the UNIX `stat` structure.
///
/// # Time in the coordination service
/// The concept of time is tricky in distributed systems. The service keeps track of time in a
/// number of ways.
///
/// - **zxid**: Every change to the tree receives a stamp in the form of a *zxid* (transaction ID).
///   This exposes the total ordering of all changes. Each change will have a unique *zxid* -- if
///   *zxid:a* is smaller than *zxid:b*, then the associated change to *zxid:a* happened before
///   *zxid:b*.
/// - **Version Numbers**: Every change to a node will cause an increase to one of the version
///   numbers of that node.
/// - **Clock Time**: The service does not use clock time to make decisions, but it uses it to put
///   timestamps into the `Stat` structure.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Stat {
    /// The transaction ID that created the node.
    pub czxid: i64,
    /// The last transaction that modified the node.
    pub mzxid: i64,
    /// Milliseconds since epoch when the node was created.
    pub ctime: i64,
    /// Milliseconds since epoch when the node was last modified.
    pub mtime: i64,
    /// The number of changes to the data of the node.
    pub version: i32,
    /// The number of changes to the children of the node.
    pub cversion: i32,
    /// The number of changes to the ACL of the node.
    pub aversion: i32,
    /// The session ID of the owner of this node, if it is an ephemeral entry.
    pub ephemeral_owner: i64,
    /// The length of the data field of the node.
    pub data_length: i32,
    /// The number of children this node has.
    pub num_children: i32,
    /// The transaction ID that last modified the children of the node.
    pub pzxid: i64,
}

/// CreateMode value determines how the node is created.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// The node will not be automatically deleted upon client's disconnect.
    Persistent = 0,
    /// The node will be deleted when the session that created it closes or expires.
    Ephemeral = 1,
    /// The name of the node will be appended with a monotonically increasing number. The actual
    /// path name of a sequential node will be the given path plus a suffix `"i"` where *i* is the
    /// current sequential number of the node. The sequence number is always fixed length of 10
    /// digits, 0 padded. Once such a node is created, the sequential number will be incremented by
    /// one.
    PersistentSequential = 2,
    /// The node will be deleted when its session ends, and its name will be appended with a
    /// monotonically increasing number.
    EphemeralSequential = 3,
    /// Container nodes are special purpose nodes useful for recipes such as leader, lock, etc. When
    /// the last child of a container is deleted, the container becomes a candidate to be deleted by
    /// the server at some point in the future.
    Container = 4,
    //
    // 421
    // 000
    // ^----- is it a container?
    //  ^---- is it sequential?
    //   ^--- is it ephemeral?
}

impl CreateMode {
    /// Whether nodes created in this mode are bound to the creating session's lease.
    pub fn is_ephemeral(self) -> bool {
        (self as i32) & 0b001 != 0
    }

    /// Whether the service appends a sequence suffix to nodes created in this mode.
    pub fn is_sequential(self) -> bool {
        (self as i32) & 0b010 != 0
    }

    pub(crate) fn from_code(code: i32) -> Option<CreateMode> {
        match code {
            0 => Some(CreateMode::Persistent),
            1 => Some(CreateMode::Ephemeral),
            2 => Some(CreateMode::PersistentSequential),
            3 => Some(CreateMode::EphemeralSequential),
            4 => Some(CreateMode::Container),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_mode_bits() {
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Container.is_ephemeral());
        assert_eq!(Some(CreateMode::EphemeralSequential), CreateMode::from_code(3));
        assert_eq!(None, CreateMode::from_code(9));
    }
}
