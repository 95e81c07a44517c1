use failure::Fail;

/// Session-level failures.
///
/// These are returned inside a `failure::Error` from every operation, and can be recovered with
/// `err.downcast_ref::<error::Session>()`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Session {
    /// The connection to the service was lost, and was not restored within the connect timeout.
    /// The session itself may still be alive; the operation can be retried.
    #[fail(display = "connection to the coordination service lost")]
    ConnectionLost,

    /// The service expired the session. Every ephemeral node and watch it owned is gone; state
    /// derived from them must be rebuilt rather than retried.
    #[fail(display = "session {:#x} expired", session_id)]
    Expired {
        /// The identifier of the expired session.
        session_id: i64,
    },

    /// The session was closed by the application.
    #[fail(display = "session closed")]
    Closed,

    /// No endpoint accepted a connection before the retry policy gave up.
    #[fail(display = "failed to connect after {} attempts", attempts)]
    ConnectFailed {
        /// The number of connection attempts that were made.
        attempts: u32,
    },
}

/// Errors that may cause a delete request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Delete {
    /// No node exists with the given `path`.
    #[fail(display = "target node does not exist")]
    NoNode,

    /// The target node has a different version than was specified by the call to delete.
    #[fail(
        display = "target node has different version than expected ({})",
        expected
    )]
    BadVersion {
        /// The expected node version.
        expected: i32,
    },

    /// The target node has child nodes, and therefore cannot be deleted.
    #[fail(display = "target node has children, and cannot be deleted")]
    NotEmpty,
}

/// Errors that may cause a `set_data` request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum SetData {
    /// No node exists with the given `path`.
    #[fail(display = "target node does not exist")]
    NoNode,

    /// The target node has a different version than was specified by the call to `set_data`.
    #[fail(
        display = "target node has different version than expected ({})",
        expected
    )]
    BadVersion {
        /// The expected node version.
        expected: i32,
    },

    /// The target node's permission does not accept data modification or requires different
    /// authentication to be altered.
    #[fail(display = "insufficient authentication")]
    NoAuth,
}

/// Errors that may cause a create request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Create {
    /// A node with the given `path` already exists.
    #[fail(display = "target node already exists")]
    NodeExists,

    /// The parent node of the given `path` does not exist.
    #[fail(display = "parent node of target does not exist")]
    NoParent,

    /// The parent node of the given `path` is ephemeral, and cannot have children.
    #[fail(display = "parent node is ephemeral, and cannot have children")]
    NoChildrenForEphemerals,

    /// The given ACL is invalid.
    #[fail(display = "the given ACL is invalid")]
    InvalidAcl,
}

/// The expected ways an `acquire` on a distributed mutex can fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Acquire {
    /// The lock was still held by someone else when the timeout elapsed. The candidate node was
    /// removed again.
    #[fail(display = "timed out waiting for the lock")]
    Timeout,
}

/// Returns the session failure wrapped in `err`, if that is what it is.
pub fn session_error(err: &failure::Error) -> Option<Session> {
    err.downcast_ref::<Session>().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_survives_boxing() {
        let err: failure::Error = Session::Expired { session_id: 0x1f }.into();
        assert_eq!(
            Some(Session::Expired { session_id: 0x1f }),
            session_error(&err)
        );
        assert_eq!("session 0x1f expired", err.to_string());

        let other = failure::format_err!("unrelated");
        assert_eq!(None, session_error(&other));
    }

    #[test]
    fn display_carries_expected_version() {
        assert_eq!(
            "target node has different version than expected (3)",
            SetData::BadVersion { expected: 3 }.to_string()
        );
    }
}
