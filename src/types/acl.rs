use once_cell::sync::Lazy;
use std::fmt;
use std::ops;

/// Describes the ability of a user to perform a certain action.
///
/// Permissions can be mixed together like integers with `|` and `&`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Permission(u32);

impl Permission {
    /// No permissions are set (server could have been configured without ACL support).
    pub const NONE: Permission = Permission(0b00000);

    /// You can access the data of a node and can list its children.
    pub const READ: Permission = Permission(0b00001);

    /// You can set the data of a node.
    pub const WRITE: Permission = Permission(0b00010);

    /// You can create a child node.
    pub const CREATE: Permission = Permission(0b00100);

    /// You can delete a child node (but not necessarily this one).
    pub const DELETE: Permission = Permission(0b01000);

    /// You can alter permissions on this node.
    pub const ADMIN: Permission = Permission(0b10000);

    /// You can do anything.
    pub const ALL: Permission = Permission(0b11111);

    /// Extract a permission value from raw `bits`.
    pub(crate) fn from_raw(bits: u32) -> Permission {
        Permission(bits)
    }

    pub(crate) fn code(self) -> u32 {
        self.0
    }

    /// Check that all `permissions` are set.
    pub fn can(self, permissions: Permission) -> bool {
        (self & permissions) == permissions
    }
}

impl ops::BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Permission::from_raw(self.0 & rhs.0)
    }
}

impl ops::BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Permission::from_raw(self.0 | rhs.0)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == Permission::ALL {
            return write!(f, "ALL");
        }
        if *self == Permission::NONE {
            return write!(f, "NONE");
        }

        let mut first = true;
        let mut tick = || {
            if first {
                first = false;
                ""
            } else {
                "|"
            }
        };

        if self.can(Permission::READ) {
            write!(f, "{}READ", tick())?;
        }
        if self.can(Permission::WRITE) {
            write!(f, "{}WRITE", tick())?;
        }
        if self.can(Permission::CREATE) {
            write!(f, "{}CREATE", tick())?;
        }
        if self.can(Permission::DELETE) {
            write!(f, "{}DELETE", tick())?;
        }
        if self.can(Permission::ADMIN) {
            write!(f, "{}ADMIN", tick())?;
        }
        Ok(())
    }
}

/// An access control list entry.
///
/// The coordination client never interprets ACLs: they are attached to a node at creation time and
/// enforced (or not) by the service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Acl {
    /// The permissions associated with this ACL.
    pub perms: Permission,
    /// The authentication scheme this list is used for. The most common scheme is `"auth"`, which
    /// allows any authenticated user to do anything (see `creator_all`).
    pub scheme: String,
    /// The ID of the user under the `scheme`.
    pub id: String,
}

impl Acl {
    /// This is a completely open ACL.
    pub fn open_unsafe() -> &'static [Acl] {
        &ACL_OPEN_UNSAFE
    }

    /// This ACL gives the creators authentication id's all permissions.
    pub fn creator_all() -> &'static [Acl] {
        &ACL_CREATOR_ALL
    }

    /// This ACL gives the world the ability to read.
    pub fn read_unsafe() -> &'static [Acl] {
        &ACL_READ_UNSAFE
    }
}

static ACL_OPEN_UNSAFE: Lazy<Vec<Acl>> = Lazy::new(|| {
    vec![Acl {
        perms: Permission::ALL,
        scheme: "world".to_string(),
        id: "anyone".to_string(),
    }]
});

static ACL_CREATOR_ALL: Lazy<Vec<Acl>> = Lazy::new(|| {
    vec![Acl {
        perms: Permission::ALL,
        scheme: "auth".to_string(),
        id: "".to_string(),
    }]
});

static ACL_READ_UNSAFE: Lazy<Vec<Acl>> = Lazy::new(|| {
    vec![Acl {
        perms: Permission::READ,
        scheme: "world".to_string(),
        id: "anyone".to_string(),
    }]
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bitor() {
        let all = Permission::READ
            | Permission::WRITE
            | Permission::CREATE
            | Permission::DELETE
            | Permission::ADMIN;
        assert_eq!(Permission::ALL, all);
        assert!(all.can(Permission::WRITE | Permission::ADMIN));
        assert!(!Permission::READ.can(Permission::WRITE));
    }

    #[test]
    fn permission_display() {
        assert_eq!("ALL", Permission::ALL.to_string());
        assert_eq!("NONE", Permission::NONE.to_string());
        assert_eq!(
            "READ|WRITE",
            (Permission::READ | Permission::WRITE).to_string()
        );
    }

    #[test]
    fn well_known_acls() {
        assert_eq!(Acl::open_unsafe()[0].perms, Permission::ALL);
        assert_eq!(Acl::read_unsafe()[0].id, "anyone");
        assert_eq!(Acl::creator_all()[0].scheme, "auth");
    }
}
