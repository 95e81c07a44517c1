//! Seams for an identity and authorization provider.
//!
//! Nothing in this crate calls these; they describe what an application plugs in next to its
//! coordination client, and fix one matching rule for permission strings.

use failure::{bail, Fail};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Why an authentication attempt was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthenticationErrorKind {
    /// No such account.
    UnknownAccount,
    /// The account exists, the credentials do not match.
    IncorrectCredentials,
    /// The account is locked.
    LockedAccount,
    /// The account is disabled.
    DisabledAccount,
    /// Too many failed attempts.
    ExcessiveAttempts,
    /// The credentials are no longer valid.
    ExpiredCredentials,
}

/// A refused authentication attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Fail)]
#[fail(display = "authentication failed: {:?}", kind)]
pub struct AuthenticationError {
    /// Why it was refused.
    pub kind: AuthenticationErrorKind,
}

/// What a caller presents to prove who it is.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The account name.
    pub username: String,
    /// The secret.
    pub password: Vec<u8>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    /// The account name.
    pub name: String,
    /// Roles granted to the account.
    pub roles: BTreeSet<String>,
    /// Permissions granted to the account, directly or through its roles.
    pub permissions: Vec<WildcardPermission>,
}

impl Principal {
    /// True if the principal has `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// True if any granted permission implies `permission`.
    pub fn is_permitted(&self, permission: &WildcardPermission) -> bool {
        self.permissions.iter().any(|p| p.implies(permission))
    }
}

/// Establishes who a caller is.
pub trait Authenticator: Send + Sync {
    /// Checks `credentials`, returning the identity they prove.
    fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthenticationError>;
}

/// Decides whether an identity may do something.
pub trait Authorizer: Send + Sync {
    /// True if `principal` may perform `action` on `resource`.
    fn authorize(&self, principal: &Principal, action: &str, resource: &str) -> bool;
}

/// Authorizes by the principal's own permissions, checking `resource:action`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PermissionAuthorizer;

impl Authorizer for PermissionAuthorizer {
    fn authorize(&self, principal: &Principal, action: &str, resource: &str) -> bool {
        match format!("{}:{}", resource, action).parse() {
            Ok(wanted) => principal.is_permitted(&wanted),
            Err(_) => false,
        }
    }
}

/// A permission string of colon-separated parts, each a comma-separated list of names or `*`.
///
/// `a` implies `b` when, part by part, every name `b` lists is listed by `a` (or `a` has `*`
/// there). Parts `a` leaves off imply everything: `user` implies `user:create:42`. Parts `b`
/// leaves off are only implied by `*`: `user:create` does not imply `user`. Matching ignores
/// case.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WildcardPermission {
    parts: Vec<BTreeSet<String>>,
}

const WILDCARD: &str = "*";

impl FromStr for WildcardPermission {
    type Err = failure::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty permission");
        }
        let mut parts = Vec::new();
        for part in s.split(':') {
            let names: BTreeSet<String> = part
                .split(',')
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect();
            if names.is_empty() {
                bail!("permission {:?} has an empty part", s);
            }
            parts.push(names);
        }
        Ok(WildcardPermission { parts })
    }
}

impl fmt::Display for WildcardPermission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self
            .parts
            .iter()
            .map(|p| p.iter().cloned().collect::<Vec<_>>().join(","))
            .collect();
        f.write_str(&parts.join(":"))
    }
}

impl WildcardPermission {
    /// True if holding `self` grants `other`.
    pub fn implies(&self, other: &WildcardPermission) -> bool {
        for (i, wanted) in other.parts.iter().enumerate() {
            let granted = match self.parts.get(i) {
                Some(granted) => granted,
                None => return true,
            };
            if !granted.contains(WILDCARD) && !granted.is_superset(wanted) {
                return false;
            }
        }
        self.parts[other.parts.len().min(self.parts.len())..]
            .iter()
            .all(|granted| granted.contains(WILDCARD))
    }
}
