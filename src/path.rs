//! Helpers for slash-delimited node paths.

use failure::bail;

/// Checks that `path` is absolute, has no empty components and no trailing slash.
pub fn validate(path: &str) -> Result<(), failure::Error> {
    if !path.starts_with('/') {
        bail!("path {:?} must start with '/'", path);
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        bail!("path {:?} must not end with '/'", path);
    }
    for component in path[1..].split('/') {
        match component {
            "" => bail!("path {:?} contains an empty component", path),
            "." | ".." => bail!("path {:?} contains a relative component", path),
            _ if component.contains('\0') => bail!("path {:?} contains a NUL byte", path),
            _ => {}
        }
    }
    Ok(())
}

/// Appends `child` to `parent`.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// The parent of `path`, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        _ if path == "/" => None,
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// The last component of `path`.
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Every proper ancestor of `path` below the root, outermost first.
pub(crate) fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = path;
    while let Some(p) = parent(current) {
        if p == "/" {
            break;
        }
        out.push(p);
        current = p;
    }
    out.reverse();
    out
}

/// The service-assigned sequence suffix of a sequential node name.
pub(crate) fn sequence_of(name: &str) -> Option<u64> {
    const DIGITS: usize = 10;
    let suffix = name.get(name.len().checked_sub(DIGITS)?..)?;
    if suffix.bytes().all(|b| b.is_ascii_digit()) {
        suffix.parse().ok()
    } else {
        None
    }
}

/// A chroot: every path the application uses is resolved below `prefix` on the service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Namespace {
    prefix: Option<String>,
}

impl Namespace {
    pub(crate) fn new(prefix: Option<String>) -> Result<Self, failure::Error> {
        match prefix {
            Some(ref p) if p == "/" => Ok(Namespace { prefix: None }),
            Some(p) => {
                let p = if p.starts_with('/') { p } else { format!("/{}", p) };
                validate(&p)?;
                Ok(Namespace { prefix: Some(p) })
            }
            None => Ok(Namespace { prefix: None }),
        }
    }

    pub(crate) fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Turns an application path into a service path.
    pub(crate) fn apply(&self, path: &str) -> String {
        match self.prefix {
            None => path.to_string(),
            Some(ref p) if path == "/" => p.clone(),
            Some(ref p) => format!("{}{}", p, path),
        }
    }

    /// Turns a service path back into an application path.
    pub(crate) fn strip(&self, path: &str) -> String {
        match self.prefix {
            None => path.to_string(),
            Some(ref p) => match path.strip_prefix(p.as_str()) {
                Some("") => "/".to_string(),
                Some(rest) if rest.starts_with('/') => rest.to_string(),
                _ => path.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(validate("/").is_ok());
        assert!(validate("/a/b-0000000001").is_ok());
        assert!(validate("a").is_err());
        assert!(validate("/a/").is_err());
        assert!(validate("/a//b").is_err());
        assert!(validate("/a/../b").is_err());
    }

    #[test]
    fn structure() {
        assert_eq!("/a", join("/", "a"));
        assert_eq!("/a/b", join("/a", "b"));
        assert_eq!(Some("/"), parent("/a"));
        assert_eq!(Some("/a"), parent("/a/b"));
        assert_eq!(None, parent("/"));
        assert_eq!("b", node_name("/a/b"));
        assert_eq!(vec!["/a", "/a/b"], ancestors("/a/b/c"));
        assert!(ancestors("/a").is_empty());
    }

    #[test]
    fn sequence_suffix() {
        assert_eq!(Some(42), sequence_of("lock-0000000042"));
        assert_eq!(Some(7), sequence_of("_c_abc-lock-0000000007"));
        assert_eq!(None, sequence_of("lock-"));
        assert_eq!(None, sequence_of("lock-00000000x2"));
        assert_eq!(None, sequence_of("-lock-ééééé1"));
        assert_eq!(Some(3), sequence_of("é-lock-0000000003"));
    }

    #[test]
    fn namespace_round_trip() {
        let ns = Namespace::new(Some("base".to_string())).unwrap();
        assert_eq!("/base", ns.apply("/"));
        assert_eq!("/base/a/b", ns.apply("/a/b"));
        assert_eq!("/", ns.strip("/base"));
        assert_eq!("/a/b", ns.strip("/base/a/b"));
        assert_eq!("/basement", ns.strip("/basement"));

        let none = Namespace::new(None).unwrap();
        assert_eq!("/x", none.apply("/x"));
        assert_eq!(None, none.prefix());
    }
}
