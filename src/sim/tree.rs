use crate::path;
use crate::proto::ZkError;
use crate::{Acl, CreateMode, Stat, WatchedEvent, WatchedEventType};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

pub(super) type LinkId = u64;

/// Notifications produced by one change, addressed to the links that watched.
pub(super) type Fired = Vec<(LinkId, WatchedEvent)>;

struct Node {
    data: Vec<u8>,
    #[allow(dead_code)]
    acl: Vec<Acl>,
    stat: Stat,
    children: BTreeSet<String>,
}

impl Node {
    fn new(data: Vec<u8>, acl: Vec<Acl>, zxid: i64, owner: i64) -> Self {
        let now = now_millis();
        Node {
            stat: Stat {
                czxid: zxid,
                mzxid: zxid,
                ctime: now,
                mtime: now,
                version: 0,
                cversion: 0,
                aversion: 0,
                ephemeral_owner: owner,
                data_length: data.len() as i32,
                num_children: 0,
                pzxid: zxid,
            },
            data,
            acl,
            children: BTreeSet::new(),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// The node tree of the simulated service, with its server-side one-shot watches.
///
/// Data watches fire on creation, modification and deletion of their node; child watches fire
/// when the child set of their node changes or the node is deleted. A link hears about one
/// change at most once, even when it watches the node both ways.
pub(super) struct Tree {
    nodes: HashMap<String, Node>,
    zxid: i64,
    data_watches: HashMap<String, HashSet<LinkId>>,
    child_watches: HashMap<String, HashSet<LinkId>>,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), Acl::open_unsafe().to_vec(), 0, 0));
        Tree {
            nodes,
            zxid: 0,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }
}

fn trigger(
    watches: &mut HashMap<String, HashSet<LinkId>>,
    path: &str,
    event_type: WatchedEventType,
    skip: &HashSet<LinkId>,
    fired: &mut Fired,
) -> HashSet<LinkId> {
    let links = watches.remove(path).unwrap_or_default();
    for &link in &links {
        if !skip.contains(&link) {
            fired.push((link, WatchedEvent::node(event_type, path)));
        }
    }
    links
}

impl Tree {
    /// The transaction id of the latest change.
    pub(super) fn zxid(&self) -> i64 {
        self.zxid
    }

    fn check(path: &str) -> Result<(), ZkError> {
        path::validate(path).map_err(|_| ZkError::BadArguments)
    }

    fn watch(map: &mut HashMap<String, HashSet<LinkId>>, path: &str, link: Option<LinkId>) {
        if let Some(link) = link {
            map.entry(path.to_string()).or_default().insert(link);
        }
    }

    pub(super) fn create(
        &mut self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
        owner: i64,
        fired: &mut Fired,
    ) -> Result<String, ZkError> {
        Self::check(path)?;
        let parent_path = path::parent(path).ok_or(ZkError::NodeExists)?;
        if acl.is_empty() {
            return Err(ZkError::InvalidACL);
        }
        let parent = self.nodes.get(parent_path).ok_or(ZkError::NoNode)?;
        if parent.stat.ephemeral_owner != 0 {
            return Err(ZkError::NoChildrenForEphemerals);
        }

        let actual = if mode.is_sequential() {
            format!("{}{:010}", path, parent.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(ZkError::NodeExists);
        }

        self.zxid += 1;
        let zxid = self.zxid;
        let parent = self.nodes.get_mut(parent_path).ok_or(ZkError::NoNode)?;
        parent.children.insert(path::node_name(&actual).to_string());
        parent.stat.cversion += 1;
        parent.stat.num_children += 1;
        parent.stat.pzxid = zxid;

        let owner = if mode.is_ephemeral() { owner } else { 0 };
        self.nodes
            .insert(actual.clone(), Node::new(data.to_vec(), acl.to_vec(), zxid, owner));

        let none = HashSet::new();
        trigger(&mut self.data_watches, &actual, WatchedEventType::NodeCreated, &none, fired);
        trigger(
            &mut self.child_watches,
            parent_path,
            WatchedEventType::NodeChildrenChanged,
            &none,
            fired,
        );
        Ok(actual)
    }

    /// Deletes `path`, returning the session that owned it (0 if it was persistent).
    pub(super) fn delete(
        &mut self,
        path: &str,
        version: i32,
        fired: &mut Fired,
    ) -> Result<i64, ZkError> {
        Self::check(path)?;
        let parent_path = path::parent(path).ok_or(ZkError::BadArguments)?;
        let node = self.nodes.get(path).ok_or(ZkError::NoNode)?;
        if version != -1 && node.stat.version != version {
            return Err(ZkError::BadVersion);
        }
        if !node.children.is_empty() {
            return Err(ZkError::NotEmpty);
        }
        let owner = node.stat.ephemeral_owner;

        self.zxid += 1;
        let zxid = self.zxid;
        self.nodes.remove(path);
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.remove(path::node_name(path));
            parent.stat.cversion += 1;
            parent.stat.num_children -= 1;
            parent.stat.pzxid = zxid;
        }

        let none = HashSet::new();
        let told = trigger(&mut self.data_watches, path, WatchedEventType::NodeDeleted, &none, fired);
        trigger(&mut self.child_watches, path, WatchedEventType::NodeDeleted, &told, fired);
        trigger(
            &mut self.child_watches,
            parent_path,
            WatchedEventType::NodeChildrenChanged,
            &none,
            fired,
        );
        Ok(owner)
    }

    pub(super) fn set_data(
        &mut self,
        path: &str,
        data: &[u8],
        version: i32,
        fired: &mut Fired,
    ) -> Result<Stat, ZkError> {
        Self::check(path)?;
        let node = self.nodes.get_mut(path).ok_or(ZkError::NoNode)?;
        if version != -1 && node.stat.version != version {
            return Err(ZkError::BadVersion);
        }
        self.zxid += 1;
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = self.zxid;
        node.stat.mtime = now_millis();
        node.stat.data_length = data.len() as i32;
        let stat = node.stat;

        let none = HashSet::new();
        trigger(&mut self.data_watches, path, WatchedEventType::NodeDataChanged, &none, fired);
        Ok(stat)
    }

    pub(super) fn get_data(
        &mut self,
        path: &str,
        watch: Option<LinkId>,
    ) -> Result<(Vec<u8>, Stat), ZkError> {
        Self::check(path)?;
        let node = self.nodes.get(path).ok_or(ZkError::NoNode)?;
        let out = (node.data.clone(), node.stat);
        Self::watch(&mut self.data_watches, path, watch);
        Ok(out)
    }

    /// Like `get_data` without the payload; a watch is left even when the node is missing.
    pub(super) fn exists(&mut self, path: &str, watch: Option<LinkId>) -> Result<Stat, ZkError> {
        Self::check(path)?;
        Self::watch(&mut self.data_watches, path, watch);
        self.nodes.get(path).map(|n| n.stat).ok_or(ZkError::NoNode)
    }

    pub(super) fn get_children(
        &mut self,
        path: &str,
        watch: Option<LinkId>,
    ) -> Result<Vec<String>, ZkError> {
        Self::check(path)?;
        let node = self.nodes.get(path).ok_or(ZkError::NoNode)?;
        let children = node.children.iter().cloned().collect();
        Self::watch(&mut self.child_watches, path, watch);
        Ok(children)
    }

    /// Forgets every watch left by `link`.
    pub(super) fn drop_watches(&mut self, link: LinkId) {
        for watches in [&mut self.data_watches, &mut self.child_watches] {
            watches.retain(|_, links| {
                links.remove(&link);
                !links.is_empty()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(tree: &mut Tree, path: &str, mode: CreateMode) -> Result<String, ZkError> {
        tree.create(path, b"", Acl::open_unsafe(), mode, 7, &mut Vec::new())
    }

    #[test]
    fn sequence_suffix_follows_parent_cversion() {
        let mut tree = Tree::default();
        create(&mut tree, "/locks", CreateMode::Persistent).unwrap();
        create(&mut tree, "/locks/other", CreateMode::Persistent).unwrap();
        assert_eq!(
            Ok("/locks/lock-0000000001".to_string()),
            create(&mut tree, "/locks/lock-", CreateMode::EphemeralSequential)
        );
        assert_eq!(
            Ok("/locks/lock-0000000002".to_string()),
            create(&mut tree, "/locks/lock-", CreateMode::EphemeralSequential)
        );
        let stat = tree.exists("/locks/lock-0000000002", None).unwrap();
        assert_eq!(7, stat.ephemeral_owner);
    }

    #[test]
    fn structural_errors() {
        let mut tree = Tree::default();
        assert_eq!(Err(ZkError::NoNode), create(&mut tree, "/a/b", CreateMode::Persistent));
        create(&mut tree, "/a", CreateMode::Ephemeral).unwrap();
        assert_eq!(
            Err(ZkError::NoChildrenForEphemerals),
            create(&mut tree, "/a/b", CreateMode::Persistent)
        );
        assert_eq!(Err(ZkError::NodeExists), create(&mut tree, "/a", CreateMode::Persistent));
        assert_eq!(Err(ZkError::BadVersion), tree.delete("/a", 3, &mut Vec::new()));
        assert_eq!(Ok(7), tree.delete("/a", 0, &mut Vec::new()));
    }

    #[test]
    fn writes_bump_versions() {
        let mut tree = Tree::default();
        create(&mut tree, "/v", CreateMode::Persistent).unwrap();
        let stat = tree.set_data("/v", b"1", 0, &mut Vec::new()).unwrap();
        assert_eq!(1, stat.version);
        assert_eq!(
            Err(ZkError::BadVersion),
            tree.set_data("/v", b"2", 0, &mut Vec::new())
        );
        let (data, stat2) = tree.get_data("/v", None).unwrap();
        assert_eq!(b"1".to_vec(), data);
        assert!(stat2.mzxid > stat2.czxid);
    }

    #[test]
    fn watches_are_one_shot_and_deduplicated() {
        let mut tree = Tree::default();
        create(&mut tree, "/w", CreateMode::Persistent).unwrap();
        tree.get_data("/w", Some(1)).unwrap();
        tree.get_children("/w", Some(1)).unwrap();
        tree.get_children("/", Some(2)).unwrap();

        let mut fired = Vec::new();
        tree.set_data("/w", b"x", -1, &mut fired).unwrap();
        assert_eq!(1, fired.len());
        tree.set_data("/w", b"y", -1, &mut fired).unwrap();
        assert_eq!(1, fired.len());

        let mut fired = Vec::new();
        tree.get_data("/w", Some(1)).unwrap();
        tree.delete("/w", -1, &mut fired).unwrap();
        assert_eq!(
            vec![
                (1, WatchedEvent::node(WatchedEventType::NodeDeleted, "/w")),
                (2, WatchedEvent::node(WatchedEventType::NodeChildrenChanged, "/")),
            ],
            fired
        );
    }

    #[test]
    fn exists_watch_sees_creation() {
        let mut tree = Tree::default();
        assert_eq!(Err(ZkError::NoNode), tree.exists("/later", Some(4)));
        let mut fired = Vec::new();
        create_fired(&mut tree, "/later", &mut fired);
        assert_eq!(
            vec![(4, WatchedEvent::node(WatchedEventType::NodeCreated, "/later"))],
            fired
        );

        tree.exists("/later", Some(4)).unwrap();
        tree.drop_watches(4);
        let mut fired = Vec::new();
        tree.delete("/later", -1, &mut fired).unwrap();
        assert!(fired.is_empty());
    }

    fn create_fired(tree: &mut Tree, path: &str, fired: &mut Fired) {
        tree.create(path, b"", Acl::open_unsafe(), CreateMode::Persistent, 0, fired)
            .unwrap();
    }
}
