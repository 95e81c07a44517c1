use crate::{WatchedEvent, WatchedEventType};
use futures::channel::oneshot;
use slog::trace;
use std::collections::HashMap;

#[derive(Debug)]
pub(crate) enum Watch {
    None,
    Global,
    Custom(oneshot::Sender<WatchedEvent>),
}

impl Watch {
    pub(crate) fn to_u8(&self) -> u8 {
        if let Watch::None = *self {
            0
        } else {
            1
        }
    }
}

/// Describes what a `Watch` is looking for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) enum WatchType {
    /// Watching for changes to children.
    Child,
    /// Watching for changes to data.
    Data,
    /// Watching for the creation of a node at the given path.
    Exist,
}

impl WatchType {
    fn triggered_by(self, event_type: WatchedEventType) -> bool {
        match (self, event_type) {
            (WatchType::Child, WatchedEventType::NodeDeleted)
            | (WatchType::Child, WatchedEventType::NodeChildrenChanged) => true,
            (WatchType::Child, _) => false,
            (WatchType::Data, WatchedEventType::NodeDeleted)
            | (WatchType::Data, WatchedEventType::NodeDataChanged) => true,
            (WatchType::Data, _) => false,
            (WatchType::Exist, WatchedEventType::NodeChildrenChanged) => false,
            (WatchType::Exist, _) => true,
        }
    }
}

/// Client-side half of the one-shot watches of a single link.
///
/// The server only remembers *that* a session watches a path; this table remembers *who* in the
/// process is waiting. It lives exactly as long as the link: dropping it drops every sender, which
/// resolves every outstanding watch as invalidated.
#[derive(Default)]
pub(crate) struct WatchRegistry {
    /// Custom registered watchers (path -> watcher)
    watchers: HashMap<String, Vec<(oneshot::Sender<WatchedEvent>, WatchType)>>,
}

impl WatchRegistry {
    pub(crate) fn add(
        &mut self,
        path: String,
        tx: oneshot::Sender<WatchedEvent>,
        wtype: WatchType,
    ) {
        let entry = self.watchers.entry(path).or_default();
        // receivers of abandoned watches will never look
        entry.retain(|(tx, _)| !tx.is_canceled());
        entry.push((tx, wtype));
    }

    /// Fires every watcher on `e.path` that `e` triggers, and returns how many fired.
    pub(crate) fn dispatch(&mut self, e: &WatchedEvent, logger: &slog::Logger) -> usize {
        let mut fired = 0;
        let mut remove = false;
        if let Some(watchers) = self.watchers.get_mut(&e.path) {
            // custom watchers were set by the user -- notify them
            trace!(logger,
                   "found potentially waiting custom watchers";
                   "n" => watchers.len()
            );

            let mut i = watchers.len();
            while i > 0 {
                i -= 1;
                if watchers[i].1.triggered_by(e.event_type) {
                    // this watcher is no longer active
                    let w = watchers.swap_remove(i);
                    // NOTE: ignore the case where the receiver has been dropped
                    let _ = w.0.send(e.clone());
                    fired += 1;
                }
            }

            remove = watchers.is_empty();
        }

        if remove {
            self.watchers.remove(&e.path);
        }
        fired
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.watchers.values().map(Vec::len).sum()
    }
}
