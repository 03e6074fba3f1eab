//! Channel listeners.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::channel::ChannelId;
use super::event::{Event, HandlerResult};

/// Something that reacts to events on a channel.
///
/// Implemented for plain closures `Fn(&Event) -> HandlerResult`.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event) -> HandlerResult;
}

impl<F> Listener for F
where
    F: Fn(&Event) -> HandlerResult + Send + Sync,
{
    fn on_event(&self, event: &Event) -> HandlerResult {
        self(event)
    }
}

pub type ListenerRef = Arc<dyn Listener>;

fn same(a: &ListenerRef, b: &ListenerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Channel → listeners, insertion ordered, deduplicated by reference.
///
/// Readers get a snapshot; no lock is held while listeners run.
#[derive(Default)]
pub struct ListenerRegistry {
    channels: RwLock<HashMap<ChannelId, Vec<ListenerRef>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when this exact listener is already on the channel.
    pub fn add(&self, channel: ChannelId, listener: ListenerRef) -> bool {
        let mut channels = self.channels.write();
        let list = channels.entry(channel).or_default();
        if list.iter().any(|l| same(l, &listener)) {
            return false;
        }
        list.push(listener);
        true
    }

    pub fn remove(&self, channel: ChannelId, listener: &ListenerRef) -> bool {
        let mut channels = self.channels.write();
        let Some(list) = channels.get_mut(&channel) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| !same(l, listener));
        let removed = list.len() != before;
        if list.is_empty() {
            channels.remove(&channel);
        }
        removed
    }

    pub fn snapshot(&self, channel: ChannelId) -> Vec<ListenerRef> {
        self.channels
            .read()
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, channel: ChannelId) -> usize {
        self.channels.read().get(&channel).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.channels.read().values().map(Vec::len).sum()
    }

    pub fn clear(&self) {
        self.channels.write().clear();
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("channels", &self.channels.read().len())
            .field("listeners", &self.total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{HandlerResult, Reply};

    fn passing() -> ListenerRef {
        Arc::new(|_: &Event| -> HandlerResult { Ok(Reply::Pass) })
    }

    #[test]
    fn test_add_is_deduplicated_by_reference() {
        let registry = ListenerRegistry::new();
        let ch = ChannelId::INVALID;
        let a = passing();
        let b = passing();

        assert!(registry.add(ch, a.clone()));
        assert!(!registry.add(ch, a.clone()));
        assert!(registry.add(ch, b.clone()));
        assert_eq!(registry.count(ch), 2);

        let snapshot = registry.snapshot(ch);
        assert!(same(&snapshot[0], &a));
        assert!(same(&snapshot[1], &b));
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = ListenerRegistry::new();
        let ch = ChannelId::INVALID;
        let a = passing();

        registry.add(ch, a.clone());
        assert!(registry.remove(ch, &a));
        assert!(!registry.remove(ch, &a));
        assert_eq!(registry.total(), 0);

        registry.add(ch, a);
        registry.clear();
        assert!(registry.snapshot(ch).is_empty());
    }
}
