//! Channel registry.
//!
//! Maps channel names to small positive integer ids. Ids are handed out from
//! a monotonic counter and never reassigned, so an id stays valid for the
//! life of the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Integer id of a named channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(i32);

impl ChannelId {
    /// Returned for empty names.
    pub const INVALID: ChannelId = ChannelId(-1);

    pub fn get(self) -> i32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Tables {
    by_name: HashMap<Arc<str>, ChannelId>,
    by_id: HashMap<ChannelId, Arc<str>>,
}

/// Bidirectional name ↔ id table.
#[derive(Debug)]
pub struct ChannelRegistry {
    next: AtomicI32,
    tables: RwLock<Tables>,
}

static GLOBAL: OnceLock<ChannelRegistry> = OnceLock::new();

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Process-wide registry, created on first use.
    pub fn global() -> &'static ChannelRegistry {
        GLOBAL.get_or_init(ChannelRegistry::new)
    }

    /// Id for `name`, allocating one on first sight.
    ///
    /// Empty names yield [`ChannelId::INVALID`]. Registering the same name
    /// again returns the same id.
    pub fn register(&self, name: &str) -> ChannelId {
        if name.is_empty() {
            return ChannelId::INVALID;
        }
        if let Some(id) = self.tables.read().by_name.get(name) {
            return *id;
        }

        let mut tables = self.tables.write();
        // Another caller may have won between the read and write lock.
        if let Some(id) = tables.by_name.get(name) {
            return *id;
        }
        let id = ChannelId(self.next.fetch_add(1, Ordering::SeqCst));
        let name: Arc<str> = Arc::from(name);
        tables.by_name.insert(name.clone(), id);
        tables.by_id.insert(id, name.clone());
        tracing::debug!(channel = %name, id = id.get(), "channel_registered");
        id
    }

    /// Accepts an optional name; `None` behaves like the empty name.
    pub fn register_opt(&self, name: Option<&str>) -> ChannelId {
        name.map_or(ChannelId::INVALID, |n| self.register(n))
    }

    pub fn name_of(&self, id: ChannelId) -> Option<Arc<str>> {
        self.tables.read().by_id.get(&id).cloned()
    }

    /// Reverse lookup. A debugging aid: hot paths should keep the id.
    pub fn id_of(&self, name: &str) -> Option<ChannelId> {
        self.tables.read().by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register `name` in the global registry.
pub fn channel(name: &str) -> ChannelId {
    ChannelRegistry::global().register(name)
}

/// Name of `id` in the global registry, or `#<id>` when unknown.
pub fn channel_name(id: ChannelId) -> Arc<str> {
    ChannelRegistry::global()
        .name_of(id)
        .unwrap_or_else(|| Arc::from(format!("#{}", id.get())))
}
