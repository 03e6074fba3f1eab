//! Trace-id chains.
//!
//! A chain is an append-only list of ids, newest last. Appending shares the
//! parent's nodes, so deriving a child never copies or mutates the parent.

use std::fmt;
use std::sync::Arc;

use crate::types::random_suffix;

#[derive(Debug)]
struct TraceNode {
    id: Arc<str>,
    parent: Option<Arc<TraceNode>>,
    len: usize,
}

/// Ordered, append-only chain of trace identifiers. Never empty.
#[derive(Clone)]
pub struct TraceChain {
    head: Arc<TraceNode>,
}

impl TraceChain {
    /// Start a chain whose first id is `<holder>-<suffix>`.
    pub fn new(holder: &str) -> Self {
        Self {
            head: Arc::new(TraceNode {
                id: make_id(holder),
                parent: None,
                len: 1,
            }),
        }
    }

    /// New chain with `<holder>-<suffix>` appended.
    pub fn append(&self, holder: &str) -> Self {
        Self {
            head: Arc::new(TraceNode {
                id: make_id(holder),
                parent: Some(self.head.clone()),
                len: self.head.len + 1,
            }),
        }
    }

    /// Newest id.
    pub fn latest(&self) -> &str {
        &self.head.id
    }

    /// Oldest id.
    pub fn origin(&self) -> &str {
        let mut node = &self.head;
        while let Some(parent) = &node.parent {
            node = parent;
        }
        &node.id
    }

    pub fn len(&self) -> usize {
        self.head.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Ids from oldest to newest.
    pub fn ids(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.len());
        let mut node = Some(&self.head);
        while let Some(n) = node {
            out.push(&*n.id);
            node = n.parent.as_ref();
        }
        out.reverse();
        out
    }

    /// True when `other` is this chain or one of its ancestors.
    pub fn descends_from(&self, other: &TraceChain) -> bool {
        let mut node = Some(&self.head);
        while let Some(n) = node {
            if Arc::ptr_eq(n, &other.head) {
                return true;
            }
            node = n.parent.as_ref();
        }
        false
    }
}

fn make_id(holder: &str) -> Arc<str> {
    let holder = if holder.is_empty() { "anon" } else { holder };
    Arc::from(format!("{}-{}", holder, random_suffix()))
}

impl fmt::Display for TraceChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ids().join(">"))
    }
}

impl fmt::Debug for TraceChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
