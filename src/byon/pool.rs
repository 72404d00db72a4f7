//! Free/allocated/invalid bookkeeping for one template's nodes.
//!
//! The three sets partition the pool: every node sits in exactly one of
//! them at all times. All transitions happen under a single mutex so
//! concurrent scale requests sharing the pool never observe a node in two
//! sets or in none. Moving a node to `invalid` is terminal.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ByonError, ByonNode};

#[derive(Debug, Default)]
struct PoolSets {
    free: BTreeMap<String, ByonNode>,
    allocated: BTreeMap<String, ByonNode>,
    invalid: BTreeMap<String, ByonNode>,
}

impl PoolSets {
    fn iter_all(&self) -> impl Iterator<Item = &ByonNode> {
        self.free
            .values()
            .chain(self.allocated.values())
            .chain(self.invalid.values())
    }
}

/// Point-in-time copy of the three sets.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolSnapshot {
    /// Nodes available for allocation.
    pub free: Vec<ByonNode>,
    /// Nodes handed out.
    pub allocated: Vec<ByonNode>,
    /// Nodes permanently withdrawn.
    pub invalid: Vec<ByonNode>,
}

/// Static node pool for a single template.
#[derive(Debug)]
pub struct ByonPool {
    template: String,
    sets: Mutex<PoolSets>,
}

impl ByonPool {
    /// Builds a pool in which every node starts free.
    ///
    /// # Errors
    ///
    /// Returns [`ByonError::DuplicateNode`] when two nodes share an id or a
    /// host.
    pub fn new(template: impl Into<String>, nodes: Vec<ByonNode>) -> Result<Self, ByonError> {
        let template_name = template.into();
        let mut free = BTreeMap::new();
        let mut hosts = BTreeSet::new();
        for node in nodes {
            if !hosts.insert(node.host.clone()) {
                return Err(ByonError::DuplicateNode {
                    key: node.host,
                    template: template_name,
                });
            }
            if free.contains_key(&node.id) {
                return Err(ByonError::DuplicateNode {
                    key: node.id,
                    template: template_name,
                });
            }
            free.insert(node.id.clone(), node);
        }

        Ok(Self {
            template: template_name,
            sets: Mutex::new(PoolSets {
                free,
                ..PoolSets::default()
            }),
        })
    }

    /// Template this pool serves.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Total number of nodes across the three sets.
    #[must_use]
    pub fn len(&self) -> usize {
        let sets = self.sets.lock();
        sets.free.len() + sets.allocated.len() + sets.invalid.len()
    }

    /// Returns `true` when the pool holds no nodes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves one free node to the allocated set and stamps it with `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ByonError::InvalidName`] for a blank name and
    /// [`ByonError::Exhausted`] when no node is free. Neither error mutates
    /// the pool.
    pub fn create_server(&self, name: &str) -> Result<ByonNode, ByonError> {
        if name.trim().is_empty() {
            return Err(ByonError::InvalidName);
        }

        let mut sets = self.sets.lock();
        let Some((id, mut node)) = sets.free.pop_first() else {
            return Err(ByonError::Exhausted {
                template: self.template.clone(),
            });
        };
        node.group = Some(name.to_owned());
        sets.allocated.insert(id, node.clone());
        drop(sets);

        info!(template = %self.template, node = %node.id, host = %node.host, server = name, "allocated node");
        Ok(node)
    }

    /// Returns an allocated node to the free set and clears its stamp.
    ///
    /// Returns `true` when the node moved. `None`, unknown nodes, free nodes,
    /// and invalid nodes are left untouched.
    pub fn shutdown_server(&self, node: Option<&ByonNode>) -> bool {
        let Some(target) = node else {
            return false;
        };

        let mut sets = self.sets.lock();
        let Some(mut released) = sets.allocated.remove(&target.id) else {
            debug!(template = %self.template, node = %target.id, "shutdown ignored, node not allocated");
            return false;
        };
        released.group = None;
        sets.free.insert(released.id.clone(), released);
        drop(sets);

        info!(template = %self.template, node = %target.id, "released node");
        true
    }

    /// Permanently withdraws `node` from allocation.
    ///
    /// Returns `true` when the node was free or allocated and is now invalid.
    pub fn invalidate_server(&self, node: &ByonNode) -> bool {
        let mut sets = self.sets.lock();
        let taken = sets
            .free
            .remove(&node.id)
            .or_else(|| sets.allocated.remove(&node.id));
        let Some(mut withdrawn) = taken else {
            return false;
        };
        withdrawn.group = None;
        sets.invalid.insert(withdrawn.id.clone(), withdrawn);
        drop(sets);

        info!(template = %self.template, node = %node.id, host = %node.host, "invalidated node");
        true
    }

    /// Marks free nodes whose host appears in `hosts` as allocated.
    ///
    /// Used to resynchronise the pool with machines the control plane
    /// already reports in use. Returns the number of nodes moved.
    pub fn set_allocated(&self, hosts: &BTreeSet<String>) -> usize {
        let mut sets = self.sets.lock();
        let matching: Vec<String> = sets
            .free
            .values()
            .filter(|node| hosts.contains(&node.host))
            .map(|node| node.id.clone())
            .collect();
        for id in &matching {
            if let Some(node) = sets.free.remove(id) {
                sets.allocated.insert(id.clone(), node);
            }
        }
        matching.len()
    }

    /// Records the node at `host` as an already running server named `name`.
    ///
    /// A free node moves to the allocated set with the stamp; an allocated
    /// node keeps any stamp it already carries. Invalid and unknown hosts
    /// are ignored and yield `None`.
    pub fn adopt(&self, host: &str, name: &str) -> Option<ByonNode> {
        let mut sets = self.sets.lock();
        if let Some(node) = sets.allocated.values_mut().find(|node| node.host == host) {
            node.group.get_or_insert_with(|| name.to_owned());
            return Some(node.clone());
        }

        let id = sets
            .free
            .values()
            .find(|node| node.host == host)
            .map(|node| node.id.clone())?;
        let mut node = sets.free.remove(&id)?;
        node.group = Some(name.to_owned());
        sets.allocated.insert(id, node.clone());
        drop(sets);

        info!(template = %self.template, node = %node.id, host, server = name, "adopted running node");
        Some(node)
    }

    /// Finds a node by id in any set.
    #[must_use]
    pub fn node_by_id(&self, id: &str) -> Option<ByonNode> {
        self.find(|node| node.id == id)
    }

    /// Finds a node by its allocation stamp in any set.
    #[must_use]
    pub fn node_by_name(&self, name: &str) -> Option<ByonNode> {
        self.find(|node| node.group.as_deref() == Some(name))
    }

    /// Finds a node by host in any set.
    #[must_use]
    pub fn node_by_ip(&self, ip: &str) -> Option<ByonNode> {
        self.find(|node| node.host == ip)
    }

    /// Allocated nodes whose stamp starts with `prefix`.
    #[must_use]
    pub fn allocated_with_prefix(&self, prefix: &str) -> Vec<ByonNode> {
        self.sets
            .lock()
            .allocated
            .values()
            .filter(|node| {
                node.group
                    .as_deref()
                    .is_some_and(|name| name.starts_with(prefix))
            })
            .cloned()
            .collect()
    }

    /// Hosts of the free and allocated nodes.
    #[must_use]
    pub fn usable_hosts(&self) -> Vec<String> {
        let sets = self.sets.lock();
        sets.free
            .values()
            .chain(sets.allocated.values())
            .map(|node| node.host.clone())
            .collect()
    }

    /// Copies the three sets.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let sets = self.sets.lock();
        PoolSnapshot {
            free: sets.free.values().cloned().collect(),
            allocated: sets.allocated.values().cloned().collect(),
            invalid: sets.invalid.values().cloned().collect(),
        }
    }

    fn find(&self, predicate: impl Fn(&ByonNode) -> bool) -> Option<ByonNode> {
        self.sets
            .lock()
            .iter_all()
            .find(|node| predicate(node))
            .cloned()
    }
}
