//! Per-template pools built from the cluster descriptor.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::descriptor::ClusterDescriptor;

use super::{ByonError, ByonNode, ByonPool, parse_nodes};

/// Owns one [`ByonPool`] per template that lists nodes.
#[derive(Debug, Default)]
pub struct ByonDeployer {
    pools: BTreeMap<String, Arc<ByonPool>>,
}

impl ByonDeployer {
    /// Expands the node records of every template in `descriptor`.
    ///
    /// Templates without nodes get no pool.
    ///
    /// # Errors
    ///
    /// Returns the parser error of the first malformed record, a
    /// [`ByonError::DuplicateNode`] for repeats inside one template, and a
    /// [`ByonError::DuplicateHost`] when two templates list the same host.
    pub fn from_descriptor(descriptor: &ClusterDescriptor) -> Result<Self, ByonError> {
        let mut deployer = Self::default();
        for (name, template) in &descriptor.templates {
            if template.nodes.is_empty() {
                continue;
            }
            deployer.add_pool(name, parse_nodes(&template.nodes)?)?;
        }
        Ok(deployer)
    }

    /// Adds a pool for `template`.
    ///
    /// # Errors
    ///
    /// Returns [`ByonError::DuplicateHost`] when a host already belongs to
    /// another template, or the pool construction error.
    pub fn add_pool(&mut self, template: &str, nodes: Vec<ByonNode>) -> Result<(), ByonError> {
        for node in &nodes {
            if let Some(owner) = self.template_of_host(&node.host) {
                return Err(ByonError::DuplicateHost {
                    host: node.host.clone(),
                    first: owner.to_owned(),
                    second: template.to_owned(),
                });
            }
        }
        let pool = ByonPool::new(template, nodes)?;
        self.pools.insert(template.to_owned(), Arc::new(pool));
        Ok(())
    }

    /// Pool serving `template`.
    ///
    /// # Errors
    ///
    /// Returns [`ByonError::UnknownTemplate`] when the template lists no
    /// nodes.
    pub fn pool(&self, template: &str) -> Result<Arc<ByonPool>, ByonError> {
        self.pools
            .get(template)
            .cloned()
            .ok_or_else(|| ByonError::UnknownTemplate {
                name: template.to_owned(),
            })
    }

    /// Templates with a pool, in name order.
    #[must_use]
    pub fn templates(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    /// Finds the node with host `ip` in any pool.
    #[must_use]
    pub fn node_by_ip(&self, ip: &str) -> Option<(String, ByonNode)> {
        self.pools.iter().find_map(|(template, pool)| {
            pool.node_by_ip(ip).map(|node| (template.clone(), node))
        })
    }

    fn template_of_host(&self, host: &str) -> Option<&str> {
        self.pools
            .iter()
            .find(|(_, pool)| pool.node_by_ip(host).is_some())
            .map(|(template, _)| template.as_str())
    }
}
