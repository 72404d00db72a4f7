//! Bring-your-own-nodes: a static, pre-registered machine pool that stands
//! in for a cloud API.
//!
//! Node records from the cluster descriptor are expanded into
//! [`ByonNode`]s by [`parse_nodes`], grouped per template into a
//! [`ByonPool`], and exposed through [`ByonDriver`] as a regular
//! provisioning driver.

use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::driver::DriverError;

mod deployer;
mod driver;
mod parse;
mod pool;

pub use deployer::ByonDeployer;
pub use driver::ByonDriver;
pub use parse::{NodeRecord, parse_nodes};
pub use pool::{ByonPool, PoolSnapshot};

/// A statically configured machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ByonNode {
    /// Node identifier, unique within a pool.
    pub id: String,
    /// IP address or host name.
    pub host: String,
    /// Login user overriding the template user.
    pub username: Option<String>,
    /// Login password overriding the template credential.
    pub credential: Option<String>,
    /// Private key overriding the template credential.
    pub key_file: Option<String>,
    /// Logical server name stamped on allocation.
    pub group: Option<String>,
}

impl ByonNode {
    /// Returns the node address when the host is an IP literal.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        IpAddr::from_str(&self.host).ok()
    }
}

/// Errors raised by node parsing and pool bookkeeping.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ByonError {
    /// Raised when a node record has a blank id.
    #[error("failed to parse cloud nodes, empty ID configuration")]
    EmptyId,
    /// Raised when a node record sets neither a host list nor a range.
    #[error("failed to parse cloud nodes, host list or range not set for node {id}")]
    HostsNotSet {
        /// Offending node id.
        id: String,
    },
    /// Raised when a host range is neither an IP range nor a CIDR block.
    #[error("failed to parse cloud nodes, invalid hosts configuration: {hosts}")]
    InvalidHosts {
        /// Offending host specification.
        hosts: String,
    },
    /// Raised when a range or CIDR endpoint is not an IPv4 address.
    #[error("invalid IP address: {address}")]
    InvalidAddress {
        /// Offending address text.
        address: String,
    },
    /// Raised when a CIDR prefix length is malformed.
    #[error("invalid CIDR block {cidr}: {message}")]
    InvalidCidr {
        /// Offending block.
        cidr: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when a range expands to more nodes than the pool accepts.
    #[error("host range {range} expands to {size} nodes, more than the {limit} allowed")]
    RangeTooLarge {
        /// Offending range.
        range: String,
        /// Number of addresses in the range.
        size: u64,
        /// Largest accepted range.
        limit: u64,
    },
    /// Raised when two nodes share an id or host.
    #[error("duplicate node {key} in template {template}")]
    DuplicateNode {
        /// Id or host that appears twice.
        key: String,
        /// Template owning the pool.
        template: String,
    },
    /// Raised when two templates list the same host.
    #[error("host {host} is listed by both template {first} and template {second}")]
    DuplicateHost {
        /// Shared host.
        host: String,
        /// First template listing the host.
        first: String,
        /// Second template listing the host.
        second: String,
    },
    /// Raised when an allocation request carries a blank server name.
    #[error("server name must not be empty")]
    InvalidName,
    /// Raised when the free set of a pool is empty.
    #[error("no free nodes left in template {template}")]
    Exhausted {
        /// Template owning the pool.
        template: String,
    },
    /// Raised when a template has no pool.
    #[error("template {name} has no BYON nodes")]
    UnknownTemplate {
        /// Requested template name.
        name: String,
    },
}

impl From<ByonError> for DriverError {
    fn from(value: ByonError) -> Self {
        match value {
            ByonError::Exhausted { template } => Self::PoolExhausted { template },
            ByonError::InvalidName => Self::Provisioning {
                message: value.to_string(),
            },
            other => Self::Config(other.to_string()),
        }
    }
}
