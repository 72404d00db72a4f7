//! Expansion of node records into individual nodes.
//!
//! A record names its hosts in one of three ways: an explicit
//! comma-separated `host-list`, a dash range such as `10.0.0.1-10.0.0.9`, or
//! a CIDR block such as `10.0.0.0/29`. When a record expands to more than
//! one node its id is either a template containing `{0}` (replaced by a
//! 1-based index) or a prefix the index is appended to.

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Deserialize;

use super::{ByonError, ByonNode};

const INDEX_PLACEHOLDER: &str = "{0}";
const MAX_RANGE_SIZE: u64 = 65_536;

/// A node record as written in the cluster descriptor.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct NodeRecord {
    /// Node id, template, or prefix.
    pub id: String,
    /// Comma-separated hosts.
    #[serde(default)]
    pub host_list: Option<String>,
    /// Dash range or CIDR block.
    #[serde(default)]
    pub host_range: Option<String>,
    /// Login user for these nodes.
    #[serde(default)]
    pub username: Option<String>,
    /// Login password for these nodes.
    #[serde(default)]
    pub credential: Option<String>,
    /// Private key for these nodes.
    #[serde(default, alias = "keyFile")]
    pub key_file: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IdScheme {
    Fixed,
    Template,
    Prefix,
}

impl IdScheme {
    fn for_many(id: &str) -> Self {
        if id.contains(INDEX_PLACEHOLDER) {
            Self::Template
        } else {
            Self::Prefix
        }
    }

    fn render(self, id: &str, index: u64) -> String {
        match self {
            Self::Fixed => id.to_owned(),
            Self::Template => id.replace(INDEX_PLACEHOLDER, &index.to_string()),
            Self::Prefix => format!("{id}{index}"),
        }
    }
}

/// Expands every record into nodes, in declaration order.
///
/// # Errors
///
/// Returns the first [`ByonError`] raised by a malformed record.
pub fn parse_nodes(records: &[NodeRecord]) -> Result<Vec<ByonNode>, ByonError> {
    let mut nodes = Vec::new();
    for record in records {
        nodes.extend(parse_record(record)?);
    }
    Ok(nodes)
}

fn parse_record(record: &NodeRecord) -> Result<Vec<ByonNode>, ByonError> {
    let id = record.id.trim();
    if id.is_empty() {
        return Err(ByonError::EmptyId);
    }

    if let Some(list) = non_blank(record.host_list.as_deref()) {
        if list.contains(',') {
            return Ok(parse_host_list(record, id, list));
        }
        let single_id = if id.contains('{') {
            IdScheme::Template.render(id, 1)
        } else {
            id.to_owned()
        };
        return Ok(vec![node(record, single_id, list.to_owned())]);
    }

    if let Some(range) = non_blank(record.host_range.as_deref()) {
        if is_ip_range(range) {
            return parse_range(record, id, range);
        }
        if range.contains('/') {
            let expanded = cidr_to_range(range)?;
            return parse_range(record, id, &expanded);
        }
        return Err(ByonError::InvalidHosts {
            hosts: range.to_owned(),
        });
    }

    Err(ByonError::HostsNotSet { id: id.to_owned() })
}

fn parse_host_list(record: &NodeRecord, id: &str, list: &str) -> Vec<ByonNode> {
    let hosts: Vec<&str> = list
        .split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .collect();
    let scheme = if hosts.len() > 1 {
        IdScheme::for_many(id)
    } else {
        IdScheme::Fixed
    };

    hosts
        .into_iter()
        .zip(1_u64..)
        .map(|(host, index)| node(record, scheme.render(id, index), host.to_owned()))
        .collect()
}

fn parse_range(record: &NodeRecord, id: &str, range: &str) -> Result<Vec<ByonNode>, ByonError> {
    let (start_text, end_text) = range
        .split_once('-')
        .ok_or_else(|| ByonError::InvalidHosts {
            hosts: range.to_owned(),
        })?;
    let start = u32::from(parse_ipv4(start_text)?);
    let end = u32::from(parse_ipv4(end_text)?);

    if start > end {
        return Ok(Vec::new());
    }

    let size = u64::from(end - start) + 1;
    if size > MAX_RANGE_SIZE {
        return Err(ByonError::RangeTooLarge {
            range: range.to_owned(),
            size,
            limit: MAX_RANGE_SIZE,
        });
    }

    let scheme = if start < end {
        IdScheme::for_many(id)
    } else {
        IdScheme::Fixed
    };

    Ok((start..=end)
        .zip(1_u64..)
        .map(|(address, index)| {
            node(
                record,
                scheme.render(id, index),
                Ipv4Addr::from(address).to_string(),
            )
        })
        .collect())
}

/// Converts `a.b.c.d/n` into the inclusive `lowest-highest` range it spans.
fn cidr_to_range(cidr: &str) -> Result<String, ByonError> {
    let (address_text, bits_text) = cidr.split_once('/').unwrap_or((cidr, "0"));
    let address = u32::from(parse_ipv4(address_text)?);
    let bits: u32 = bits_text
        .trim()
        .parse()
        .map_err(|err: std::num::ParseIntError| ByonError::InvalidCidr {
            cidr: cidr.to_owned(),
            message: err.to_string(),
        })?;
    if bits > 32 {
        return Err(ByonError::InvalidCidr {
            cidr: cidr.to_owned(),
            message: String::from("prefix length exceeds 32"),
        });
    }

    let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
    let lowest = address & mask;
    let highest = lowest | !mask;
    Ok(format!("{}-{}", Ipv4Addr::from(lowest), Ipv4Addr::from(highest)))
}

fn is_ip_range(range: &str) -> bool {
    range
        .split_once('-')
        .is_some_and(|(start, _)| Ipv4Addr::from_str(start.trim()).is_ok())
}

fn parse_ipv4(text: &str) -> Result<Ipv4Addr, ByonError> {
    Ipv4Addr::from_str(text.trim()).map_err(|_| ByonError::InvalidAddress {
        address: text.trim().to_owned(),
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|text| !text.is_empty())
}

fn node(record: &NodeRecord, id: String, host: String) -> ByonNode {
    ByonNode {
        id,
        host,
        username: record.username.clone(),
        credential: record.credential.clone(),
        key_file: record.key_file.clone(),
        group: None,
    }
}
