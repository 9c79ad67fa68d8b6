/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reading pairwise link weights out of the KFD topology tree.
//!
//! The kernel exposes one directory per topology node under
//! `/sys/class/kfd/kfd/topology/nodes`. Each node carries a `properties`
//! record and link records under `io_links/` and `p2p_links/`:
//!
//! ```text
//! nodes/
//!   2/
//!     properties            # ... drm_render_minor 128 ...
//!     io_links/0/properties # type 11, node_from 2, node_to 3, ...
//!     p2p_links/0/properties
//! ```
//!
//! Access goes through [`TopologySource`] so tests can substitute an
//! in-memory tree for sysfs.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::num::ParseIntError;
use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;

#[cfg(test)]
use mockall::automock;
use regex::Regex;

use crate::device::Device;
use crate::device::find_by_node;
use crate::weights::LinkType;
use crate::weights::PairWeights;
use crate::weights::canonical_pair;
use crate::weights::pair_weight;

/// Where the KFD driver publishes its topology.
pub const DEFAULT_TOPOLOGY_ROOT: &str = "/sys/class/kfd/kfd/topology/nodes";

static DRM_RENDER_MINOR: LazyLock<Regex> = LazyLock::new(|| field_pattern("drm_render_minor"));
static NODE_FROM: LazyLock<Regex> = LazyLock::new(|| field_pattern("node_from"));
static NODE_TO: LazyLock<Regex> = LazyLock::new(|| field_pattern("node_to"));
static LINK_TYPE: LazyLock<Regex> = LazyLock::new(|| field_pattern("type"));

fn field_pattern(key: &str) -> Regex {
    Regex::new(&format!(r"{}\s(\d+)", regex::escape(key))).expect("escaped key is a valid pattern")
}

/// Errors raised while reading the topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// The node entries under the root could not be listed.
    #[error("unable to list topology nodes under {}: {source}", .path.display())]
    ListNodes { path: PathBuf, source: io::Error },

    /// A link directory exists but could not be listed.
    #[error("unable to list links under {}: {source}", .path.display())]
    ListLinks { path: PathBuf, source: io::Error },

    /// Neither io_links nor p2p_links could be listed for a node.
    #[error("unable to list io_links and p2p_links for node {node}")]
    NoLinkListing { node: String },

    /// A properties record could not be read.
    #[error("unable to read properties at {}: {source}", .path.display())]
    ReadProperties { path: PathBuf, source: io::Error },

    /// A field matched but its value is not a valid integer.
    #[error("invalid value {value:?} for property pattern `{pattern}`: {source}")]
    ParseField {
        pattern: String,
        value: String,
        source: ParseIntError,
    },
}

/// The two kinds of link directories a node may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Links through the IO fabric (`io_links`).
    Io,
    /// Peer-to-peer links (`p2p_links`).
    P2p,
}

impl LinkKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            LinkKind::Io => "io_links",
            LinkKind::P2p => "p2p_links",
        }
    }
}

/// Read access to a KFD-shaped topology tree.
#[cfg_attr(test, automock(type Entry = String;))]
pub trait TopologySource {
    /// Handle for a node or link entry.
    type Entry: fmt::Debug;

    /// Lists the node entries. Failure here is fatal to the whole scan.
    fn nodes(&self) -> Result<Vec<Self::Entry>, TopologyError>;

    /// Lists the link entries of `kind` under `node`. A node without such
    /// links yields an empty list.
    fn links(&self, node: &Self::Entry, kind: LinkKind) -> Result<Vec<Self::Entry>, TopologyError>;

    /// Returns the raw `properties` record of a node or link entry.
    fn properties(&self, entry: &Self::Entry) -> Result<String, TopologyError>;
}

/// Extracts integer fields from a `key value` properties record.
///
/// Each line is matched against every pattern; when a pattern matches more
/// than one line the last match wins. Fields that never match read as 0.
pub fn read_fields<const N: usize>(
    text: &str,
    patterns: [&Regex; N],
) -> Result<[u32; N], TopologyError> {
    let mut values = [0; N];
    for line in text.lines() {
        for (value, pattern) in values.iter_mut().zip(patterns) {
            let Some(captures) = pattern.captures(line) else {
                continue;
            };
            let raw = &captures[1];
            *value = raw.parse().map_err(|source| TopologyError::ParseField {
                pattern: pattern.as_str().to_string(),
                value: raw.to_string(),
                source,
            })?;
        }
    }
    Ok(values)
}

/// The topology as published by the kernel under a sysfs directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new(DEFAULT_TOPOLOGY_ROOT)
    }
}

/// Lists the entries of `dir` whose names start with a digit, in name order.
fn numbered_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let numbered = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(|c: char| c.is_ascii_digit()));
        if numbered {
            entries.push(entry.path());
        }
    }
    entries.sort();
    Ok(entries)
}

impl TopologySource for SysfsTopology {
    type Entry = PathBuf;

    fn nodes(&self) -> Result<Vec<PathBuf>, TopologyError> {
        numbered_entries(&self.root).map_err(|source| TopologyError::ListNodes {
            path: self.root.clone(),
            source,
        })
    }

    fn links(&self, node: &PathBuf, kind: LinkKind) -> Result<Vec<PathBuf>, TopologyError> {
        let dir = node.join(kind.dir_name());
        match numbered_entries(&dir) {
            Ok(entries) => Ok(entries),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(TopologyError::ListLinks { path: dir, source }),
        }
    }

    fn properties(&self, entry: &PathBuf) -> Result<String, TopologyError> {
        let path = entry.join("properties");
        fs::read_to_string(&path).map_err(|source| TopologyError::ReadProperties { path, source })
    }
}

/// Builds the weight table over `devices` from the topology in `source`.
///
/// Only nodes with a positive `drm_render_minor` are scanned; CPU nodes and
/// disabled partitions are skipped along with their links. A link counts only
/// when both endpoints are among `devices`. If several records describe the
/// same pair, the last one scanned wins.
///
/// Unreadable or malformed records skip that node or link. Failing to list the
/// nodes, or both link directories of a node, fails the whole read.
pub fn fetch_all_pair_weights<S: TopologySource>(
    source: &S,
    devices: &[&Device],
) -> Result<PairWeights, TopologyError> {
    let mut weights = PairWeights::new();
    if devices.is_empty() {
        tracing::debug!("no candidate devices; skipping topology scan");
        return Ok(weights);
    }

    let node_ids: HashSet<u32> = devices.iter().map(|dev| dev.node_id).collect();
    for node in source.nodes()? {
        let render_minor = source
            .properties(&node)
            .and_then(|text| read_fields(&text, [&*DRM_RENDER_MINOR]));
        match render_minor {
            Ok([minor]) if minor > 0 => {}
            Ok(_) => {
                tracing::debug!(node = ?node, "skipping topology node without a render minor");
                continue;
            }
            Err(err) => {
                tracing::debug!(node = ?node, "skipping topology node: {}", err);
                continue;
            }
        }
        scan_peer_weights(source, &node, devices, &node_ids, &mut weights)?;
    }
    Ok(weights)
}

fn scan_peer_weights<S: TopologySource>(
    source: &S,
    node: &S::Entry,
    devices: &[&Device],
    node_ids: &HashSet<u32>,
    weights: &mut PairWeights,
) -> Result<(), TopologyError> {
    let links = match (
        source.links(node, LinkKind::Io),
        source.links(node, LinkKind::P2p),
    ) {
        (Err(io_err), Err(p2p_err)) => {
            tracing::warn!(node = ?node, "unable to list links: {}; {}", io_err, p2p_err);
            return Err(TopologyError::NoLinkListing {
                node: format!("{:?}", node),
            });
        }
        (Ok(mut io_links), Ok(p2p_links)) => {
            io_links.extend(p2p_links);
            io_links
        }
        (Ok(links), Err(err)) | (Err(err), Ok(links)) => {
            tracing::debug!(node = ?node, "partial link listing: {}", err);
            links
        }
    };

    for link in links {
        let fields = source
            .properties(&link)
            .and_then(|text| read_fields(&text, [&*NODE_FROM, &*NODE_TO, &*LINK_TYPE]));
        let [node_from, node_to, link_type] = match fields {
            Ok(fields) => fields,
            Err(err) => {
                tracing::debug!(link = ?link, "skipping link: {}", err);
                continue;
            }
        };

        let (from, to) = canonical_pair(node_from, node_to);
        if !node_ids.contains(&from) || !node_ids.contains(&to) {
            continue;
        }
        let (Some(from_dev), Some(to_dev)) = (find_by_node(devices, from), find_by_node(devices, to))
        else {
            continue;
        };
        weights.insert(from, to, pair_weight(from_dev, to_dev, LinkType::from(link_type)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::test_utils::MemoryTopology;

    fn devices() -> Vec<Device> {
        vec![
            Device::new("gpu-a", 2, 0, 0x74a1),
            Device::new("gpu-b", 3, 0, 0x74a1),
            Device::new("gpu-c", 4, 1, 0x74a1),
            Device::new("gpu-d", 5, 1, 0x74b5),
        ]
    }

    #[test]
    fn test_read_fields() {
        let text = "type 11\nversion_major 0\nnode_from 2\nnode_to 5\nweight 15\n";
        let values = read_fields(text, [&*NODE_FROM, &*NODE_TO, &*LINK_TYPE]).unwrap();
        assert_eq!(values, [2, 5, 11]);
    }

    #[test]
    fn test_read_fields_missing_reads_zero() {
        let text = "cpu_cores_count 64\nsimd_count 0\n";
        assert_eq!(read_fields(text, [&*DRM_RENDER_MINOR]).unwrap(), [0]);
    }

    #[test]
    fn test_read_fields_last_match_wins() {
        let text = "node_from 2\nnode_from 7\n";
        assert_eq!(read_fields(text, [&*NODE_FROM]).unwrap(), [7]);
    }

    #[test]
    fn test_read_fields_overflow_is_error() {
        let text = "node_from 99999999999\n";
        let err = read_fields(text, [&*NODE_FROM]).unwrap_err();
        assert!(matches!(err, TopologyError::ParseField { .. }), "{err}");
    }

    #[test]
    fn test_weights_from_memory_topology() {
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        let mut topo = MemoryTopology::new();
        topo.gpu_node(2, 128)
            .gpu_node(3, 129)
            .gpu_node(4, 130)
            .gpu_node(5, 131)
            .link(2, 3, LinkType::XGMI_CODE)
            .link(3, 2, LinkType::XGMI_CODE)
            .link(2, 4, LinkType::PCIE_CODE)
            .link(5, 3, 7);

        let weights = fetch_all_pair_weights(&topo, &refs).unwrap();
        assert_eq!(weights.len(), 3);
        assert_eq!(weights.get(2, 3), Some(1 + 2 + 7));
        assert_eq!(weights.get(2, 4), Some(1 + 10 + 11));
        assert_eq!(weights.get(3, 5), Some(3 + 30 + 11));
        assert_eq!(weights.get(4, 5), None);
    }

    #[test]
    fn test_cpu_nodes_are_not_scanned() {
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        let mut topo = MemoryTopology::new();
        // Node 2 reports no render minor, so its links are ignored even
        // though both endpoints are candidates.
        topo.cpu_node(2)
            .gpu_node(3, 129)
            .link(2, 3, LinkType::XGMI_CODE)
            .link(3, 4, LinkType::XGMI_CODE);

        let weights = fetch_all_pair_weights(&topo, &refs).unwrap();
        assert_eq!(weights.get(2, 3), None);
        assert_eq!(weights.get(3, 4), Some(1 + 2 + 11));
    }

    #[test]
    fn test_links_outside_candidates_are_ignored() {
        let devices = devices();
        let refs: Vec<&Device> = devices[..2].iter().collect();
        let mut topo = MemoryTopology::new();
        topo.gpu_node(2, 128)
            .link(2, 3, LinkType::XGMI_CODE)
            .link(2, 4, LinkType::XGMI_CODE)
            .link(2, 0, LinkType::PCIE_CODE);

        let weights = fetch_all_pair_weights(&topo, &refs).unwrap();
        assert_eq!(weights.len(), 1);
        assert_eq!(weights.get(2, 3), Some(10));
    }

    #[test]
    fn test_last_record_for_a_pair_wins() {
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        let mut topo = MemoryTopology::new();
        topo.gpu_node(2, 128)
            .link(2, 3, LinkType::PCIE_CODE)
            .p2p_link(2, 3, LinkType::XGMI_CODE);

        let weights = fetch_all_pair_weights(&topo, &refs).unwrap();
        assert_eq!(weights.get(2, 3), Some(1 + 2 + 7));
    }

    #[test]
    fn test_bad_records_are_skipped() {
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        let mut topo = MemoryTopology::new();
        topo.gpu_node(2, 128)
            .unreadable_link(2)
            .raw_link(2, "type 11\nnode_from 2\nnode_to 99999999999\n")
            .link(2, 3, LinkType::XGMI_CODE)
            .unreadable_node(4)
            .gpu_node(5, 131)
            .link(5, 4, LinkType::XGMI_CODE);

        let weights = fetch_all_pair_weights(&topo, &refs).unwrap();
        assert_eq!(weights.get(2, 3), Some(10));
        assert_eq!(weights.get(4, 5), Some(3 + 2 + 7));
        assert_eq!(weights.len(), 2);
    }

    #[test]
    fn test_empty_candidates_skip_the_scan() {
        // The mock has no expectations, so any call would panic.
        let source = MockTopologySource::new();
        let weights = fetch_all_pair_weights(&source, &[]).unwrap();
        assert!(weights.is_empty());
    }

    #[test]
    fn test_node_listing_failure_is_fatal() {
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        let mut source = MockTopologySource::new();
        source.expect_nodes().times(1).returning(|| {
            Err(TopologyError::ListNodes {
                path: PathBuf::from("/nonexistent"),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            })
        });

        let err = fetch_all_pair_weights(&source, &refs).unwrap_err();
        assert!(matches!(err, TopologyError::ListNodes { .. }), "{err}");
    }

    #[test]
    fn test_link_listing_failure() {
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        let mut source = MockTopologySource::new();
        source.expect_nodes().returning(|| Ok(vec!["2".to_string()]));
        source
            .expect_properties()
            .returning(|_| Ok("drm_render_minor 128\n".to_string()));
        source.expect_links().returning(|node, kind| {
            Err(TopologyError::ListLinks {
                path: PathBuf::from(node).join(kind.dir_name()),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            })
        });

        let err = fetch_all_pair_weights(&source, &refs).unwrap_err();
        assert!(matches!(err, TopologyError::NoLinkListing { .. }), "{err}");
    }

    #[test]
    fn test_one_link_listing_failure_is_tolerated() {
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        let mut source = MockTopologySource::new();
        source.expect_nodes().returning(|| Ok(vec!["2".to_string()]));
        source.expect_links().returning(|node, kind| match kind {
            LinkKind::Io => Ok(vec![format!("{node}/io_links/0")]),
            LinkKind::P2p => Err(TopologyError::ListLinks {
                path: PathBuf::from(node).join(kind.dir_name()),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            }),
        });
        source.expect_properties().returning(|entry| {
            if entry.contains("io_links") {
                Ok("type 11\nnode_from 2\nnode_to 3\n".to_string())
            } else {
                Ok("drm_render_minor 128\n".to_string())
            }
        });

        let weights = fetch_all_pair_weights(&source, &refs).unwrap();
        assert_eq!(weights.get(2, 3), Some(10));
    }

    #[test]
    fn test_sysfs_topology() {
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        let mut topo = MemoryTopology::new();
        topo.cpu_node(0)
            .gpu_node(2, 128)
            .gpu_node(3, 129)
            .link(0, 2, LinkType::PCIE_CODE)
            .link(2, 3, LinkType::XGMI_CODE)
            .p2p_link(3, 4, LinkType::PCIE_CODE);
        let dir = TempDir::new().unwrap();
        topo.write_sysfs(dir.path()).unwrap();

        let sysfs = SysfsTopology::new(dir.path());
        assert_eq!(sysfs.nodes().unwrap().len(), 3);
        let weights = fetch_all_pair_weights(&sysfs, &refs).unwrap();
        assert_eq!(weights.len(), 2);
        assert_eq!(weights.get(2, 3), Some(10));
        assert_eq!(weights.get(3, 4), Some(1 + 10 + 11));
    }

    #[test]
    fn test_sysfs_ignores_non_numbered_entries() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("2/io_links/0")).unwrap();
        fs::create_dir_all(dir.path().join("generation_id")).unwrap();
        fs::create_dir_all(dir.path().join("2/io_links/stale")).unwrap();

        let sysfs = SysfsTopology::new(dir.path());
        let nodes = sysfs.nodes().unwrap();
        assert_eq!(nodes, vec![dir.path().join("2")]);
        let links = sysfs.links(&nodes[0], LinkKind::Io).unwrap();
        assert_eq!(links, vec![dir.path().join("2/io_links/0")]);
        // No p2p_links directory at all.
        assert!(sysfs.links(&nodes[0], LinkKind::P2p).unwrap().is_empty());
    }

    #[test]
    fn test_sysfs_missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let sysfs = SysfsTopology::new(dir.path().join("missing"));
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        let err = fetch_all_pair_weights(&sysfs, &refs).unwrap_err();
        assert!(matches!(err, TopologyError::ListNodes { .. }), "{err}");
    }

    #[test]
    fn test_default_root() {
        assert_eq!(
            SysfsTopology::default().root(),
            Path::new("/sys/class/kfd/kfd/topology/nodes")
        );
    }
}
