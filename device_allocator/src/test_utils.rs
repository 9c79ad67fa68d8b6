/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Topology fixtures for tests.
//!
//! [`MemoryTopology`] describes a KFD topology in memory. It can be read
//! directly as a [`TopologySource`] or written out as a sysfs-shaped directory
//! tree for [`crate::topology::SysfsTopology`].

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::topology::LinkKind;
use crate::topology::TopologyError;
use crate::topology::TopologySource;

/// A node in a [`MemoryTopology`]. `None` properties model a record that
/// cannot be read.
#[derive(Debug, Clone, Default)]
pub struct MemoryNode {
    pub properties: Option<String>,
    pub io_links: Vec<Option<String>>,
    pub p2p_links: Vec<Option<String>>,
}

impl MemoryNode {
    fn links(&self, kind: LinkKind) -> &[Option<String>] {
        match kind {
            LinkKind::Io => &self.io_links,
            LinkKind::P2p => &self.p2p_links,
        }
    }

    fn links_mut(&mut self, kind: LinkKind) -> &mut Vec<Option<String>> {
        match kind {
            LinkKind::Io => &mut self.io_links,
            LinkKind::P2p => &mut self.p2p_links,
        }
    }
}

/// Handle for an entry of a [`MemoryTopology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEntry {
    pub node: u32,
    pub link: Option<(LinkKind, usize)>,
}

/// An in-memory KFD topology. Nodes are listed in ascending node order.
#[derive(Debug, Clone, Default)]
pub struct MemoryTopology {
    nodes: BTreeMap<u32, MemoryNode>,
}

fn node_properties(render_minor: u32) -> String {
    format!(
        "cpu_cores_count 0\nsimd_count 304\nmem_banks_count 1\n\
         io_links_count 1\np2p_links_count 0\ngfx_target_version 90402\n\
         drm_render_minor {}\nnum_xcc 1\n",
        render_minor
    )
}

fn link_properties(from: u32, to: u32, link_type: u32) -> String {
    format!(
        "type {}\nversion_major 0\nversion_minor 0\nnode_from {}\nnode_to {}\n\
         weight 15\nmin_latency 0\nmax_latency 0\nmin_bandwidth 0\nmax_bandwidth 0\n",
        link_type, from, to
    )
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// A GPU or partition node with the given render minor.
    pub fn gpu_node(&mut self, node: u32, render_minor: u32) -> &mut Self {
        self.nodes.entry(node).or_default().properties = Some(node_properties(render_minor));
        self
    }

    /// A CPU node: its render minor is 0.
    pub fn cpu_node(&mut self, node: u32) -> &mut Self {
        self.nodes.entry(node).or_default().properties =
            Some("cpu_cores_count 64\nsimd_count 0\ndrm_render_minor 0\n".to_string());
        self
    }

    /// A node whose properties record cannot be read.
    pub fn unreadable_node(&mut self, node: u32) -> &mut Self {
        self.nodes.entry(node).or_default().properties = None;
        self
    }

    /// An `io_links` record on node `from`.
    pub fn link(&mut self, from: u32, to: u32, link_type: u32) -> &mut Self {
        self.push_link(from, LinkKind::Io, Some(link_properties(from, to, link_type)))
    }

    /// A `p2p_links` record on node `from`.
    pub fn p2p_link(&mut self, from: u32, to: u32, link_type: u32) -> &mut Self {
        self.push_link(from, LinkKind::P2p, Some(link_properties(from, to, link_type)))
    }

    /// An `io_links` record on `node` with arbitrary contents.
    pub fn raw_link(&mut self, node: u32, properties: &str) -> &mut Self {
        self.push_link(node, LinkKind::Io, Some(properties.to_string()))
    }

    /// An `io_links` record on `node` that cannot be read.
    pub fn unreadable_link(&mut self, node: u32) -> &mut Self {
        self.push_link(node, LinkKind::Io, None)
    }

    /// Links every ordered pair of `nodes` in both directions, as the kernel
    /// reports them.
    pub fn fully_linked(&mut self, nodes: &[u32], link_type: u32) -> &mut Self {
        for &from in nodes {
            for &to in nodes {
                if from != to {
                    self.link(from, to, link_type);
                }
            }
        }
        self
    }

    fn push_link(&mut self, node: u32, kind: LinkKind, properties: Option<String>) -> &mut Self {
        self.nodes
            .entry(node)
            .or_default()
            .links_mut(kind)
            .push(properties);
        self
    }

    /// Writes the topology as a sysfs-shaped tree rooted at `root`.
    /// Unreadable records become directories without a `properties` file.
    pub fn write_sysfs(&self, root: &Path) -> io::Result<()> {
        fn write_entry(dir: &Path, properties: &Option<String>) -> io::Result<()> {
            fs::create_dir_all(dir)?;
            if let Some(properties) = properties {
                fs::write(dir.join("properties"), properties)?;
            }
            Ok(())
        }

        for (id, node) in &self.nodes {
            let node_dir = root.join(id.to_string());
            write_entry(&node_dir, &node.properties)?;
            for kind in [LinkKind::Io, LinkKind::P2p] {
                for (idx, link) in node.links(kind).iter().enumerate() {
                    write_entry(&node_dir.join(kind.dir_name()).join(idx.to_string()), link)?;
                }
            }
        }
        Ok(())
    }

    fn node(&self, node: u32) -> Result<&MemoryNode, TopologyError> {
        self.nodes
            .get(&node)
            .ok_or_else(|| TopologyError::ReadProperties {
                path: node.to_string().into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
    }
}

impl TopologySource for MemoryTopology {
    type Entry = MemoryEntry;

    fn nodes(&self) -> Result<Vec<MemoryEntry>, TopologyError> {
        Ok(self
            .nodes
            .keys()
            .map(|&node| MemoryEntry { node, link: None })
            .collect())
    }

    fn links(&self, node: &MemoryEntry, kind: LinkKind) -> Result<Vec<MemoryEntry>, TopologyError> {
        let count = self.node(node.node)?.links(kind).len();
        Ok((0..count)
            .map(|idx| MemoryEntry {
                node: node.node,
                link: Some((kind, idx)),
            })
            .collect())
    }

    fn properties(&self, entry: &MemoryEntry) -> Result<String, TopologyError> {
        let node = self.node(entry.node)?;
        let properties = match entry.link {
            None => node.properties.as_ref(),
            Some((kind, idx)) => node.links(kind).get(idx).and_then(Option::as_ref),
        };
        properties
            .cloned()
            .ok_or_else(|| TopologyError::ReadProperties {
                path: format!("{:?}", entry).into(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            })
    }
}
