/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Topology-aware allocation of device subsets.
//!
//! [`BestEffortPolicy`] picks, among every subset of the requested size that
//! includes the required devices, the one whose members are best connected
//! to each other.

use crate::config::AllocatorConfig;
use crate::config::Selection;
use crate::device::Device;
use crate::device::find_by_node;
use crate::device::resolve_ids;
use crate::subsets::DeviceSet;
use crate::subsets::CandidateOrder;
use crate::subsets::all_device_subsets_in;
use crate::topology::SysfsTopology;
use crate::topology::TopologyError;
use crate::topology::TopologySource;
use crate::topology::fetch_all_pair_weights;

/// Picks devices for an allocation request.
pub trait Policy {
    /// Returns exactly `size` ids drawn from `available_ids` and including
    /// every known id in `required_ids`, or an empty vector when no such
    /// allocation exists.
    fn allocate(
        &self,
        available_ids: &[String],
        required_ids: &[String],
        size: usize,
        devices: &[Device],
    ) -> Vec<String>;
}

/// Reasons an allocation request produced no devices.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// The request cannot be satisfied whatever the topology.
    #[error(
        "invalid request: size {size} with {available} available and {required} required devices"
    )]
    InvalidRequest {
        size: usize,
        available: usize,
        required: usize,
    },

    /// The topology could not be read.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// No subset of the requested size contains every required device.
    #[error("no subset of {size} devices contains required nodes {required:?}")]
    NoSolution { size: usize, required: Vec<u32> },
}

impl AllocationError {
    /// Short, stable reason code for logs.
    pub fn reason(&self) -> &'static str {
        match self {
            AllocationError::InvalidRequest { .. } => "invalid_request",
            AllocationError::Topology(_) => "topology",
            AllocationError::NoSolution { .. } => "no_solution",
        }
    }
}

/// Exhaustively searches for the best connected subset of devices.
///
/// Each call reads a fresh topology snapshot; nothing is cached between
/// calls. The policy has no notion of devices in use, so `available_ids`
/// must already exclude them.
#[derive(Debug, Clone)]
pub struct BestEffortPolicy<S = SysfsTopology> {
    source: S,
    selection: Selection,
}

impl BestEffortPolicy<SysfsTopology> {
    /// A policy reading the kernel's topology with default settings.
    pub fn new() -> Self {
        Self::from_config(&AllocatorConfig::default())
    }

    pub fn from_config(config: &AllocatorConfig) -> Self {
        Self::with_source(SysfsTopology::new(config.topology_root.clone()))
            .with_selection(config.selection)
    }
}

impl Default for BestEffortPolicy<SysfsTopology> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TopologySource> BestEffortPolicy<S> {
    pub fn with_source(source: S) -> Self {
        Self {
            source,
            selection: Selection::default(),
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Like [`Policy::allocate`], but says why nothing was allocated.
    ///
    /// Ids that match no entry in `devices` are dropped (and logged) rather
    /// than rejected. The returned ids are ordered by topology node, except
    /// under [`Selection::LastQualifying`], which keeps the order of
    /// `available_ids`.
    #[tracing::instrument(level = "debug", skip_all, fields(size = size, selection = %self.selection))]
    pub fn try_allocate(
        &self,
        available_ids: &[String],
        required_ids: &[String],
        size: usize,
        devices: &[Device],
    ) -> Result<Vec<String>, AllocationError> {
        if size == 0
            || available_ids.len() < size
            || required_ids.len() > size
            || required_ids.len() > available_ids.len()
        {
            return Err(AllocationError::InvalidRequest {
                size,
                available: available_ids.len(),
                required: required_ids.len(),
            });
        }

        let (available, unknown) = resolve_ids(devices, available_ids);
        if !unknown.is_empty() {
            tracing::warn!(ids = ?unknown, "dropping unknown available device ids");
        }
        let (required, unknown) = resolve_ids(devices, required_ids);
        if !unknown.is_empty() {
            tracing::warn!(ids = ?unknown, "dropping unknown required device ids");
        }

        let weights = fetch_all_pair_weights(&self.source, &available)?;
        let order = match self.selection {
            Selection::Minimum => CandidateOrder::Ascending,
            Selection::LastQualifying => CandidateOrder::AsListed,
        };
        let subsets = all_device_subsets_in(&available, size, &weights, order);

        let mut required_nodes: Vec<u32> = required.iter().map(|dev| dev.node_id).collect();
        required_nodes.sort_unstable();
        required_nodes.dedup();

        let best = select_subset(subsets, &required_nodes, self.selection).ok_or_else(|| {
            AllocationError::NoSolution {
                size,
                required: required_nodes.clone(),
            }
        })?;
        if best.unlinked_pairs > 0 {
            tracing::debug!(
                unlinked_pairs = best.unlinked_pairs,
                "selected subset has pairs without a known link"
            );
        }
        tracing::debug!(nodes = ?best.ids, weight = best.total_weight, "selected devices");

        Ok(best
            .ids
            .iter()
            .filter_map(|&node| find_by_node(&available, node))
            .map(|dev| dev.id.clone())
            .collect())
    }
}

impl<S: TopologySource> Policy for BestEffortPolicy<S> {
    fn allocate(
        &self,
        available_ids: &[String],
        required_ids: &[String],
        size: usize,
        devices: &[Device],
    ) -> Vec<String> {
        match self.try_allocate(available_ids, required_ids, size, devices) {
            Ok(ids) => ids,
            Err(err) => {
                tracing::info!(reason = err.reason(), size, "allocation refused: {}", err);
                Vec::new()
            }
        }
    }
}

/// Picks the winner among `subsets` that contain every node in `required`.
fn select_subset(
    subsets: Vec<DeviceSet>,
    required: &[u32],
    selection: Selection,
) -> Option<DeviceSet> {
    let qualifying = subsets
        .into_iter()
        .filter(|subset| subset.contains_all(required));
    match selection {
        // `min_by_key` keeps the first of equal minima.
        Selection::Minimum => qualifying.min_by_key(|subset| subset.total_weight),
        Selection::LastQualifying => qualifying.last(),
    }
}
