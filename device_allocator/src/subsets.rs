/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Enumeration of fixed-size device subsets.
//!
//! Subsets are built level by level over the candidate node ids, normally in
//! ascending order (see [`CandidateOrder`]). A subset is only ever extended with ids positioned after the last
//! one it took, so each combination is produced exactly once and a prefix's
//! weight is computed once for all of its extensions.
//!
//! The search is exhaustive: time and space are O(C(n, k) * k) for `n`
//! candidates and subsets of size `k`. That is fine for the handful of GPUs
//! on one machine (C(16, 8) = 12870) but grows quickly past a few dozen
//! devices.

use crate::device::Device;
use crate::weights::PairWeights;

/// Order in which candidate node ids are laid out before enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CandidateOrder {
    /// Ascending node id.
    #[default]
    Ascending,
    /// The order the devices were listed in, keeping the first occurrence of
    /// a repeated node.
    AsListed,
}

/// A candidate subset of topology nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSet {
    /// Node ids in candidate-list order; strictly ascending under
    /// [`CandidateOrder::Ascending`].
    pub ids: Vec<u32>,
    /// Sum of the pair weights over every pair in `ids`.
    pub total_weight: u32,
    /// Pairs in `ids` without an entry in the weight table. They add
    /// nothing to `total_weight`.
    pub unlinked_pairs: usize,
    /// Position of the last id of `ids` in the candidate list.
    pub last_idx: usize,
}

impl DeviceSet {
    fn singleton(id: u32, idx: usize) -> Self {
        Self {
            ids: vec![id],
            total_weight: 0,
            unlinked_pairs: 0,
            last_idx: idx,
        }
    }

    /// Returns a new set extended with `id`, found at `idx` in the candidate
    /// list.
    fn extend(&self, id: u32, idx: usize, weights: &PairWeights) -> Self {
        let mut total_weight = self.total_weight;
        let mut unlinked_pairs = self.unlinked_pairs;
        for &member in &self.ids {
            match weights.get(member, id) {
                Some(weight) => total_weight += weight,
                None => unlinked_pairs += 1,
            }
        }
        let mut ids = Vec::with_capacity(self.ids.len() + 1);
        ids.extend_from_slice(&self.ids);
        ids.push(id);
        Self {
            ids,
            total_weight,
            unlinked_pairs,
            last_idx: idx,
        }
    }

    /// Whether every id in `required` is part of this set.
    pub fn contains_all(&self, required: &[u32]) -> bool {
        required.len() <= self.ids.len()
            && required
                .iter()
                .all(|id| self.ids.contains(id))
    }
}

/// Returns every subset of `size` devices from `available`, in enumeration
/// order, each annotated with its total pair weight.
///
/// Node ids are sorted and deduplicated first, so a device listed twice is
/// still only used once. Returns nothing when `size` is 0 or exceeds the
/// number of distinct candidates.
pub fn all_device_subsets(
    available: &[&Device],
    size: usize,
    weights: &PairWeights,
) -> Vec<DeviceSet> {
    all_device_subsets_in(available, size, weights, CandidateOrder::Ascending)
}

/// Like [`all_device_subsets`], with candidates laid out in `order`.
pub fn all_device_subsets_in(
    available: &[&Device],
    size: usize,
    weights: &PairWeights,
    order: CandidateOrder,
) -> Vec<DeviceSet> {
    if size == 0 || available.len() < size {
        return Vec::new();
    }

    let mut ids: Vec<u32> = Vec::with_capacity(available.len());
    match order {
        CandidateOrder::Ascending => {
            ids.extend(available.iter().map(|dev| dev.node_id));
            ids.sort_unstable();
            ids.dedup();
        }
        CandidateOrder::AsListed => {
            for dev in available {
                if !ids.contains(&dev.node_id) {
                    ids.push(dev.node_id);
                }
            }
        }
    }
    if ids.len() < size {
        return Vec::new();
    }

    let mut level: Vec<DeviceSet> = ids
        .iter()
        .enumerate()
        .map(|(idx, &id)| DeviceSet::singleton(id, idx))
        .collect();
    for _ in 1..size {
        level = level
            .iter()
            .flat_map(|subset| {
                ids.iter()
                    .enumerate()
                    .skip(subset.last_idx + 1)
                    .map(move |(idx, &id)| subset.extend(id, idx, weights))
            })
            .collect();
    }
    level
}
