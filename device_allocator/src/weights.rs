/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Pairwise interconnect weights between devices.
//!
//! Lower weight means a more desirable pairing. The constants are a fixed
//! heuristic: existing placements were made with these exact values, so they
//! are not exposed through configuration.

use std::collections::HashMap;

use crate::device::Device;

// ==== PAIR WEIGHT CONSTANTS ====
//
// A pair's weight is the sum of three terms:
//
// - Hardware: SAME_DEV_ID_WEIGHT (1) when both devices report the same
//   `dev_id`, otherwise DIFFERENT_DEV_ID_WEIGHT (3).
//
// - Link: XGMI_LINK_WEIGHT (2) for a direct XGMI link, PCIE_LINK_WEIGHT (10)
//   for a PCIe link, OTHER_LINK_WEIGHT (30) for anything else. Unknown link
//   types usually mean an indirect path.
//
// - NUMA: SAME_NUMA_WEIGHT (7) when both devices share a NUMA domain,
//   otherwise CROSS_NUMA_WEIGHT (11).

pub const SAME_DEV_ID_WEIGHT: u32 = 1;
pub const DIFFERENT_DEV_ID_WEIGHT: u32 = 3;
pub const XGMI_LINK_WEIGHT: u32 = 2;
pub const PCIE_LINK_WEIGHT: u32 = 10;
pub const OTHER_LINK_WEIGHT: u32 = 30;
pub const SAME_NUMA_WEIGHT: u32 = 7;
pub const CROSS_NUMA_WEIGHT: u32 = 11;

/// Link type codes reported in the `type` field of a KFD link record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// PCIe (code 2).
    Pcie,
    /// XGMI (code 11).
    Xgmi,
    /// Any other code, including 0 when the field is absent.
    Other(u32),
}

impl LinkType {
    pub const PCIE_CODE: u32 = 2;
    pub const XGMI_CODE: u32 = 11;

    pub fn weight(&self) -> u32 {
        match self {
            LinkType::Xgmi => XGMI_LINK_WEIGHT,
            LinkType::Pcie => PCIE_LINK_WEIGHT,
            LinkType::Other(_) => OTHER_LINK_WEIGHT,
        }
    }
}

impl From<u32> for LinkType {
    fn from(code: u32) -> Self {
        match code {
            Self::PCIE_CODE => LinkType::Pcie,
            Self::XGMI_CODE => LinkType::Xgmi,
            other => LinkType::Other(other),
        }
    }
}

/// Weight of directly connecting `from` and `to` over a link of `link_type`.
pub fn pair_weight(from: &Device, to: &Device, link_type: LinkType) -> u32 {
    let hardware = if from.dev_id == to.dev_id {
        SAME_DEV_ID_WEIGHT
    } else {
        DIFFERENT_DEV_ID_WEIGHT
    };
    let numa = if from.numa_node == to.numa_node {
        SAME_NUMA_WEIGHT
    } else {
        CROSS_NUMA_WEIGHT
    };
    hardware + link_type.weight() + numa
}

/// Orders a pair of node ids so the smaller one comes first.
pub fn canonical_pair(a: u32, b: u32) -> (u32, u32) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Weights between pairs of topology nodes.
///
/// Every unordered pair is stored once under `(min, max)`; both `insert` and
/// `get` canonicalize, so callers may pass endpoints in either order. A pair
/// without an entry has no known direct link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairWeights {
    weights: HashMap<u32, HashMap<u32, u32>>,
}

impl PairWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the weight for `(a, b)`, replacing any previous value.
    pub fn insert(&mut self, a: u32, b: u32, weight: u32) {
        let (from, to) = canonical_pair(a, b);
        self.weights.entry(from).or_default().insert(to, weight);
    }

    pub fn get(&self, a: u32, b: u32) -> Option<u32> {
        let (from, to) = canonical_pair(a, b);
        self.weights.get(&from)?.get(&to).copied()
    }

    /// Number of pairs with a known weight.
    pub fn len(&self) -> usize {
        self.weights.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
