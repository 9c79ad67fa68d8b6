/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Allocator configuration.
//!
//! Only where the topology is read from and how the winning subset is picked
//! are configurable. Pair weights are fixed in [`crate::weights`].

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::topology::DEFAULT_TOPOLOGY_ROOT;

/// Environment variable overriding [`AllocatorConfig::topology_root`].
pub const TOPOLOGY_ROOT_ENV: &str = "DEVICE_ALLOCATOR_TOPOLOGY_ROOT";
/// Environment variable overriding [`AllocatorConfig::selection`].
pub const SELECTION_ENV: &str = "DEVICE_ALLOCATOR_SELECTION";

/// How the allocator picks among subsets that satisfy a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// The subset with the lowest total weight. Ties go to the subset
    /// enumerated first.
    #[default]
    Minimum,
    /// The last subset that contains every required device, whatever its
    /// weight, with candidates enumerated in the order `available_ids` lists
    /// them. Matches placements made by earlier versions of the allocator.
    LastQualifying,
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Minimum => write!(f, "minimum"),
            Selection::LastQualifying => write!(f, "last_qualifying"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown selection {0:?}; expected \"minimum\" or \"last_qualifying\"")]
pub struct ParseSelectionError(String);

impl FromStr for Selection {
    type Err = ParseSelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimum" => Ok(Selection::Minimum),
            "last_qualifying" => Ok(Selection::LastQualifying),
            _ => Err(ParseSelectionError(s.to_string())),
        }
    }
}

/// Configuration for [`crate::policy::BestEffortPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Directory holding one entry per KFD topology node.
    pub topology_root: PathBuf,
    /// Selection among qualifying subsets.
    pub selection: Selection,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            topology_root: PathBuf::from(DEFAULT_TOPOLOGY_ROOT),
            selection: Selection::default(),
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or invalid.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(root) = lookup(TOPOLOGY_ROOT_ENV).filter(|root| !root.is_empty()) {
            config.topology_root = PathBuf::from(root);
        }

        if let Some(val) = lookup(SELECTION_ENV) {
            match val.parse() {
                Ok(selection) => config.selection = selection,
                Err(err) => {
                    tracing::error!(
                        "failed to override selection from ${}: {}; using {}",
                        SELECTION_ENV,
                        err,
                        config.selection
                    );
                }
            }
        }

        config
    }

    pub fn with_topology_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.topology_root = root.into();
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }
}
