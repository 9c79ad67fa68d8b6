/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Topology-aware GPU allocation.
//!
//! Given the GPUs available on a node, this crate picks the subset of a
//! requested size whose members are best connected to each other, optionally
//! pinning devices that must be part of the result. Connectivity comes from
//! the KFD topology published under `/sys/class/kfd/kfd/topology/nodes`:
//!
//! - [`topology`] reads link records and scores each device pair with
//!   [`weights::pair_weight`].
//! - [`subsets`] enumerates every subset of the requested size with its total
//!   pair weight.
//! - [`policy`] filters and picks the winner.
//!
//! ```no_run
//! use device_allocator::BestEffortPolicy;
//! use device_allocator::Device;
//! use device_allocator::Policy;
//!
//! let devices = vec![
//!     Device::new("gpu-0", 2, 0, 0x74a1),
//!     Device::new("gpu-1", 3, 0, 0x74a1),
//!     Device::new("gpu-2", 4, 1, 0x74a1),
//! ];
//! let available: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
//! let picked = BestEffortPolicy::new().allocate(&available, &[], 2, &devices);
//! assert!(picked.is_empty() || picked.len() == 2);
//! ```

pub mod config;
pub mod device;
pub mod policy;
pub mod subsets;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod topology;
pub mod weights;

pub use config::AllocatorConfig;
pub use config::Selection;
pub use device::Device;
pub use policy::AllocationError;
pub use policy::BestEffortPolicy;
pub use policy::Policy;
pub use topology::SysfsTopology;
pub use topology::TopologyError;
pub use topology::TopologySource;
