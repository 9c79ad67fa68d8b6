/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Device records handed to the allocator by the discovery layer.

use serde::Deserialize;
use serde::Serialize;

/// A GPU or GPU partition as seen by the allocator.
///
/// Records are produced once per boot by device discovery and are never
/// mutated by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// External identifier used by callers.
    pub id: String,
    /// Node index of this device in the KFD topology tree.
    pub node_id: u32,
    /// NUMA domain the device is attached to.
    pub numa_node: i32,
    /// Hardware type identifier. Devices with equal `dev_id` are the same
    /// hardware model.
    pub dev_id: u32,
}

impl Device {
    pub fn new(id: impl Into<String>, node_id: u32, numa_node: i32, dev_id: u32) -> Self {
        Self {
            id: id.into(),
            node_id,
            numa_node,
            dev_id,
        }
    }
}

/// Resolves `ids` against `devices`, keeping the order of `ids`.
///
/// Returns the resolved devices together with the ids that matched nothing.
/// Unknown ids are dropped rather than rejected; the caller decides how loudly
/// to report them.
pub fn resolve_ids<'a>(devices: &'a [Device], ids: &[String]) -> (Vec<&'a Device>, Vec<String>) {
    let mut resolved = Vec::with_capacity(ids.len());
    let mut unknown = Vec::new();
    for id in ids {
        match devices.iter().find(|dev| &dev.id == id) {
            Some(dev) => resolved.push(dev),
            None => unknown.push(id.clone()),
        }
    }
    (resolved, unknown)
}

/// Finds the device sitting at topology node `node_id`.
pub fn find_by_node<'a>(devices: &[&'a Device], node_id: u32) -> Option<&'a Device> {
    devices.iter().copied().find(|dev| dev.node_id == node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<Device> {
        vec![
            Device::new("gpu-a", 2, 0, 0x74a1),
            Device::new("gpu-b", 3, 0, 0x74a1),
            Device::new("gpu-c", 4, 1, 0x74a1),
        ]
    }

    #[test]
    fn test_resolve_ids_keeps_request_order() {
        let devices = devices();
        let ids = vec!["gpu-c".to_string(), "gpu-a".to_string()];
        let (resolved, unknown) = resolve_ids(&devices, &ids);
        let names: Vec<&str> = resolved.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(names, vec!["gpu-c", "gpu-a"]);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_resolve_ids_reports_unknown() {
        let devices = devices();
        let ids = vec!["gpu-b".to_string(), "gpu-z".to_string()];
        let (resolved, unknown) = resolve_ids(&devices, &ids);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].node_id, 3);
        assert_eq!(unknown, vec!["gpu-z".to_string()]);
    }

    #[test]
    fn test_find_by_node() {
        let devices = devices();
        let refs: Vec<&Device> = devices.iter().collect();
        assert_eq!(find_by_node(&refs, 4).map(|d| d.id.as_str()), Some("gpu-c"));
        assert!(find_by_node(&refs, 7).is_none());
    }
}
