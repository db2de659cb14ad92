// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Placement plan handed out by the cluster scheduler.
//!
//! Scheduling itself happens elsewhere; this module only models its output:
//! one [`PlacementGroup`] per node, each exposing a number of allocatable
//! device slots ("bundles").

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::Result;

/// One node's worth of device slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementGroup {
    pub bundle_count: usize,
}

impl PlacementGroup {
    pub fn new(bundle_count: usize) -> Self {
        Self { bundle_count }
    }
}

/// The device slots of one tensor-parallel replica: which node, and which
/// local bundle indices on that node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Getters)]
pub struct BundleAssignment {
    node_index: usize,
    local_bundle_indices: Vec<usize>,
}

impl BundleAssignment {
    pub fn new(node_index: usize, local_bundle_indices: Vec<usize>) -> Self {
        Self {
            node_index,
            local_bundle_indices,
        }
    }

    /// Number of workers tied together by this assignment.
    pub fn group_size(&self) -> usize {
        self.local_bundle_indices.len()
    }

    /// First local bundle index, if the assignment is non-empty.
    pub fn first_local_index(&self) -> Option<usize> {
        self.local_bundle_indices.first().copied()
    }
}

/// A set of nodes and how many worker groups may share each device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualCluster {
    placement_groups: Vec<PlacementGroup>,
    max_colocated_worker_groups: usize,
}

impl VirtualCluster {
    /// Build a cluster from per-node bundle counts.
    pub fn new(bundle_counts: impl IntoIterator<Item = usize>) -> Self {
        Self {
            placement_groups: bundle_counts.into_iter().map(PlacementGroup::new).collect(),
            max_colocated_worker_groups: 1,
        }
    }

    /// Allow this many worker groups (e.g. trainer and generator) to share
    /// each device. Must be at least one.
    pub fn with_max_colocated_worker_groups(mut self, count: usize) -> Result<Self> {
        if count == 0 {
            crate::raise!("max_colocated_worker_groups must be at least 1");
        }
        self.max_colocated_worker_groups = count;
        Ok(self)
    }

    pub fn placement_groups(&self) -> &[PlacementGroup] {
        &self.placement_groups
    }

    pub fn node_count(&self) -> usize {
        self.placement_groups.len()
    }

    /// Total bundles across every node.
    pub fn world_size(&self) -> usize {
        self.placement_groups.iter().map(|pg| pg.bundle_count).sum()
    }

    /// Fraction of a device each worker may claim.
    pub fn resource_share_per_worker(&self) -> f64 {
        1.0 / self.max_colocated_worker_groups as f64
    }
}
