// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Resource request, environment and seed for one generation worker.

use std::collections::BTreeMap;

use genfleet_runtime::BundleAssignment;
use serde::{Deserialize, Serialize};

/// Seeds of different nodes are this far apart.
pub const SEED_NODE_STRIDE: u64 = 1024;

pub const NOSET_VISIBLE_DEVICES_ENV: &str = "RAY_EXPERIMENTAL_NOSET_CUDA_VISIBLE_DEVICES";
pub const ENGINE_MULTIPROCESSING_ENV: &str = "VLLM_ENABLE_V1_MULTIPROCESSING";
pub const SKIP_P2P_CHECK_ENV: &str = "VLLM_SKIP_P2P_CHECK";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub num_gpus: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitArgs {
    pub bundle_indices: Option<Vec<usize>>,
    pub seed: Option<u64>,
    /// Device share handed to the engine when the runtime binds devices itself.
    pub fraction_of_gpus: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResourceRequest {
    pub resources: Resources,
    pub env: BTreeMap<String, String>,
    pub init: InitArgs,
}

impl WorkerResourceRequest {
    /// Device share the engine should assume, wherever it was placed.
    pub fn device_share(&self) -> f64 {
        self.init.fraction_of_gpus.unwrap_or(self.resources.num_gpus)
    }
}

/// `node * SEED_NODE_STRIDE + first_local_index / group_size`. Every member of
/// a tied group yields the same value.
pub fn tied_group_seed(assignment: &BundleAssignment) -> Option<u64> {
    let first = assignment.first_local_index()? as u64;
    let group_size = assignment.group_size() as u64;
    Some(*assignment.node_index() as u64 * SEED_NODE_STRIDE + first / group_size)
}

/// Plan one worker. `assignment` is present only for the owner of a tied
/// group.
pub fn configure_worker(
    num_gpus: f64,
    assignment: Option<&BundleAssignment>,
) -> WorkerResourceRequest {
    let mut request = WorkerResourceRequest {
        resources: Resources { num_gpus },
        env: BTreeMap::new(),
        init: InitArgs::default(),
    };

    if let Some(assignment) = assignment {
        request.init.bundle_indices = Some(assignment.local_bundle_indices().clone());
        request.init.seed = tied_group_seed(assignment);

        if assignment.group_size() > 1 {
            // the engine binds devices for multi-device groups itself
            request.resources.num_gpus = 0.0;
            request
                .env
                .insert(NOSET_VISIBLE_DEVICES_ENV.to_string(), "1".to_string());
            request.init.fraction_of_gpus = Some(num_gpus);
        }
    }

    request
        .env
        .insert(ENGINE_MULTIPROCESSING_ENV.to_string(), "0".to_string());
    request
        .env
        .insert(SKIP_P2P_CHECK_ENV.to_string(), "1".to_string());
    request
}
