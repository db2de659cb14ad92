// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Genfleet Runtime
//!
//! The plumbing a generation fleet is built on: the placement plan a cluster
//! hands out ([`cluster`]), the data-parallel × tensor-parallel grid workers
//! are addressed by ([`sharding`]), the batched column container that flows
//! in and out of workers ([`batch`]), and the isolated worker actors that
//! calls are fanned out to ([`worker_group`]).

pub use anyhow::{
    anyhow as error, bail as raise, Context as ErrorContext, Error, Ok as OK, Result,
};

pub mod batch;
pub mod cluster;
pub mod config;
pub mod logging;
pub mod sharding;
pub mod worker_group;

pub use batch::{BatchedData, Column};
pub use cluster::{BundleAssignment, PlacementGroup, VirtualCluster};
pub use config::WorkerConfig;
pub use sharding::{Axis, ShardingLayout};
pub use tokio_util::sync::CancellationToken;
pub use worker_group::{Actor, WorkerGroup, WorkerSlot};
