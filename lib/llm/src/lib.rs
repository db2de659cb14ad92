// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Genfleet LLM
//!
//! Runs a fleet of tensor-parallel vLLM engines as one logical generator.
//! Nodes are partitioned into tied groups ([`tied_groups`]), each group gets a
//! placement plan ([`placement`]) and one engine-owning worker
//! ([`generation::worker`]), and [`generation::VllmGeneration`] shards batches
//! across the groups.

pub mod config;
pub mod engine;
pub mod generation;
pub mod mocker;
pub mod placement;
pub mod protocols;
pub mod tied_groups;

pub use config::{LogprobPolicy, VllmConfig, VllmSpecificArgs};
pub use generation::{
    GenerationError, GenerationInterface, GenerationStream, VllmGeneration, VllmGenerationWorker,
};
