// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generation over a fleet of engine workers.
//!
//! [`worker::VllmGenerationWorker`] wraps one inference engine per tied group;
//! [`orchestrator::VllmGeneration`] fans batches out across the tied groups and
//! stitches the results back together.

use async_trait::async_trait;
use genfleet_runtime::BatchedData;
use thiserror::Error;

use crate::engine::EngineFlavor;
use crate::protocols::{DeviceUuid, IpcHandles};

pub mod orchestrator;
pub mod worker;

pub use orchestrator::{GenerationStream, VllmGeneration};
pub use worker::VllmGenerationWorker;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{operation} requires the {expected} engine")]
    ModeMismatch {
        operation: &'static str,
        expected: EngineFlavor,
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("remote call failed: {0}")]
    RemoteCall(String),

    #[error("generation output is missing required fields: {missing:?}")]
    Schema { missing: Vec<String> },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl GenerationError {
    /// Recover a typed error that crossed a worker mailbox as [`anyhow::Error`].
    pub fn from_remote(err: anyhow::Error) -> Self {
        match err.downcast::<GenerationError>() {
            Ok(typed) => typed,
            Err(other) => GenerationError::RemoteCall(format!("{other:#}")),
        }
    }
}

pub type Result<T, E = GenerationError> = std::result::Result<T, E>;

/// What a caller of a generation backend sees.
#[async_trait]
pub trait GenerationInterface: Send + Sync {
    /// Token-id generation. Output columns: `output_ids`, `logprobs`,
    /// `generation_lengths`, `unpadded_sequence_lengths`.
    async fn generate(&self, data: &BatchedData, greedy: bool) -> Result<BatchedData>;

    /// Raw text generation. Output column: `texts`.
    async fn generate_text(&self, data: &BatchedData, greedy: bool) -> Result<BatchedData>;

    /// Wake every engine before a generation phase.
    async fn prepare_for_generation(&self, tags: Option<Vec<String>>) -> bool;

    /// Put every engine to sleep after a generation phase.
    async fn finish_generation(&self) -> bool;

    /// Push new weights, keyed by device identity.
    async fn update_weights(&self, ipc_handles: &IpcHandles) -> bool;

    /// Device identities recorded at construction, one list per tied group.
    fn device_uuids(&self) -> &[Vec<DeviceUuid>];

    async fn shutdown(&self) -> bool;
}
