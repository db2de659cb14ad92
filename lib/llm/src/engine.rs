// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the inference engine.
//!
//! The engine samples tokens and manages its own device memory; this crate
//! only drives it. Two flavors exist: [`LlmEngine`] takes a whole batch and
//! blocks until every prompt is done, [`AsyncLlmEngine`] takes one request at
//! a time and streams incremental outputs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::protocols::{DeviceUuid, IpcHandles, TokenIdType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFlavor {
    Sync,
    Async,
}

impl EngineFlavor {
    pub fn from_async_flag(async_engine: bool) -> Self {
        if async_engine {
            EngineFlavor::Async
        } else {
            EngineFlavor::Sync
        }
    }
}

impl fmt::Display for EngineFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineFlavor::Sync => write!(f, "synchronous"),
            EngineFlavor::Async => write!(f, "asynchronous"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    /// `-1` disables top-k filtering.
    pub top_k: i32,
    pub max_tokens: usize,
    /// Number of candidates to report per position besides the sampled one.
    pub logprobs: Option<usize>,
    pub stop_token_ids: Vec<TokenIdType>,
    pub stop: Option<Vec<String>>,
    pub include_stop_str_in_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Logprob {
    pub logprob: f32,
    pub rank: Option<usize>,
}

/// Candidates reported for one generated position, in engine order.
pub type TopLogprobs = Vec<(TokenIdType, Logprob)>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOutput {
    pub index: usize,
    pub text: String,
    pub token_ids: Vec<TokenIdType>,
    /// One entry per generated position when the engine reports them; an
    /// empty entry means nothing was reported for that step.
    pub logprobs: Option<Vec<TopLogprobs>>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutput {
    pub request_id: String,
    pub prompt_token_ids: Vec<TokenIdType>,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prompt {
    Tokens(Vec<TokenIdType>),
    Text(String),
}

/// Remote calls broadcast to every internal engine worker.
#[derive(Debug, Clone)]
pub enum WorkerRpc {
    ReportDeviceId,
    UpdateWeightsFromIpcHandles(IpcHandles),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    DeviceId(DeviceUuid),
    Updated(bool),
}

/// Batch-synchronous engine.
pub trait LlmEngine: Send + Sync {
    fn generate(
        &self,
        prompts: &[Prompt],
        params: &SamplingParams,
    ) -> anyhow::Result<Vec<RequestOutput>>;

    /// One reply per internal worker.
    fn collective_rpc(&self, rpc: &WorkerRpc) -> anyhow::Result<Vec<RpcReply>>;

    fn reset_prefix_cache(&self) -> anyhow::Result<()>;

    fn sleep(&self, level: u32) -> anyhow::Result<()>;

    fn wake_up(&self, tags: Option<&[String]>) -> anyhow::Result<()>;
}

/// Request-level asynchronous engine.
#[async_trait]
pub trait AsyncLlmEngine: Send + Sync {
    /// Incremental outputs for one request. The last item has `finished` set.
    fn generate(
        &self,
        prompt: Prompt,
        params: SamplingParams,
        request_id: String,
    ) -> BoxStream<'static, anyhow::Result<RequestOutput>>;

    async fn collective_rpc(&self, rpc: WorkerRpc) -> anyhow::Result<Vec<RpcReply>>;

    async fn reset_prefix_cache(&self) -> anyhow::Result<()>;

    async fn sleep(&self, level: u32) -> anyhow::Result<()>;

    async fn wake_up(&self, tags: Option<Vec<String>>) -> anyhow::Result<()>;

    fn shutdown_background_loop(&self) -> anyhow::Result<()>;
}

pub enum LoadedEngine {
    Sync(Box<dyn LlmEngine>),
    Async(Arc<dyn AsyncLlmEngine>),
}

impl LoadedEngine {
    pub fn flavor(&self) -> EngineFlavor {
        match self {
            LoadedEngine::Sync(_) => EngineFlavor::Sync,
            LoadedEngine::Async(_) => EngineFlavor::Async,
        }
    }
}

impl fmt::Debug for LoadedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoadedEngine({})", self.flavor())
    }
}

/// Creates engines on the worker that will own them.
pub trait EngineLoader: Send + Sync {
    fn load(&self, args: &EngineArgs) -> anyhow::Result<LoadedEngine>;
}

/// Everything an engine needs to come up on one tied group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineArgs {
    pub model: String,
    pub load_format: String,
    pub skip_tokenizer_init: bool,
    pub tensor_parallel_size: usize,
    pub gpu_memory_utilization: f64,
    pub enable_prefix_caching: bool,
    pub dtype: String,
    pub seed: Option<u64>,
    pub enforce_eager: bool,
    pub max_model_len: usize,
    pub trust_remote_code: bool,
    pub enable_sleep_mode: bool,
    pub disable_log_stats: bool,
    pub distributed_executor_backend: Option<String>,
    pub async_engine: bool,
    pub node_index: usize,
    pub bundle_indices: Vec<usize>,
    /// Process environment the engine is started with.
    pub env: BTreeMap<String, String>,
    /// Free-form engine arguments passed through untouched.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EngineArgs {
    pub fn flavor(&self) -> EngineFlavor {
        EngineFlavor::from_async_flag(self.async_engine)
    }
}
