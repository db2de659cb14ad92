// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One generation worker per device slot.
//!
//! Only the first worker of a tied group (the owner) loads an engine; the
//! rest exist to hold their device slot and reject every engine operation.
//! The engine flavor is fixed by configuration: each operation has a
//! synchronous and an asynchronous entry point and calling the one that does
//! not match the flavor fails with [`GenerationError::ModeMismatch`].

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use genfleet_runtime::{Actor, BatchedData};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{GenerationError, Result};
use crate::config::{LogprobPolicy, VllmConfig};
use crate::engine::{
    AsyncLlmEngine, CompletionOutput, EngineArgs, EngineFlavor, EngineLoader, LlmEngine,
    LoadedEngine, Prompt, RequestOutput, RpcReply, SamplingParams, WorkerRpc,
};
use crate::placement::WorkerResourceRequest;
use crate::protocols::{
    verify_right_padding, DeviceUuid, GenerationInput, GenerationOutput, IndexedGeneration,
    IpcHandles, TextGenerationInput, TextGenerationOutput, TokenIdType,
};

pub const PER_WORKER_GPUS_ENV: &str = "VLLM_RAY_PER_WORKER_GPUS";
pub const BUNDLE_INDICES_ENV: &str = "VLLM_RAY_BUNDLE_INDICES";
pub const USE_V1_ENV: &str = "VLLM_USE_V1";

/// Sleep level used between generation phases: offload weights, drop the cache.
const SLEEP_LEVEL: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    OwnerReady,
    NonOwner,
    ShuttingDown,
}

/// Engine arguments for the owner of a tied group.
pub fn derive_engine_args(
    cfg: &VllmConfig,
    request: &WorkerResourceRequest,
    node_index: usize,
) -> EngineArgs {
    let tp = cfg.vllm_cfg.tensor_parallel_size;
    let bundle_indices = request.init.bundle_indices.clone().unwrap_or_default();
    let mut env = request.env.clone();
    let mut extra = cfg.vllm_kwargs.clone();
    extra.remove("distributed_executor_backend");

    let distributed_executor_backend = if tp > 1 {
        env.insert(
            PER_WORKER_GPUS_ENV.to_string(),
            (request.device_share() / tp as f64).to_string(),
        );
        env.insert(
            BUNDLE_INDICES_ENV.to_string(),
            bundle_indices
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );
        Some("ray".to_string())
    } else {
        None
    };
    if !cfg.vllm_cfg.async_engine {
        env.insert(USE_V1_ENV.to_string(), "1".to_string());
    }

    EngineArgs {
        model: cfg.model_name.clone(),
        load_format: cfg.vllm_cfg.load_format.clone(),
        skip_tokenizer_init: cfg.vllm_cfg.skip_tokenizer_init,
        tensor_parallel_size: tp,
        gpu_memory_utilization: cfg.vllm_cfg.gpu_memory_utilization,
        enable_prefix_caching: cfg.vllm_cfg.enable_prefix_caching,
        dtype: cfg.vllm_cfg.precision.clone(),
        seed: request.init.seed,
        // graph capture changes numerics enough to hurt training
        enforce_eager: true,
        max_model_len: cfg.vllm_cfg.max_model_len,
        trust_remote_code: true,
        enable_sleep_mode: true,
        disable_log_stats: true,
        distributed_executor_backend,
        async_engine: cfg.vllm_cfg.async_engine,
        node_index,
        bundle_indices,
        env,
        extra,
    }
}

pub struct VllmGenerationWorker {
    name: String,
    cfg: Arc<VllmConfig>,
    flavor: EngineFlavor,
    state: WorkerState,
    engine: Option<LoadedEngine>,
}

impl std::fmt::Debug for VllmGenerationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VllmGenerationWorker")
            .field("name", &self.name)
            .field("flavor", &self.flavor)
            .field("state", &self.state)
            .finish()
    }
}

impl VllmGenerationWorker {
    /// Build a worker from its placement plan. An engine is loaded only when
    /// the plan carries bundle indices, i.e. for the owner of a tied group.
    pub fn new(
        cfg: Arc<VllmConfig>,
        request: &WorkerResourceRequest,
        node_index: usize,
        loader: &dyn EngineLoader,
        name: impl Into<String>,
    ) -> Result<Self> {
        let mut worker = Self {
            name: name.into(),
            flavor: cfg.flavor(),
            cfg,
            state: WorkerState::Uninitialized,
            engine: None,
        };

        if request.init.bundle_indices.is_none() {
            worker.state = WorkerState::NonOwner;
            tracing::debug!(worker = %worker.name, "non-owner worker holding its device slot");
            return Ok(worker);
        }

        let args = derive_engine_args(&worker.cfg, request, node_index);
        let engine = loader.load(&args)?;
        if engine.flavor() != worker.flavor {
            return Err(GenerationError::Configuration(format!(
                "engine loader produced a {} engine but the configuration asks for {}",
                engine.flavor(),
                worker.flavor
            )));
        }
        tracing::info!(
            worker = %worker.name,
            model = %args.model,
            tensor_parallel_size = args.tensor_parallel_size,
            seed = ?args.seed,
            flavor = %worker.flavor,
            "engine loaded"
        );
        worker.engine = Some(engine);
        worker.state = WorkerState::OwnerReady;
        Ok(worker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn flavor(&self) -> EngineFlavor {
        self.flavor
    }

    pub fn is_alive(&self) -> bool {
        true
    }

    fn owner_engine(&self, operation: &'static str, expected: EngineFlavor) -> Result<&LoadedEngine> {
        if self.flavor != expected {
            return Err(GenerationError::ModeMismatch {
                operation,
                expected,
            });
        }
        match (self.state, self.engine.as_ref()) {
            (WorkerState::OwnerReady, Some(engine)) => Ok(engine),
            (WorkerState::NonOwner, _) => Err(GenerationError::Precondition(format!(
                "{operation} called on {}, which does not own an engine",
                self.name
            ))),
            (WorkerState::ShuttingDown, _) => Err(GenerationError::Precondition(format!(
                "{operation} called on {} after shutdown",
                self.name
            ))),
            _ => Err(GenerationError::Precondition(format!(
                "{operation} called on {} before its engine was loaded",
                self.name
            ))),
        }
    }

    fn sync_engine(&self, operation: &'static str) -> Result<&dyn LlmEngine> {
        match self.owner_engine(operation, EngineFlavor::Sync)? {
            LoadedEngine::Sync(engine) => Ok(engine.as_ref()),
            LoadedEngine::Async(_) => Err(GenerationError::ModeMismatch {
                operation,
                expected: EngineFlavor::Sync,
            }),
        }
    }

    fn async_engine(&self, operation: &'static str) -> Result<Arc<dyn AsyncLlmEngine>> {
        match self.owner_engine(operation, EngineFlavor::Async)? {
            LoadedEngine::Async(engine) => Ok(engine.clone()),
            LoadedEngine::Sync(_) => Err(GenerationError::ModeMismatch {
                operation,
                expected: EngineFlavor::Async,
            }),
        }
    }

    /// Union of the configured stop strings and every per-row list; `None`
    /// when the union is empty.
    pub fn merge_stop_strings<'a>(
        &self,
        rows: impl IntoIterator<Item = Option<&'a [String]>>,
    ) -> Option<Vec<String>> {
        let mut merged: BTreeSet<String> = self
            .cfg
            .stop_strings
            .iter()
            .flatten()
            .cloned()
            .collect();
        for row in rows.into_iter().flatten() {
            merged.extend(row.iter().cloned());
        }
        (!merged.is_empty()).then(|| merged.into_iter().collect())
    }

    /// Greedy decoding pins temperature to 0 and top-k to 1.
    pub fn build_sampling_params(&self, greedy: bool, stop: Option<Vec<String>>) -> SamplingParams {
        let cfg = &self.cfg;
        SamplingParams {
            temperature: if greedy { 0.0 } else { cfg.temperature },
            top_p: cfg.top_p,
            top_k: if greedy { 1 } else { cfg.top_k.unwrap_or(-1) },
            max_tokens: cfg.max_new_tokens,
            logprobs: Some(0),
            stop_token_ids: cfg.stop_token_ids.clone().unwrap_or_default(),
            stop,
            include_stop_str_in_output: true,
        }
    }

    /// Batch generation on the synchronous engine.
    pub fn generate(&self, data: &BatchedData, greedy: bool) -> Result<BatchedData> {
        let engine = self.sync_engine("generate")?;
        let input = GenerationInput::from_batch(data)?;
        if input.is_empty() {
            return GenerationOutput::default().into_batch();
        }
        verify_right_padding(&input, self.cfg.pad_token_id)?;

        let stop = self.merge_stop_strings((0..input.len()).map(|i| input.row_stop_strings(i)));
        let params = self.build_sampling_params(greedy, stop);
        let prompts: Vec<Prompt> = input
            .input_ids
            .iter()
            .zip(&input.input_lengths)
            .map(|(ids, &len)| Prompt::Tokens(ids[..len].to_vec()))
            .collect();

        let outputs = engine.generate(&prompts, &params)?;
        if outputs.len() != prompts.len() {
            return Err(GenerationError::Engine(anyhow::anyhow!(
                "engine returned {} outputs for {} prompts",
                outputs.len(),
                prompts.len()
            )));
        }
        let completions = outputs
            .iter()
            .map(first_completion)
            .collect::<Result<Vec<_>>>()?;

        let max_generated = completions.iter().map(|c| c.token_ids.len()).max().unwrap_or(0);
        let width = input.padded_length() + max_generated;
        let mut result = GenerationOutput::default();
        for ((ids, &len), completion) in input.input_ids.iter().zip(&input.input_lengths).zip(completions) {
            let row = RowBuilder {
                input: ids,
                input_length: len,
                pad: self.cfg.pad_token_id,
                policy: self.cfg.logprob_policy,
            };
            row.append_to(&mut result, completion, width);
        }
        result.into_batch()
    }

    /// Per-request generation on the asynchronous engine.
    ///
    /// Returns immediately; every finished request arrives on the receiver as
    /// a single-row result, in completion order. A failed request is logged
    /// and skipped. The receiver closes once every request has finished.
    pub fn generate_async(
        &self,
        data: &BatchedData,
        greedy: bool,
    ) -> Result<mpsc::UnboundedReceiver<IndexedGeneration>> {
        let engine = self.async_engine("generate_async")?;
        let input = GenerationInput::from_batch(data)?;
        verify_right_padding(&input, self.cfg.pad_token_id)?;

        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<RequestCompletion>();
        let mut contexts = HashMap::with_capacity(input.len());
        for (index, (ids, &len)) in input.input_ids.iter().zip(&input.input_lengths).enumerate() {
            let stop = self.merge_stop_strings(std::iter::once(input.row_stop_strings(index)));
            let params = self.build_sampling_params(greedy, stop);
            let request_id = Uuid::new_v4().to_string();
            let mut stream = engine.generate(
                Prompt::Tokens(ids[..len].to_vec()),
                params,
                request_id.clone(),
            );
            contexts.insert(
                request_id.clone(),
                RequestContext {
                    index,
                    input: ids.clone(),
                    input_length: len,
                },
            );

            let tx = completion_tx.clone();
            tokio::spawn(async move {
                let mut last: Option<RequestOutput> = None;
                let outcome = loop {
                    match stream.next().await {
                        Some(Ok(output)) => last = Some(output),
                        Some(Err(e)) => break Err(e),
                        None => {
                            break last.ok_or_else(|| anyhow::anyhow!("engine stream ended without output"))
                        }
                    }
                };
                let _ = tx.send(RequestCompletion { request_id, outcome });
            });
        }
        drop(completion_tx);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let pad = self.cfg.pad_token_id;
        let policy = self.cfg.logprob_policy;
        let worker = self.name.clone();
        tokio::spawn(async move {
            while let Some(done) = completion_rx.recv().await {
                let output = match done.outcome {
                    Ok(output) => output,
                    Err(e) => {
                        tracing::error!(%worker, request_id = %done.request_id, "generation request failed: {e:#}");
                        continue;
                    }
                };
                let context = contexts
                    .remove(&output.request_id)
                    .or_else(|| contexts.remove(&done.request_id));
                let Some(context) = context else {
                    tracing::error!(%worker, request_id = %output.request_id, "output for an unknown request");
                    continue;
                };
                let completion = match first_completion(&output) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!(%worker, request_id = %output.request_id, "{e}");
                        continue;
                    }
                };

                let row = RowBuilder {
                    input: &context.input,
                    input_length: context.input_length,
                    pad,
                    policy,
                };
                let mut single = GenerationOutput::default();
                row.append_to(&mut single, completion, context.input.len() + completion.token_ids.len());
                if out_tx
                    .send(IndexedGeneration {
                        index: context.index,
                        output: single,
                    })
                    .is_err()
                {
                    tracing::debug!(%worker, "generation stream dropped by the caller");
                    break;
                }
            }
        });
        Ok(out_rx)
    }

    /// Text-in, text-out generation on the synchronous engine. One stop-string
    /// set, the union over every row and the configuration, applies to the
    /// whole batch.
    pub fn generate_text(&self, data: &BatchedData, greedy: bool) -> Result<BatchedData> {
        let engine = self.sync_engine("generate_text")?;
        let input = TextGenerationInput::from_batch(data)?;
        let stop = match &input.stop_strings {
            Some(rows) => self.merge_stop_strings(rows.iter().map(|r| r.as_deref())),
            None => self.merge_stop_strings(std::iter::empty()),
        };
        let params = self.build_sampling_params(greedy, stop);
        let prompts: Vec<Prompt> = input.prompts.iter().cloned().map(Prompt::Text).collect();
        if prompts.is_empty() {
            return TextGenerationOutput::default().into_batch();
        }

        let outputs = engine.generate(&prompts, &params)?;
        let texts = outputs
            .iter()
            .map(|o| first_completion(o).map(|c| c.text.clone()))
            .collect::<Result<Vec<_>>>()?;
        TextGenerationOutput { texts }.into_batch()
    }

    pub fn report_device_id(&self) -> Result<Vec<DeviceUuid>> {
        let engine = self.sync_engine("report_device_id")?;
        device_ids(engine.collective_rpc(&WorkerRpc::ReportDeviceId)?)
    }

    pub async fn report_device_id_async(&self) -> Result<Vec<DeviceUuid>> {
        let engine = self.async_engine("report_device_id_async")?;
        device_ids(engine.collective_rpc(WorkerRpc::ReportDeviceId).await?)
    }

    /// `Ok(false)` when the update itself fails on any internal worker;
    /// `Err` only for calling it on the wrong worker or flavor.
    pub fn update_weights_from_ipc_handles(&self, handles: IpcHandles) -> Result<bool> {
        let engine = self.sync_engine("update_weights_from_ipc_handles")?;
        let replies = engine.collective_rpc(&WorkerRpc::UpdateWeightsFromIpcHandles(handles));
        Ok(self.weight_update_succeeded(replies))
    }

    pub async fn update_weights_from_ipc_handles_async(&self, handles: IpcHandles) -> Result<bool> {
        let engine = self.async_engine("update_weights_from_ipc_handles_async")?;
        let replies = engine
            .collective_rpc(WorkerRpc::UpdateWeightsFromIpcHandles(handles))
            .await;
        Ok(self.weight_update_succeeded(replies))
    }

    fn weight_update_succeeded(&self, replies: anyhow::Result<Vec<RpcReply>>) -> bool {
        match replies {
            Ok(replies) if !replies.is_empty() => {
                let ok = replies.iter().all(|r| matches!(r, RpcReply::Updated(true)));
                if !ok {
                    tracing::error!(worker = %self.name, ?replies, "weight update failed on an internal worker");
                }
                ok
            }
            Ok(_) => {
                tracing::error!(worker = %self.name, "weight update got no replies");
                false
            }
            Err(e) => {
                tracing::error!(worker = %self.name, "weight update failed: {e:#}");
                false
            }
        }
    }

    /// Drop the prefix cache, then offload.
    pub fn sleep(&self) -> Result<()> {
        let engine = self.sync_engine("sleep")?;
        engine.reset_prefix_cache()?;
        engine.sleep(SLEEP_LEVEL)?;
        Ok(())
    }

    pub async fn sleep_async(&self) -> Result<()> {
        let engine = self.async_engine("sleep_async")?;
        engine.reset_prefix_cache().await?;
        engine.sleep(SLEEP_LEVEL).await?;
        Ok(())
    }

    pub fn wake_up(&self, tags: Option<Vec<String>>) -> Result<()> {
        let engine = self.sync_engine("wake_up")?;
        engine.wake_up(tags.as_deref())?;
        Ok(())
    }

    pub async fn wake_up_async(&self, tags: Option<Vec<String>>) -> Result<()> {
        let engine = self.async_engine("wake_up_async")?;
        engine.wake_up(tags).await?;
        Ok(())
    }

    /// Release the engine. Safe to call any number of times, never panics,
    /// reports `false` only if releasing the engine failed.
    pub fn shutdown(&mut self) -> bool {
        if self.state == WorkerState::ShuttingDown {
            return true;
        }
        self.state = WorkerState::ShuttingDown;
        let Some(engine) = self.engine.take() else {
            return true;
        };

        let mut ok = true;
        if let LoadedEngine::Async(engine) = &engine {
            if let Err(e) = engine.shutdown_background_loop() {
                // keep going; the engine is released below either way
                tracing::warn!(worker = %self.name, "stopping engine background loop failed: {e:#}");
            }
        }
        if catch_unwind(AssertUnwindSafe(move || drop(engine))).is_err() {
            tracing::error!(worker = %self.name, "releasing engine panicked");
            ok = false;
        }
        tracing::debug!(worker = %self.name, ok, "worker shut down");
        ok
    }
}

impl Drop for VllmGenerationWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RequestContext {
    index: usize,
    input: Vec<TokenIdType>,
    input_length: usize,
}

struct RequestCompletion {
    request_id: String,
    outcome: anyhow::Result<RequestOutput>,
}

fn first_completion(output: &RequestOutput) -> Result<&CompletionOutput> {
    output.outputs.first().ok_or_else(|| {
        GenerationError::Engine(anyhow::anyhow!(
            "engine returned no completion for request {}",
            output.request_id
        ))
    })
}

fn device_ids(replies: Vec<RpcReply>) -> Result<Vec<DeviceUuid>> {
    replies
        .into_iter()
        .map(|reply| match reply {
            RpcReply::DeviceId(id) => Ok(id),
            other => Err(GenerationError::Engine(anyhow::anyhow!(
                "expected a device id, got {other:?}"
            ))),
        })
        .collect()
}

/// Rebuilds one output row around the original, unpadded input.
struct RowBuilder<'a> {
    input: &'a [TokenIdType],
    input_length: usize,
    pad: TokenIdType,
    policy: LogprobPolicy,
}

impl RowBuilder<'_> {
    fn append_to(&self, out: &mut GenerationOutput, completion: &CompletionOutput, width: usize) {
        let len = self.input_length;
        let generated = &completion.token_ids;

        let mut ids = vec![self.pad; width];
        ids[..len].copy_from_slice(&self.input[..len]);
        ids[len..len + generated.len()].copy_from_slice(generated);

        let mut logprobs = vec![0.0f32; width];
        if let Some(steps) = &completion.logprobs {
            for (step, (candidates, &token)) in steps.iter().zip(generated).enumerate() {
                let value = match self.policy {
                    LogprobPolicy::EmittedToken => candidates
                        .iter()
                        .find(|(candidate, _)| *candidate == token)
                        .map(|(_, lp)| lp.logprob),
                    LogprobPolicy::FirstCandidate => candidates.first().map(|(_, lp)| lp.logprob),
                };
                logprobs[len + step] = value.unwrap_or(0.0);
            }
        }

        out.output_ids.push(ids);
        out.logprobs.push(logprobs);
        out.generation_lengths.push(generated.len());
        out.unpadded_sequence_lengths.push(len + generated.len());
    }
}

/// Calls a worker actor understands.
#[derive(Debug)]
pub enum WorkerCall {
    Generate { data: BatchedData, greedy: bool },
    GenerateAsync { data: BatchedData, greedy: bool },
    GenerateText { data: BatchedData, greedy: bool },
    ReportDeviceId,
    ReportDeviceIdAsync,
    UpdateWeights(IpcHandles),
    UpdateWeightsAsync(IpcHandles),
    Sleep,
    SleepAsync,
    WakeUp { tags: Option<Vec<String>> },
    WakeUpAsync { tags: Option<Vec<String>> },
    IsAlive,
}

#[derive(Debug)]
pub enum WorkerReply {
    Batch(BatchedData),
    Stream(mpsc::UnboundedReceiver<IndexedGeneration>),
    DeviceIds(Vec<DeviceUuid>),
    Updated(bool),
    Done,
    Alive(bool),
}

#[async_trait]
impl Actor for VllmGenerationWorker {
    type Call = WorkerCall;
    type Reply = WorkerReply;

    async fn handle(&mut self, call: WorkerCall) -> anyhow::Result<WorkerReply> {
        let reply = match call {
            WorkerCall::Generate { data, greedy } => WorkerReply::Batch(self.generate(&data, greedy)?),
            WorkerCall::GenerateAsync { data, greedy } => {
                WorkerReply::Stream(self.generate_async(&data, greedy)?)
            }
            WorkerCall::GenerateText { data, greedy } => {
                WorkerReply::Batch(self.generate_text(&data, greedy)?)
            }
            WorkerCall::ReportDeviceId => WorkerReply::DeviceIds(self.report_device_id()?),
            WorkerCall::ReportDeviceIdAsync => {
                WorkerReply::DeviceIds(self.report_device_id_async().await?)
            }
            WorkerCall::UpdateWeights(handles) => {
                WorkerReply::Updated(self.update_weights_from_ipc_handles(handles)?)
            }
            WorkerCall::UpdateWeightsAsync(handles) => {
                WorkerReply::Updated(self.update_weights_from_ipc_handles_async(handles).await?)
            }
            WorkerCall::Sleep => {
                self.sleep()?;
                WorkerReply::Done
            }
            WorkerCall::SleepAsync => {
                self.sleep_async().await?;
                WorkerReply::Done
            }
            WorkerCall::WakeUp { tags } => {
                self.wake_up(tags)?;
                WorkerReply::Done
            }
            WorkerCall::WakeUpAsync { tags } => {
                self.wake_up_async(tags).await?;
                WorkerReply::Done
            }
            WorkerCall::IsAlive => WorkerReply::Alive(self.is_alive()),
        };
        Ok(reply)
    }

    async fn shutdown(&mut self) -> bool {
        VllmGenerationWorker::shutdown(self)
    }
}
