// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The fleet as one logical generator.
//!
//! A batch is split into one shard per tied group (data-parallel), each shard
//! goes to that group's owner, and the per-shard results are concatenated
//! back in shard order. Lifecycle calls (wake, sleep, weight updates) go to
//! every owner.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use genfleet_runtime::{Axis, BatchedData, ShardingLayout, VirtualCluster, WorkerConfig, WorkerGroup};
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::worker::{VllmGenerationWorker, WorkerCall, WorkerReply};
use super::{GenerationError, GenerationInterface, Result};
use crate::config::VllmConfig;
use crate::engine::{EngineFlavor, EngineLoader};
use crate::placement::configure_worker;
use crate::protocols::{
    DeviceUuid, GenerationOutput, IndexedGeneration, IpcHandles, GENERATION_OUTPUT_KEYS,
    INPUT_IDS, INPUT_LENGTHS, OUTPUT_IDS, PROMPTS, TEXT_OUTPUT_KEYS,
};
use crate::tied_groups::tied_worker_bundle_indices;

pub const DEFAULT_NAME_PREFIX: &str = "vllm_policy";

const OWNERS_ONLY: &[Axis] = &[Axis::TensorParallel];

pub struct VllmGeneration {
    cfg: Arc<VllmConfig>,
    workers: WorkerGroup<VllmGenerationWorker>,
    device_uuids: Vec<Vec<DeviceUuid>>,
}

impl VllmGeneration {
    /// Start one worker per device slot of `cluster` and load an engine on
    /// every tied-group owner.
    pub async fn new(
        cluster: &VirtualCluster,
        config: VllmConfig,
        loader: Arc<dyn EngineLoader>,
    ) -> Result<Self> {
        let worker_config =
            WorkerConfig::from_settings().map_err(|e| GenerationError::Configuration(format!("{e:#}")))?;
        Self::new_named(cluster, config, loader, DEFAULT_NAME_PREFIX, worker_config).await
    }

    /// Like [`VllmGeneration::new`] from an untyped configuration mapping.
    pub async fn from_value(
        cluster: &VirtualCluster,
        config: Value,
        loader: Arc<dyn EngineLoader>,
    ) -> Result<Self> {
        Self::new(cluster, VllmConfig::from_value(config)?, loader).await
    }

    pub async fn new_named(
        cluster: &VirtualCluster,
        config: VllmConfig,
        loader: Arc<dyn EngineLoader>,
        name_prefix: &str,
        worker_config: WorkerConfig,
    ) -> Result<Self> {
        let cfg = Arc::new(config);
        let tp = cfg.tensor_parallel_size();

        // fail before any worker starts
        let assignments = tied_worker_bundle_indices(cluster.placement_groups(), tp)?;
        let resource_share = cluster.resource_share_per_worker();
        tracing::info!(
            model = %cfg.model_name,
            tied_groups = assignments.len(),
            tensor_parallel_size = tp,
            flavor = %cfg.flavor(),
            "starting generation workers"
        );

        let factory_cfg = cfg.clone();
        let workers = WorkerGroup::new(
            name_prefix,
            resource_share,
            &assignments,
            worker_config,
            move |slot| {
                let cfg = factory_cfg.clone();
                let loader = loader.clone();
                async move {
                    let request = configure_worker(*slot.resource_share(), slot.assignment().as_ref());
                    let worker = VllmGenerationWorker::new(
                        cfg,
                        &request,
                        *slot.node_index(),
                        loader.as_ref(),
                        slot.name().clone(),
                    )?;
                    Ok::<_, anyhow::Error>(worker)
                }
            },
        )
        .await
        .map_err(GenerationError::from_remote)?;

        let mut generation = Self {
            cfg,
            workers,
            device_uuids: Vec::new(),
        };
        match generation.collect_device_uuids().await {
            Ok(ids) => generation.device_uuids = ids,
            Err(e) => {
                generation.shutdown().await;
                return Err(e);
            }
        }
        tracing::info!(device_uuids = ?generation.device_uuids, "generation workers ready");
        Ok(generation)
    }

    /// Build a generator, run `body` with it, and shut it down on every path
    /// out of `body`.
    pub async fn scoped<F, Fut, T>(
        cluster: &VirtualCluster,
        config: VllmConfig,
        loader: Arc<dyn EngineLoader>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<VllmGeneration>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let generation = Arc::new(Self::new(cluster, config, loader).await?);
        let outcome = body(generation.clone()).await;
        if !generation.shutdown().await {
            tracing::warn!("generation workers did not all shut down cleanly");
        }
        outcome
    }

    async fn collect_device_uuids(&self) -> Result<Vec<Vec<DeviceUuid>>> {
        let flavor = self.cfg.flavor();
        let futures = self.workers.run_all_workers_single_data(
            |_| match flavor {
                EngineFlavor::Sync => WorkerCall::ReportDeviceId,
                EngineFlavor::Async => WorkerCall::ReportDeviceIdAsync,
            },
            OWNERS_ONLY,
        );
        let replies = join_all(futures).await;
        replies
            .into_iter()
            .map(|reply| match reply.map_err(GenerationError::from_remote)? {
                WorkerReply::DeviceIds(ids) => Ok(ids),
                other => Err(unexpected("report_device_id", &other)),
            })
            .collect()
    }

    pub fn sharding(&self) -> &ShardingLayout {
        self.workers.layout()
    }

    pub fn config(&self) -> &VllmConfig {
        &self.cfg
    }

    pub fn is_shut_down(&self) -> bool {
        self.workers.is_shut_down()
    }

    fn data_parallel_size(&self) -> usize {
        self.sharding().axis_size(Axis::DataParallel)
    }

    fn shard(&self, data: &BatchedData) -> Result<Vec<BatchedData>> {
        data.shard_by_batch_size(self.data_parallel_size(), true)
            .map_err(|e| GenerationError::InvalidInput(format!("{e:#}")))
    }

    async fn dispatch_shards(&self, calls: Vec<WorkerCall>) -> Result<Vec<WorkerReply>> {
        let bundle = self
            .workers
            .run_all_workers_sharded_data(calls)
            .map_err(GenerationError::from_remote)?;
        self.workers
            .get_all_worker_results(bundle)
            .await
            .map_err(GenerationError::from_remote)
    }

    /// Token-id generation across every tied group.
    pub async fn generate(&self, data: &BatchedData, greedy: bool) -> Result<BatchedData> {
        require_keys(data, &[INPUT_IDS, INPUT_LENGTHS])?;
        let calls = self
            .shard(data)?
            .into_iter()
            .map(|data| WorkerCall::Generate { data, greedy })
            .collect();
        let batches = self
            .dispatch_shards(calls)
            .await?
            .into_iter()
            .map(|reply| match reply {
                WorkerReply::Batch(batch) => Ok(batch),
                other => Err(unexpected("generate", &other)),
            })
            .collect::<Result<Vec<_>>>()?;

        let combined = BatchedData::from_batches(batches, &[(OUTPUT_IDS, self.cfg.pad_token_id)])?;
        check_schema(&combined, &GENERATION_OUTPUT_KEYS)?;
        Ok(combined)
    }

    /// Text generation across every tied group.
    pub async fn generate_text(&self, data: &BatchedData, greedy: bool) -> Result<BatchedData> {
        require_keys(data, &[PROMPTS])?;
        let calls = self
            .shard(data)?
            .into_iter()
            .map(|data| WorkerCall::GenerateText { data, greedy })
            .collect();
        let batches = self
            .dispatch_shards(calls)
            .await?
            .into_iter()
            .map(|reply| match reply {
                WorkerReply::Batch(batch) => Ok(batch),
                other => Err(unexpected("generate_text", &other)),
            })
            .collect::<Result<Vec<_>>>()?;

        let combined = BatchedData::from_batches(batches, &[])?;
        check_schema(&combined, &TEXT_OUTPUT_KEYS)?;
        Ok(combined)
    }

    /// Stream single-row results as they finish, across every tied group.
    ///
    /// Indices refer to rows of `data`. Requires the asynchronous engine.
    pub async fn generate_async(&self, data: &BatchedData, greedy: bool) -> Result<GenerationStream> {
        if self.cfg.flavor() != EngineFlavor::Async {
            return Err(GenerationError::ModeMismatch {
                operation: "generate_async",
                expected: EngineFlavor::Async,
            });
        }
        require_keys(data, &[INPUT_IDS, INPUT_LENGTHS])?;
        let shards = self.shard(data)?;
        let offsets: Vec<usize> = shards
            .iter()
            .scan(0, |start, shard| {
                let offset = *start;
                *start += shard.batch_size();
                Some(offset)
            })
            .collect();

        let calls = shards
            .into_iter()
            .map(|data| WorkerCall::GenerateAsync { data, greedy })
            .collect();
        let replies = self.dispatch_shards(calls).await?;

        let mut streams = Vec::with_capacity(replies.len());
        for (offset, reply) in offsets.into_iter().zip(replies) {
            let rx = match reply {
                WorkerReply::Stream(rx) => rx,
                other => return Err(unexpected("generate_async", &other)),
            };
            streams.push(
                UnboundedReceiverStream::new(rx)
                    .map(move |mut item| {
                        item.index += offset;
                        item
                    })
                    .boxed(),
            );
        }

        Ok(GenerationStream {
            inner: stream::select_all(streams).boxed(),
            pad_token_id: self.cfg.pad_token_id,
            requested: data.batch_size(),
        })
    }

    /// Wake every engine. `tags` selects what to restore; `None` restores
    /// everything.
    pub async fn prepare_for_generation(&self, tags: Option<Vec<String>>) -> bool {
        let flavor = self.cfg.flavor();
        let futures = self.workers.run_all_workers_single_data(
            |_| match flavor {
                EngineFlavor::Sync => WorkerCall::WakeUp { tags: tags.clone() },
                EngineFlavor::Async => WorkerCall::WakeUpAsync { tags: tags.clone() },
            },
            OWNERS_ONLY,
        );
        all_succeeded("prepare_for_generation", join_all(futures).await)
    }

    /// Reset prefix caches and put every engine to sleep.
    pub async fn finish_generation(&self) -> bool {
        let flavor = self.cfg.flavor();
        let futures = self.workers.run_all_workers_single_data(
            |_| match flavor {
                EngineFlavor::Sync => WorkerCall::Sleep,
                EngineFlavor::Async => WorkerCall::SleepAsync,
            },
            OWNERS_ONLY,
        );
        all_succeeded("finish_generation", join_all(futures).await)
    }

    /// Push new weights. Each tied group receives only the handles for its own
    /// devices; if any device recorded at construction has no handle, nothing
    /// is sent and the update fails.
    pub async fn update_weights(&self, ipc_handles: &IpcHandles) -> bool {
        if self.workers.is_empty() {
            tracing::error!("update_weights called with no workers");
            return false;
        }

        let mut subsets = Vec::with_capacity(self.device_uuids.len());
        for group in &self.device_uuids {
            let mut subset = IpcHandles::with_capacity(group.len());
            for uuid in group {
                let Some(handle) = ipc_handles.get(uuid) else {
                    tracing::error!(device = %uuid, "no weight handle for device");
                    return false;
                };
                subset.insert(uuid.clone(), handle.clone());
            }
            subsets.push(subset);
        }

        let calls = subsets
            .into_iter()
            .map(|subset| match self.cfg.flavor() {
                EngineFlavor::Sync => WorkerCall::UpdateWeights(subset),
                EngineFlavor::Async => WorkerCall::UpdateWeightsAsync(subset),
            })
            .collect();
        let futures = match self.workers.run_all_workers_multiple_data(calls, OWNERS_ONLY) {
            Ok(futures) => futures,
            Err(e) => {
                tracing::error!("dispatching weight update failed: {e:#}");
                return false;
            }
        };
        all_succeeded("update_weights", join_all(futures).await)
    }

    pub fn device_uuids(&self) -> &[Vec<DeviceUuid>] {
        &self.device_uuids
    }

    /// Health check: `true` when every engine owner answers.
    pub async fn is_alive(&self) -> bool {
        if self.workers.is_shut_down() {
            return false;
        }
        let futures = self
            .workers
            .run_all_workers_single_data(|_| WorkerCall::IsAlive, OWNERS_ONLY);
        all_succeeded("is_alive", join_all(futures).await)
    }

    /// Shut every worker down. Idempotent.
    pub async fn shutdown(&self) -> bool {
        let ok = self.workers.shutdown().await;
        if !ok {
            tracing::error!("generation workers did not all shut down cleanly");
        }
        ok
    }
}

impl std::fmt::Debug for VllmGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VllmGeneration")
            .field("model", &self.cfg.model_name)
            .field("flavor", &self.cfg.flavor())
            .field("sharding", self.workers.layout())
            .field("device_uuids", &self.device_uuids)
            .field("shut_down", &self.workers.is_shut_down())
            .finish()
    }
}

impl Drop for VllmGeneration {
    fn drop(&mut self) {
        if !self.workers.is_shut_down() {
            tracing::warn!("VllmGeneration dropped without shutdown; cancelling workers");
            self.workers.cancel();
        }
    }
}

#[async_trait]
impl GenerationInterface for VllmGeneration {
    async fn generate(&self, data: &BatchedData, greedy: bool) -> Result<BatchedData> {
        VllmGeneration::generate(self, data, greedy).await
    }

    async fn generate_text(&self, data: &BatchedData, greedy: bool) -> Result<BatchedData> {
        VllmGeneration::generate_text(self, data, greedy).await
    }

    async fn prepare_for_generation(&self, tags: Option<Vec<String>>) -> bool {
        VllmGeneration::prepare_for_generation(self, tags).await
    }

    async fn finish_generation(&self) -> bool {
        VllmGeneration::finish_generation(self).await
    }

    async fn update_weights(&self, ipc_handles: &IpcHandles) -> bool {
        VllmGeneration::update_weights(self, ipc_handles).await
    }

    fn device_uuids(&self) -> &[Vec<DeviceUuid>] {
        &self.device_uuids
    }

    async fn shutdown(&self) -> bool {
        VllmGeneration::shutdown(self).await
    }
}

/// Completion-ordered single-row results of [`VllmGeneration::generate_async`].
pub struct GenerationStream {
    inner: BoxStream<'static, IndexedGeneration>,
    pad_token_id: u32,
    requested: usize,
}

impl GenerationStream {
    /// Rows submitted. Rows whose request failed never arrive, so the stream
    /// may yield fewer items; [`GenerationStream::collect_batch`] rejects that.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Drain the stream into one batch ordered by original row index. Fails
    /// unless every submitted row produced exactly one result.
    pub async fn collect_batch(self) -> Result<BatchedData> {
        let pad = self.pad_token_id;
        let requested = self.requested;
        let mut items: Vec<IndexedGeneration> = self.collect().await;
        items.sort_by_key(|item| item.index);
        let missing = missing_rows(&items, requested);
        if !missing.is_empty() {
            return Err(GenerationError::RemoteCall(format!(
                "{} of {requested} generation requests produced no result; missing rows {missing:?}",
                missing.len()
            )));
        }
        if items.len() != requested {
            return Err(GenerationError::RemoteCall(format!(
                "expected {requested} generation results, received {}",
                items.len()
            )));
        }
        if items.is_empty() {
            return GenerationOutput::default().into_batch();
        }
        let batches = items
            .into_iter()
            .map(|item| item.output.into_batch())
            .collect::<Result<Vec<_>>>()?;
        let combined = BatchedData::from_batches(batches, &[(OUTPUT_IDS, pad)])?;
        check_schema(&combined, &GENERATION_OUTPUT_KEYS)?;
        Ok(combined)
    }
}

impl Stream for GenerationStream {
    type Item = IndexedGeneration;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStream")
            .field("requested", &self.requested)
            .finish_non_exhaustive()
    }
}

/// Row indices in `0..requested` with no result in `sorted`.
fn missing_rows(sorted: &[IndexedGeneration], requested: usize) -> Vec<usize> {
    let mut seen = vec![false; requested];
    for item in sorted {
        if let Some(slot) = seen.get_mut(item.index) {
            *slot = true;
        }
    }
    (0..requested).filter(|&i| !seen[i]).collect()
}

fn require_keys(data: &BatchedData, keys: &[&str]) -> Result<()> {
    let missing = data.missing_keys(keys);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GenerationError::InvalidInput(format!(
            "batch is missing required columns {missing:?}"
        )))
    }
}

fn check_schema(data: &BatchedData, keys: &[&str]) -> Result<()> {
    let missing = data.missing_keys(keys);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GenerationError::Schema { missing })
    }
}

fn unexpected(operation: &str, reply: &WorkerReply) -> GenerationError {
    GenerationError::RemoteCall(format!("{operation}: unexpected worker reply {reply:?}"))
}

/// `true` when every owner acknowledged. Failures are logged, never raised.
fn all_succeeded(operation: &str, replies: Vec<anyhow::Result<WorkerReply>>) -> bool {
    let mut ok = true;
    for (group, reply) in replies.into_iter().enumerate() {
        match reply {
            Ok(WorkerReply::Done) | Ok(WorkerReply::Alive(true)) | Ok(WorkerReply::Updated(true)) => {}
            Ok(other) => {
                tracing::error!(operation, group, reply = ?other, "worker reported failure");
                ok = false;
            }
            Err(e) => {
                tracing::error!(operation, group, "worker call failed: {e:#}");
                ok = false;
            }
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::LOGPROBS;

    fn row(index: usize, token: u32) -> IndexedGeneration {
        IndexedGeneration {
            index,
            output: GenerationOutput {
                output_ids: vec![vec![token, token + 1]],
                logprobs: vec![vec![0.0, -0.5]],
                generation_lengths: vec![1],
                unpadded_sequence_lengths: vec![2],
            },
        }
    }

    fn stream_of(items: Vec<IndexedGeneration>, requested: usize) -> GenerationStream {
        GenerationStream {
            inner: stream::iter(items).boxed(),
            pad_token_id: 0,
            requested,
        }
    }

    #[test]
    fn test_recombined_shard_without_logprobs_is_schema_error() {
        let complete = row(0, 10).output.into_batch().unwrap();
        let mut partial = row(1, 20).output.into_batch().unwrap();
        partial.remove(LOGPROBS);

        let combined = BatchedData::from_batches(vec![complete, partial], &[(OUTPUT_IDS, 0)]).unwrap();
        let err = check_schema(&combined, &GENERATION_OUTPUT_KEYS).unwrap_err();
        match err {
            GenerationError::Schema { missing } => assert_eq!(missing, vec![LOGPROBS.to_string()]),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_input_columns_are_invalid_input() {
        let err = require_keys(&BatchedData::new(), &[INPUT_IDS, INPUT_LENGTHS]).unwrap_err();
        assert!(matches!(err, GenerationError::InvalidInput(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_collect_batch_orders_rows_by_index() {
        let batch = stream_of(vec![row(2, 30), row(0, 10), row(1, 20)], 3)
            .collect_batch()
            .await
            .unwrap();
        let out = GenerationOutput::from_batch(&batch).unwrap();
        let firsts: Vec<u32> = out.output_ids.iter().map(|r| r[0]).collect();
        assert_eq!(firsts, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_collect_batch_rejects_missing_rows() {
        let err = stream_of(vec![row(2, 30), row(0, 10)], 3)
            .collect_batch()
            .await
            .unwrap_err();
        match err {
            GenerationError::RemoteCall(msg) => assert!(msg.contains("[1]"), "{msg}"),
            other => panic!("expected remote call error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_collect_batch_rejects_duplicate_rows() {
        let err = stream_of(vec![row(0, 10), row(0, 10)], 1)
            .collect_batch()
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::RemoteCall(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_collect_batch_of_nothing_is_empty_batch() {
        let batch = stream_of(Vec::new(), 0).collect_batch().await.unwrap();
        assert!(batch.missing_keys(&GENERATION_OUTPUT_KEYS).is_empty());
        assert_eq!(batch.batch_size(), 0);
    }
}
