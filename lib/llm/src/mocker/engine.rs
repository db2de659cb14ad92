// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MockVllmEngine - deterministic stand-in for the inference engine
//!
//! Implements both engine flavors over one shared core. Outputs depend only on
//! the prompt and the sampling parameters, so tests can predict every token.
//! The asynchronous flavor streams one step at a time with an optional delay,
//! which makes longer generations finish later.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::engine::{
    AsyncLlmEngine, CompletionOutput, EngineArgs, EngineLoader, LlmEngine, LoadedEngine, Logprob,
    Prompt, RequestOutput, RpcReply, SamplingParams, TopLogprobs, WorkerRpc,
};
use crate::mocker::protocols::{mock_logprob, mock_token, MockEngineArgs};
use crate::protocols::{DeviceUuid, TokenIdType};

/// Token listed ahead of the emitted one when decoys are enabled.
const DECOY_TOKEN: TokenIdType = 0;
const DECOY_LOGPROB: f32 = -9.0;

#[derive(Debug, Default)]
struct MockState {
    sleeping: bool,
    shut_down: bool,
    prefix_cache_resets: usize,
    sleep_levels: Vec<u32>,
    wake_tags: Vec<Option<Vec<String>>>,
    last_params: Option<SamplingParams>,
    requests_served: usize,
    weight_updates: Vec<Vec<DeviceUuid>>,
}

struct MockCore {
    args: MockEngineArgs,
    engine_args: EngineArgs,
    device_uuids: Vec<DeviceUuid>,
    state: Mutex<MockState>,
}

/// Deterministic engine implementing [`LlmEngine`] and [`AsyncLlmEngine`].
#[derive(Clone)]
pub struct MockVllmEngine {
    core: Arc<MockCore>,
}

impl MockVllmEngine {
    pub fn new(args: MockEngineArgs, engine_args: EngineArgs) -> Self {
        // one internal worker per device of the tied group
        let device_uuids = engine_args
            .bundle_indices
            .iter()
            .map(|bundle| format!("GPU-{}-{bundle}", engine_args.node_index))
            .collect();
        Self {
            core: Arc::new(MockCore {
                args,
                engine_args,
                device_uuids,
                state: Mutex::new(MockState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.core
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn engine_args(&self) -> &EngineArgs {
        &self.core.engine_args
    }

    pub fn device_uuids(&self) -> &[DeviceUuid] {
        &self.core.device_uuids
    }

    pub fn is_sleeping(&self) -> bool {
        self.state().sleeping
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    pub fn prefix_cache_resets(&self) -> usize {
        self.state().prefix_cache_resets
    }

    pub fn sleep_levels(&self) -> Vec<u32> {
        self.state().sleep_levels.clone()
    }

    pub fn wake_tags(&self) -> Vec<Option<Vec<String>>> {
        self.state().wake_tags.clone()
    }

    pub fn last_params(&self) -> Option<SamplingParams> {
        self.state().last_params.clone()
    }

    pub fn requests_served(&self) -> usize {
        self.state().requests_served
    }

    /// Device identities received by each weight update, sorted.
    pub fn weight_updates(&self) -> Vec<Vec<DeviceUuid>> {
        self.state().weight_updates.clone()
    }

    fn admit(&self, params: &SamplingParams) -> Result<()> {
        let mut state = self.state();
        if state.shut_down {
            bail!("mock engine has been shut down");
        }
        if state.sleeping {
            bail!("mock engine is asleep");
        }
        state.last_params = Some(params.clone());
        state.requests_served += 1;
        Ok(())
    }

    /// Full output for one prompt.
    fn complete(
        &self,
        prompt: &Prompt,
        params: &SamplingParams,
        request_id: String,
    ) -> Result<RequestOutput> {
        let args = &self.core.args;
        let (prompt_token_ids, last, prompt_len) = match prompt {
            Prompt::Tokens(ids) => (ids.clone(), ids.last().copied().unwrap_or(0), ids.len()),
            Prompt::Text(text) => (Vec::new(), text.len() as TokenIdType, text.split_whitespace().count()),
        };
        if let (Some(poison), Some(first)) = (args.fail_on_token, prompt_token_ids.first()) {
            if poison == *first {
                bail!("request {request_id} hit poisoned token {poison}");
            }
        }

        let budget = args.response_len.resolve(prompt_len, params.max_tokens);
        let stop_tokens: BTreeSet<TokenIdType> = params.stop_token_ids.iter().copied().collect();
        let stop_strings = params.stop.clone().unwrap_or_default();
        let report = args.report_logprobs && params.logprobs.is_some();

        let mut token_ids = Vec::with_capacity(budget);
        let mut logprobs: Vec<TopLogprobs> = Vec::with_capacity(budget);
        let mut text = String::new();
        let mut finish_reason = "length";
        for step in 0..budget {
            let token = mock_token(last, step, args.vocab_size);
            token_ids.push(token);
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&format!("t{token}"));

            let mut candidates = Vec::new();
            if args.decoy_logprobs && token != DECOY_TOKEN {
                candidates.push((
                    DECOY_TOKEN,
                    Logprob {
                        logprob: DECOY_LOGPROB,
                        rank: Some(2),
                    },
                ));
            }
            candidates.push((
                token,
                Logprob {
                    logprob: mock_logprob(step),
                    rank: Some(1),
                },
            ));
            logprobs.push(candidates);

            if stop_tokens.contains(&token) {
                finish_reason = "stop";
                break;
            }
            if let Some(stop) = stop_strings.iter().find(|s| text.contains(s.as_str())) {
                // keep output up to and including the stop string
                if let Some(pos) = text.find(stop.as_str()) {
                    text.truncate(pos + stop.len());
                }
                finish_reason = "stop";
                break;
            }
        }

        Ok(RequestOutput {
            request_id,
            prompt_token_ids,
            outputs: vec![CompletionOutput {
                index: 0,
                text,
                token_ids,
                logprobs: report.then_some(logprobs),
                finish_reason: Some(finish_reason.to_string()),
            }],
            finished: true,
        })
    }

    fn rpc(&self, rpc: &WorkerRpc) -> Result<Vec<RpcReply>> {
        if self.state().shut_down {
            bail!("mock engine has been shut down");
        }
        match rpc {
            WorkerRpc::ReportDeviceId => Ok(self
                .core
                .device_uuids
                .iter()
                .cloned()
                .map(RpcReply::DeviceId)
                .collect()),
            WorkerRpc::UpdateWeightsFromIpcHandles(handles) => {
                let mut received: Vec<DeviceUuid> = handles.keys().cloned().collect();
                received.sort();
                self.state().weight_updates.push(received);
                Ok(self
                    .core
                    .device_uuids
                    .iter()
                    .map(|uuid| {
                        RpcReply::Updated(!self.core.args.fail_weight_update && handles.contains_key(uuid))
                    })
                    .collect())
            }
        }
    }

    fn do_sleep(&self, level: u32) -> Result<()> {
        let mut state = self.state();
        if state.sleeping {
            bail!("mock engine is already asleep");
        }
        state.sleeping = true;
        state.sleep_levels.push(level);
        Ok(())
    }

    fn do_wake_up(&self, tags: Option<Vec<String>>) -> Result<()> {
        let mut state = self.state();
        state.sleeping = false;
        state.wake_tags.push(tags);
        Ok(())
    }

    fn do_reset_prefix_cache(&self) -> Result<()> {
        self.state().prefix_cache_resets += 1;
        Ok(())
    }

    fn mark_shut_down(&self) {
        self.state().shut_down = true;
    }
}

impl LlmEngine for MockVllmEngine {
    fn generate(&self, prompts: &[Prompt], params: &SamplingParams) -> Result<Vec<RequestOutput>> {
        self.admit(params)?;
        prompts
            .iter()
            .enumerate()
            .map(|(i, prompt)| self.complete(prompt, params, i.to_string()))
            .collect()
    }

    fn collective_rpc(&self, rpc: &WorkerRpc) -> Result<Vec<RpcReply>> {
        self.rpc(rpc)
    }

    fn reset_prefix_cache(&self) -> Result<()> {
        self.do_reset_prefix_cache()
    }

    fn sleep(&self, level: u32) -> Result<()> {
        self.do_sleep(level)
    }

    fn wake_up(&self, tags: Option<&[String]>) -> Result<()> {
        self.do_wake_up(tags.map(<[String]>::to_vec))
    }
}

#[async_trait]
impl AsyncLlmEngine for MockVllmEngine {
    fn generate(
        &self,
        prompt: Prompt,
        params: SamplingParams,
        request_id: String,
    ) -> BoxStream<'static, Result<RequestOutput>> {
        let engine = self.clone();
        let delay = Duration::from_millis(self.core.args.step_delay_ms);
        async_stream::stream! {
            if let Err(e) = engine.admit(&params) {
                yield Err(e);
                return;
            }
            let full = match engine.complete(&prompt, &params, request_id) {
                Ok(full) => full,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let steps = full.outputs.first().map(|o| o.token_ids.len()).unwrap_or(0);
            for step in 1..steps {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(partial(&full, step));
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            yield Ok(full);
        }
        .boxed()
    }

    async fn collective_rpc(&self, rpc: WorkerRpc) -> Result<Vec<RpcReply>> {
        self.rpc(&rpc)
    }

    async fn reset_prefix_cache(&self) -> Result<()> {
        self.do_reset_prefix_cache()
    }

    async fn sleep(&self, level: u32) -> Result<()> {
        self.do_sleep(level)
    }

    async fn wake_up(&self, tags: Option<Vec<String>>) -> Result<()> {
        self.do_wake_up(tags)
    }

    fn shutdown_background_loop(&self) -> Result<()> {
        self.mark_shut_down();
        Ok(())
    }
}

/// The first `steps` generated tokens of `full`, not yet finished.
fn partial(full: &RequestOutput, steps: usize) -> RequestOutput {
    let outputs = full
        .outputs
        .iter()
        .map(|o| CompletionOutput {
            index: o.index,
            text: String::new(),
            token_ids: o.token_ids[..steps.min(o.token_ids.len())].to_vec(),
            logprobs: o
                .logprobs
                .as_ref()
                .map(|lp| lp[..steps.min(lp.len())].to_vec()),
            finish_reason: None,
        })
        .collect();
    RequestOutput {
        request_id: full.request_id.clone(),
        prompt_token_ids: full.prompt_token_ids.clone(),
        outputs,
        finished: false,
    }
}

/// Builds [`MockVllmEngine`]s and keeps every engine it built for inspection.
#[derive(Default)]
pub struct MockEngineLoader {
    args: MockEngineArgs,
    /// Nodes on which loading fails.
    fail_on_nodes: BTreeSet<usize>,
    engines: Mutex<Vec<MockVllmEngine>>,
}

impl MockEngineLoader {
    pub fn new(args: MockEngineArgs) -> Self {
        Self {
            args,
            fail_on_nodes: BTreeSet::new(),
            engines: Mutex::new(Vec::new()),
        }
    }

    /// Loading an engine on `node` fails.
    pub fn failing_on_node(mut self, node: usize) -> Self {
        self.fail_on_nodes.insert(node);
        self
    }

    /// Engines built so far, ordered by tied group.
    pub fn engines(&self) -> Vec<MockVllmEngine> {
        let mut engines = self
            .engines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        engines.sort_by_key(|e| {
            (
                e.engine_args().node_index,
                e.engine_args().bundle_indices.first().copied(),
            )
        });
        engines
    }
}

impl EngineLoader for MockEngineLoader {
    fn load(&self, args: &EngineArgs) -> Result<LoadedEngine> {
        if self.fail_on_nodes.contains(&args.node_index) {
            return Err(anyhow!("no devices available on node {}", args.node_index));
        }
        let engine = MockVllmEngine::new(self.args.clone(), args.clone());
        self.engines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(engine.clone());
        tracing::debug!(
            node = args.node_index,
            bundles = ?args.bundle_indices,
            flavor = %args.flavor(),
            "loaded mock engine"
        );
        Ok(if args.async_engine {
            LoadedEngine::Async(Arc::new(engine))
        } else {
            LoadedEngine::Sync(Box::new(engine))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocker::protocols::ResponseLength;
    use std::collections::{BTreeMap, HashMap};

    fn engine_args(async_engine: bool) -> EngineArgs {
        EngineArgs {
            model: "mock".into(),
            load_format: "auto".into(),
            skip_tokenizer_init: true,
            tensor_parallel_size: 2,
            gpu_memory_utilization: 0.5,
            enable_prefix_caching: true,
            dtype: "bfloat16".into(),
            seed: Some(0),
            enforce_eager: true,
            max_model_len: 128,
            trust_remote_code: true,
            enable_sleep_mode: true,
            disable_log_stats: true,
            distributed_executor_backend: Some("ray".into()),
            async_engine,
            node_index: 1,
            bundle_indices: vec![2, 3],
            env: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    fn params(max_tokens: usize) -> SamplingParams {
        SamplingParams {
            temperature: 0.0,
            top_p: 1.0,
            top_k: 1,
            max_tokens,
            logprobs: Some(0),
            stop_token_ids: vec![],
            stop: None,
            include_stop_str_in_output: true,
        }
    }

    #[test]
    fn test_sync_generation_is_deterministic() {
        let engine = MockVllmEngine::new(MockEngineArgs::default(), engine_args(false));
        let out = LlmEngine::generate(&engine, &[Prompt::Tokens(vec![1, 2, 10])], &params(3)).unwrap();
        assert_eq!(out[0].outputs[0].token_ids, vec![11, 12, 13]);
        let lp = out[0].outputs[0].logprobs.as_ref().unwrap();
        assert_eq!(lp[2], vec![(13, Logprob { logprob: -0.375, rank: Some(1) })]);
        assert_eq!(engine.requests_served(), 1);
    }

    #[test]
    fn test_stop_token_is_included() {
        let engine = MockVllmEngine::new(MockEngineArgs::default(), engine_args(false));
        let mut p = params(8);
        p.stop_token_ids = vec![12];
        let out = LlmEngine::generate(&engine, &[Prompt::Tokens(vec![10])], &p).unwrap();
        assert_eq!(out[0].outputs[0].token_ids, vec![11, 12]);
        assert_eq!(out[0].outputs[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_text_stop_strings() {
        let engine = MockVllmEngine::new(MockEngineArgs::default(), engine_args(false));
        let mut p = params(8);
        p.stop = Some(vec!["t7".into()]);
        let out = LlmEngine::generate(&engine, &[Prompt::Text("abcde".into())], &p).unwrap();
        assert_eq!(out[0].outputs[0].text, "t6 t7");
    }

    #[test]
    fn test_sleep_blocks_generation_until_wake() {
        let engine = MockVllmEngine::new(MockEngineArgs::default(), engine_args(false));
        LlmEngine::sleep(&engine, 1).unwrap();
        assert!(LlmEngine::generate(&engine, &[Prompt::Tokens(vec![1])], &params(1)).is_err());
        LlmEngine::wake_up(&engine, Some(&["weights".to_string()])).unwrap();
        assert!(LlmEngine::generate(&engine, &[Prompt::Tokens(vec![1])], &params(1)).is_ok());
        assert_eq!(engine.wake_tags(), vec![Some(vec!["weights".to_string()])]);
    }

    #[test]
    fn test_weight_update_needs_every_device() {
        let engine = MockVllmEngine::new(MockEngineArgs::default(), engine_args(false));
        assert_eq!(engine.device_uuids(), &["GPU-1-2", "GPU-1-3"]);

        let mut handles = HashMap::new();
        handles.insert("GPU-1-2".to_string(), crate::protocols::IpcHandle::new(vec![1u8]));
        let replies = LlmEngine::collective_rpc(&engine, &WorkerRpc::UpdateWeightsFromIpcHandles(handles)).unwrap();
        assert_eq!(replies, vec![RpcReply::Updated(true), RpcReply::Updated(false)]);
        assert_eq!(engine.weight_updates(), vec![vec!["GPU-1-2".to_string()]]);
    }

    #[tokio::test]
    async fn test_async_stream_ends_with_finished_output() {
        let args = MockEngineArgs::builder()
            .response_len(ResponseLength::Fixed(3))
            .build()
            .unwrap();
        let engine = MockVllmEngine::new(args, engine_args(true));
        let items: Vec<RequestOutput> =
            AsyncLlmEngine::generate(&engine, Prompt::Tokens(vec![4]), params(8), "req".into())
                .map(|r| r.unwrap())
                .collect()
                .await;
        assert_eq!(items.len(), 3);
        assert!(!items[0].finished);
        assert_eq!(items[0].outputs[0].token_ids, vec![5]);
        let last = items.last().unwrap();
        assert!(last.finished);
        assert_eq!(last.request_id, "req");
        assert_eq!(last.outputs[0].token_ids, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_async_poisoned_request_fails() {
        let args = MockEngineArgs::builder()
            .fail_on_token(Some(99))
            .build()
            .unwrap();
        let engine = MockVllmEngine::new(args, engine_args(true));
        let items: Vec<Result<RequestOutput>> =
            AsyncLlmEngine::generate(&engine, Prompt::Tokens(vec![99, 1]), params(4), "bad".into())
                .collect()
                .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn test_loader_records_engines_and_fails_on_request() {
        let loader = MockEngineLoader::new(MockEngineArgs::default()).failing_on_node(3);
        let loaded = loader.load(&engine_args(true)).unwrap();
        assert!(matches!(loaded, LoadedEngine::Async(_)));
        assert_eq!(loader.engines().len(), 1);

        let mut elsewhere = engine_args(false);
        elsewhere.node_index = 3;
        assert!(loader.load(&elsewhere).is_err());
    }
}
