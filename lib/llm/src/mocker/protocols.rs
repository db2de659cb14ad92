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

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::protocols::TokenIdType;

/// How many tokens the mock engine produces for a prompt, before stop
/// conditions and `max_tokens` are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseLength {
    /// Always `max_tokens`.
    #[default]
    MaxTokens,
    /// Prompt length minus this many tokens.
    PromptMinus(usize),
    Fixed(usize),
}

impl ResponseLength {
    pub fn resolve(&self, prompt_len: usize, max_tokens: usize) -> usize {
        let wanted = match *self {
            ResponseLength::MaxTokens => max_tokens,
            ResponseLength::PromptMinus(k) => prompt_len.saturating_sub(k),
            ResponseLength::Fixed(n) => n,
        };
        wanted.min(max_tokens)
    }
}

/// Configuration arguments for MockVllmEngine
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(pattern = "owned", build_fn(public))]
pub struct MockEngineArgs {
    #[builder(default = "32000")]
    pub vocab_size: u32,

    /// Report per-position log-probabilities when the request asks for them.
    #[builder(default = "true")]
    pub report_logprobs: bool,

    /// List a low-probability decoy candidate ahead of the emitted token.
    #[builder(default = "false")]
    pub decoy_logprobs: bool,

    /// Requests whose prompt starts with this token fail.
    #[builder(default)]
    pub fail_on_token: Option<TokenIdType>,

    /// Internal workers report failure for every weight update.
    #[builder(default = "false")]
    pub fail_weight_update: bool,

    /// Pause between streamed steps of the asynchronous engine.
    #[builder(default = "0")]
    pub step_delay_ms: u64,

    #[builder(default)]
    pub response_len: ResponseLength,
}

impl MockEngineArgs {
    pub fn builder() -> MockEngineArgsBuilder {
        MockEngineArgsBuilder::default()
    }
}

impl Default for MockEngineArgs {
    fn default() -> Self {
        MockEngineArgs {
            vocab_size: 32000,
            report_logprobs: true,
            decoy_logprobs: false,
            fail_on_token: None,
            fail_weight_update: false,
            step_delay_ms: 0,
            response_len: ResponseLength::default(),
        }
    }
}

/// Token emitted at step `step` after a prompt ending in `last`.
pub fn mock_token(last: TokenIdType, step: usize, vocab_size: u32) -> TokenIdType {
    ((last as u64 + step as u64 + 1) % vocab_size.max(1) as u64) as TokenIdType
}

/// Log-probability reported for step `step`.
pub fn mock_logprob(step: usize) -> f32 {
    -((step + 1) as f32) / 8.0
}
