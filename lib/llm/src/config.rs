// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generation configuration.
//!
//! Configuration usually arrives as a loosely-typed map. [`VllmConfig::from_value`]
//! checks it against the schema below in one pass, reporting every missing and
//! every unknown key together, before deserializing and range-checking it.

use std::collections::BTreeSet;
use std::path::Path;

use derive_builder::Builder;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::engine::EngineFlavor;
use crate::generation::{GenerationError, Result};
use crate::protocols::TokenIdType;

/// Environment prefix for [`VllmConfig::from_settings`]. Nested keys use `__`,
/// e.g. `GENFLEET_GEN_VLLM_CFG__TENSOR_PARALLEL_SIZE=2`.
pub const GENERATION_ENV_PREFIX: &str = "GENFLEET_GEN_";

const REQUIRED_KEYS: &[&str] = &[
    "model_name",
    "max_new_tokens",
    "temperature",
    "top_p",
    "top_k",
    "stop_token_ids",
    "stop_strings",
    "pad_token_id",
    "vllm_cfg",
];
const OPTIONAL_KEYS: &[&str] = &["backend", "vllm_kwargs", "logprob_policy"];

const REQUIRED_VLLM_KEYS: &[&str] = &[
    "tensor_parallel_size",
    "gpu_memory_utilization",
    "max_model_len",
    "skip_tokenizer_init",
    "async_engine",
];
const OPTIONAL_VLLM_KEYS: &[&str] = &["load_format", "precision", "enable_prefix_caching"];

/// Which log-probability to record for a generated position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogprobPolicy {
    /// The candidate matching the token actually emitted; zero if absent.
    #[default]
    EmittedToken,
    /// Whichever candidate the engine lists first.
    FirstCandidate,
}

fn default_load_format() -> String {
    "auto".to_string()
}

fn default_precision() -> String {
    "bfloat16".to_string()
}

fn default_true() -> bool {
    true
}

/// Engine-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
#[serde(deny_unknown_fields)]
pub struct VllmSpecificArgs {
    #[validate(range(min = 1))]
    pub tensor_parallel_size: usize,

    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub gpu_memory_utilization: f64,

    #[validate(range(min = 1))]
    pub max_model_len: usize,

    #[builder(default)]
    pub skip_tokenizer_init: bool,

    /// Request-level asynchronous engine instead of the batch engine.
    #[builder(default)]
    pub async_engine: bool,

    #[serde(default = "default_load_format")]
    #[builder(default = "default_load_format()", setter(into))]
    pub load_format: String,

    #[serde(default = "default_precision")]
    #[builder(default = "default_precision()", setter(into))]
    pub precision: String,

    #[serde(default = "default_true")]
    #[builder(default = "true")]
    pub enable_prefix_caching: bool,
}

impl VllmSpecificArgs {
    pub fn builder() -> VllmSpecificArgsBuilder {
        VllmSpecificArgsBuilder::default()
    }
}

impl VllmSpecificArgsBuilder {
    pub fn build(self) -> Result<VllmSpecificArgs> {
        let args = self
            .build_internal()
            .map_err(|e| GenerationError::Configuration(e.to_string()))?;
        args.validate()
            .map_err(|e| GenerationError::Configuration(e.to_string()))?;
        Ok(args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
#[serde(deny_unknown_fields)]
pub struct VllmConfig {
    #[builder(setter(into))]
    pub model_name: String,

    #[validate(range(min = 1))]
    pub max_new_tokens: usize,

    #[builder(default = "1.0")]
    pub temperature: f32,

    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    #[builder(default = "1.0")]
    pub top_p: f32,

    /// `None` disables top-k filtering.
    #[builder(default)]
    pub top_k: Option<i32>,

    #[builder(default)]
    pub stop_token_ids: Option<Vec<TokenIdType>>,

    /// Stop strings applied to every request.
    #[builder(default)]
    pub stop_strings: Option<Vec<String>>,

    #[builder(default)]
    pub pad_token_id: TokenIdType,

    #[validate(nested)]
    pub vllm_cfg: VllmSpecificArgs,

    /// Free-form label of the backend in use.
    #[serde(default)]
    #[builder(default)]
    pub backend: Option<String>,

    /// Extra engine arguments passed through untouched.
    #[serde(default)]
    #[builder(default)]
    pub vllm_kwargs: serde_json::Map<String, Value>,

    #[serde(default)]
    #[builder(default)]
    pub logprob_policy: LogprobPolicy,
}

impl VllmConfigBuilder {
    pub fn build(self) -> Result<VllmConfig> {
        let config = self
            .build_internal()
            .map_err(|e| GenerationError::Configuration(e.to_string()))?;
        config
            .validate()
            .map_err(|e| GenerationError::Configuration(e.to_string()))?;
        Ok(config)
    }
}

impl VllmConfig {
    pub fn builder() -> VllmConfigBuilder {
        VllmConfigBuilder::default()
    }

    pub fn flavor(&self) -> EngineFlavor {
        EngineFlavor::from_async_flag(self.vllm_cfg.async_engine)
    }

    pub fn tensor_parallel_size(&self) -> usize {
        self.vllm_cfg.tensor_parallel_size
    }

    /// Check a loosely-typed configuration against the schema and convert it.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(top) = &value else {
            return Err(GenerationError::Configuration(
                "generation configuration must be a map".to_string(),
            ));
        };

        let mut missing = Vec::new();
        let mut unknown = Vec::new();
        check_keys(top, REQUIRED_KEYS, OPTIONAL_KEYS, "", &mut missing, &mut unknown);
        match top.get("vllm_cfg") {
            Some(Value::Object(nested)) => check_keys(
                nested,
                REQUIRED_VLLM_KEYS,
                OPTIONAL_VLLM_KEYS,
                "vllm_cfg.",
                &mut missing,
                &mut unknown,
            ),
            Some(other) => {
                return Err(GenerationError::Configuration(format!(
                    "vllm_cfg must be a map, got {other}"
                )))
            }
            None => {}
        }

        if !missing.is_empty() || !unknown.is_empty() {
            let provided: Vec<&str> = top.keys().map(String::as_str).collect();
            return Err(GenerationError::Configuration(format!(
                "missing keys: [{}]; unknown keys: [{}]; provided keys: [{}]",
                missing.join(", "),
                unknown.join(", "),
                provided.join(", ")
            )));
        }

        let config: VllmConfig = serde_json::from_value(value)
            .map_err(|e| GenerationError::Configuration(e.to_string()))?;
        config
            .validate()
            .map_err(|e| GenerationError::Configuration(e.to_string()))?;
        Ok(config)
    }

    /// Load from an optional TOML file, overridden by `GENFLEET_GEN_*`
    /// environment variables, then check as [`VllmConfig::from_value`].
    pub fn from_settings(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(
            Env::prefixed(GENERATION_ENV_PREFIX)
                .filter_map(|k| {
                    let full_key = format!("{GENERATION_ENV_PREFIX}{}", k.as_str());
                    // filters out empty environment variables
                    match std::env::var(&full_key) {
                        Ok(v) if !v.is_empty() => Some(k.into()),
                        _ => None,
                    }
                })
                .split("__"),
        );
        let value: Value = figment
            .extract()
            .map_err(|e| GenerationError::Configuration(e.to_string()))?;
        Self::from_value(value)
    }
}

fn check_keys(
    map: &serde_json::Map<String, Value>,
    required: &[&str],
    optional: &[&str],
    prefix: &str,
    missing: &mut Vec<String>,
    unknown: &mut Vec<String>,
) {
    missing.extend(
        required
            .iter()
            .filter(|key| !map.contains_key(**key))
            .map(|key| format!("{prefix}{key}")),
    );
    let known: BTreeSet<&str> = required.iter().chain(optional).copied().collect();
    unknown.extend(
        map.keys()
            .filter(|key| !known.contains(key.as_str()))
            .map(|key| format!("{prefix}{key}")),
    );
}
