// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::Validate;

/// Optional TOML file consulted for worker settings.
const WORKER_CONFIG_PATH: &str = "/opt/genfleet/etc/worker.toml";

/// Environment prefix for [`WorkerConfig`] overrides.
const WORKER_ENV_PREFIX: &str = "GENFLEET_WORKER_";

/// Settings shared by every worker thread of a [`crate::WorkerGroup`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WorkerConfig {
    /// Seconds a worker is given to acknowledge a bulk shutdown before it is
    /// reported as failed and cancelled.
    /// Set this at runtime with environment variable GENFLEET_WORKER_GRACEFUL_SHUTDOWN_TIMEOUT.
    #[validate(range(min = 1))]
    pub graceful_shutdown_timeout: u64,

    /// Stack size in bytes for each worker thread.
    /// Set this at runtime with environment variable GENFLEET_WORKER_THREAD_STACK_SIZE.
    #[validate(range(min = 65536))]
    pub thread_stack_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            graceful_shutdown_timeout: if cfg!(debug_assertions) {
                5 // Debug build: 5 seconds
            } else {
                30 // Release build: 30 seconds
            },
            thread_stack_size: 8 * 1024 * 1024,
        }
    }
}

impl fmt::Display for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "graceful_shutdown_timeout={}s, thread_stack_size={}",
            self.graceful_shutdown_timeout, self.thread_stack_size
        )
    }
}

impl WorkerConfig {
    pub(crate) fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(WorkerConfig::default()))
            .merge(Toml::file(WORKER_CONFIG_PATH))
            .merge(Env::prefixed(WORKER_ENV_PREFIX).filter_map(|k| {
                let full_key = format!("{WORKER_ENV_PREFIX}{}", k.as_str());
                // filters out empty environment variables
                match std::env::var(&full_key) {
                    Ok(v) if !v.is_empty() => Some(k.into()),
                    _ => None,
                }
            }))
    }

    /// Load the worker configuration.
    ///
    /// Priority, highest first:
    /// 1. Environment variables prefixed with `GENFLEET_WORKER_`
    /// 2. /opt/genfleet/etc/worker.toml
    /// 3. [`WorkerConfig::default`]
    pub fn from_settings() -> Result<WorkerConfig> {
        let config: WorkerConfig = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout)
    }
}

/// Check if a string is truthy
/// This will be used to evaluate environment variables or any other subjective
/// configuration parameters that can be set by the user that should be evaluated
/// as a boolean value.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if a string is falsey (opposite of [`is_truthy`]).
pub fn is_falsey(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "0" | "false" | "off" | "no")
}

/// Check if an environment variable is truthy
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Check if an environment variable is falsey
pub fn env_is_falsey(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_falsey(val.as_str()),
        Err(_) => false,
    }
}

/// Check whether JSONL logging enabled
/// Set the `GENFLEET_LOGGING_JSONL` environment variable a [`is_truthy`] value
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy("GENFLEET_LOGGING_JSONL")
}

/// Check whether logging with ANSI terminal escape codes and colors is disabled.
/// Set the `GENFLEET_DISABLE_ANSI_LOGGING` environment variable a [`is_truthy`] value
pub fn disable_ansi_logging() -> bool {
    env_is_truthy("GENFLEET_DISABLE_ANSI_LOGGING")
}

/// Check whether to use local timezone for logging timestamps (default is UTC)
/// Set the `GENFLEET_LOG_USE_LOCAL_TZ` environment variable to a [`is_truthy`] value
pub fn use_local_timezone() -> bool {
    env_is_truthy("GENFLEET_LOG_USE_LOCAL_TZ")
}
