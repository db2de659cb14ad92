// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process engine double. Generates predictable tokens without any device.

pub mod engine;
pub mod protocols;

pub use engine::{MockEngineLoader, MockVllmEngine};
pub use protocols::{MockEngineArgs, ResponseLength};
