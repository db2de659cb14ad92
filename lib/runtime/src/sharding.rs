// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Named 2-D grid of worker ranks.
//!
//! Rank `r` sits at `(dp, tp) = (r / tp_size, r % tp_size)`; every row of the
//! grid is one tied tensor-parallel group.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    DataParallel,
    TensorParallel,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::DataParallel => write!(f, "data_parallel"),
            Axis::TensorParallel => write!(f, "tensor_parallel"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingLayout {
    data_parallel: usize,
    tensor_parallel: usize,
}

impl ShardingLayout {
    /// Lay `world_size` ranks out as `world_size / tensor_parallel` rows.
    pub fn new(world_size: usize, tensor_parallel: usize) -> Result<Self> {
        if tensor_parallel == 0 {
            crate::raise!("tensor parallel size must be at least 1");
        }
        if world_size == 0 || world_size % tensor_parallel != 0 {
            crate::raise!(
                "world size {world_size} is not a positive multiple of tensor parallel size {tensor_parallel}"
            );
        }
        Ok(Self {
            data_parallel: world_size / tensor_parallel,
            tensor_parallel,
        })
    }

    /// Layout with explicit axis sizes.
    pub fn from_groups(data_parallel: usize, tensor_parallel: usize) -> Result<Self> {
        Self::new(data_parallel * tensor_parallel, tensor_parallel)
    }

    pub fn axis_size(&self, axis: Axis) -> usize {
        match axis {
            Axis::DataParallel => self.data_parallel,
            Axis::TensorParallel => self.tensor_parallel,
        }
    }

    pub fn world_size(&self) -> usize {
        self.data_parallel * self.tensor_parallel
    }

    pub fn rank(&self, dp: usize, tp: usize) -> usize {
        dp * self.tensor_parallel + tp
    }

    /// `(dp, tp)` coordinates of a rank.
    pub fn coords(&self, rank: usize) -> (usize, usize) {
        (rank / self.tensor_parallel, rank % self.tensor_parallel)
    }

    pub fn coord(&self, rank: usize, axis: Axis) -> usize {
        let (dp, tp) = self.coords(rank);
        match axis {
            Axis::DataParallel => dp,
            Axis::TensorParallel => tp,
        }
    }

    /// Ranks forming tied group `dp`.
    pub fn tied_group(&self, dp: usize) -> Range<usize> {
        let start = self.rank(dp, 0);
        start..start + self.tensor_parallel
    }

    /// Ranks whose coordinate is zero on every axis in `rank_0_only`. With no
    /// axes this is every rank.
    pub fn ranks_on(&self, rank_0_only: &[Axis]) -> Vec<usize> {
        (0..self.world_size())
            .filter(|&rank| rank_0_only.iter().all(|&axis| self.coord(rank, axis) == 0))
            .collect()
    }

    /// The tp=0 rank of each tied group, in data-parallel order.
    pub fn group_leaders(&self) -> Vec<usize> {
        (0..self.data_parallel).map(|dp| self.rank(dp, 0)).collect()
    }
}
