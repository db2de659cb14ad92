// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Batched column container passed in and out of workers.
//!
//! A [`BatchedData`] is a set of named columns that all share one leading
//! (batch) dimension. It can be split into data-parallel shards and put back
//! together, re-padding ragged 2-D columns on the way.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{ErrorContext, Result};

/// One named column. Every variant is indexed by batch row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum Column {
    TokenRows(Vec<Vec<u32>>),
    FloatRows(Vec<Vec<f32>>),
    Lengths(Vec<usize>),
    Texts(Vec<String>),
    StringLists(Vec<Option<Vec<String>>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::TokenRows(v) => v.len(),
            Column::FloatRows(v) => v.len(),
            Column::Lengths(v) => v.len(),
            Column::Texts(v) => v.len(),
            Column::StringLists(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Column::TokenRows(_) => "token_rows",
            Column::FloatRows(_) => "float_rows",
            Column::Lengths(_) => "lengths",
            Column::Texts(_) => "texts",
            Column::StringLists(_) => "string_lists",
        }
    }

    fn slice(&self, range: Range<usize>) -> Column {
        match self {
            Column::TokenRows(v) => Column::TokenRows(v[range].to_vec()),
            Column::FloatRows(v) => Column::FloatRows(v[range].to_vec()),
            Column::Lengths(v) => Column::Lengths(v[range].to_vec()),
            Column::Texts(v) => Column::Texts(v[range].to_vec()),
            Column::StringLists(v) => Column::StringLists(v[range].to_vec()),
        }
    }

    /// Append `other` to `self`. Both must be the same kind.
    fn extend(&mut self, other: Column) -> Result<()> {
        match (self, other) {
            (Column::TokenRows(a), Column::TokenRows(b)) => a.extend(b),
            (Column::FloatRows(a), Column::FloatRows(b)) => a.extend(b),
            (Column::Lengths(a), Column::Lengths(b)) => a.extend(b),
            (Column::Texts(a), Column::Texts(b)) => a.extend(b),
            (Column::StringLists(a), Column::StringLists(b)) => a.extend(b),
            (a, b) => crate::raise!("cannot concatenate {} with {}", a.kind(), b.kind()),
        }
        Ok(())
    }

    /// Right-pad every 2-D row to the widest row. `pad` applies to token
    /// rows; float rows are padded with zero. 1-D columns are untouched.
    fn pad_rows(&mut self, pad: u32) {
        match self {
            Column::TokenRows(rows) => {
                let width = rows.iter().map(Vec::len).max().unwrap_or(0);
                rows.iter_mut().for_each(|row| row.resize(width, pad));
            }
            Column::FloatRows(rows) => {
                let width = rows.iter().map(Vec::len).max().unwrap_or(0);
                rows.iter_mut().for_each(|row| row.resize(width, 0.0));
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchedData {
    columns: BTreeMap<String, Column>,
}

impl BatchedData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`BatchedData::insert`].
    pub fn with(mut self, key: impl Into<String>, column: Column) -> Result<Self> {
        self.insert(key, column)?;
        Ok(self)
    }

    /// Add or replace a column. Its length must match the existing batch size.
    pub fn insert(&mut self, key: impl Into<String>, column: Column) -> Result<()> {
        let key = key.into();
        if let Some((existing_key, existing)) = self.columns.iter().find(|(k, _)| **k != key) {
            if existing.len() != column.len() {
                crate::raise!(
                    "column '{key}' has {} rows but column '{existing_key}' has {}",
                    column.len(),
                    existing.len()
                );
            }
        }
        self.columns.insert(key, column);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Column> {
        self.columns.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Column> {
        self.columns.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.columns.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Size of the shared leading dimension; zero for a batch with no columns.
    pub fn batch_size(&self) -> usize {
        self.columns.values().next().map(Column::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.batch_size() == 0
    }

    /// Keys from `required` that are absent, in the order given.
    pub fn missing_keys(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|key| !self.columns.contains_key(**key))
            .map(|key| key.to_string())
            .collect()
    }

    pub fn token_rows(&self, key: &str) -> Result<&Vec<Vec<u32>>> {
        match self.require(key)? {
            Column::TokenRows(v) => Ok(v),
            other => crate::raise!("column '{key}' is {}, expected token_rows", other.kind()),
        }
    }

    pub fn float_rows(&self, key: &str) -> Result<&Vec<Vec<f32>>> {
        match self.require(key)? {
            Column::FloatRows(v) => Ok(v),
            other => crate::raise!("column '{key}' is {}, expected float_rows", other.kind()),
        }
    }

    pub fn lengths(&self, key: &str) -> Result<&Vec<usize>> {
        match self.require(key)? {
            Column::Lengths(v) => Ok(v),
            other => crate::raise!("column '{key}' is {}, expected lengths", other.kind()),
        }
    }

    pub fn texts(&self, key: &str) -> Result<&Vec<String>> {
        match self.require(key)? {
            Column::Texts(v) => Ok(v),
            other => crate::raise!("column '{key}' is {}, expected texts", other.kind()),
        }
    }

    pub fn string_lists(&self, key: &str) -> Result<&Vec<Option<Vec<String>>>> {
        match self.require(key)? {
            Column::StringLists(v) => Ok(v),
            other => crate::raise!("column '{key}' is {}, expected string_lists", other.kind()),
        }
    }

    fn require(&self, key: &str) -> Result<&Column> {
        self.columns
            .get(key)
            .with_context(|| format!("missing column '{key}'"))
    }

    /// Rows `range` of every column.
    pub fn slice(&self, range: Range<usize>) -> Result<BatchedData> {
        if range.start > range.end || range.end > self.batch_size() {
            crate::raise!(
                "slice {range:?} out of bounds for batch of {}",
                self.batch_size()
            );
        }
        Ok(BatchedData {
            columns: self
                .columns
                .iter()
                .map(|(k, c)| (k.clone(), c.slice(range.clone())))
                .collect(),
        })
    }

    /// Split along the batch dimension into exactly `shards` pieces.
    ///
    /// With `allow_uneven`, the first `batch_size % shards` shards receive one
    /// extra row and trailing shards may be empty. Without it, the batch size
    /// must divide evenly.
    pub fn shard_by_batch_size(&self, shards: usize, allow_uneven: bool) -> Result<Vec<BatchedData>> {
        if shards == 0 {
            crate::raise!("cannot shard a batch into zero pieces");
        }
        let total = self.batch_size();
        let base = total / shards;
        let remainder = total % shards;
        if remainder != 0 && !allow_uneven {
            crate::raise!("batch size {total} is not divisible by {shards} shards");
        }

        let mut start = 0;
        (0..shards)
            .map(|i| {
                let size = base + usize::from(i < remainder);
                let shard = self.slice(start..start + size);
                start += size;
                shard
            })
            .collect()
    }

    /// Concatenate batches in order.
    ///
    /// Only keys present in every batch survive. Ragged 2-D columns are
    /// right-padded to the widest row across all batches, token columns with
    /// the pad value listed for that key (zero when unlisted).
    pub fn from_batches(batches: Vec<BatchedData>, pad_values: &[(&str, u32)]) -> Result<BatchedData> {
        let mut iter = batches.into_iter();
        let Some(first) = iter.next() else {
            return Ok(BatchedData::new());
        };
        let rest: Vec<BatchedData> = iter.collect();

        let shared: BTreeSet<String> = first
            .columns
            .keys()
            .filter(|k| rest.iter().all(|b| b.columns.contains_key(*k)))
            .cloned()
            .collect();

        let mut columns: BTreeMap<String, Column> = first
            .columns
            .into_iter()
            .filter(|(k, _)| shared.contains(k))
            .collect();
        for mut batch in rest {
            for (key, column) in columns.iter_mut() {
                if let Some(next) = batch.columns.remove(key) {
                    column
                        .extend(next)
                        .with_context(|| format!("combining column '{key}'"))?;
                }
            }
        }

        for (key, column) in columns.iter_mut() {
            let pad = pad_values
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
                .unwrap_or(0);
            column.pad_rows(pad);
        }
        Ok(BatchedData { columns })
    }
}
