// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Typed views over the batched columns exchanged with generation workers.

use std::collections::HashMap;

use bytes::Bytes;
use genfleet_runtime::{BatchedData, Column};
use serde::{Deserialize, Serialize};

use crate::generation::{GenerationError, Result};

pub type TokenIdType = u32;

/// Opaque identity of one physical device, e.g. `GPU-6f1c...`.
pub type DeviceUuid = String;

pub const INPUT_IDS: &str = "input_ids";
pub const INPUT_LENGTHS: &str = "input_lengths";
pub const STOP_STRINGS: &str = "stop_strings";
pub const PROMPTS: &str = "prompts";
pub const OUTPUT_IDS: &str = "output_ids";
pub const LOGPROBS: &str = "logprobs";
pub const GENERATION_LENGTHS: &str = "generation_lengths";
pub const UNPADDED_SEQUENCE_LENGTHS: &str = "unpadded_sequence_lengths";
pub const TEXTS: &str = "texts";

/// Columns every token-generation result must carry.
pub const GENERATION_OUTPUT_KEYS: [&str; 4] = [
    OUTPUT_IDS,
    GENERATION_LENGTHS,
    UNPADDED_SEQUENCE_LENGTHS,
    LOGPROBS,
];

/// Columns every text-generation result must carry.
pub const TEXT_OUTPUT_KEYS: [&str; 1] = [TEXTS];

/// Out-of-process reference to device memory holding updated parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcHandle(pub Bytes);

impl IpcHandle {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

pub type IpcHandles = HashMap<DeviceUuid, IpcHandle>;

/// Right-padded token prompts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationInput {
    pub input_ids: Vec<Vec<TokenIdType>>,
    pub input_lengths: Vec<usize>,
    /// Extra stop strings per row, merged with the configured defaults.
    pub stop_strings: Option<Vec<Option<Vec<String>>>>,
}

impl GenerationInput {
    pub fn from_batch(batch: &BatchedData) -> Result<Self> {
        let input_ids = batch.token_rows(INPUT_IDS).map_err(invalid)?.clone();
        let input_lengths = batch.lengths(INPUT_LENGTHS).map_err(invalid)?.clone();
        let stop_strings = match batch.get(STOP_STRINGS) {
            None => None,
            Some(_) => Some(batch.string_lists(STOP_STRINGS).map_err(invalid)?.clone()),
        };
        let input = Self {
            input_ids,
            input_lengths,
            stop_strings,
        };
        input.check_lengths()?;
        Ok(input)
    }

    pub fn into_batch(self) -> Result<BatchedData> {
        let mut batch = BatchedData::new();
        batch
            .insert(INPUT_IDS, Column::TokenRows(self.input_ids))
            .map_err(invalid)?;
        batch
            .insert(INPUT_LENGTHS, Column::Lengths(self.input_lengths))
            .map_err(invalid)?;
        if let Some(stops) = self.stop_strings {
            batch
                .insert(STOP_STRINGS, Column::StringLists(stops))
                .map_err(invalid)?;
        }
        Ok(batch)
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Width of the padded input rows.
    pub fn padded_length(&self) -> usize {
        self.input_ids.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Extra stop strings for `row`, if any.
    pub fn row_stop_strings(&self, row: usize) -> Option<&[String]> {
        self.stop_strings
            .as_ref()
            .and_then(|rows| rows.get(row))
            .and_then(|s| s.as_deref())
    }

    fn check_lengths(&self) -> Result<()> {
        if self.input_ids.len() != self.input_lengths.len() {
            return Err(GenerationError::InvalidInput(format!(
                "{} input rows but {} input lengths",
                self.input_ids.len(),
                self.input_lengths.len()
            )));
        }
        for (row, (ids, &len)) in self.input_ids.iter().zip(&self.input_lengths).enumerate() {
            if len > ids.len() {
                return Err(GenerationError::InvalidInput(format!(
                    "row {row} declares length {len} but holds {} tokens",
                    ids.len()
                )));
            }
        }
        Ok(())
    }
}

/// Every row must hold exactly `pad` after its declared length.
pub fn verify_right_padding(input: &GenerationInput, pad: TokenIdType) -> Result<()> {
    input.check_lengths()?;
    let width = input.padded_length();
    for (row, (ids, &len)) in input.input_ids.iter().zip(&input.input_lengths).enumerate() {
        if ids.len() != width {
            return Err(GenerationError::InvalidInput(format!(
                "row {row} has width {} but the batch is padded to {width}",
                ids.len()
            )));
        }
        if let Some(pos) = ids[len..].iter().position(|&t| t != pad) {
            return Err(GenerationError::InvalidInput(format!(
                "row {row} is not right-padded: position {} holds {} instead of pad {pad}",
                len + pos,
                ids[len + pos]
            )));
        }
    }
    Ok(())
}

/// Generated continuation for each input row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Input tokens followed by generated tokens, right-padded.
    pub output_ids: Vec<Vec<TokenIdType>>,
    /// Log-probability per position; zero outside generated positions.
    pub logprobs: Vec<Vec<f32>>,
    pub generation_lengths: Vec<usize>,
    /// Input length plus generation length.
    pub unpadded_sequence_lengths: Vec<usize>,
}

impl GenerationOutput {
    pub fn len(&self) -> usize {
        self.output_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output_ids.is_empty()
    }

    pub fn into_batch(self) -> Result<BatchedData> {
        let mut batch = BatchedData::new();
        batch
            .insert(OUTPUT_IDS, Column::TokenRows(self.output_ids))
            .map_err(invalid)?;
        batch
            .insert(LOGPROBS, Column::FloatRows(self.logprobs))
            .map_err(invalid)?;
        batch
            .insert(GENERATION_LENGTHS, Column::Lengths(self.generation_lengths))
            .map_err(invalid)?;
        batch
            .insert(
                UNPADDED_SEQUENCE_LENGTHS,
                Column::Lengths(self.unpadded_sequence_lengths),
            )
            .map_err(invalid)?;
        Ok(batch)
    }

    pub fn from_batch(batch: &BatchedData) -> Result<Self> {
        let missing = batch.missing_keys(&GENERATION_OUTPUT_KEYS);
        if !missing.is_empty() {
            return Err(GenerationError::Schema { missing });
        }
        Ok(Self {
            output_ids: batch.token_rows(OUTPUT_IDS).map_err(invalid)?.clone(),
            logprobs: batch.float_rows(LOGPROBS).map_err(invalid)?.clone(),
            generation_lengths: batch.lengths(GENERATION_LENGTHS).map_err(invalid)?.clone(),
            unpadded_sequence_lengths: batch
                .lengths(UNPADDED_SEQUENCE_LENGTHS)
                .map_err(invalid)?
                .clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextGenerationInput {
    pub prompts: Vec<String>,
    pub stop_strings: Option<Vec<Option<Vec<String>>>>,
}

impl TextGenerationInput {
    pub fn from_batch(batch: &BatchedData) -> Result<Self> {
        let prompts = batch.texts(PROMPTS).map_err(invalid)?.clone();
        let stop_strings = match batch.get(STOP_STRINGS) {
            None => None,
            Some(_) => Some(batch.string_lists(STOP_STRINGS).map_err(invalid)?.clone()),
        };
        Ok(Self {
            prompts,
            stop_strings,
        })
    }

    pub fn into_batch(self) -> Result<BatchedData> {
        let mut batch = BatchedData::new();
        batch
            .insert(PROMPTS, Column::Texts(self.prompts))
            .map_err(invalid)?;
        if let Some(stops) = self.stop_strings {
            batch
                .insert(STOP_STRINGS, Column::StringLists(stops))
                .map_err(invalid)?;
        }
        Ok(batch)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextGenerationOutput {
    pub texts: Vec<String>,
}

impl TextGenerationOutput {
    pub fn into_batch(self) -> Result<BatchedData> {
        BatchedData::new()
            .with(TEXTS, Column::Texts(self.texts))
            .map_err(invalid)
    }
}

/// One finished row from a streaming generation, tagged with the row's
/// position in the caller's batch.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedGeneration {
    pub index: usize,
    /// Single-row result.
    pub output: GenerationOutput,
}

fn invalid(err: anyhow::Error) -> GenerationError {
    GenerationError::InvalidInput(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> GenerationInput {
        GenerationInput {
            input_ids: vec![vec![5, 6, 7, 0], vec![8, 9, 0, 0]],
            input_lengths: vec![3, 2],
            stop_strings: Some(vec![Some(vec!["</s>".into()]), None]),
        }
    }

    #[test]
    fn test_input_batch_conversion() {
        let batch = input().into_batch().unwrap();
        assert_eq!(batch.batch_size(), 2);
        let back = GenerationInput::from_batch(&batch).unwrap();
        assert_eq!(back.row_stop_strings(0), Some(&["</s>".to_string()][..]));
        assert_eq!(back.row_stop_strings(1), None);
        assert_eq!(back.padded_length(), 4);
    }

    #[test]
    fn test_input_rejects_overlong_length() {
        let mut bad = input();
        bad.input_lengths[1] = 5;
        let batch = bad.into_batch().unwrap();
        assert!(matches!(
            GenerationInput::from_batch(&batch),
            Err(GenerationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_verify_right_padding() {
        assert!(verify_right_padding(&input(), 0).is_ok());
        assert!(verify_right_padding(&input(), 1).is_err());

        let mut ragged = input();
        ragged.input_ids[1].pop();
        assert!(verify_right_padding(&ragged, 0).is_err());

        let mut left_padded = input();
        left_padded.input_ids[1] = vec![0, 8, 9, 0];
        left_padded.input_lengths[1] = 1;
        let err = verify_right_padding(&left_padded, 0).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_empty_output_is_schema_valid() {
        let batch = GenerationOutput::default().into_batch().unwrap();
        assert_eq!(batch.batch_size(), 0);
        assert!(batch.missing_keys(&GENERATION_OUTPUT_KEYS).is_empty());
        assert_eq!(GenerationOutput::from_batch(&batch).unwrap().len(), 0);
    }

    #[test]
    fn test_output_reports_missing_columns() {
        let batch = BatchedData::new()
            .with(OUTPUT_IDS, Column::TokenRows(vec![vec![1]]))
            .unwrap();
        match GenerationOutput::from_batch(&batch) {
            Err(GenerationError::Schema { missing }) => assert_eq!(
                missing,
                vec![GENERATION_LENGTHS, UNPADDED_SEQUENCE_LENGTHS, LOGPROBS]
            ),
            other => panic!("unexpected {other:?}"),
        }
    }
}
