// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use genfleet_runtime::{BundleAssignment, PlacementGroup};

use crate::generation::{GenerationError, Result};

/// Split every node's bundles into consecutive groups of `tensor_parallel_size`,
/// node by node. Bundles left over on a node are not used.
pub fn tied_worker_bundle_indices(
    placement_groups: &[PlacementGroup],
    tensor_parallel_size: usize,
) -> Result<Vec<BundleAssignment>> {
    if tensor_parallel_size == 0 {
        return Err(GenerationError::Configuration(
            "tensor_parallel_size must be at least 1".to_string(),
        ));
    }

    let groups: Vec<BundleAssignment> = placement_groups
        .iter()
        .enumerate()
        .flat_map(|(node_index, pg)| {
            (0..pg.bundle_count / tensor_parallel_size).map(move |group| {
                let start = group * tensor_parallel_size;
                BundleAssignment::new(node_index, (start..start + tensor_parallel_size).collect())
            })
        })
        .collect();

    if groups.is_empty() {
        return Err(GenerationError::Configuration(format!(
            "cannot form any tensor parallel group of size {tensor_parallel_size}; \
             every node needs at least {tensor_parallel_size} bundles"
        )));
    }
    tracing::debug!(
        groups = groups.len(),
        tensor_parallel_size,
        "partitioned bundles into tied worker groups"
    );
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn nodes(counts: &[usize]) -> Vec<PlacementGroup> {
        counts.iter().copied().map(PlacementGroup::new).collect()
    }

    #[test]
    fn test_consecutive_groups_per_node() {
        let groups = tied_worker_bundle_indices(&nodes(&[4, 5]), 2).unwrap();
        assert_eq!(
            groups,
            vec![
                BundleAssignment::new(0, vec![0, 1]),
                BundleAssignment::new(0, vec![2, 3]),
                BundleAssignment::new(1, vec![0, 1]),
                BundleAssignment::new(1, vec![2, 3]),
            ]
        );
    }

    #[rstest]
    #[case(&[8], 1, 8)]
    #[case(&[8, 8], 4, 4)]
    #[case(&[3, 7, 2], 3, 3)]
    #[case(&[1, 4], 2, 2)]
    fn test_group_count(#[case] counts: &[usize], #[case] tp: usize, #[case] expected: usize) {
        let groups = tied_worker_bundle_indices(&nodes(counts), tp).unwrap();
        assert_eq!(groups.len(), expected);
        assert!(groups.iter().all(|g| g.group_size() == tp));
    }

    #[rstest]
    #[case(&[1, 1], 2)]
    #[case(&[], 1)]
    #[case(&[4], 0)]
    fn test_no_groups_is_configuration_error(#[case] counts: &[usize], #[case] tp: usize) {
        assert!(matches!(
            tied_worker_bundle_indices(&nodes(counts), tp),
            Err(GenerationError::Configuration(_))
        ));
    }
}
