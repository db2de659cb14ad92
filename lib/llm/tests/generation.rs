// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use futures::StreamExt;
use genfleet_llm::config::{VllmConfig, VllmSpecificArgs};
use genfleet_llm::mocker::{MockEngineArgs, MockEngineLoader, ResponseLength};
use genfleet_llm::protocols::{
    GenerationOutput, IpcHandle, IpcHandles, GENERATION_OUTPUT_KEYS, INPUT_IDS, INPUT_LENGTHS,
    PROMPTS, STOP_STRINGS, TEXTS,
};
use genfleet_llm::{GenerationError, GenerationInterface, VllmGeneration};
use genfleet_runtime::{Axis, BatchedData, Column, VirtualCluster, WorkerConfig};

fn config(tp: usize, async_engine: bool) -> VllmConfig {
    let vllm_cfg = VllmSpecificArgs::builder()
        .tensor_parallel_size(tp)
        .gpu_memory_utilization(0.6)
        .max_model_len(512)
        .async_engine(async_engine)
        .build()
        .unwrap();
    VllmConfig::builder()
        .model_name("mock-model")
        .max_new_tokens(16)
        .pad_token_id(0)
        .vllm_cfg(vllm_cfg)
        .build()
        .unwrap()
}

async fn start(
    nodes: &[usize],
    cfg: VllmConfig,
    args: MockEngineArgs,
) -> (VllmGeneration, Arc<MockEngineLoader>) {
    genfleet_runtime::logging::init();
    let loader = Arc::new(MockEngineLoader::new(args));
    let cluster = VirtualCluster::new(nodes.iter().copied());
    let generation = VllmGeneration::new_named(
        &cluster,
        cfg,
        loader.clone(),
        "test_policy",
        WorkerConfig::default(),
    )
    .await
    .unwrap();
    (generation, loader)
}

fn token_batch(rows: Vec<Vec<u32>>, lengths: Vec<usize>) -> BatchedData {
    BatchedData::new()
        .with(INPUT_IDS, Column::TokenRows(rows))
        .unwrap()
        .with(INPUT_LENGTHS, Column::Lengths(lengths))
        .unwrap()
}

fn fixed(n: usize) -> MockEngineArgs {
    MockEngineArgs::builder()
        .response_len(ResponseLength::Fixed(n))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_uneven_batch_keeps_row_order() {
    let (generation, loader) = start(&[3], config(1, false), fixed(2)).await;
    assert_eq!(generation.sharding().axis_size(Axis::DataParallel), 3);

    let rows: Vec<Vec<u32>> = (1..=5).map(|i| vec![i * 10, 0]).collect();
    let out = generation
        .generate(&token_batch(rows, vec![1; 5]), true)
        .await
        .unwrap();
    let out = GenerationOutput::from_batch(&out).unwrap();
    assert_eq!(out.len(), 5);
    for (i, ids) in out.output_ids.iter().enumerate() {
        let first = (i as u32 + 1) * 10;
        assert_eq!(ids, &vec![first, first + 1, first + 2, 0]);
    }

    // shards of 2, 2 and 1 rows
    let served: Vec<usize> = loader.engines().iter().map(|e| e.requests_served()).collect();
    assert_eq!(served, vec![1, 1, 1]);
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_tensor_parallel_groups_and_device_ids() {
    let (generation, loader) = start(&[4, 2], config(2, false), MockEngineArgs::default()).await;
    let layout = generation.sharding();
    assert_eq!(layout.axis_size(Axis::DataParallel), 3);
    assert_eq!(layout.axis_size(Axis::TensorParallel), 2);
    assert_eq!(
        generation.device_uuids(),
        &[
            vec!["GPU-0-0".to_string(), "GPU-0-1".to_string()],
            vec!["GPU-0-2".to_string(), "GPU-0-3".to_string()],
            vec!["GPU-1-0".to_string(), "GPU-1-1".to_string()],
        ]
    );

    // only owners load engines, with one seed per tied group
    let engines = loader.engines();
    assert_eq!(engines.len(), 3);
    let seeds: Vec<Option<u64>> = engines.iter().map(|e| e.engine_args().seed).collect();
    assert_eq!(seeds, vec![Some(0), Some(1), Some(1024)]);
    assert_eq!(
        engines[0].engine_args().distributed_executor_backend.as_deref(),
        Some("ray")
    );
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_shards_are_padded_to_widest_row() {
    let args = MockEngineArgs::builder()
        .response_len(ResponseLength::PromptMinus(1))
        .build()
        .unwrap();
    let (generation, _loader) = start(&[2], config(1, false), args).await;

    let data = token_batch(
        vec![vec![1, 2, 3, 0, 0, 0, 0, 0], vec![4, 5, 6, 7, 8, 0, 0, 0]],
        vec![3, 5],
    );
    let out = GenerationOutput::from_batch(&generation.generate(&data, false).await.unwrap()).unwrap();
    assert_eq!(out.output_ids[0], vec![1, 2, 3, 4, 5, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(out.output_ids[1], vec![4, 5, 6, 7, 8, 9, 10, 11, 12, 0, 0, 0]);
    assert_eq!(out.logprobs[0].len(), 12);
    assert_eq!(out.generation_lengths, vec![2, 4]);
    assert_eq!(out.unpadded_sequence_lengths, vec![5, 9]);
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_empty_batch_returns_schema_valid_result() {
    let (generation, loader) = start(&[2], config(1, false), MockEngineArgs::default()).await;
    let out = generation.generate(&token_batch(vec![], vec![]), false).await.unwrap();
    assert_eq!(out.batch_size(), 0);
    assert!(out.missing_keys(&GENERATION_OUTPUT_KEYS).is_empty());
    assert!(loader.engines().iter().all(|e| e.requests_served() == 0));
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_missing_input_columns_rejected() {
    let (generation, _loader) = start(&[1], config(1, false), MockEngineArgs::default()).await;
    let data = BatchedData::new()
        .with(INPUT_IDS, Column::TokenRows(vec![vec![1]]))
        .unwrap();
    assert!(matches!(
        generation.generate(&data, false).await,
        Err(GenerationError::InvalidInput(_))
    ));
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_generate_async_requires_async_engine() {
    let (generation, loader) = start(&[1], config(1, false), MockEngineArgs::default()).await;
    let err = generation
        .generate_async(&token_batch(vec![vec![1]], vec![1]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, GenerationError::ModeMismatch { .. }));
    assert_eq!(loader.engines()[0].requests_served(), 0);
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let (generation, loader) = start(&[2], config(1, true), MockEngineArgs::default()).await;
    assert!(generation.shutdown().await);
    assert!(generation.shutdown().await);
    assert!(generation.is_shut_down());
    assert!(loader.engines().iter().all(|e| e.is_shut_down()));
}

#[tokio::test]
async fn test_is_alive_until_shutdown() {
    let (generation, _loader) = start(&[2, 2], config(2, false), MockEngineArgs::default()).await;
    assert!(generation.is_alive().await);
    assert!(generation.shutdown().await);
    assert!(!generation.is_alive().await);
}

#[tokio::test]
async fn test_generation_debug_names_model() {
    let (generation, _loader) = start(&[1], config(1, false), MockEngineArgs::default()).await;
    let rendered = format!("{generation:?}");
    assert!(rendered.contains("mock-model"), "{rendered}");
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_update_weights_routes_subsets() {
    let (generation, loader) = start(&[2, 2], config(2, false), MockEngineArgs::default()).await;
    let all: Vec<String> = generation.device_uuids().iter().flatten().cloned().collect();

    let mut handles = IpcHandles::new();
    for uuid in &all[..3] {
        handles.insert(uuid.clone(), IpcHandle::new(uuid.clone().into_bytes()));
    }
    assert!(!generation.update_weights(&handles).await);
    // nothing dispatched
    assert!(loader.engines().iter().all(|e| e.weight_updates().is_empty()));

    handles.insert(all[3].clone(), IpcHandle::new(vec![3u8]));
    assert!(generation.update_weights(&handles).await);
    let engines = loader.engines();
    assert_eq!(engines[0].weight_updates(), vec![vec!["GPU-0-0".to_string(), "GPU-0-1".to_string()]]);
    assert_eq!(engines[1].weight_updates(), vec![vec!["GPU-1-0".to_string(), "GPU-1-1".to_string()]]);
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_update_weights_reports_engine_failure() {
    let args = MockEngineArgs::builder()
        .fail_weight_update(true)
        .build()
        .unwrap();
    let (generation, _loader) = start(&[1], config(1, true), args).await;
    let handles: IpcHandles = generation
        .device_uuids()
        .iter()
        .flatten()
        .map(|uuid| (uuid.clone(), IpcHandle::new(vec![0u8])))
        .collect();
    assert!(!generation.update_weights(&handles).await);
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_sleep_and_wake_cycle() {
    let (generation, loader) = start(&[2], config(1, false), fixed(1)).await;
    let data = token_batch(vec![vec![1], vec![2]], vec![1, 1]);

    assert!(generation.finish_generation().await);
    for engine in loader.engines() {
        assert!(engine.is_sleeping());
        assert_eq!(engine.prefix_cache_resets(), 1);
        assert_eq!(engine.sleep_levels(), vec![1]);
    }
    assert!(generation.generate(&data, false).await.is_err());
    // already asleep
    assert!(!generation.finish_generation().await);

    assert!(generation.prepare_for_generation(Some(vec!["weights".into()])).await);
    for engine in loader.engines() {
        assert!(!engine.is_sleeping());
        assert_eq!(engine.wake_tags(), vec![Some(vec!["weights".to_string()])]);
    }
    assert!(generation.generate(&data, false).await.is_ok());
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_generate_async_streams_in_completion_order() {
    let args = MockEngineArgs::builder()
        .response_len(ResponseLength::PromptMinus(0))
        .step_delay_ms(10)
        .build()
        .unwrap();
    let (generation, _loader) = start(&[2], config(1, true), args).await;

    let data = token_batch(
        vec![
            vec![1, 2, 3, 4, 5, 6],
            vec![11, 12, 13, 14, 15, 16],
            vec![7, 0, 0, 0, 0, 0],
            vec![21, 22, 23, 24, 25, 26],
        ],
        vec![6, 6, 1, 6],
    );
    let mut stream = generation.generate_async(&data, true).await.unwrap();
    assert_eq!(stream.requested(), 4);
    let first = stream.next().await.unwrap();
    // the one-token request on the second group finishes first
    assert_eq!(first.index, 2);
    assert_eq!(first.output.output_ids[0], vec![7, 8, 0, 0, 0, 0, 0]);
    let mut seen: Vec<usize> = stream.map(|g| g.index).collect().await;
    seen.sort();
    assert_eq!(seen, vec![0, 1, 3]);

    let batch = generation
        .generate_async(&data, true)
        .await
        .unwrap()
        .collect_batch()
        .await
        .unwrap();
    let out = GenerationOutput::from_batch(&batch).unwrap();
    assert_eq!(out.generation_lengths, vec![6, 6, 1, 6]);
    assert_eq!(out.output_ids[2], vec![7, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(out.output_ids[3][6..], [27, 28, 29, 30, 31, 32]);
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_collect_batch_fails_when_a_request_fails() {
    let args = MockEngineArgs::builder()
        .response_len(ResponseLength::Fixed(2))
        .fail_on_token(Some(99))
        .build()
        .unwrap();
    let (generation, _loader) = start(&[1], config(1, true), args).await;
    let data = token_batch(vec![vec![10], vec![99], vec![30]], vec![1, 1, 1]);

    let mut seen: Vec<usize> = generation
        .generate_async(&data, true)
        .await
        .unwrap()
        .map(|g| g.index)
        .collect()
        .await;
    seen.sort();
    assert_eq!(seen, vec![0, 2]);

    let err = generation
        .generate_async(&data, true)
        .await
        .unwrap()
        .collect_batch()
        .await
        .unwrap_err();
    match err {
        GenerationError::RemoteCall(msg) => assert!(msg.contains("[1]"), "{msg}"),
        other => panic!("expected remote call error, got {other:?}"),
    }
    assert!(generation.shutdown().await);
}

#[tokio::test]
async fn test_generate_text_through_interface() {
    let mut cfg = config(1, false);
    cfg.stop_strings = Some(vec!["t9".to_string()]);
    let (generation, loader) = start(&[1], cfg, MockEngineArgs::default()).await;
    let backend: &dyn GenerationInterface = &generation;

    let data = BatchedData::new()
        .with(PROMPTS, Column::Texts(vec!["abcdef".into(), "ab".into()]))
        .unwrap()
        .with(
            STOP_STRINGS,
            Column::StringLists(vec![None, Some(vec!["t4".into()])]),
        )
        .unwrap();
    let out = backend.generate_text(&data, true).await.unwrap();
    let texts = out.texts(TEXTS).unwrap();
    assert_eq!(texts, &vec!["t7 t8 t9".to_string(), "t3 t4".to_string()]);
    let params = loader.engines()[0].last_params().unwrap();
    assert_eq!(params.stop, Some(vec!["t4".to_string(), "t9".to_string()]));
    assert_eq!(params.temperature, 0.0);
    assert_eq!(params.top_k, 1);
    assert!(backend.shutdown().await);
}

#[tokio::test]
async fn test_scoped_shuts_down_on_exit() {
    let loader = Arc::new(MockEngineLoader::new(MockEngineArgs::default()));
    let cluster = VirtualCluster::new([2]);
    let mut kept = None;
    let groups = VllmGeneration::scoped(&cluster, config(1, true), loader.clone(), |generation| {
        kept = Some(generation.clone());
        async move { Ok::<_, GenerationError>(generation.device_uuids().len()) }
    })
    .await
    .unwrap();
    assert_eq!(groups, 2);
    assert!(kept.unwrap().is_shut_down());
    assert!(loader.engines().iter().all(|e| e.is_shut_down()));
}

#[tokio::test]
async fn test_engine_load_failure_fails_construction() {
    let loader = Arc::new(MockEngineLoader::new(MockEngineArgs::default()).failing_on_node(1));
    let cluster = VirtualCluster::new([1, 1]);
    let err = VllmGeneration::new_named(
        &cluster,
        config(1, false),
        loader,
        "test_policy",
        WorkerConfig::default(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("no devices available on node 1"), "{err}");
}

#[tokio::test]
async fn test_tensor_parallel_wider_than_nodes_is_configuration_error() {
    let loader = Arc::new(MockEngineLoader::new(MockEngineArgs::default()));
    let cluster = VirtualCluster::new([2, 2]);
    let err = VllmGeneration::new_named(
        &cluster,
        config(4, false),
        loader.clone(),
        "test_policy",
        WorkerConfig::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, GenerationError::Configuration(_)));
    assert!(loader.engines().is_empty());
}

#[tokio::test]
async fn test_from_value_rejects_unknown_keys() {
    let loader = Arc::new(MockEngineLoader::new(MockEngineArgs::default()));
    let cluster = VirtualCluster::new([1]);
    let value = serde_json::json!({
        "model_name": "mock-model",
        "max_new_tokens": 4,
        "temperature": 1.0,
        "top_p": 1.0,
        "top_k": null,
        "stop_token_ids": null,
        "stop_strings": null,
        "pad_token_id": 0,
        "beam_width": 4,
        "vllm_cfg": {
            "tensor_parallel_size": 1,
            "gpu_memory_utilization": 0.5,
            "max_model_len": 64
        }
    });
    let err = VllmGeneration::from_value(&cluster, value, loader).await.unwrap_err();
    assert!(matches!(err, GenerationError::Configuration(msg) if msg.contains("beam_width")));
}
