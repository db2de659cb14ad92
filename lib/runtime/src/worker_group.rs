// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Isolated worker actors, one per device slot.
//!
//! Every worker owns a dedicated OS thread driving a single-threaded tokio
//! runtime, so the actor's state is never shared: the only way in is its
//! mailbox. Calls are sent eagerly (fan-out) and the returned futures are
//! joined by the caller (fan-in).
//!
//! ```text
//!            WorkerGroup
//!   ┌──────────┬──────────┬──────────┐
//!   │ dp0-tp0  │ dp0-tp1  │ ...      │   one row per tied group
//!   │ dp1-tp0  │ dp1-tp1  │          │
//!   └──────────┴──────────┴──────────┘
//!        │ mpsc mailbox / oneshot reply
//!        ▼
//!   thread + current_thread runtime + Actor
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use derive_getters::Getters;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cluster::BundleAssignment;
use crate::config::WorkerConfig;
use crate::sharding::{Axis, ShardingLayout};
use crate::{error, ErrorContext, Result};

/// A unit of isolated state driven by calls from its [`WorkerGroup`].
#[async_trait]
pub trait Actor: Send + 'static {
    type Call: Send + 'static;
    type Reply: Send + 'static;

    async fn handle(&mut self, call: Self::Call) -> Result<Self::Reply>;

    /// Release everything the actor holds. Must be idempotent and must not fail.
    async fn shutdown(&mut self) -> bool;
}

/// Where a worker sits and what it may claim.
#[derive(Debug, Clone, Getters)]
pub struct WorkerSlot {
    rank: usize,
    dp_index: usize,
    tp_index: usize,
    name: String,
    node_index: usize,
    local_bundle_index: usize,
    resource_share: f64,
    /// The tied group's full assignment; only present on the tp=0 member.
    assignment: Option<BundleAssignment>,
}

impl WorkerSlot {
    pub fn is_owner(&self) -> bool {
        self.assignment.is_some()
    }
}

/// Reply to a dispatched call.
pub type WorkerFuture<R> = BoxFuture<'static, Result<R>>;

/// Replies from one call per data-parallel shard, in shard order.
pub struct FutureBundle<R> {
    futures: Vec<WorkerFuture<R>>,
}

impl<R> FutureBundle<R> {
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }
}

enum Envelope<A: Actor> {
    Call {
        call: A::Call,
        reply: oneshot::Sender<Result<A::Reply>>,
    },
    Shutdown {
        reply: oneshot::Sender<bool>,
    },
}

struct WorkerHandle<A: Actor> {
    slot: WorkerSlot,
    mailbox: mpsc::UnboundedSender<Envelope<A>>,
}

impl<A: Actor> WorkerHandle<A> {
    fn call(&self, call: A::Call) -> WorkerFuture<A::Reply> {
        let (tx, rx) = oneshot::channel();
        let name = self.slot.name.clone();
        let sent = self.mailbox.send(Envelope::Call { call, reply: tx }).is_ok();
        async move {
            if !sent {
                return Err(error!("worker {name} is no longer running"));
            }
            rx.await
                .map_err(|_| error!("worker {name} dropped the call"))?
        }
        .boxed()
    }
}

pub struct WorkerGroup<A: Actor> {
    name_prefix: String,
    layout: ShardingLayout,
    workers: Vec<WorkerHandle<A>>,
    config: WorkerConfig,
    cancel_token: CancellationToken,
    shut_down: AtomicBool,
}

impl<A: Actor> WorkerGroup<A> {
    /// Start one worker per bundle slot of every assignment.
    ///
    /// `factory` runs on each worker's own thread and builds that worker's
    /// actor. If any worker fails to come up, the workers that did start are
    /// shut down and the first failure is returned.
    pub async fn new<F, Fut>(
        name_prefix: &str,
        resource_share: f64,
        assignments: &[BundleAssignment],
        config: WorkerConfig,
        factory: F,
    ) -> Result<Self>
    where
        F: Fn(WorkerSlot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A>> + 'static,
    {
        let tp = assignments.first().map(BundleAssignment::group_size).unwrap_or(0);
        if let Some(odd) = assignments.iter().find(|a| a.group_size() != tp) {
            crate::raise!(
                "assignment on node {} has {} bundles, expected {tp}",
                odd.node_index(),
                odd.group_size()
            );
        }
        let layout = ShardingLayout::from_groups(assignments.len(), tp)?;
        let factory = Arc::new(factory);
        let cancel_token = CancellationToken::new();

        let mut workers = Vec::with_capacity(layout.world_size());
        let mut ready = Vec::with_capacity(layout.world_size());
        for (dp, assignment) in assignments.iter().enumerate() {
            for (tp_index, &local_bundle_index) in
                assignment.local_bundle_indices().iter().enumerate()
            {
                let slot = WorkerSlot {
                    rank: layout.rank(dp, tp_index),
                    dp_index: dp,
                    tp_index,
                    name: format!("{name_prefix}-dp{dp}-tp{tp_index}"),
                    node_index: *assignment.node_index(),
                    local_bundle_index,
                    resource_share,
                    assignment: (tp_index == 0).then(|| assignment.clone()),
                };
                let (handle, ready_rx) = spawn_worker(
                    slot,
                    factory.clone(),
                    cancel_token.child_token(),
                    &config,
                )?;
                workers.push(handle);
                ready.push(ready_rx);
            }
        }

        let outcomes = join_all(ready).await;
        let mut group = WorkerGroup {
            name_prefix: name_prefix.to_string(),
            layout,
            workers,
            config,
            cancel_token,
            shut_down: AtomicBool::new(false),
        };

        let mut first_failure = None;
        for (worker, outcome) in group.workers.iter().zip(outcomes) {
            let outcome = outcome
                .map_err(|_| error!("worker thread exited before reporting"))
                .and_then(|r| r);
            if let Err(e) = outcome {
                tracing::error!(worker = %worker.slot.name, "worker failed to start: {e:#}");
                first_failure
                    .get_or_insert_with(|| e.context(format!("starting worker {}", worker.slot.name)));
            }
        }
        if let Some(err) = first_failure {
            group.shutdown().await;
            group.workers.clear();
            return Err(err);
        }

        tracing::debug!(
            prefix = %group.name_prefix,
            workers = group.workers.len(),
            "worker group started ({})",
            group.config
        );
        Ok(group)
    }

    pub fn layout(&self) -> &ShardingLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.workers.iter().map(|w| &w.slot)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Call every worker, skipping ranks that are not zero on any axis in
    /// `run_rank_0_only_axes`. The call is built per target slot.
    pub fn run_all_workers_single_data(
        &self,
        make_call: impl Fn(&WorkerSlot) -> A::Call,
        run_rank_0_only_axes: &[Axis],
    ) -> Vec<WorkerFuture<A::Reply>> {
        self.layout
            .ranks_on(run_rank_0_only_axes)
            .into_iter()
            .map(|rank| {
                let worker = &self.workers[rank];
                worker.call(make_call(&worker.slot))
            })
            .collect()
    }

    /// Send `calls[i]` to the i-th worker selected by `run_rank_0_only_axes`.
    pub fn run_all_workers_multiple_data(
        &self,
        calls: Vec<A::Call>,
        run_rank_0_only_axes: &[Axis],
    ) -> Result<Vec<WorkerFuture<A::Reply>>> {
        let ranks = self.layout.ranks_on(run_rank_0_only_axes);
        if ranks.len() != calls.len() {
            crate::raise!(
                "{} calls for {} selected workers",
                calls.len(),
                ranks.len()
            );
        }
        Ok(ranks
            .into_iter()
            .zip(calls)
            .map(|(rank, call)| self.workers[rank].call(call))
            .collect())
    }

    /// Send shard `i` to the owner (tp=0) of tied group `i`. Other members of
    /// a tied group receive nothing.
    pub fn run_all_workers_sharded_data(
        &self,
        shards: Vec<A::Call>,
    ) -> Result<FutureBundle<A::Reply>> {
        let leaders = self.layout.group_leaders();
        if leaders.len() != shards.len() {
            crate::raise!(
                "{} shards for {} data-parallel groups",
                shards.len(),
                leaders.len()
            );
        }
        Ok(FutureBundle {
            futures: leaders
                .into_iter()
                .zip(shards)
                .map(|(rank, call)| self.workers[rank].call(call))
                .collect(),
        })
    }

    /// Await every shard's reply. Results keep shard order; the first failing
    /// shard fails the whole bundle.
    pub async fn get_all_worker_results(&self, bundle: FutureBundle<A::Reply>) -> Result<Vec<A::Reply>> {
        join_all(bundle.futures)
            .await
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.with_context(|| format!("data-parallel shard {i}")))
            .collect()
    }

    /// Ask every worker to shut down and wait for each acknowledgement.
    ///
    /// Idempotent. Workers that are already gone count as shut down; workers
    /// that do not answer within the graceful timeout count as failures and
    /// are cancelled.
    pub async fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return true;
        }
        let timeout = self.config.graceful_shutdown_timeout();
        let acks = self.workers.iter().map(|worker| {
            let (tx, rx) = oneshot::channel();
            let sent = worker.mailbox.send(Envelope::Shutdown { reply: tx }).is_ok();
            let name = worker.slot.name.clone();
            async move {
                if !sent {
                    return true;
                }
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(ok)) => ok,
                    Ok(Err(_)) => true,
                    Err(_) => {
                        tracing::warn!(worker = %name, "worker did not acknowledge shutdown within {timeout:?}");
                        false
                    }
                }
            }
        });
        let all_ok = join_all(acks).await.into_iter().all(|ok| ok);
        self.cancel_token.cancel();
        all_ok
    }

    /// Cancel every worker without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl<A: Actor> Drop for WorkerGroup<A> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn spawn_worker<A, F, Fut>(
    slot: WorkerSlot,
    factory: Arc<F>,
    cancel_token: CancellationToken,
    config: &WorkerConfig,
) -> Result<(WorkerHandle<A>, oneshot::Receiver<Result<()>>)>
where
    A: Actor,
    F: Fn(WorkerSlot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<A>> + 'static,
{
    let (mailbox, inbox) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let thread_slot = slot.clone();

    std::thread::Builder::new()
        .name(slot.name.clone())
        .stack_size(config.thread_stack_size)
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            runtime.block_on(async move {
                let name = thread_slot.name.clone();
                match factory(thread_slot).await {
                    Ok(actor) => {
                        if ready_tx.send(Ok(())).is_ok() {
                            run_worker(actor, inbox, cancel_token, &name).await;
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            });
        })
        .with_context(|| format!("spawning thread for worker {}", slot.name))?;

    Ok((WorkerHandle { slot, mailbox }, ready_rx))
}

async fn run_worker<A: Actor>(
    mut actor: A,
    mut inbox: mpsc::UnboundedReceiver<Envelope<A>>,
    cancel_token: CancellationToken,
    name: &str,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                tracing::debug!(worker = name, "worker cancelled");
                actor.shutdown().await;
                break;
            }
            envelope = inbox.recv() => match envelope {
                Some(Envelope::Call { call, reply }) => {
                    let result = actor.handle(call).await;
                    let _ = reply.send(result);
                }
                Some(Envelope::Shutdown { reply }) => {
                    let ok = actor.shutdown().await;
                    let _ = reply.send(ok);
                    break;
                }
                None => {
                    actor.shutdown().await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Doubler {
        slot: WorkerSlot,
        shutdowns: Arc<AtomicUsize>,
        done: bool,
    }

    #[async_trait]
    impl Actor for Doubler {
        type Call = u64;
        type Reply = (usize, u64);

        async fn handle(&mut self, call: u64) -> Result<(usize, u64)> {
            if call == 13 {
                crate::raise!("unlucky");
            }
            Ok((*self.slot.rank(), call * 2))
        }

        async fn shutdown(&mut self) -> bool {
            if !self.done {
                self.done = true;
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
            }
            true
        }
    }

    async fn group(
        assignments: &[BundleAssignment],
        shutdowns: Arc<AtomicUsize>,
    ) -> Result<WorkerGroup<Doubler>> {
        WorkerGroup::new(
            "test",
            1.0,
            assignments,
            WorkerConfig::default(),
            move |slot| {
                let shutdowns = shutdowns.clone();
                async move {
                    Ok(Doubler {
                        slot,
                        shutdowns,
                        done: false,
                    })
                }
            },
        )
        .await
    }

    fn two_by_two() -> Vec<BundleAssignment> {
        vec![
            BundleAssignment::new(0, vec![0, 1]),
            BundleAssignment::new(0, vec![2, 3]),
        ]
    }

    #[tokio::test]
    async fn test_slots_follow_assignments() {
        let group = group(&two_by_two(), Arc::default()).await.unwrap();
        let slots: Vec<&WorkerSlot> = group.slots().collect();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[3].name(), "test-dp1-tp1");
        assert_eq!(*slots[3].local_bundle_index(), 3);
        assert!(slots[2].is_owner());
        assert!(!slots[3].is_owner());
        assert!(group.shutdown().await);
    }

    #[tokio::test]
    async fn test_single_data_respects_rank_0_axes() {
        let group = group(&two_by_two(), Arc::default()).await.unwrap();
        let all = join_all(group.run_all_workers_single_data(|_| 1, &[])).await;
        assert_eq!(all.len(), 4);
        let leaders = join_all(
            group.run_all_workers_single_data(|s| *s.rank() as u64, &[Axis::TensorParallel]),
        )
        .await;
        let replies: Vec<(usize, u64)> = leaders.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(replies, vec![(0, 0), (2, 4)]);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_sharded_data_preserves_order() {
        let group = group(&two_by_two(), Arc::default()).await.unwrap();
        let bundle = group.run_all_workers_sharded_data(vec![10, 20]).unwrap();
        assert_eq!(bundle.len(), 2);
        let results = group.get_all_worker_results(bundle).await.unwrap();
        assert_eq!(results, vec![(0, 20), (2, 40)]);
        assert!(group.run_all_workers_sharded_data(vec![1]).is_err());
        assert!(group
            .run_all_workers_multiple_data(vec![1, 2, 3], &[Axis::TensorParallel])
            .is_err());
        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_shard_fails_bundle() {
        let group = group(&two_by_two(), Arc::default()).await.unwrap();
        let bundle = group.run_all_workers_sharded_data(vec![1, 13]).unwrap();
        let err = group.get_all_worker_results(bundle).await.unwrap_err();
        assert!(format!("{err:#}").contains("data-parallel shard 1"));
        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let group = group(&two_by_two(), shutdowns.clone()).await.unwrap();
        assert!(group.shutdown().await);
        assert!(group.shutdown().await);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 4);
        let after = join_all(group.run_all_workers_single_data(|_| 1, &[])).await;
        assert!(after.iter().all(|r| r.is_err()));
    }

    #[tokio::test]
    async fn test_failed_start_tears_down_started_workers() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = shutdowns.clone();
        let result: Result<WorkerGroup<Doubler>> = WorkerGroup::new(
            "broken",
            1.0,
            &two_by_two(),
            WorkerConfig::default(),
            move |slot| {
                let shutdowns = counter.clone();
                async move {
                    if *slot.rank() == 1 {
                        crate::raise!("no device");
                    }
                    Ok(Doubler {
                        slot,
                        shutdowns,
                        done: false,
                    })
                }
            },
        )
        .await;
        let err = result.err().unwrap();
        assert!(format!("{err:#}").contains("broken-dp0-tp1"));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mismatched_assignments_rejected() {
        let assignments = vec![
            BundleAssignment::new(0, vec![0, 1]),
            BundleAssignment::new(1, vec![0]),
        ];
        assert!(group(&assignments, Arc::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_cancels_workers() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let group = group(&two_by_two(), shutdowns.clone()).await.unwrap();
        drop(group);
        for _ in 0..200 {
            if shutdowns.load(Ordering::SeqCst) == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(shutdowns.load(Ordering::SeqCst), 4);
    }
}
