//! Walks the test plan, running each node's lifecycle under its resource lock.
//!
//! Siblings whose resources conflict are grouped and run one after another;
//! groups run as separate tokio tasks. Hook calls are bounded by a semaphore
//! sized by `parallelism`.

use crate::core::config::{EngineConfig, ExecutionMode};
use crate::core::errors::{EngineError, FailureCollector, LifecyclePhase, Result};
use crate::execution::context::ExecutionContext;
use crate::execution::dynamic::DynamicRegistrar;
use crate::execution::events::{
    CompositeListener, EventEmitter, ExecutionEvent, ExecutionListener, LoggingListener, NodeDescriptor,
    NodeStatus, RecordingListener,
};
use crate::execution::outcome::{EngineExecutionResults, ExecutionAborted, ExecutionReport, NodeOutcome};
use crate::execution::template::expand_template;
use crate::lock::{ExclusiveResource, LockManager, LockMode, ResourceLock};
use crate::tree::orderer::OrderKey;
use crate::tree::{NodeEntry, NodeId, NodeType, TestPlan};
use anyhow::anyhow;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CANCELLED_REASON: &str = "Execution cancelled";

/// Entry point: runs a [`TestPlan`] and reports every node's outcome
pub struct Engine {
    config: Arc<EngineConfig>,
    listeners: Vec<Arc<dyn ExecutionListener>>,
    cancellation: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            listeners: vec![Arc::new(LoggingListener)],
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Cancelling the token stops nodes that have not started yet.
    ///
    /// Nodes already running still get their `after` and `cleanup` hooks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn execute(&self, plan: Arc<TestPlan>) -> EngineExecutionResults {
        let run_id = uuid::Uuid::new_v4().to_string();
        let seed = self.config.random_seed.unwrap_or_else(|| fastrand::u64(..));
        info!(run_id = %run_id, "Starting execution of {} node(s), random seed {}", plan.len(), seed);

        let recorder = Arc::new(RecordingListener::new());
        let mut listener = CompositeListener::new();
        for registered in &self.listeners {
            listener.add(registered.clone());
        }
        listener.add(recorder.clone());

        let scheduler = Arc::new(Scheduler {
            plan: plan.clone(),
            config: self.config.clone(),
            locks: LockManager::new(),
            permits: Semaphore::new(self.config.parallelism.max(1)),
            emitter: Arc::new(EventEmitter::new(run_id.clone(), listener)),
            cancellation: self.cancellation.clone(),
            seed,
        });

        let root = plan.root();
        let root_outcome = match plan.entry(root) {
            Ok(entry) => {
                let ctx = ExecutionContext::for_root(root, &entry, self.config.clone(), self.cancellation.clone());
                let lock_plan = LockPlan::none();
                scheduler.clone().execute_node(root, ctx, lock_plan, Scope::default()).await
            }
            Err(e) => {
                error!("Test plan has no root: {}", e);
                NodeOutcome {
                    status: NodeStatus::Failed,
                    failure: None,
                    reason: Some(e.to_string()),
                }
            }
        };

        let events = recorder.get_events();
        let report = ExecutionReport::from_events(&events);
        info!(
            run_id = %run_id,
            "Execution finished with {}: {} succeeded, {} failed, {} aborted, {} skipped",
            root_outcome.status,
            report.count(NodeStatus::Succeeded),
            report.count(NodeStatus::Failed),
            report.count(NodeStatus::Aborted),
            report.count(NodeStatus::Skipped),
        );
        EngineExecutionResults {
            run_id,
            seed,
            root: root_outcome,
            report,
            events,
        }
    }
}

/// Lock a node takes and whether it covers the node's whole subtree
#[derive(Debug)]
struct LockPlan {
    lock: ResourceLock,
    resources: Vec<ExclusiveResource>,
    locks_subtree: bool,
}

impl LockPlan {
    fn none() -> Self {
        Self {
            lock: ResourceLock::Nop,
            resources: Vec::new(),
            locks_subtree: false,
        }
    }
}

/// State inherited from ancestors
#[derive(Debug, Clone, Default)]
struct Scope {
    /// Resources already held by an ancestor
    held: Arc<Vec<ExclusiveResource>>,
    /// An ancestor locked everything below it
    subtree_locked: bool,
    /// Children run sequentially on the parent's task
    same_thread: bool,
    /// Nearest explicitly configured execution mode
    inherited_mode: Option<ExecutionMode>,
}

/// A child ready to run
struct Prepared {
    position: usize,
    node: NodeId,
    ctx: ExecutionContext,
    lock_plan: LockPlan,
}

struct Scheduler {
    plan: Arc<TestPlan>,
    config: Arc<EngineConfig>,
    locks: LockManager,
    permits: Semaphore,
    emitter: Arc<EventEmitter>,
    cancellation: CancellationToken,
    seed: u64,
}

/// Failures of one node, plus an abort request
#[derive(Default)]
struct NodeRun {
    failures: FailureCollector,
    aborted: Option<String>,
}

impl NodeRun {
    fn proceed(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }

    fn record_hook(&mut self, unique_id: &str, phase: LifecyclePhase, result: anyhow::Result<()>) {
        if let Err(e) = result {
            match e.chain().find_map(|cause| cause.downcast_ref::<ExecutionAborted>()) {
                Some(abort) if self.aborted.is_none() => self.aborted = Some(abort.reason.clone()),
                Some(_) => {}
                None => self.failures.add(EngineError::execution(unique_id, phase, e)),
            }
        }
    }
}

impl Scheduler {
    async fn permit(&self) -> Option<SemaphorePermit<'_>> {
        self.permits.acquire().await.ok()
    }

    /// Run one node's lifecycle and everything below it
    fn execute_node(
        self: Arc<Self>,
        node: NodeId,
        mut ctx: ExecutionContext,
        lock_plan: LockPlan,
        scope: Scope,
    ) -> BoxFuture<'static, NodeOutcome> {
        async move {
            let entry = match self.plan.entry(node) {
                Ok(entry) => entry,
                Err(e) => {
                    error!("Cannot execute unknown node: {}", e);
                    return NodeOutcome {
                        status: NodeStatus::Failed,
                        failure: None,
                        reason: Some(e.to_string()),
                    };
                }
            };
            let descriptor = NodeDescriptor::of(&entry);
            let uid = entry.unique_id().to_string();

            if self.cancellation.is_cancelled() {
                return self.skip(descriptor, CANCELLED_REASON);
            }
            let guard = match lock_plan.lock.acquire_cancellable(&self.cancellation).await {
                Ok(guard) => guard,
                Err(_) => return self.skip(descriptor, CANCELLED_REASON),
            };

            let behavior = entry.behavior().clone();
            let is_engine = entry.node_type() == NodeType::Engine;
            let mut run = NodeRun::default();

            {
                let _permit = self.permit().await;
                let result = guarded(behavior.prepare(&mut ctx)).await;
                run.record_hook(&uid, LifecyclePhase::Prepare, result);
            }

            if run.proceed() && !is_engine {
                if let Some(reason) = self.skip_reason(&entry, &ctx, &mut run) {
                    let cleanup = guarded(behavior.cleanup(&ctx)).await;
                    run.record_hook(&uid, LifecyclePhase::Cleanup, cleanup);
                    if let Err(e) = ctx.store().close() {
                        warn!("Closing store of skipped node {} failed: {}", uid, e);
                    }
                    drop(guard);
                    if let Some(failure) = run.failures.into_failure() {
                        warn!("Skipped node {} failed during cleanup: {}", uid, failure);
                    }
                    return self.skip(descriptor, &reason);
                }
            }

            self.emitter.emit(ExecutionEvent::Started {
                node: descriptor.clone(),
            });

            let callbacks = if is_engine {
                Vec::new()
            } else {
                ctx.registry()
                    .extensions()
                    .into_iter()
                    .filter(|registered| registered.extension().as_lifecycle_callback().is_some())
                    .collect()
            };

            if run.proceed() {
                for registered in &callbacks {
                    if let Some(callback) = registered.extension().as_lifecycle_callback() {
                        let _permit = self.permit().await;
                        let result = guarded(callback.before_node(&ctx)).await;
                        run.record_hook(&uid, LifecyclePhase::Before, result);
                    }
                    if !run.proceed() {
                        break;
                    }
                }
            }

            let mut failed_children = 0;
            if run.proceed() {
                {
                    let _permit = self.permit().await;
                    let result = guarded(behavior.before(&ctx)).await;
                    run.record_hook(&uid, LifecyclePhase::Before, result);
                }
                if run.proceed() {
                    let child_scope = self.child_scope(&entry, &lock_plan, &scope);
                    let static_children = entry.children().to_vec();
                    let registrar = DynamicRegistrar::new(
                        self.plan.clone(),
                        node,
                        entry.unique_id().clone(),
                        self.emitter.clone(),
                    );

                    if entry.node_type() == NodeType::Template {
                        let expanded = guarded_sync(|| expand_template(&self.plan, node, &ctx, &registrar))
                            .unwrap_or_else(|e| Err(EngineError::execution(uid.clone(), LifecyclePhase::Execute, e)));
                        if let Some(count) = run.failures.record(expanded) {
                            debug!("Template {} expanded into {} invocation(s)", uid, count);
                        }
                    } else {
                        let _permit = self.permit().await;
                        let result = guarded(behavior.execute(&ctx, &registrar)).await;
                        run.record_hook(&uid, LifecyclePhase::Execute, result);
                    }

                    let dynamic = registrar.take_registered();
                    if run.proceed() {
                        failed_children += self.drive_children(&entry, &ctx, &child_scope, static_children).await;
                        failed_children += self.drive_children(&entry, &ctx, &child_scope, dynamic).await;
                    } else {
                        self.skip_registered(&uid, dynamic);
                    }
                }
            }

            {
                let _permit = self.permit().await;
                let result = guarded(behavior.after(&ctx)).await;
                run.record_hook(&uid, LifecyclePhase::After, result);
            }
            for registered in callbacks.iter().rev() {
                if let Some(callback) = registered.extension().as_lifecycle_callback() {
                    let _permit = self.permit().await;
                    let result = guarded(callback.after_node(&ctx)).await;
                    run.record_hook(&uid, LifecyclePhase::After, result);
                }
            }
            {
                let _permit = self.permit().await;
                let result = guarded(behavior.cleanup(&ctx)).await;
                run.record_hook(&uid, LifecyclePhase::Cleanup, result);
            }
            if entry.node_type() == NodeType::Template {
                self.plan.clear_template(node);
            }
            if let Err(e) = ctx.store().close() {
                run.failures.add(e);
            }
            drop(guard);

            let outcome = self.conclude(&entry, run, failed_children);
            self.emitter.emit(ExecutionEvent::Finished {
                node: descriptor,
                status: outcome.status,
                failure: outcome.failure.clone(),
            });
            outcome
        }
        .boxed()
    }

    fn skip(&self, node: NodeDescriptor, reason: &str) -> NodeOutcome {
        self.emitter.emit(ExecutionEvent::Skipped {
            node,
            reason: reason.to_string(),
        });
        NodeOutcome::skipped(reason)
    }

    /// Report dynamic children that were registered but will never run
    fn skip_registered(&self, parent: &str, children: Vec<NodeId>) {
        let reason = format!("{} did not complete successfully", parent);
        for child in children {
            match self.plan.entry(child) {
                Ok(entry) => {
                    self.skip(NodeDescriptor::of(&entry), &reason);
                }
                Err(e) => error!("Cannot report unknown child of {}: {}", parent, e),
            }
        }
    }

    /// First reason not to run the node, from conditions then the node itself
    fn skip_reason(&self, entry: &NodeEntry, ctx: &ExecutionContext, run: &mut NodeRun) -> Option<String> {
        for registered in ctx.registry().extensions() {
            if let Some(condition) = registered.extension().as_execution_condition() {
                let result = match guarded_sync(|| condition.evaluate(ctx)) {
                    Ok(result) => result,
                    Err(e) => {
                        run.failures
                            .add(EngineError::execution(entry.unique_id().to_string(), LifecyclePhase::Condition, e));
                        return None;
                    }
                };
                if result.is_disabled() {
                    return Some(
                        result
                            .reason()
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("disabled by {}", registered.extension().name())),
                    );
                }
            }
        }
        match guarded_sync(|| entry.behavior().should_be_skipped(ctx)).and_then(|skip| skip) {
            Ok(skip) => skip.reason().filter(|_| skip.is_skipped()).map(str::to_string),
            Err(e) => {
                run.failures
                    .add(EngineError::execution(entry.unique_id().to_string(), LifecyclePhase::Condition, e));
                None
            }
        }
    }

    fn conclude(&self, entry: &NodeEntry, run: NodeRun, failed_children: usize) -> NodeOutcome {
        if let Some(failure) = run.failures.into_failure() {
            return NodeOutcome {
                status: NodeStatus::Failed,
                failure: Some(Arc::new(failure)),
                reason: None,
            };
        }
        if let Some(reason) = run.aborted {
            return NodeOutcome {
                status: NodeStatus::Aborted,
                failure: None,
                reason: Some(reason),
            };
        }
        if failed_children > 0 && self.config.propagate_descendant_failures {
            let mut collector = FailureCollector::new();
            collector.add(EngineError::DescendantFailed {
                unique_id: entry.unique_id().to_string(),
                failed: failed_children,
            });
            return NodeOutcome {
                status: NodeStatus::Failed,
                failure: collector.into_failure().map(Arc::new),
                reason: None,
            };
        }
        if self.cancellation.is_cancelled() {
            return NodeOutcome {
                status: NodeStatus::Aborted,
                failure: None,
                reason: Some(CANCELLED_REASON.to_string()),
            };
        }
        NodeOutcome::succeeded()
    }

    fn child_scope(&self, entry: &NodeEntry, lock_plan: &LockPlan, scope: &Scope) -> Scope {
        let mut held = scope.held.as_ref().clone();
        held.extend(lock_plan.resources.iter().cloned());
        let same_thread = scope.same_thread
            || lock_plan.locks_subtree
            || entry.orderer().is_some()
            || !self.config.parallel_enabled;
        Scope {
            held: Arc::new(held),
            subtree_locked: scope.subtree_locked || lock_plan.locks_subtree,
            same_thread,
            inherited_mode: entry.execution_mode().or(scope.inherited_mode),
        }
    }

    /// Resources `node` must lock, given what its ancestors already hold
    fn plan_lock(&self, node: NodeId, entry: &NodeEntry, scope: &Scope, top_level: bool) -> Result<LockPlan> {
        let own = entry.resources().to_vec();
        let (mut wanted, locks_subtree) = if scope.subtree_locked {
            (own, false)
        } else {
            let subtree = self.plan.subtree_resources(node);
            let global_exclusive = subtree.contains(&ExclusiveResource::global_read_write());
            let descendants_declare = subtree.len() > own.len();
            if top_level && global_exclusive {
                (subtree, descendants_declare)
            } else if own.is_empty() {
                (Vec::new(), false)
            } else if descendants_declare {
                (subtree, true)
            } else {
                (own, false)
            }
        };
        if top_level && !wanted.iter().any(ExclusiveResource::is_global) {
            wanted.push(ExclusiveResource::global_read());
        }

        let mut needed = Vec::with_capacity(wanted.len());
        for resource in wanted {
            let held_modes: Vec<LockMode> = scope
                .held
                .iter()
                .filter(|held| held.key() == resource.key())
                .map(ExclusiveResource::mode)
                .collect();
            if held_modes.is_empty() {
                needed.push(resource);
            } else if resource.mode() == LockMode::ReadWrite && !held_modes.contains(&LockMode::ReadWrite) {
                return Err(EngineError::lock_acquisition(
                    resource.to_string(),
                    "an ancestor holds this resource in read mode only",
                ));
            }
        }

        // Along any path locks are taken in canonical order only.
        if let Some(highest) = scope.held.iter().max() {
            if let Some(early) = needed.iter().find(|resource| *resource < highest) {
                return Err(EngineError::lock_acquisition(
                    early.to_string(),
                    format!(
                        "an ancestor already holds [{}]; declare this resource on that ancestor instead",
                        highest
                    ),
                ));
            }
        }

        let lock = self.locks.lock_for(&needed);
        Ok(LockPlan {
            resources: lock.resources(),
            lock,
            locks_subtree,
        })
    }

    fn effective_mode(&self, entry: &NodeEntry, scope: &Scope, top_level: bool) -> ExecutionMode {
        entry.execution_mode().or(scope.inherited_mode).unwrap_or(if top_level {
            self.config.default_classes_execution_mode
        } else {
            self.config.default_execution_mode
        })
    }

    fn ordered(&self, parent: &NodeEntry, children: Vec<NodeId>) -> Vec<(NodeId, NodeEntry)> {
        let mut keys: Vec<OrderKey<(NodeId, NodeEntry)>> = children
            .into_iter()
            .filter_map(|child| match self.plan.entry(child) {
                Ok(entry) if !entry.is_pruned() => Some(OrderKey {
                    display_name: entry.display_name().to_string(),
                    order: entry.order(),
                    item: (child, entry),
                }),
                Ok(_) => None,
                Err(e) => {
                    error!("Skipping unknown child of {}: {}", parent.unique_id(), e);
                    None
                }
            })
            .collect();
        if let Some(orderer) = parent.orderer() {
            orderer.order(&mut keys, self.seed);
        }
        keys.into_iter().map(|key| key.item).collect()
    }

    /// Run `children` of `parent`; returns how many of them failed
    async fn drive_children(
        self: &Arc<Self>,
        parent: &NodeEntry,
        parent_ctx: &ExecutionContext,
        scope: &Scope,
        children: Vec<NodeId>,
    ) -> usize {
        if children.is_empty() {
            return 0;
        }
        let top_level = parent.node_type() == NodeType::Engine;
        let mut failed = 0;
        let mut inline = Vec::new();
        let mut groups: Vec<(Vec<ExclusiveResource>, Vec<Prepared>)> = Vec::new();

        for (position, (child, entry)) in self.ordered(parent, children).into_iter().enumerate() {
            let lock_plan = match self.plan_lock(child, &entry, scope, top_level) {
                Ok(lock_plan) => lock_plan,
                Err(e) => {
                    if self.fail_unstarted(&entry, e).is_failed() {
                        failed += 1;
                    }
                    continue;
                }
            };
            let concurrent = !scope.same_thread
                && !lock_plan.lock.is_global_read_write()
                && self.effective_mode(&entry, scope, top_level) == ExecutionMode::Concurrent;
            let prepared = Prepared {
                position,
                node: child,
                ctx: parent_ctx.fork(child, &entry),
                lock_plan,
            };
            if !concurrent {
                inline.push(prepared);
                continue;
            }

            let (conflicting, independent): (Vec<_>, Vec<_>) = groups.into_iter().partition(|(resources, _)| {
                resources
                    .iter()
                    .any(|held| prepared.lock_plan.resources.iter().any(|r| r.conflicts_with(held)))
            });
            let mut merged_resources = prepared.lock_plan.resources.clone();
            let mut merged_members = Vec::new();
            for (resources, members) in conflicting {
                merged_resources.extend(resources);
                merged_members.extend(members);
            }
            merged_members.push(prepared);
            merged_members.sort_by_key(|member| member.position);
            groups = independent;
            groups.push((merged_resources, merged_members));
        }

        let handles: Vec<_> = groups
            .into_iter()
            .map(|(_, members)| {
                let scheduler = self.clone();
                let child_scope = scope.clone();
                tokio::spawn(async move {
                    let mut failed = 0;
                    for member in members {
                        let outcome = scheduler
                            .clone()
                            .execute_node(member.node, member.ctx, member.lock_plan, child_scope.clone())
                            .await;
                        if outcome.is_failed() {
                            failed += 1;
                        }
                    }
                    failed
                })
            })
            .collect();

        for member in inline {
            let outcome = self
                .clone()
                .execute_node(member.node, member.ctx, member.lock_plan, scope.clone())
                .await;
            if outcome.is_failed() {
                failed += 1;
            }
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(group_failed) => failed += group_failed,
                Err(e) => {
                    error!("Child group of {} did not complete: {}", parent.unique_id(), e);
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Report a child that could not be started
    fn fail_unstarted(&self, entry: &NodeEntry, error: EngineError) -> NodeOutcome {
        warn!("Cannot start {}: {}", entry.unique_id(), error);
        let descriptor = NodeDescriptor::of(entry);
        self.emitter.emit(ExecutionEvent::Started {
            node: descriptor.clone(),
        });
        let mut collector = FailureCollector::new();
        collector.add(error);
        let outcome = NodeOutcome {
            status: NodeStatus::Failed,
            failure: collector.into_failure().map(Arc::new),
            reason: None,
        };
        self.emitter.emit(ExecutionEvent::Finished {
            node: descriptor,
            status: outcome.status,
            failure: outcome.failure.clone(),
        });
        outcome
    }
}

/// Await a user hook, reporting a panic as an ordinary failure
async fn guarded<F>(hook: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    AssertUnwindSafe(hook)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(panic_error(payload)))
}

fn guarded_sync<T>(call: impl FnOnce() -> T) -> anyhow::Result<T> {
    std::panic::catch_unwind(AssertUnwindSafe(call)).map_err(panic_error)
}

fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow!("panicked: {}", message)
}
