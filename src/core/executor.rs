//! Executor: runs an execution plan batch by batch.
//!
//! Within a batch every resource gets its own task; the batch completes
//! before the next one starts. A failed resource marks its transitive
//! dependents as skipped, independent resources keep going. Results are
//! published to the output resolver and recorded in state serially, after
//! the batch has been joined, and state is saved after every batch.

use super::error::Result;
use super::graph::DependencyGraph;
use super::output::OutputResolver;
use super::planner;
use super::schema;
use super::state::{ExportMap, StateMap, StateStore};
use super::types::*;
use crate::provider::{Provider, ProviderError};
use crate::tripwire::eventlog::{self, EventLog};
use crate::tripwire::hasher;
use rustc_hash::{FxHashMap, FxHashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Per-run context: the graph, its output slots, and the state being written.
#[derive(Debug)]
pub struct RunContext {
    pub stack: String,
    graph: DependencyGraph,
    exports: Vec<StackExport>,
    outputs: OutputResolver,
    states: StateMap,
}

impl RunContext {
    pub fn new(
        stack: impl Into<String>,
        graph: DependencyGraph,
        exports: Vec<StackExport>,
        states: StateMap,
    ) -> Self {
        Self {
            stack: stack.into(),
            graph,
            exports,
            outputs: OutputResolver::new(),
            states,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn outputs(&self) -> &OutputResolver {
        &self.outputs
    }

    pub fn states(&self) -> &StateMap {
        &self.states
    }
}

struct ApplyJob {
    id: String,
    kind: ResourceKind,
    properties: serde_json::Value,
    provider_id: Option<String>,
    action: PlanAction,
}

/// Properties as sent to the provider, with their hash.
struct Resolved {
    kind: ResourceKind,
    properties: serde_json::Value,
    hash: String,
}

struct Applied {
    provider_id: String,
    outputs: serde_json::Value,
    status: TerminalStatus,
}

struct JobResult<T> {
    id: String,
    result: std::result::Result<T, ProviderError>,
    attempts: u32,
    duration: Duration,
}

/// Drives a [`Provider`] through an execution plan.
pub struct Executor {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    failure: FailurePolicy,
    force: bool,
    cancel: CancellationToken,
    events: Option<EventLog>,
}

impl Executor {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            failure: FailurePolicy::default(),
            force: false,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    /// Re-apply resources whose properties are unchanged.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Token that cancels the current and all later batches.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn record(&self, event: ProvenanceEvent) {
        if let Some(log) = &self.events {
            log.record(event);
        }
    }

    /// Apply every resource of `plan`.
    ///
    /// Provider failures never surface as `Err`: they end up in the report.
    /// `Err` is reserved for state persistence and output bookkeeping.
    #[instrument(name = "apply", skip_all, fields(stack = %ctx.stack, batches = plan.len()))]
    pub async fn apply(
        &self,
        ctx: &mut RunContext,
        plan: &ExecutionPlan,
        store: &dyn StateStore,
    ) -> Result<ApplyReport> {
        let run_id = eventlog::generate_run_id();
        let started = Instant::now();
        self.record(ProvenanceEvent::ApplyStarted {
            stack: ctx.stack.clone(),
            run_id: run_id.clone(),
            direction: "apply".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        info!(run_id = %run_id, resources = plan.resource_count(), "apply started");

        let mut outcomes: FxHashMap<String, ResourceOutcome> = FxHashMap::default();
        let mut blocked: FxHashSet<String> = FxHashSet::default();
        let mut halted = false;

        for (batch_index, batch) in plan.batches.iter().enumerate() {
            if self.cancel.is_cancelled() || halted {
                let reason = if halted {
                    SkipReason::Halted
                } else {
                    SkipReason::Cancelled
                };
                for id in batch {
                    self.skip(ctx, &mut outcomes, id, reason.clone());
                }
                continue;
            }

            let snapshot = ctx.outputs.snapshot();
            let mut jobs = JoinSet::new();
            let mut in_flight: Vec<String> = Vec::new();
            let mut prepared: FxHashMap<String, (serde_json::Value, String)> = FxHashMap::default();

            for id in batch {
                let Some(node) = ctx.graph.node_id(id) else {
                    warn!(resource = %id, "planned resource not in graph");
                    continue;
                };
                let descriptor = ctx.graph.node(node);
                let kind = descriptor.kind;

                let upstream = ctx
                    .graph
                    .dependencies(node)
                    .iter()
                    .map(|d| &ctx.graph.node(*d).id)
                    .find(|d| blocked.contains(*d))
                    .cloned();
                if let Some(upstream) = upstream {
                    blocked.insert(id.clone());
                    self.skip(ctx, &mut outcomes, id, SkipReason::DependencyFailed(upstream));
                    continue;
                }

                let properties = match snapshot
                    .resolve_properties(&descriptor.properties, id)
                    .and_then(|p| schema::check_resolved(id, kind, &p).map(|_| p))
                {
                    Ok(p) => p,
                    Err(e) => {
                        blocked.insert(id.clone());
                        self.fail(ctx, &mut outcomes, id, kind, e.to_string(), 0, Duration::ZERO);
                        halted |= self.failure == FailurePolicy::StopOnFirst;
                        continue;
                    }
                };

                let hash = hasher::hash_properties(kind, &properties);
                let state = ctx.states.get(id);
                let mut action = planner::determine_action(state, Some(hash.as_str()));

                if action == PlanAction::NoOp && !self.force {
                    let recorded = state.map(|s| s.outputs.clone()).unwrap_or_default();
                    ctx.outputs.resolve(id, recorded)?;
                    debug!(resource = %id, "unchanged");
                    outcomes.insert(
                        id.clone(),
                        ResourceOutcome {
                            resource_id: id.clone(),
                            kind,
                            status: TerminalStatus::Unchanged,
                            attempts: 0,
                            duration: Duration::ZERO,
                        },
                    );
                    continue;
                }
                if action == PlanAction::NoOp {
                    action = PlanAction::Update;
                }

                self.record(ProvenanceEvent::ResourceStarted {
                    stack: ctx.stack.clone(),
                    resource: id.clone(),
                    action: action.to_string().to_lowercase(),
                });
                let job = ApplyJob {
                    id: id.clone(),
                    kind,
                    properties: properties.clone(),
                    provider_id: state.and_then(|s| s.provider_id.clone()),
                    action,
                };
                let provider = Arc::clone(&self.provider);
                let retry = self.retry.clone();
                let cancel = self.cancel.clone();
                prepared.insert(id.clone(), (properties, hash));
                in_flight.push(id.clone());
                jobs.spawn(apply_one(provider, retry, cancel, job));
            }

            debug!(batch = batch_index, tasks = in_flight.len(), "batch dispatched");
            let (mut results, cancelled) = self.join_batch(jobs).await;

            for id in &in_flight {
                let Some((properties, hash)) = prepared.remove(id) else {
                    continue;
                };
                let Some(kind) = ctx.graph.get(id).map(|d| d.kind) else {
                    continue;
                };
                match results.remove(id) {
                    Some(JobResult {
                        result: Ok(applied),
                        attempts,
                        duration,
                        ..
                    }) => {
                        let resolved = Resolved {
                            kind,
                            properties,
                            hash,
                        };
                        self.record_applied(ctx, id, resolved, applied, attempts, duration, &mut outcomes)?;
                    }
                    Some(JobResult {
                        result: Err(e),
                        attempts,
                        duration,
                        ..
                    }) => {
                        blocked.insert(id.clone());
                        let message = e.into_engine(id).to_string();
                        self.fail(ctx, &mut outcomes, id, kind, message, attempts, duration);
                        halted |= self.failure == FailurePolicy::StopOnFirst;
                    }
                    None if cancelled => {
                        blocked.insert(id.clone());
                        self.skip(ctx, &mut outcomes, id, SkipReason::Cancelled);
                    }
                    None => {
                        blocked.insert(id.clone());
                        self.fail(ctx, &mut outcomes, id, kind, "task aborted".to_string(), 0, Duration::ZERO);
                        halted |= self.failure == FailurePolicy::StopOnFirst;
                    }
                }
            }

            store.save(&ctx.states)?;
        }

        let exports = self.resolve_exports(ctx);
        store.save_outputs(&exports)?;

        let report = self.finish(ctx, run_id, PlanDirection::Apply, plan, outcomes, exports, started);
        Ok(report)
    }

    /// Tear down every resource of a destroy plan that state records as provisioned.
    #[instrument(name = "destroy", skip_all, fields(stack = %ctx.stack, batches = plan.len()))]
    pub async fn destroy(
        &self,
        ctx: &mut RunContext,
        plan: &ExecutionPlan,
        store: &dyn StateStore,
    ) -> Result<ApplyReport> {
        let run_id = eventlog::generate_run_id();
        let started = Instant::now();
        self.record(ProvenanceEvent::ApplyStarted {
            stack: ctx.stack.clone(),
            run_id: run_id.clone(),
            direction: "destroy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        info!(run_id = %run_id, resources = plan.resource_count(), "destroy started");

        let mut outcomes: FxHashMap<String, ResourceOutcome> = FxHashMap::default();
        let mut blocked: FxHashSet<String> = FxHashSet::default();
        let mut halted = false;

        for batch in &plan.batches {
            if self.cancel.is_cancelled() || halted {
                let reason = if halted {
                    SkipReason::Halted
                } else {
                    SkipReason::Cancelled
                };
                for id in batch {
                    if ctx.states.get(id).is_some_and(ResourceState::is_provisioned) {
                        self.skip(ctx, &mut outcomes, id, reason.clone());
                    }
                }
                continue;
            }

            let mut jobs = JoinSet::new();
            let mut in_flight: Vec<(String, ResourceKind)> = Vec::new();

            for id in batch {
                let Some(state) = ctx.states.get(id) else {
                    continue;
                };
                let kind = state.kind;
                let Some(provider_id) = state.provider_id.clone().filter(|_| state.is_provisioned())
                else {
                    ctx.states.shift_remove(id);
                    continue;
                };

                // anything still recorded as depending on us must be gone first
                let waiting = ctx
                    .states
                    .values()
                    .find(|s| s.dependencies.iter().any(|d| d == id) && blocked.contains(&s.id))
                    .map(|s| s.id.clone());
                if let Some(dependent) = waiting {
                    blocked.insert(id.clone());
                    self.skip(ctx, &mut outcomes, id, SkipReason::DependencyFailed(dependent));
                    continue;
                }

                self.record(ProvenanceEvent::ResourceStarted {
                    stack: ctx.stack.clone(),
                    resource: id.clone(),
                    action: "delete".to_string(),
                });
                let provider = Arc::clone(&self.provider);
                let retry = self.retry.clone();
                let cancel = self.cancel.clone();
                let rid = id.clone();
                in_flight.push((id.clone(), kind));
                jobs.spawn(async move {
                    let started = Instant::now();
                    let (result, attempts) = with_retry(&retry, &cancel, &rid, || {
                        provider.delete(kind, &provider_id)
                    })
                    .await;
                    let result = match result {
                        Err(ProviderError::NotFound(_)) => Ok(()),
                        other => other,
                    };
                    JobResult {
                        id: rid,
                        result,
                        attempts,
                        duration: started.elapsed(),
                    }
                });
            }

            let (mut results, cancelled) = self.join_batch(jobs).await;

            for (id, kind) in &in_flight {
                match results.remove(id) {
                    Some(JobResult {
                        result: Ok(()),
                        attempts,
                        duration,
                        ..
                    }) => {
                        ctx.states.shift_remove(id);
                        self.record(ProvenanceEvent::ResourceDeleted {
                            stack: ctx.stack.clone(),
                            resource: id.clone(),
                            duration_seconds: duration.as_secs_f64(),
                        });
                        info!(resource = %id, "deleted");
                        outcomes.insert(
                            id.clone(),
                            ResourceOutcome {
                                resource_id: id.clone(),
                                kind: *kind,
                                status: TerminalStatus::Deleted,
                                attempts,
                                duration,
                            },
                        );
                    }
                    Some(JobResult {
                        result: Err(e),
                        attempts,
                        duration,
                        ..
                    }) => {
                        blocked.insert(id.clone());
                        let message = e.into_engine(id).to_string();
                        self.fail(ctx, &mut outcomes, id, *kind, message, attempts, duration);
                        halted |= self.failure == FailurePolicy::StopOnFirst;
                    }
                    None if cancelled => {
                        blocked.insert(id.clone());
                        self.skip(ctx, &mut outcomes, id, SkipReason::Cancelled);
                    }
                    None => {
                        blocked.insert(id.clone());
                        self.fail(ctx, &mut outcomes, id, *kind, "task aborted".to_string(), 0, Duration::ZERO);
                    }
                }
            }

            store.save(&ctx.states)?;
        }

        let exports = if ctx.states.values().any(ResourceState::is_provisioned) {
            store.load_outputs()?
        } else {
            ExportMap::new()
        };
        store.save_outputs(&exports)?;

        Ok(self.finish(ctx, run_id, PlanDirection::Destroy, plan, outcomes, exports, started))
    }

    /// Delete provisioned resources the graph no longer declares.
    pub async fn prune(&self, ctx: &mut RunContext, store: &dyn StateStore) -> Result<ApplyReport> {
        let teardown = planner::plan_orphans(&ctx.states, &ctx.graph)?;
        self.destroy(ctx, &teardown, store).await
    }

    /// Join every task of a batch, or abort them all on cancellation.
    async fn join_batch<T: Send + 'static>(
        &self,
        mut jobs: JoinSet<JobResult<T>>,
    ) -> (FxHashMap<String, JobResult<T>>, bool) {
        let mut results = FxHashMap::default();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(in_flight = jobs.len(), "cancelled; aborting in-flight tasks");
                    jobs.abort_all();
                    while let Some(joined) = jobs.join_next().await {
                        if let Ok(r) = joined {
                            results.insert(r.id.clone(), r);
                        }
                    }
                    return (results, true);
                }
                joined = jobs.join_next() => match joined {
                    Some(Ok(r)) => {
                        results.insert(r.id.clone(), r);
                    }
                    Some(Err(e)) => warn!(error = %e, "resource task did not complete"),
                    None => return (results, false),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_applied(
        &self,
        ctx: &mut RunContext,
        id: &str,
        resolved: Resolved,
        applied: Applied,
        attempts: u32,
        duration: Duration,
        outcomes: &mut FxHashMap<String, ResourceOutcome>,
    ) -> Result<()> {
        let Resolved {
            kind,
            properties,
            hash,
        } = resolved;
        let dependencies = ctx
            .graph
            .node_id(id)
            .map(|node| ctx.graph.dependency_ids(node))
            .unwrap_or_default();

        ctx.outputs.resolve(id, applied.outputs.clone())?;

        let mut state = ResourceState::new(id, kind);
        state.provider_id = Some(applied.provider_id);
        state.status = ResourceStatus::Created;
        state.properties_hash = hash.clone();
        state.last_applied = properties;
        state.outputs = applied.outputs;
        state.dependencies = dependencies;
        state.applied_at = Some(eventlog::now_iso8601());
        state.duration_seconds = Some(duration.as_secs_f64());
        ctx.states.insert(id.to_string(), state);

        self.record(ProvenanceEvent::ResourceApplied {
            stack: ctx.stack.clone(),
            resource: id.to_string(),
            action: match applied.status {
                TerminalStatus::Updated => "update".to_string(),
                _ => "create".to_string(),
            },
            duration_seconds: duration.as_secs_f64(),
            hash,
        });
        info!(resource = %id, status = %applied.status, attempts, "resource applied");
        outcomes.insert(
            id.to_string(),
            ResourceOutcome {
                resource_id: id.to_string(),
                kind,
                status: applied.status,
                attempts,
                duration,
            },
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &self,
        ctx: &mut RunContext,
        outcomes: &mut FxHashMap<String, ResourceOutcome>,
        id: &str,
        kind: ResourceKind,
        message: String,
        attempts: u32,
        duration: Duration,
    ) {
        let state = ctx
            .states
            .entry(id.to_string())
            .or_insert_with(|| ResourceState::new(id, kind));
        state.status = ResourceStatus::Failed;
        state.applied_at = Some(eventlog::now_iso8601());
        state.duration_seconds = Some(duration.as_secs_f64());

        self.record(ProvenanceEvent::ResourceFailed {
            stack: ctx.stack.clone(),
            resource: id.to_string(),
            error: message.clone(),
        });
        warn!(resource = %id, attempts, error = %message, "resource failed");
        outcomes.insert(
            id.to_string(),
            ResourceOutcome {
                resource_id: id.to_string(),
                kind,
                status: TerminalStatus::Failed(message),
                attempts,
                duration,
            },
        );
    }

    fn skip(
        &self,
        ctx: &RunContext,
        outcomes: &mut FxHashMap<String, ResourceOutcome>,
        id: &str,
        reason: SkipReason,
    ) {
        let kind = ctx
            .graph
            .get(id)
            .map(|d| d.kind)
            .or_else(|| ctx.states.get(id).map(|s| s.kind));
        let Some(kind) = kind else {
            return;
        };
        self.record(ProvenanceEvent::ResourceSkipped {
            stack: ctx.stack.clone(),
            resource: id.to_string(),
            reason: reason.to_string(),
        });
        debug!(resource = %id, reason = %reason, "resource skipped");
        outcomes.insert(
            id.to_string(),
            ResourceOutcome {
                resource_id: id.to_string(),
                kind,
                status: TerminalStatus::Skipped(reason),
                attempts: 0,
                duration: Duration::ZERO,
            },
        );
    }

    /// Exports from this run's outputs, falling back to the outputs recorded
    /// for producers that were failed, skipped or cancelled but still exist.
    fn resolve_exports(&self, ctx: &RunContext) -> ExportMap {
        let snapshot = ctx.outputs.snapshot();
        let recorded = planner::preview_outputs(&ctx.states);
        let mut exports = ExportMap::new();
        for export in &ctx.exports {
            let value = snapshot
                .resolve_value(&export.value, &export.name)
                .or_else(|_| recorded.resolve_value(&export.value, &export.name));
            match value {
                Ok(value) => {
                    exports.insert(
                        export.name.clone(),
                        ExportValue {
                            value,
                            secret: export.secret,
                        },
                    );
                }
                Err(e) => debug!(export = %export.name, error = %e, "export not resolved"),
            }
        }
        exports
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        ctx: &RunContext,
        run_id: String,
        direction: PlanDirection,
        plan: &ExecutionPlan,
        mut outcomes: FxHashMap<String, ResourceOutcome>,
        exports: ExportMap,
        started: Instant,
    ) -> ApplyReport {
        let ordered = plan
            .order()
            .into_iter()
            .filter_map(|id| outcomes.remove(&id).map(|o| (id, o)))
            .collect();
        let report = ApplyReport {
            stack: ctx.stack.clone(),
            run_id: run_id.clone(),
            direction,
            outcomes: ordered,
            exports,
            total_duration: started.elapsed(),
        };

        let changed = report.count(|s| {
            matches!(
                s,
                TerminalStatus::Created | TerminalStatus::Updated | TerminalStatus::Deleted
            )
        });
        self.record(ProvenanceEvent::ApplyCompleted {
            stack: ctx.stack.clone(),
            run_id,
            resources_changed: changed as u32,
            resources_unchanged: report.count(|s| *s == TerminalStatus::Unchanged) as u32,
            resources_failed: report.failed() as u32,
            resources_skipped: report.skipped() as u32,
            total_seconds: report.total_duration.as_secs_f64(),
        });
        info!(
            changed,
            failed = report.failed(),
            skipped = report.skipped(),
            "run completed"
        );
        report
    }
}

/// Run one provider operation with bounded exponential backoff.
///
/// Only transient errors are retried. Returns the last result and the
/// number of attempts made.
async fn with_retry<T, F, Fut>(
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    resource: &str,
    mut op: F,
) -> (std::result::Result<T, ProviderError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = retry.delay_for_attempt(attempt - 1);
                warn!(
                    resource,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider error; retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return (Err(e), attempt),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return (other, attempt),
        }
    }
}

async fn apply_one(
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    job: ApplyJob,
) -> JobResult<Applied> {
    let started = Instant::now();
    let ApplyJob {
        id,
        kind,
        properties,
        provider_id,
        action,
    } = job;

    let mut attempts = 0;
    let mut result = Err(ProviderError::NotFound(id.clone()));

    if let (PlanAction::Update, Some(pid)) = (action, provider_id.as_deref()) {
        let (r, n) = with_retry(&retry, &cancel, &id, || provider.update(kind, pid, &properties)).await;
        attempts += n;
        result = r.map(|outputs| Applied {
            provider_id: pid.to_string(),
            outputs,
            status: TerminalStatus::Updated,
        });
        if matches!(result, Err(ProviderError::NotFound(_))) {
            warn!(resource = %id, provider_id = pid, "object gone; recreating");
        }
    }

    if matches!(result, Err(ProviderError::NotFound(_))) {
        let (r, n) = with_retry(&retry, &cancel, &id, || provider.create(kind, &id, &properties)).await;
        attempts += n;
        result = r.map(|created| Applied {
            provider_id: created.provider_id,
            outputs: created.outputs,
            status: TerminalStatus::Created,
        });
    }

    JobResult {
        id,
        result,
        attempts,
        duration: started.elapsed(),
    }
}
