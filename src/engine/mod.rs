//! Execution engine: drives a compiled graph to a terminal state, emits
//! stepwise updates, persists best-effort history, records traces, and
//! honours cooperative cancellation.
//!
//! The repository-side terminal transition is the source of truth for
//! run state; history writes are best-effort and never fail the run.

mod checkpoint;

pub use checkpoint::{InMemoryCheckpointer, NodeCheckpointer, RunCheckpoint};

use crate::graph::{CompiledGraph, GraphCompiler, RunConfig};
use crate::trace::{
    trace_update_message, RootSpanContext, TraceUpdateArgs, TraceUpdateMessage,
};
use crate::vault::CredentialResolver;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use orcheo_backend::{RunHistoryStore, WorkflowRepository};
use orcheo_types::{
    OrcheoError, RunHistoryStep, RunStartRequest, TraceMetadataUpdate, WorkflowVersion,
};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Cooperative cancellation token shared between the caller, the engine,
/// and node code.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    triggered: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. The first recorded reason wins.
    pub fn trigger(&self, reason: Option<&str>) {
        if let Ok(mut slot) = self.inner.reason.lock() {
            if slot.is_none() {
                *slot = reason.map(str::to_string);
            }
        }
        self.inner.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Events pushed to the progress sink in emission order.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Raw step payload as produced by the graph.
    NodeStep {
        execution_id: String,
        payload: Value,
    },
    /// Incremental trace delta.
    TraceUpdate(TraceUpdateMessage),
}

/// Consumer of execution progress; typically bridged to a websocket.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, event: ExecutionEvent);
}

/// Sink that drops everything.
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn emit(&self, _event: ExecutionEvent) {}
}

/// Sink forwarding events into an unbounded channel.
pub struct ChannelProgressSink {
    sender: UnboundedSender<ExecutionEvent>,
}

impl ChannelProgressSink {
    pub fn new(sender: UnboundedSender<ExecutionEvent>) -> Self {
        ChannelProgressSink { sender }
    }
}

#[async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn emit(&self, event: ExecutionEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("progress sink receiver dropped");
        }
    }
}

/// Adapt the receiving half of a `ChannelProgressSink` into a `Stream`
/// for transports that forward events over a socket.
pub fn event_stream(
    receiver: UnboundedReceiver<ExecutionEvent>,
) -> UnboundedReceiverStream<ExecutionEvent> {
    UnboundedReceiverStream::new(receiver)
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Hard cap on executed node steps per run; cyclic graphs that breach
    /// it terminate the run as failed.
    pub step_budget: usize,
    /// Overall per-run deadline; when exceeded the cancel token trips.
    pub run_deadline: Option<Duration>,
    /// When off, the engine skips trace metadata writes and trace
    /// deltas; node-step events still flow.
    pub tracing_enabled: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            step_budget: 10_000,
            run_deadline: None,
            tracing_enabled: true,
        }
    }
}

/// Everything needed to drive one run.
pub struct RunRequest {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub version: WorkflowVersion,
    pub inputs: Value,
    pub execution_id: String,
    pub resolver: Option<CredentialResolver>,
    pub actor: String,
}

/// Terminal result of a driven run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Succeeded(Value),
    Cancelled(String),
}

/// The run driver. Exactly one driver may exist per execution id; the
/// history store's uniqueness guard enforces this across callers.
pub struct ExecutionEngine {
    compiler: GraphCompiler,
    history: Arc<dyn RunHistoryStore>,
    repository: Arc<dyn WorkflowRepository>,
    checkpointer: Arc<dyn NodeCheckpointer>,
    settings: EngineSettings,
}

impl ExecutionEngine {
    pub fn new(
        compiler: GraphCompiler,
        history: Arc<dyn RunHistoryStore>,
        repository: Arc<dyn WorkflowRepository>,
        checkpointer: Arc<dyn NodeCheckpointer>,
        settings: EngineSettings,
    ) -> Self {
        ExecutionEngine {
            compiler,
            history,
            repository,
            checkpointer,
            settings,
        }
    }

    pub async fn run(
        &self,
        request: RunRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Result<RunOutcome, OrcheoError> {
        let execution_id = request.execution_id.clone();
        let workflow_id = request.workflow_id.to_string();

        let checkpoint = self.checkpointer.load(&execution_id).await?;
        let existing = match self.history.get(&execution_id).await {
            Ok(record) => Some(record),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                tracing::warn!(execution_id, error = %err, "history lookup failed; continuing");
                None
            }
        };
        if existing.is_some() && checkpoint.is_none() {
            return Err(OrcheoError::Execution(format!(
                "execution {execution_id} is already being driven"
            )));
        }
        if existing.is_none() {
            // The uniqueness of execution ids in start_run is the guard
            // against concurrent drivers, so this error is not demoted.
            self.history
                .start_run(RunStartRequest::new(
                    &execution_id,
                    &workflow_id,
                    request.inputs.clone(),
                ))
                .await?;
        }

        let trace_id = Uuid::new_v4().simple().to_string();
        let trace_started = Utc::now();
        if self.settings.tracing_enabled {
            if let Err(err) = self
                .history
                .update_trace_metadata(
                    &execution_id,
                    TraceMetadataUpdate {
                        trace_id: Some(trace_id.clone()),
                        started_at: Some(trace_started),
                        updated_at: Some(trace_started),
                    },
                )
                .await
            {
                tracing::warn!(execution_id, error = %err, "trace metadata write failed");
            }
        }

        let root_context = RootSpanContext {
            execution_id: execution_id.clone(),
            workflow_id: workflow_id.clone(),
            trace_id: Some(trace_id.clone()),
            started_at: trace_started,
            completed_at: None,
            status: "running".to_string(),
            error: None,
            inputs: Some(request.inputs.clone()),
        };
        if self.settings.tracing_enabled {
            if let Some(message) = trace_update_message(
                &execution_id,
                Some(&trace_id),
                TraceUpdateArgs {
                    root: Some(&root_context),
                    steps: &[],
                    complete: false,
                    cursor: Some(0),
                },
            ) {
                sink.emit(ExecutionEvent::TraceUpdate(message)).await;
            }
        }

        match self
            .repository
            .mark_run_started(request.run_id, &request.actor)
            .await
        {
            Ok(_) => {}
            Err(OrcheoError::InvalidTransition(_)) => {}
            Err(err) => {
                tracing::warn!(run_id = %request.run_id, error = %err, "mark_run_started failed");
            }
        }

        let driven = self
            .drive(&request, &execution_id, &workflow_id, &trace_id, &checkpoint, &sink, &cancel)
            .await;

        match driven {
            Ok(DriveResult {
                cancelled: true, ..
            }) => {
                let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                self.finish_cancelled(&request, &execution_id, &trace_id, &root_context, &sink, &reason)
                    .await;
                Ok(RunOutcome::Cancelled(reason))
            }
            Ok(DriveResult {
                final_state,
                steps_emitted,
                ..
            }) => {
                let output = extract_output(&final_state);
                self.finish_succeeded(
                    &request,
                    &execution_id,
                    &trace_id,
                    &root_context,
                    &sink,
                    steps_emitted,
                    &output,
                )
                .await?;
                Ok(RunOutcome::Succeeded(output))
            }
            Err(err) => {
                self.finish_failed(&request, &execution_id, &trace_id, &root_context, &sink, &err)
                    .await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        request: &RunRequest,
        execution_id: &str,
        workflow_id: &str,
        trace_id: &str,
        checkpoint: &Option<RunCheckpoint>,
        sink: &Arc<dyn ProgressSink>,
        cancel: &CancelToken,
    ) -> Result<DriveResult, OrcheoError> {
        let compiled: CompiledGraph = self
            .compiler
            .compile(&request.version.graph, request.resolver.as_ref())
            .await?;

        let mut state = compiled.start_state(&request.inputs);
        let mut completed: HashSet<String> = HashSet::new();
        if let Some(checkpoint) = checkpoint {
            state = checkpoint.state.clone();
            completed = checkpoint.completed.iter().cloned().collect();
            tracing::info!(
                execution_id,
                resumed_nodes = completed.len(),
                "resuming run from checkpoint"
            );
        }

        let deadline_guard = self.settings.run_deadline.map(|deadline| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.trigger(Some("run deadline exceeded"));
            })
        });

        let config = RunConfig {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            cancel: cancel.clone(),
            step_budget: self.settings.step_budget,
            completed,
        };

        let mut final_state = state.clone();
        let mut steps_emitted: i64 = 0;
        let mut cancelled = false;
        let mut failure: Option<OrcheoError> = None;

        {
            let stream = compiled.stream(state, config);
            tokio::pin!(stream);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(update) => {
                        if cancel.is_triggered() {
                            // The in-flight node's result is discarded.
                            cancelled = true;
                            break;
                        }
                        final_state = update.state.clone();
                        if let Err(err) = self
                            .checkpointer
                            .save(execution_id, &update.node_id, &update.state)
                            .await
                        {
                            tracing::warn!(execution_id, error = %err, "checkpoint write failed");
                        }
                        let step = self
                            .append_step_best_effort(execution_id, update.payload.clone(), steps_emitted)
                            .await;
                        steps_emitted = step.index + 1;
                        sink.emit(ExecutionEvent::NodeStep {
                            execution_id: execution_id.to_string(),
                            payload: update.payload,
                        })
                        .await;
                        if self.settings.tracing_enabled {
                            if let Some(message) = trace_update_message(
                                execution_id,
                                Some(trace_id),
                                TraceUpdateArgs {
                                    root: None,
                                    steps: std::slice::from_ref(&step),
                                    complete: false,
                                    cursor: None,
                                },
                            ) {
                                sink.emit(ExecutionEvent::TraceUpdate(message)).await;
                            }
                        }
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        if let Some(guard) = deadline_guard {
            guard.abort();
        }
        if cancel.is_triggered() && failure.is_none() {
            cancelled = true;
        }
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(DriveResult {
            final_state,
            steps_emitted,
            cancelled,
        })
    }

    /// History writes never fail the run; fall back to a locally indexed
    /// step when persistence misbehaves.
    async fn append_step_best_effort(
        &self,
        execution_id: &str,
        payload: Value,
        fallback_index: i64,
    ) -> RunHistoryStep {
        match self.history.append_step(execution_id, payload.clone()).await {
            Ok(step) => step,
            Err(err) => {
                tracing::warn!(execution_id, error = %err, "history append failed");
                RunHistoryStep {
                    index: fallback_index,
                    at: Utc::now(),
                    payload,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_succeeded(
        &self,
        request: &RunRequest,
        execution_id: &str,
        trace_id: &str,
        root_context: &RootSpanContext,
        sink: &Arc<dyn ProgressSink>,
        steps_emitted: i64,
        output: &Value,
    ) -> Result<(), OrcheoError> {
        let completion = json!({"status": "completed"});
        let _ = self
            .append_step_best_effort(execution_id, completion, steps_emitted)
            .await;
        if let Err(err) = self.history.mark_completed(execution_id).await {
            tracing::warn!(execution_id, error = %err, "history completion failed");
        }
        // The repository transition is the source of truth for run
        // state; its failure fails the run.
        self.repository
            .mark_run_succeeded(request.run_id, &request.actor, Some(output.clone()))
            .await?;
        self.emit_completion(execution_id, trace_id, root_context, sink, "succeeded", None, steps_emitted + 1)
            .await;
        if let Err(err) = self.checkpointer.clear(execution_id).await {
            tracing::warn!(execution_id, error = %err, "checkpoint clear failed");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_cancelled(
        &self,
        request: &RunRequest,
        execution_id: &str,
        trace_id: &str,
        root_context: &RootSpanContext,
        sink: &Arc<dyn ProgressSink>,
        reason: &str,
    ) {
        let payload = json!({"status": "cancelled", "reason": reason});
        let step = self.append_step_best_effort(execution_id, payload, 0).await;
        if let Err(err) = self.history.mark_cancelled(execution_id, Some(reason)).await {
            tracing::warn!(execution_id, error = %err, "history cancellation failed");
        }
        if let Err(err) = self
            .repository
            .mark_run_cancelled(request.run_id, &request.actor, Some(reason))
            .await
        {
            tracing::warn!(run_id = %request.run_id, error = %err, "mark_run_cancelled failed");
        }
        self.emit_completion(
            execution_id,
            trace_id,
            root_context,
            sink,
            "cancelled",
            Some(reason),
            step.index + 1,
        )
        .await;
    }

    async fn finish_failed(
        &self,
        request: &RunRequest,
        execution_id: &str,
        trace_id: &str,
        root_context: &RootSpanContext,
        sink: &Arc<dyn ProgressSink>,
        error: &OrcheoError,
    ) {
        let message = error.to_string();
        let payload = json!({"status": "error", "error": message});
        let step = self.append_step_best_effort(execution_id, payload, 0).await;
        if let Err(err) = self.history.mark_failed(execution_id, &message).await {
            tracing::warn!(execution_id, error = %err, "history failure write failed");
        }
        if let Err(err) = self
            .repository
            .mark_run_failed(request.run_id, &request.actor, &message)
            .await
        {
            tracing::warn!(run_id = %request.run_id, error = %err, "mark_run_failed failed");
        }
        self.emit_completion(
            execution_id,
            trace_id,
            root_context,
            sink,
            "failed",
            Some(&message),
            step.index + 1,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_completion(
        &self,
        execution_id: &str,
        trace_id: &str,
        root_context: &RootSpanContext,
        sink: &Arc<dyn ProgressSink>,
        status: &str,
        error: Option<&str>,
        cursor: i64,
    ) {
        if !self.settings.tracing_enabled {
            return;
        }
        let mut context = root_context.clone();
        context.status = status.to_string();
        context.error = error.map(str::to_string);
        context.completed_at = Some(Utc::now());
        if let Some(message) = trace_update_message(
            execution_id,
            Some(trace_id),
            TraceUpdateArgs {
                root: Some(&context),
                steps: &[],
                complete: true,
                cursor: Some(cursor),
            },
        ) {
            sink.emit(ExecutionEvent::TraceUpdate(message)).await;
        }
    }
}

struct DriveResult {
    final_state: Value,
    steps_emitted: i64,
    cancelled: bool,
}

/// Shape the output view from the final state: `reply` plus the intact
/// `_messages` channel when present, otherwise the state itself.
fn extract_output(state: &Value) -> Value {
    let Some(map) = state.as_object() else {
        return state.clone();
    };
    let mut output = Map::new();
    if let Some(reply) = map.get("reply") {
        output.insert("reply".to_string(), reply.clone());
    } else if let Some(messages) = map.get("_messages").and_then(Value::as_array) {
        let last_assistant = messages.iter().rev().find(|message| {
            message.get("role").and_then(Value::as_str) == Some("assistant")
        });
        if let Some(message) = last_assistant {
            if let Some(content) = message.get("content") {
                output.insert("reply".to_string(), content.clone());
            }
        }
    }
    if let Some(messages) = map.get("_messages") {
        output.insert("_messages".to_string(), messages.clone());
    }
    if output.is_empty() {
        state.clone()
    } else {
        Value::Object(output)
    }
}
