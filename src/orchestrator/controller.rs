//! Pipeline lifecycle controller.
//!
//! Owns the compile → run state machine, talks to the two stages through
//! frames, and publishes state snapshots and events for presentation layers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

use super::post_process::{process_run_completion, RunMeta};
use crate::error::{CompileError, PipelineError, RuntimeError};
use crate::model::{InfoEvent, Phase, PipelineConfig, PipelineEvent, PipelineState, RequestId};
use crate::output::OutputRecord;
use crate::stages::protocol::{self, CompileReply, CompileRequest, RunReply, RunRequest};
use crate::stages::{Compiler, Runner, ScriptCompiler, ScriptRunner, Stages};

/// Commands sent from the [`Pipeline`] handle to the controller task.
#[derive(Debug)]
pub(crate) enum PipelineCommand {
    Submit { request: RequestId, source: String },
    Shutdown,
}

/// What the controller loop must do after feeding a reply to the machine.
#[derive(Debug)]
pub(crate) enum Step {
    /// The reply belongs to a request that is no longer active.
    Stale { request: RequestId, phase: Phase },
    /// Compile succeeded; send this to the runner.
    Dispatch(RunRequest),
    /// A chunk was buffered; more frames follow.
    Pending,
    /// The active request reached a terminal state.
    Settled,
}

struct Active {
    request: RequestId,
    phase: Phase,
    phase_started: Instant,
    compile_ms: f64,
    listing: String,
    records: Vec<OutputRecord>,
    notified: bool,
}

/// Synchronous transition logic. Latest request wins: only replies for the
/// active request move the state; everything else is reported as stale.
#[derive(Default)]
pub(crate) struct PipelineMachine {
    state: PipelineState,
    active: Option<Active>,
}

impl PipelineMachine {
    pub(crate) fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Start a new request, returning the one it supersedes, if any.
    pub(crate) fn submit(&mut self, request: RequestId, now: Instant) -> Option<RequestId> {
        let previous = self.active.take().map(|a| a.request);
        self.active = Some(Active {
            request,
            phase: Phase::Compile,
            phase_started: now,
            compile_ms: 0.0,
            listing: String::new(),
            records: Vec::new(),
            notified: false,
        });
        self.state = PipelineState::Compiling { request };
        previous
    }

    pub(crate) fn on_compile_reply(&mut self, reply: CompileReply, now: Instant) -> Step {
        let request = reply.request_id();
        let Some(active) = self.active_for(request, Phase::Compile) else {
            return Step::Stale {
                request,
                phase: Phase::Compile,
            };
        };
        match reply {
            CompileReply::Success {
                request_id,
                unit,
                listing,
            } => {
                active.compile_ms = elapsed_ms(active.phase_started, now);
                active.listing = listing;
                active.phase = Phase::Run;
                active.phase_started = now;
                active.notified = false;
                self.state = PipelineState::Running { request };
                Step::Dispatch(RunRequest { request_id, unit })
            }
            CompileReply::Error { error, .. } => self.settle_failed(error.into()),
        }
    }

    pub(crate) fn on_run_reply(&mut self, reply: RunReply, now: Instant) -> Step {
        let request = reply.request_id();
        let Some(active) = self.active_for(request, Phase::Run) else {
            return Step::Stale {
                request,
                phase: Phase::Run,
            };
        };
        match reply {
            RunReply::Chunk { items, .. } => {
                active.records.extend(items);
                Step::Pending
            }
            RunReply::Success { items, total, .. } => {
                let Some(mut active) = self.active.take() else {
                    return Step::Pending;
                };
                active.records.extend(items);
                let meta = RunMeta {
                    listing: active.listing,
                    compile_ms: active.compile_ms,
                    run_ms: elapsed_ms(active.phase_started, now),
                };
                self.state = match process_run_completion(active.records, total, meta) {
                    Ok(result) => PipelineState::Succeeded {
                        request,
                        result: Box::new(result),
                    },
                    Err(error) => PipelineState::Failed {
                        request,
                        error: error.into(),
                    },
                };
                Step::Settled
            }
            RunReply::Error { error, .. } => self.settle_failed(error.into()),
        }
    }

    /// Fail the active request if it is waiting on `phase`. Used when a
    /// stage's reply stream breaks or a frame cannot be decoded.
    pub(crate) fn fail_active(&mut self, phase: Phase, message: String) -> Option<Step> {
        let waiting = self.active.as_ref().is_some_and(|a| a.phase == phase);
        if !waiting {
            return None;
        }
        let error = match phase {
            Phase::Compile => PipelineError::Compile(CompileError::new(message)),
            Phase::Run => PipelineError::Runtime(RuntimeError::new(message)),
        };
        Some(self.settle_failed(error))
    }

    /// A reply frame for `phase` failed to decode. When its envelope still
    /// names a request other than the active one, it is only stale.
    pub(crate) fn on_undecodable(
        &mut self,
        phase: Phase,
        frame_request: Option<RequestId>,
        message: String,
    ) -> Option<Step> {
        if let Some(request) = frame_request {
            if self.active.as_ref().map(|a| a.request) != Some(request) {
                return Some(Step::Stale { request, phase });
            }
        }
        self.fail_active(phase, message)
    }

    /// One-shot notice when the active phase has been running for `after`.
    pub(crate) fn overdue(&mut self, now: Instant, after: Duration) -> Option<InfoEvent> {
        let active = self.active.as_mut()?;
        let elapsed = now.saturating_duration_since(active.phase_started);
        if active.notified || elapsed < after {
            return None;
        }
        active.notified = true;
        Some(InfoEvent::StillBusy {
            request: active.request,
            phase: active.phase,
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    fn active_for(&mut self, request: RequestId, phase: Phase) -> Option<&mut Active> {
        self.active
            .as_mut()
            .filter(|a| a.request == request && a.phase == phase)
    }

    fn settle_failed(&mut self, error: PipelineError) -> Step {
        if let Some(active) = self.active.take() {
            self.state = PipelineState::Failed {
                request: active.request,
                error,
            };
        }
        Step::Settled
    }
}

fn elapsed_ms(since: Instant, now: Instant) -> f64 {
    now.saturating_duration_since(since).as_secs_f64() * 1000.0
}

/// Publishes machine state and events to observers.
struct Outputs {
    state_tx: watch::Sender<PipelineState>,
    event_tx: Option<UnboundedSender<PipelineEvent>>,
}

impl Outputs {
    fn publish(&self, machine: &PipelineMachine) {
        self.state_tx.send_replace(machine.state().clone());
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn info(&self, info: InfoEvent) {
        self.emit(PipelineEvent::Info(info));
    }

    fn apply(&self, machine: &mut PipelineMachine, stages: &Stages, step: Step) {
        match step {
            Step::Stale { request, phase } => {
                tracing::info!(%request, ?phase, "discarding stale reply");
                self.info(InfoEvent::StaleReply { request, phase });
            }
            Step::Pending => {}
            Step::Settled => self.settled(machine),
            Step::Dispatch(run) => {
                let request = run.request_id;
                tracing::debug!(%request, "compile succeeded; dispatching run");
                self.publish(machine);
                self.emit(PipelineEvent::PhaseStarted {
                    request,
                    phase: Phase::Run,
                });
                if let Err(e) = protocol::encode(&run).and_then(|f| stages.runner.post(f)) {
                    tracing::error!(%request, "failed to dispatch run: {e}");
                    if let Some(step) = machine.fail_active(Phase::Run, e.to_string()) {
                        self.apply(machine, stages, step);
                    }
                }
            }
        }
    }

    fn settled(&self, machine: &PipelineMachine) {
        let state = machine.state().clone();
        tracing::debug!(request = ?state.request(), state = state.label(), "request settled");
        self.state_tx.send_replace(state.clone());
        self.emit(PipelineEvent::Finished { state });
    }
}

/// Drive requests through the stages until shutdown, then hand the stages
/// back for teardown.
pub(crate) async fn run_controller(
    cfg: PipelineConfig,
    mut stages: Stages,
    mut cmd_rx: UnboundedReceiver<PipelineCommand>,
    state_tx: watch::Sender<PipelineState>,
    event_tx: Option<UnboundedSender<PipelineEvent>>,
) -> Stages {
    let out = Outputs { state_tx, event_tx };
    let mut machine = PipelineMachine::default();
    let mut compiler_open = true;
    let mut runner_open = true;
    // Busy watchdog: if a phase takes too long, tell observers once.
    let tick = cfg
        .busy_notice_after
        .clamp(Duration::from_millis(10), Duration::from_millis(500));
    let mut watchdog = tokio::time::interval(tick);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PipelineCommand::Submit { request, source }) => {
                        if let Some(previous) = machine.submit(request, Instant::now()) {
                            tracing::info!(%previous, %request, "request superseded");
                            out.info(InfoEvent::Superseded { previous, by: request });
                        }
                        tracing::debug!(%request, bytes = source.len(), "dispatching compile");
                        out.publish(&machine);
                        out.emit(PipelineEvent::PhaseStarted { request, phase: Phase::Compile });
                        let msg = CompileRequest { request_id: request, source };
                        if let Err(e) = protocol::encode(&msg).and_then(|f| stages.compiler.post(f)) {
                            tracing::error!(%request, "failed to dispatch compile: {e}");
                            if let Some(step) = machine.fail_active(Phase::Compile, e.to_string()) {
                                out.apply(&mut machine, &stages, step);
                            }
                        }
                    }
                    Some(PipelineCommand::Shutdown) | None => break,
                }
            }
            frame = stages.compiler.recv(), if compiler_open => {
                let step = match frame {
                    Some(frame) => match protocol::decode::<CompileReply>(&frame) {
                        Ok(reply) => Some(machine.on_compile_reply(reply, Instant::now())),
                        Err(e) => {
                            tracing::error!("undecodable compiler reply: {e}");
                            machine.on_undecodable(
                                Phase::Compile,
                                protocol::peek_request_id(&frame),
                                format!("undecodable compiler reply: {e}"),
                            )
                        }
                    },
                    None => {
                        compiler_open = false;
                        tracing::error!("compiler stage exited");
                        machine.fail_active(Phase::Compile, "compiler stage exited".to_string())
                    }
                };
                if let Some(step) = step {
                    out.apply(&mut machine, &stages, step);
                }
            }
            frame = stages.runner.recv(), if runner_open => {
                let step = match frame {
                    Some(frame) => match protocol::decode::<RunReply>(&frame) {
                        Ok(reply) => Some(machine.on_run_reply(reply, Instant::now())),
                        Err(e) => {
                            tracing::error!("undecodable runner reply: {e}");
                            machine.on_undecodable(
                                Phase::Run,
                                protocol::peek_request_id(&frame),
                                format!("undecodable runner reply: {e}"),
                            )
                        }
                    },
                    None => {
                        runner_open = false;
                        tracing::error!("runner stage exited");
                        machine.fail_active(Phase::Run, "runner stage exited".to_string())
                    }
                };
                if let Some(step) = step {
                    out.apply(&mut machine, &stages, step);
                }
            }
            _ = watchdog.tick() => {
                if let Some(info) = machine.overdue(Instant::now(), cfg.busy_notice_after) {
                    tracing::warn!("{}", info.to_message());
                    out.info(info);
                }
            }
        }
    }

    tracing::debug!("controller stopped");
    stages
}

/// Handle to a running pipeline: two stages plus the controller task.
///
/// `compile_and_run` never blocks; observe progress through
/// [`Pipeline::current_state`], [`Pipeline::subscribe`] or
/// [`Pipeline::settled`].
pub struct Pipeline {
    cmd_tx: UnboundedSender<PipelineCommand>,
    state_rx: watch::Receiver<PipelineState>,
    next_id: AtomicU64,
    grace: Duration,
    task: tokio::task::JoinHandle<Stages>,
}

impl Pipeline {
    /// Spawn both stages and the controller. Must be called inside a tokio runtime.
    pub fn start<C: Compiler, R: Runner>(
        cfg: PipelineConfig,
        compiler: C,
        runner: R,
        event_tx: Option<UnboundedSender<PipelineEvent>>,
    ) -> Result<Self> {
        let stages = Stages::spawn(compiler, runner, cfg.chunk_items)
            .context("failed to start pipeline stages")?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<PipelineCommand>();
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
        let grace = cfg.shutdown_grace;
        let task = tokio::spawn(run_controller(cfg, stages, cmd_rx, state_tx, event_tx));
        Ok(Self {
            cmd_tx,
            state_rx,
            next_id: AtomicU64::new(0),
            grace,
            task,
        })
    }

    pub fn with_script_stages(
        cfg: PipelineConfig,
        event_tx: Option<UnboundedSender<PipelineEvent>>,
    ) -> Result<Self> {
        Self::start(cfg, ScriptCompiler, ScriptRunner, event_tx)
    }

    /// Submit `source` for compilation and execution, superseding any
    /// request still in flight.
    pub fn compile_and_run(&self, source: impl Into<String>) -> RequestId {
        let request = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let cmd = PipelineCommand::Submit {
            request,
            source: source.into(),
        };
        if self.cmd_tx.send(cmd).is_err() {
            tracing::error!(%request, "pipeline controller is not running");
        }
        request
    }

    pub fn current_state(&self) -> PipelineState {
        self.state_rx.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state_rx.borrow().is_busy()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    /// Wait until `request`, or a request that superseded it, reaches a
    /// terminal state.
    pub async fn settled(&self, request: RequestId) -> Result<PipelineState> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| s.is_terminal() && s.request() >= Some(request))
            .await
            .context("pipeline controller stopped before the request settled")?;
        Ok(state.clone())
    }

    /// Stop the controller and join both stages within the configured grace.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.cmd_tx.send(PipelineCommand::Shutdown);
        let stages = self.task.await.context("pipeline controller task failed")?;
        stages.shutdown(self.grace).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::CompiledUnit;
    use crate::output::{OutputItem, Value};

    fn compiled(request: u64) -> CompileReply {
        CompileReply::Success {
            request_id: RequestId(request),
            unit: CompiledUnit::default(),
            listing: "fn main():\n".into(),
        }
    }

    fn record(text: &str) -> OutputRecord {
        OutputItem::print(Value::from(text)).to_record()
    }

    #[test]
    fn test_happy_path_transitions() {
        let now = Instant::now();
        let mut m = PipelineMachine::default();
        assert!(matches!(m.state(), PipelineState::Idle));

        assert_eq!(m.submit(RequestId(1), now), None);
        assert!(m.state().is_busy());

        let step = m.on_compile_reply(compiled(1), now);
        assert!(matches!(step, Step::Dispatch(RunRequest { request_id: RequestId(1), .. })));
        assert!(matches!(m.state(), PipelineState::Running { .. }));

        let step = m.on_run_reply(
            RunReply::Chunk {
                request_id: RequestId(1),
                items: vec![record("a")],
            },
            now,
        );
        assert!(matches!(step, Step::Pending));
        let step = m.on_run_reply(
            RunReply::Success {
                request_id: RequestId(1),
                items: vec![record("b")],
                total: 2,
            },
            now,
        );
        assert!(matches!(step, Step::Settled));
        assert_eq!(m.state().display_text().as_deref(), Some("a\nb\n"));
        assert!(!m.state().is_busy());
    }

    #[test]
    fn test_compile_error_short_circuits() {
        let now = Instant::now();
        let mut m = PipelineMachine::default();
        m.submit(RequestId(1), now);
        let step = m.on_compile_reply(
            CompileReply::Error {
                request_id: RequestId(1),
                error: CompileError::new("bad"),
            },
            now,
        );
        assert!(matches!(step, Step::Settled));
        assert!(matches!(
            m.state(),
            PipelineState::Failed { error: PipelineError::Compile(_), .. }
        ));
    }

    #[test]
    fn test_latest_request_wins() {
        let now = Instant::now();
        let mut m = PipelineMachine::default();
        m.submit(RequestId(1), now);
        assert_eq!(m.submit(RequestId(2), now), Some(RequestId(1)));

        // The superseded compile must not be forwarded to the runner.
        let step = m.on_compile_reply(compiled(1), now);
        assert!(matches!(step, Step::Stale { request: RequestId(1), phase: Phase::Compile }));
        assert!(matches!(m.state(), PipelineState::Compiling { request: RequestId(2) }));

        assert!(matches!(m.on_compile_reply(compiled(2), now), Step::Dispatch(_)));
        let stale_run = RunReply::Success {
            request_id: RequestId(1),
            items: vec![],
            total: 0,
        };
        assert!(matches!(m.on_run_reply(stale_run, now), Step::Stale { .. }));
        assert!(m.state().is_busy());
    }

    #[test]
    fn test_run_reply_during_compile_is_stale() {
        let now = Instant::now();
        let mut m = PipelineMachine::default();
        m.submit(RequestId(1), now);
        let early = RunReply::Success {
            request_id: RequestId(1),
            items: vec![],
            total: 0,
        };
        assert!(matches!(m.on_run_reply(early, now), Step::Stale { .. }));
    }

    #[test]
    fn test_undecodable_frame_of_superseded_request_is_stale() {
        let now = Instant::now();
        let mut m = PipelineMachine::default();
        m.submit(RequestId(1), now);
        m.on_compile_reply(compiled(1), now);
        m.submit(RequestId(2), now);
        m.on_compile_reply(compiled(2), now);

        let step = m.on_undecodable(Phase::Run, Some(RequestId(1)), "bad frame".into());
        assert!(matches!(
            step,
            Some(Step::Stale { request: RequestId(1), phase: Phase::Run })
        ));
        assert!(matches!(m.state(), PipelineState::Running { request: RequestId(2) }));

        let step = m.on_run_reply(
            RunReply::Success {
                request_id: RequestId(2),
                items: vec![record("ok")],
                total: 1,
            },
            now,
        );
        assert!(matches!(step, Step::Settled));
        assert!(matches!(m.state(), PipelineState::Succeeded { .. }));
    }

    #[test]
    fn test_undecodable_frame_without_other_id_fails_active() {
        let now = Instant::now();
        let mut m = PipelineMachine::default();
        m.submit(RequestId(4), now);
        assert!(m.on_undecodable(Phase::Compile, None, "bad frame".into()).is_some());
        assert!(matches!(
            m.state(),
            PipelineState::Failed { error: PipelineError::Compile(_), .. }
        ));

        m.submit(RequestId(5), now);
        m.on_compile_reply(compiled(5), now);
        assert!(m
            .on_undecodable(Phase::Run, Some(RequestId(5)), "bad frame".into())
            .is_some());
        assert!(matches!(
            m.state(),
            PipelineState::Failed { error: PipelineError::Runtime(_), .. }
        ));
    }

    #[test]
    fn test_broken_stage_fails_only_matching_phase() {
        let now = Instant::now();
        let mut m = PipelineMachine::default();
        assert!(m.fail_active(Phase::Run, "gone".into()).is_none());
        m.submit(RequestId(1), now);
        assert!(m.fail_active(Phase::Run, "gone".into()).is_none());
        assert!(m.fail_active(Phase::Compile, "gone".into()).is_some());
        assert!(matches!(
            m.state(),
            PipelineState::Failed { error: PipelineError::Compile(_), .. }
        ));
    }

    #[test]
    fn test_overdue_notice_fires_once_per_phase() {
        let start = Instant::now();
        let mut m = PipelineMachine::default();
        m.submit(RequestId(1), start);
        let after = Duration::from_millis(100);
        assert!(m.overdue(start, after).is_none());
        let later = start + Duration::from_millis(150);
        assert!(matches!(
            m.overdue(later, after),
            Some(InfoEvent::StillBusy { phase: Phase::Compile, .. })
        ));
        assert!(m.overdue(later, after).is_none());

        m.on_compile_reply(compiled(1), later);
        let much_later = later + Duration::from_millis(150);
        assert!(matches!(
            m.overdue(much_later, after),
            Some(InfoEvent::StillBusy { phase: Phase::Run, .. })
        ));
    }
}
