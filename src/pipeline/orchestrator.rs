//! Pipeline orchestrator: walks a dispatch through worker → audit → verdict.
//!
//! Each phase function is idempotent: it dedups on the processed-event ledger,
//! rejects completions from superseded attempts, and asserts its CAS
//! transition before any externally visible action. A lost CAS means a
//! concurrent operation already resolved the dispatch and the phase drops out
//! silently. Duplicate completion deliveries — the direct return value and an
//! out-of-band safety-net notification can both report the same run — are
//! made safe by the event ledger, not by mutual exclusion.
//!
//! Collaborator I/O (tracker fetches, comments, notifications) never
//! interrupts the state machine; failures are logged at the call site.

use crate::config::OverseerConfig;
use crate::errors::{PipelineError, TransitionError};
use crate::notify::{DispatchEvent, DispatchEventKind, Notifier};
use crate::pipeline::verdict::{self, Verdict};
use crate::prompts::PromptCompiler;
use crate::runner::{RunExecutor, RunOutcome, RunRequest};
use crate::session;
use crate::state::store::StateStore;
use crate::state::types::{CompletedDispatch, Dispatch, DispatchStatus, RunPhase};
use crate::tracker::{IssueContext, IssueTracker};
use crate::transition::{FieldUpdates, TransitionEngine};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a dispatch left the pipeline.
#[derive(Debug)]
pub enum DispatchResolution {
    /// Audit passed; the dispatch moved to the completed set.
    Completed(CompletedDispatch),
    /// Rework budget exhausted or watchdog kill; stuck, awaiting a human.
    Escalated(Dispatch),
    /// Duplicate, stale, or concurrently resolved; nothing left to do.
    Dropped,
}

/// Outcome of the spawn-worker phase.
pub enum WorkerPhase {
    Finished {
        dispatch: Dispatch,
        outcome: RunOutcome,
        run_key: String,
    },
    Escalated(Dispatch),
    Dropped,
}

/// Outcome of the trigger-audit phase.
pub enum AuditPhase {
    Finished {
        dispatch: Dispatch,
        outcome: RunOutcome,
        run_key: String,
    },
    Escalated(Dispatch),
    Dropped,
}

/// Outcome of the process-verdict phase.
pub enum VerdictOutcome {
    Completed(CompletedDispatch),
    Rework {
        dispatch: Dispatch,
        gaps: Vec<String>,
    },
    Escalated(Dispatch),
    Dropped,
}

pub struct Orchestrator {
    store: Arc<StateStore>,
    engine: TransitionEngine,
    config: OverseerConfig,
    prompts: PromptCompiler,
    executor: Arc<dyn RunExecutor>,
    tracker: Arc<dyn IssueTracker>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        config: OverseerConfig,
        prompts: PromptCompiler,
        executor: Arc<dyn RunExecutor>,
        tracker: Arc<dyn IssueTracker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine: TransitionEngine::new(store.clone()),
            store,
            config,
            prompts,
            executor,
            tracker,
            notifier,
        }
    }

    /// Drive a registered dispatch through its whole lifecycle, looping back
    /// to spawn-worker for each rework cycle.
    pub async fn run(&self, dispatch_id: &str) -> Result<DispatchResolution, PipelineError> {
        let dispatch = self
            .store
            .get_dispatch(dispatch_id)
            .map_err(TransitionError::Store)?
            .ok_or_else(|| TransitionError::DispatchNotFound {
                id: dispatch_id.to_string(),
            })?;
        self.drive(dispatch, Vec::new()).await
    }

    async fn drive(
        &self,
        mut dispatch: Dispatch,
        mut gaps: Vec<String>,
    ) -> Result<DispatchResolution, PipelineError> {
        loop {
            let (d, worker_outcome, worker_key) =
                match self.spawn_worker(dispatch, &gaps).await? {
                    WorkerPhase::Finished {
                        dispatch,
                        outcome,
                        run_key,
                    } => (dispatch, outcome, run_key),
                    WorkerPhase::Escalated(d) => return Ok(DispatchResolution::Escalated(d)),
                    WorkerPhase::Dropped => return Ok(DispatchResolution::Dropped),
                };

            let (d, audit_outcome, audit_key) =
                match self.trigger_audit(d, &worker_outcome, &worker_key).await? {
                    AuditPhase::Finished {
                        dispatch,
                        outcome,
                        run_key,
                    } => (dispatch, outcome, run_key),
                    AuditPhase::Escalated(d) => return Ok(DispatchResolution::Escalated(d)),
                    AuditPhase::Dropped => return Ok(DispatchResolution::Dropped),
                };

            match self.process_verdict(d, &audit_outcome, &audit_key).await? {
                VerdictOutcome::Completed(record) => {
                    return Ok(DispatchResolution::Completed(record));
                }
                VerdictOutcome::Escalated(d) => return Ok(DispatchResolution::Escalated(d)),
                VerdictOutcome::Dropped => return Ok(DispatchResolution::Dropped),
                VerdictOutcome::Rework {
                    dispatch: next,
                    gaps: next_gaps,
                } => {
                    dispatch = next;
                    gaps = next_gaps;
                }
            }
        }
    }

    /// Safety-net entry point: an out-of-band notification reported a worker
    /// run's completion. Routes through the same idempotent phase handlers as
    /// the direct path and continues the pipeline to resolution.
    pub async fn handle_worker_completion(
        &self,
        run_key: &str,
        outcome: RunOutcome,
    ) -> Result<DispatchResolution, PipelineError> {
        let Some(dispatch) = self.dispatch_for_event(run_key, RunPhase::Worker)? else {
            return Ok(DispatchResolution::Dropped);
        };
        let (d, audit_outcome, audit_key) =
            match self.trigger_audit(dispatch, &outcome, run_key).await? {
                AuditPhase::Finished {
                    dispatch,
                    outcome,
                    run_key,
                } => (dispatch, outcome, run_key),
                AuditPhase::Escalated(d) => return Ok(DispatchResolution::Escalated(d)),
                AuditPhase::Dropped => return Ok(DispatchResolution::Dropped),
            };
        self.resolve_verdict(d, &audit_outcome, &audit_key).await
    }

    /// Safety-net entry point for an out-of-band audit completion.
    pub async fn handle_audit_completion(
        &self,
        run_key: &str,
        outcome: RunOutcome,
    ) -> Result<DispatchResolution, PipelineError> {
        let Some(dispatch) = self.dispatch_for_event(run_key, RunPhase::Audit)? else {
            return Ok(DispatchResolution::Dropped);
        };
        self.resolve_verdict(dispatch, &outcome, run_key).await
    }

    async fn resolve_verdict(
        &self,
        dispatch: Dispatch,
        outcome: &RunOutcome,
        run_key: &str,
    ) -> Result<DispatchResolution, PipelineError> {
        match self.process_verdict(dispatch, outcome, run_key).await? {
            VerdictOutcome::Completed(record) => Ok(DispatchResolution::Completed(record)),
            VerdictOutcome::Escalated(d) => Ok(DispatchResolution::Escalated(d)),
            VerdictOutcome::Dropped => Ok(DispatchResolution::Dropped),
            VerdictOutcome::Rework { dispatch, gaps } => self.drive(dispatch, gaps).await,
        }
    }

    /// Phase 1: move the dispatch into `working` and execute a worker run.
    ///
    /// A dispatch already in `working` is a rework continuation (the
    /// `auditing -> working` CAS happened in process-verdict) and skips the
    /// entry transition. A watchdog kill escalates straight to `stuck`,
    /// bypassing both the audit and the rework budget.
    pub async fn spawn_worker(
        &self,
        dispatch: Dispatch,
        rework_gaps: &[String],
    ) -> Result<WorkerPhase, PipelineError> {
        let dispatch = match dispatch.status {
            DispatchStatus::Dispatched => {
                match self
                    .engine
                    .transition(
                        &dispatch.id,
                        DispatchStatus::Dispatched,
                        DispatchStatus::Working,
                        FieldUpdates::none(),
                    )
                    .await
                {
                    Ok(d) => d,
                    Err(e) if e.is_cas_conflict() => {
                        debug!(id = %dispatch.id, error = %e, "Dispatch already picked up; dropping");
                        return Ok(WorkerPhase::Dropped);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            DispatchStatus::Working => dispatch,
            other => {
                debug!(id = %dispatch.id, status = %other, "spawn_worker on non-startable dispatch; dropping");
                return Ok(WorkerPhase::Dropped);
            }
        };

        let issue = self.fetch_issue_or_fallback(&dispatch).await;
        let prompt = self.prompts.worker_prompt(&dispatch, &issue, rework_gaps);
        let run_key = dispatch.worker_key();

        session::register_mapping(
            &self.store,
            &run_key,
            &dispatch.id,
            RunPhase::Worker,
            dispatch.attempt,
        )
        .await
        .map_err(TransitionError::Store)?;
        self.record_run_key(&dispatch.id, RunPhase::Worker, &run_key)
            .await?;

        self.notify(DispatchEvent::new(
            DispatchEventKind::Working,
            &dispatch.id,
            &dispatch.identifier,
            &dispatch.title,
            dispatch.attempt,
        ))
        .await;

        info!(id = %dispatch.id, run_key, attempt = dispatch.attempt, "Starting worker run");
        let outcome = self
            .executor
            .execute(RunRequest {
                role: RunPhase::Worker,
                prompt,
                timeout: self.config.run_timeout(),
                profile: dispatch.profile.clone(),
            })
            .await
            .map_err(|source| PipelineError::ExecutorFailed {
                run_key: run_key.clone(),
                source,
            })?;

        if outcome.watchdog_killed {
            return self
                .escalate_watchdog(&dispatch, DispatchStatus::Working, &run_key)
                .await
                .map(|phase| match phase {
                    Some(d) => WorkerPhase::Escalated(d),
                    None => WorkerPhase::Dropped,
                });
        }

        // The dispatch may have changed while the run was executing.
        let Some(fresh) = self
            .store
            .get_dispatch(&dispatch.id)
            .map_err(TransitionError::Store)?
        else {
            debug!(id = %dispatch.id, "Dispatch removed during worker run; dropping");
            return Ok(WorkerPhase::Dropped);
        };

        Ok(WorkerPhase::Finished {
            dispatch: fresh,
            outcome,
            run_key,
        })
    }

    /// Phase 2: move `working -> auditing` and execute an audit run.
    ///
    /// Dedups on `worker-end:<run_key>`. A lost CAS here means the dispatch
    /// was concurrently escalated; that is not an error worth surfacing. A
    /// worker run that failed without a watchdog kill still gets audited —
    /// the auditor is expected to detect and report incompleteness.
    pub async fn trigger_audit(
        &self,
        dispatch: Dispatch,
        worker_outcome: &RunOutcome,
        run_key: &str,
    ) -> Result<AuditPhase, PipelineError> {
        let event_key = format!("worker-end:{}", run_key);
        if !self
            .store
            .mark_event_processed(&event_key)
            .await
            .map_err(TransitionError::Store)?
        {
            debug!(event_key, "Duplicate worker completion; dropping");
            return Ok(AuditPhase::Dropped);
        }
        if self.dispatch_for_event(run_key, RunPhase::Worker)?.is_none() {
            return Ok(AuditPhase::Dropped);
        }

        let audit_key = dispatch.audit_key();
        let dispatch = match self
            .engine
            .transition(
                &dispatch.id,
                DispatchStatus::Working,
                DispatchStatus::Auditing,
                FieldUpdates::none().with_audit_run_key(audit_key.clone()),
            )
            .await
        {
            Ok(d) => d,
            Err(e) if e.is_cas_conflict() => {
                debug!(id = %dispatch.id, error = %e, "Dispatch concurrently escalated; skipping audit");
                return Ok(AuditPhase::Dropped);
            }
            Err(e) => return Err(e.into()),
        };

        let issue = self.fetch_issue_or_fallback(&dispatch).await;
        let worker_report = verdict::extract_output_text(worker_outcome).unwrap_or_default();
        let prompt = self.prompts.audit_prompt(&dispatch, &issue, &worker_report);

        session::register_mapping(
            &self.store,
            &audit_key,
            &dispatch.id,
            RunPhase::Audit,
            dispatch.attempt,
        )
        .await
        .map_err(TransitionError::Store)?;

        self.notify(DispatchEvent::new(
            DispatchEventKind::Auditing,
            &dispatch.id,
            &dispatch.identifier,
            &dispatch.title,
            dispatch.attempt,
        ))
        .await;

        info!(id = %dispatch.id, run_key = audit_key, attempt = dispatch.attempt, "Starting audit run");
        let outcome = self
            .executor
            .execute(RunRequest {
                role: RunPhase::Audit,
                prompt,
                timeout: self.config.run_timeout(),
                profile: dispatch.profile.clone(),
            })
            .await
            .map_err(|source| PipelineError::ExecutorFailed {
                run_key: audit_key.clone(),
                source,
            })?;

        if outcome.watchdog_killed {
            return self
                .escalate_watchdog(&dispatch, DispatchStatus::Auditing, &audit_key)
                .await
                .map(|phase| match phase {
                    Some(d) => AuditPhase::Escalated(d),
                    None => AuditPhase::Dropped,
                });
        }

        Ok(AuditPhase::Finished {
            dispatch,
            outcome,
            run_key: audit_key,
        })
    }

    /// Phase 3: parse the audit's verdict and complete, rework, or escalate.
    ///
    /// Dedups on `audit-end:<run_key>`. Output that yields no verdict becomes
    /// a synthetic failing verdict — never an error. The audit run's own
    /// success flag is secondary to whether a verdict could be extracted.
    pub async fn process_verdict(
        &self,
        dispatch: Dispatch,
        audit_outcome: &RunOutcome,
        run_key: &str,
    ) -> Result<VerdictOutcome, PipelineError> {
        let event_key = format!("audit-end:{}", run_key);
        if !self
            .store
            .mark_event_processed(&event_key)
            .await
            .map_err(TransitionError::Store)?
        {
            debug!(event_key, "Duplicate audit completion; dropping");
            return Ok(VerdictOutcome::Dropped);
        }
        if self.dispatch_for_event(run_key, RunPhase::Audit)?.is_none() {
            return Ok(VerdictOutcome::Dropped);
        }

        let verdict = verdict::extract_output_text(audit_outcome)
            .as_deref()
            .and_then(verdict::parse_verdict)
            .unwrap_or_else(|| {
                warn!(id = %dispatch.id, run_key, "Audit output yielded no verdict; treating as failure");
                Verdict::synthetic_failure(format!(
                    "audit run {} produced no parseable verdict",
                    run_key
                ))
            });

        if verdict.pass {
            return self.complete_pass(&dispatch, &verdict).await;
        }

        let next_attempt = dispatch.attempt + 1;
        if next_attempt > self.config.max_rework_attempts {
            self.escalate_exhausted(&dispatch, &verdict, next_attempt)
                .await
        } else {
            self.begin_rework(&dispatch, verdict, next_attempt).await
        }
    }

    async fn complete_pass(
        &self,
        dispatch: &Dispatch,
        verdict: &Verdict,
    ) -> Result<VerdictOutcome, PipelineError> {
        match self
            .engine
            .transition(
                &dispatch.id,
                DispatchStatus::Auditing,
                DispatchStatus::Done,
                FieldUpdates::none(),
            )
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_cas_conflict() => {
                debug!(id = %dispatch.id, error = %e, "Pass verdict lost the race; dropping");
                return Ok(VerdictOutcome::Dropped);
            }
            Err(e) => return Err(e.into()),
        }

        let Some(record) = self
            .store
            .complete_dispatch(&dispatch.id, DispatchStatus::Done)
            .await
            .map_err(TransitionError::Store)?
        else {
            return Ok(VerdictOutcome::Dropped);
        };

        info!(
            id = %dispatch.id,
            identifier = %dispatch.identifier,
            total_attempts = record.total_attempts,
            "Audit passed; dispatch complete"
        );
        self.notify(
            DispatchEvent::new(
                DispatchEventKind::AuditPass,
                &dispatch.id,
                &dispatch.identifier,
                &dispatch.title,
                dispatch.attempt,
            )
            .with_detail(verdict.test_results.clone()),
        )
        .await;
        self.comment_best_effort(&dispatch.id, &pass_comment(dispatch, verdict))
            .await;

        Ok(VerdictOutcome::Completed(record))
    }

    async fn begin_rework(
        &self,
        dispatch: &Dispatch,
        verdict: Verdict,
        next_attempt: u32,
    ) -> Result<VerdictOutcome, PipelineError> {
        let updated = match self
            .engine
            .transition(
                &dispatch.id,
                DispatchStatus::Auditing,
                DispatchStatus::Working,
                FieldUpdates::none()
                    .with_attempt(next_attempt)
                    .clearing_run_keys(),
            )
            .await
        {
            Ok(d) => d,
            Err(e) if e.is_cas_conflict() => {
                debug!(id = %dispatch.id, error = %e, "Rework transition lost the race; dropping");
                return Ok(VerdictOutcome::Dropped);
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            id = %dispatch.id,
            identifier = %dispatch.identifier,
            attempt = next_attempt,
            gaps = verdict.gaps.len(),
            "Audit failed; starting rework"
        );
        self.notify(
            DispatchEvent::new(
                DispatchEventKind::AuditFail,
                &dispatch.id,
                &dispatch.identifier,
                &dispatch.title,
                dispatch.attempt,
            )
            .with_detail(verdict.gaps.join("; ")),
        )
        .await;
        self.comment_best_effort(&dispatch.id, &fail_comment(dispatch, &verdict, next_attempt))
            .await;

        Ok(VerdictOutcome::Rework {
            dispatch: updated,
            gaps: verdict.gaps,
        })
    }

    async fn escalate_exhausted(
        &self,
        dispatch: &Dispatch,
        verdict: &Verdict,
        failed_attempts: u32,
    ) -> Result<VerdictOutcome, PipelineError> {
        let reason = format!("audit failed after {} attempts", failed_attempts);
        let updated = match self
            .engine
            .transition(
                &dispatch.id,
                DispatchStatus::Auditing,
                DispatchStatus::Stuck,
                FieldUpdates::none().with_stuck_reason(reason.clone()),
            )
            .await
        {
            Ok(d) => d,
            Err(e) if e.is_cas_conflict() => {
                debug!(id = %dispatch.id, error = %e, "Escalation lost the race; dropping");
                return Ok(VerdictOutcome::Dropped);
            }
            Err(e) => return Err(e.into()),
        };

        warn!(
            id = %dispatch.id,
            identifier = %dispatch.identifier,
            reason,
            "Rework budget exhausted; escalating to a human"
        );
        self.notify(
            DispatchEvent::new(
                DispatchEventKind::Escalation,
                &dispatch.id,
                &dispatch.identifier,
                &dispatch.title,
                dispatch.attempt,
            )
            .with_detail(reason.clone()),
        )
        .await;
        self.comment_best_effort(&dispatch.id, &escalation_comment(dispatch, verdict, &reason))
            .await;

        Ok(VerdictOutcome::Escalated(updated))
    }

    /// Watchdog kills are fatal and bypass the rework budget. Returns the
    /// stuck dispatch, or `None` when a concurrent operation won the race.
    async fn escalate_watchdog(
        &self,
        dispatch: &Dispatch,
        from: DispatchStatus,
        run_key: &str,
    ) -> Result<Option<Dispatch>, PipelineError> {
        let reason = format!("run {} killed by inactivity watchdog", run_key);
        let updated = match self
            .engine
            .transition(
                &dispatch.id,
                from,
                DispatchStatus::Stuck,
                FieldUpdates::none().with_stuck_reason(reason.clone()),
            )
            .await
        {
            Ok(d) => d,
            Err(e) if e.is_cas_conflict() => {
                debug!(id = %dispatch.id, error = %e, "Watchdog escalation lost the race; dropping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        warn!(id = %dispatch.id, identifier = %dispatch.identifier, reason, "Watchdog kill; escalating");
        self.notify(
            DispatchEvent::new(
                DispatchEventKind::WatchdogKill,
                &dispatch.id,
                &dispatch.identifier,
                &dispatch.title,
                dispatch.attempt,
            )
            .with_detail(reason.clone()),
        )
        .await;
        self.comment_best_effort(
            &dispatch.id,
            &format!(
                "Dispatch for {} is stuck: {}. Manual intervention required.",
                dispatch.identifier, reason
            ),
        )
        .await;

        Ok(Some(updated))
    }

    /// Resolve a run key to its live dispatch, or `None` when the mapping is
    /// unknown, belongs to another phase, points at a removed dispatch, or is
    /// stale relative to the current attempt.
    fn dispatch_for_event(
        &self,
        run_key: &str,
        expected_phase: RunPhase,
    ) -> Result<Option<Dispatch>, TransitionError> {
        let snapshot = self.store.read().map_err(TransitionError::Store)?;
        let Some(mapping) = session::lookup_mapping(&snapshot, run_key) else {
            debug!(run_key, "No session mapping for completion; dropping");
            return Ok(None);
        };
        if mapping.phase != expected_phase {
            warn!(run_key, ?expected_phase, actual = ?mapping.phase, "Completion phase mismatch; dropping");
            return Ok(None);
        }
        let Some(dispatch) = snapshot.dispatches.active.get(&mapping.dispatch_id) else {
            debug!(run_key, "Mapped dispatch no longer active; dropping");
            return Ok(None);
        };
        if session::is_stale(mapping, dispatch) {
            debug!(
                run_key,
                mapping_attempt = mapping.attempt,
                current_attempt = dispatch.attempt,
                "Stale completion from a superseded attempt; dropping"
            );
            return Ok(None);
        }
        Ok(Some(dispatch.clone()))
    }

    async fn record_run_key(
        &self,
        dispatch_id: &str,
        phase: RunPhase,
        run_key: &str,
    ) -> Result<(), TransitionError> {
        let dispatch_id = dispatch_id.to_string();
        let run_key = run_key.to_string();
        self.store
            .mutate(move |snap| {
                if let Some(d) = snap.dispatches.active.get_mut(&dispatch_id) {
                    match phase {
                        RunPhase::Worker => d.worker_run_key = Some(run_key),
                        RunPhase::Audit => d.audit_run_key = Some(run_key),
                    }
                }
            })
            .await
            .map_err(TransitionError::Store)
    }

    async fn fetch_issue_or_fallback(&self, dispatch: &Dispatch) -> IssueContext {
        match self.tracker.fetch_issue(&dispatch.id).await {
            Ok(issue) => issue,
            Err(e) => {
                warn!(id = %dispatch.id, error = %e, "Issue fetch failed; using stored dispatch fields");
                IssueContext::fallback(&dispatch.id, &dispatch.identifier, &dispatch.title)
            }
        }
    }

    async fn comment_best_effort(&self, issue_id: &str, body: &str) {
        if let Err(e) = self.tracker.post_comment(issue_id, body).await {
            warn!(issue_id, error = %e, "Failed to post tracker comment");
        }
    }

    async fn notify(&self, event: DispatchEvent) {
        self.notifier.notify(event).await;
    }
}

fn pass_comment(dispatch: &Dispatch, verdict: &Verdict) -> String {
    let mut body = format!(
        "Audit passed for {} on attempt {}.\n",
        dispatch.identifier,
        dispatch.attempt + 1
    );
    if !verdict.criteria.is_empty() {
        body.push_str("\nSatisfied criteria:\n");
        for criterion in &verdict.criteria {
            body.push_str(&format!("- {}\n", criterion));
        }
    }
    if !verdict.test_results.is_empty() {
        body.push_str(&format!("\nTests: {}\n", verdict.test_results));
    }
    body
}

fn fail_comment(dispatch: &Dispatch, verdict: &Verdict, next_attempt: u32) -> String {
    let mut body = format!(
        "Audit failed for {}; starting rework attempt {}.\n",
        dispatch.identifier, next_attempt
    );
    if !verdict.gaps.is_empty() {
        body.push_str("\nGaps:\n");
        for gap in &verdict.gaps {
            body.push_str(&format!("- {}\n", gap));
        }
    }
    body
}

fn escalation_comment(dispatch: &Dispatch, verdict: &Verdict, reason: &str) -> String {
    let mut body = format!(
        "Dispatch for {} is stuck: {}. Manual intervention required.\n",
        dispatch.identifier, reason
    );
    if !verdict.gaps.is_empty() {
        body.push_str("\nOutstanding gaps from the last audit:\n");
        for gap in &verdict.gaps {
            body.push_str(&format!("- {}\n", gap));
        }
    }
    body
}
