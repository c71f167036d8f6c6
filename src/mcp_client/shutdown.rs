//! Gateway shutdown.
//!
//! Teardown runs in a fixed order: sessions, then the connector's shared
//! handles, then processes. Every step has its own time budget and its
//! outcome is recorded in a `ShutdownReport`; nothing here returns an error.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::time::timeout;

use super::client::{McpGateway, Phase};
use super::config::GatewayTimeouts;
use super::lifecycle::{terminate, ProviderProcess, TerminateOutcome};
use super::registry::ToolCatalog;
use super::session::{Connector, ToolSession};

// ─── Report ──────────────────────────────────────────────────────────────────

/// What a cleanup step acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    /// Close one provider session.
    Disconnect,
    /// Close the connector's aggregate handle.
    CloseAll,
    /// Stop one provider process.
    Terminate,
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnect => "disconnect",
            Self::CloseAll => "close_all",
            Self::Terminate => "terminate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupStep {
    /// Provider name, or `connector` for the aggregate close.
    pub target: String,
    pub action: CleanupAction,
    pub outcome: StepOutcome,
}

/// Every step taken by one `cleanup()` call, in execution order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub steps: Vec<CleanupStep>,
}

impl ShutdownReport {
    /// True when every step completed.
    pub fn is_clean(&self) -> bool {
        self.steps
            .iter()
            .all(|step| step.outcome == StepOutcome::Completed)
    }

    /// Steps that failed or timed out.
    pub fn problems(&self) -> impl Iterator<Item = &CleanupStep> {
        self.steps
            .iter()
            .filter(|step| step.outcome != StepOutcome::Completed)
    }

    fn record(&mut self, step: CleanupStep) {
        match &step.outcome {
            StepOutcome::Completed => {
                tracing::debug!(target_name = %step.target, action = %step.action, "cleanup step completed");
            }
            StepOutcome::Failed(reason) => {
                tracing::warn!(target_name = %step.target, action = %step.action, %reason, "cleanup step failed");
            }
            StepOutcome::TimedOut => {
                tracing::warn!(target_name = %step.target, action = %step.action, "cleanup step timed out");
            }
        }
        self.steps.push(step);
    }
}

// ─── Cleanup ─────────────────────────────────────────────────────────────────

impl<C: Connector> McpGateway<C> {
    /// Shut down every provider.
    ///
    /// Stops accepting calls immediately, then tears down within
    /// `GatewayTimeouts::shutdown_bound`. Idempotent and safe before
    /// `initialize()`; a second call returns an empty report.
    pub async fn cleanup(&self) -> ShutdownReport {
        let (sessions, processes) = {
            let mut state = self.state.lock().await;
            match state.phase {
                Phase::ShuttingDown | Phase::Closed => {
                    tracing::debug!(phase = %state.phase, "cleanup already done or in progress");
                    return ShutdownReport::default();
                }
                Phase::Uninitialized | Phase::Initializing | Phase::Ready => {}
            }
            state.phase = Phase::ShuttingDown;
            state.catalog = ToolCatalog::default();
            (
                std::mem::take(&mut state.sessions),
                std::mem::take(&mut state.processes),
            )
        };

        let report = teardown(&self.connector, &self.config.timeouts, sessions, processes).await;

        self.state.lock().await.phase = Phase::Closed;
        report
    }
}

/// Disconnect sessions, close the connector, then stop processes.
pub(super) async fn teardown<C: Connector>(
    connector: &C,
    timeouts: &GatewayTimeouts,
    sessions: BTreeMap<String, Arc<dyn ToolSession>>,
    processes: BTreeMap<String, ProviderProcess>,
) -> ShutdownReport {
    let start = Instant::now();
    let mut report = ShutdownReport::default();

    tracing::info!(
        sessions = sessions.len(),
        processes = processes.len(),
        "shutting down providers"
    );

    // 1. Sessions
    let disconnects = sessions.into_iter().map(|(name, session)| async move {
        let outcome = match timeout(timeouts.session_close(), session.disconnect()).await {
            Ok(Ok(())) => StepOutcome::Completed,
            Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
            Err(_) => StepOutcome::TimedOut,
        };
        CleanupStep {
            target: name,
            action: CleanupAction::Disconnect,
            outcome,
        }
    });
    for step in futures::future::join_all(disconnects).await {
        report.record(step);
    }

    // 2. Aggregate close
    let outcome = match timeout(timeouts.aggregate_close(), connector.close_all()).await {
        Ok(Ok(())) => StepOutcome::Completed,
        Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
        Err(_) => StepOutcome::TimedOut,
    };
    report.record(CleanupStep {
        target: "connector".into(),
        action: CleanupAction::CloseAll,
        outcome,
    });

    // 3. Processes
    let grace = timeouts.process_grace();
    let kill_wait = timeouts.process_kill();
    let terminations = processes.into_iter().map(|(name, process)| async move {
        let outcome = match terminate(process, grace, kill_wait).await {
            TerminateOutcome::Exited | TerminateOutcome::Killed => StepOutcome::Completed,
            TerminateOutcome::Unaccounted => {
                StepOutcome::Failed("process still running after kill".into())
            }
        };
        CleanupStep {
            target: name,
            action: CleanupAction::Terminate,
            outcome,
        }
    });
    for step in futures::future::join_all(terminations).await {
        report.record(step);
    }

    tracing::info!(
        steps = report.steps.len(),
        problems = report.problems().count(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "shutdown complete"
    );

    report
}

// ─── Tests ───────────────────────────────────────────────────────────────────
