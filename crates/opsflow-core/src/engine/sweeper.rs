//! Out-of-band deadline enforcement.
//!
//! Deadlines inside the driver are cooperative; if a driver task dies or
//! an action overruns its budget, nothing in-process finalizes the row.
//! The sweeper is the belt-and-braces fallback: a periodic poller that,
//! per tenant, fails executions whose `timeout_at` elapsed while still
//! running or waiting, and expires overdue pending approval requests.
//!
//! All transitions are guarded so concurrent sweepers (or a sweeper
//! racing a live driver) leave already-terminal rows untouched.

use std::time::Duration;

use chrono::Utc;
use opsflow_types::approval::ApprovalStatus;
use opsflow_types::execution::{ExecutionResult, ExecutionStatus};
use tokio_util::sync::CancellationToken;

use super::EngineError;
use super::interpreter::timeout_message;
use crate::repository::approval::ApprovalRepository;
use crate::repository::execution::ExecutionRepository;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Sweeper cadence and batch limits.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Poll period between sweep cycles.
    pub interval: Duration,
    /// Maximum executions finalized per tenant per cycle.
    pub batch_size: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Counters from one sweep cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub executions_failed: usize,
    pub approvals_expired: usize,
}

// ---------------------------------------------------------------------------
// TimeoutSweeper
// ---------------------------------------------------------------------------

/// Periodic poller that finalizes overdue executions and approvals.
pub struct TimeoutSweeper<R, P> {
    executions: R,
    approvals: P,
    config: SweeperConfig,
}

impl<R, P> TimeoutSweeper<R, P>
where
    R: ExecutionRepository,
    P: ApprovalRepository,
{
    pub fn new(executions: R, approvals: P, config: SweeperConfig) -> Self {
        Self {
            executions,
            approvals,
            config,
        }
    }

    /// Run sweep cycles until the shutdown token fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "timeout sweeper started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("timeout sweeper stopping");
                    return;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(err) = self.sweep_once().await {
                        tracing::warn!(error = %err, "sweep cycle failed");
                    }
                }
            }
        }
    }

    /// One full pass over every active tenant.
    pub async fn sweep_once(&self) -> Result<SweepStats, EngineError> {
        let mut stats = SweepStats::default();
        let now = Utc::now();

        for organization_id in self.executions.list_active_orgs().await? {
            let overdue = self
                .executions
                .get_timed_out(organization_id, now, self.config.batch_size)
                .await?;

            for mut execution in overdue {
                // Guarded transition: a row a live driver (or another
                // sweeper) already finalized is skipped.
                let transitioned = self
                    .executions
                    .try_transition(
                        organization_id,
                        execution.id,
                        &[ExecutionStatus::Running, ExecutionStatus::Waiting],
                        ExecutionStatus::Failed,
                    )
                    .await?;
                if !transitioned {
                    continue;
                }

                let completed_at = Utc::now();
                execution.status = ExecutionStatus::Failed;
                execution.result = Some(ExecutionResult::Failed);
                execution.error_message = Some(timeout_message(&execution));
                execution.completed_at = Some(completed_at);
                execution.duration_ms =
                    Some((completed_at - execution.started_at).num_milliseconds());
                self.executions.update(&execution).await?;

                tracing::info!(
                    organization_id = %organization_id,
                    execution_id = execution.execution_id.as_str(),
                    "swept timed-out execution"
                );
                stats.executions_failed += 1;
            }

            let expired = self
                .approvals
                .get_expired(organization_id, now, self.config.batch_size)
                .await?;
            for mut request in expired {
                request.status = ApprovalStatus::Expired;
                request.decided_at = Some(Utc::now());
                self.approvals.update(&request).await?;
                tracing::info!(
                    organization_id = %organization_id,
                    request_id = request.request_id.as_str(),
                    "expired approval request"
                );
                stats.approvals_expired += 1;
            }
        }

        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{MemoryApprovalRepository, MemoryExecutionRepository};
    use chrono::TimeDelta;
    use opsflow_types::ContextMap;
    use opsflow_types::approval::ApprovalRequest;
    use opsflow_types::execution::Execution;
    use std::sync::Arc;
    use uuid::Uuid;

    fn sweeper(
        executions: Arc<MemoryExecutionRepository>,
        approvals: Arc<MemoryApprovalRepository>,
    ) -> TimeoutSweeper<Arc<MemoryExecutionRepository>, Arc<MemoryApprovalRepository>> {
        TimeoutSweeper::new(executions, approvals, SweeperConfig::default())
    }

    fn overdue_execution(org: Uuid, status: ExecutionStatus, overdue_secs: i64) -> Execution {
        let started = Utc::now() - TimeDelta::seconds(overdue_secs + 30);
        Execution {
            id: Uuid::now_v7(),
            organization_id: org,
            execution_id: Execution::display_id(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "wf".to_string(),
            status,
            result: None,
            trigger_event: "order.created".to_string(),
            trigger_payload: ContextMap::new(),
            context: ContextMap::new(),
            started_at: started,
            completed_at: None,
            duration_ms: None,
            timeout_at: Some(started + TimeDelta::seconds(30)),
            timeout_duration: Some(30),
            paused_at: None,
            paused_reason: None,
            paused_step_id: None,
            next_step_id: None,
            resume_data: ContextMap::new(),
            resume_count: 0,
            last_resumed_at: None,
            current_step_id: None,
            wait_state: None,
            error_message: None,
            metadata: ContextMap::new(),
        }
    }

    #[tokio::test]
    async fn test_sweep_fails_overdue_running_and_waiting() {
        let executions = Arc::new(MemoryExecutionRepository::new());
        let approvals = Arc::new(MemoryApprovalRepository::new());
        let org = Uuid::now_v7();

        let running = overdue_execution(org, ExecutionStatus::Running, 60);
        let waiting = overdue_execution(org, ExecutionStatus::Waiting, 60);
        executions.create(&running).await.unwrap();
        executions.create(&waiting).await.unwrap();

        let stats = sweeper(Arc::clone(&executions), approvals)
            .sweep_once()
            .await
            .unwrap();
        assert_eq!(stats.executions_failed, 2);

        for id in [running.id, waiting.id] {
            let swept = executions.get(org, id).await.unwrap().unwrap();
            assert_eq!(swept.status, ExecutionStatus::Failed);
            assert_eq!(swept.result, Some(ExecutionResult::Failed));
            assert_eq!(
                swept.error_message.as_deref(),
                Some("Workflow execution timed out after 30s")
            );
            assert!(swept.completed_at.is_some());
            assert!(swept.duration_ms.is_some());
        }
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let executions = Arc::new(MemoryExecutionRepository::new());
        let approvals = Arc::new(MemoryApprovalRepository::new());
        let org = Uuid::now_v7();
        executions
            .create(&overdue_execution(org, ExecutionStatus::Running, 60))
            .await
            .unwrap();

        let sweeper = sweeper(Arc::clone(&executions), approvals);
        let first = sweeper.sweep_once().await.unwrap();
        assert_eq!(first.executions_failed, 1);

        let row_after_first = executions.all_for_org(org).remove(0);

        // Re-running against an already-failed row is a no-op.
        let second = sweeper.sweep_once().await.unwrap();
        assert_eq!(second.executions_failed, 0);
        let row_after_second = executions.all_for_org(org).remove(0);
        assert_eq!(row_after_first.completed_at, row_after_second.completed_at);
        assert_eq!(row_after_first.duration_ms, row_after_second.duration_ms);
    }

    #[tokio::test]
    async fn test_sweep_skips_rows_not_due_or_paused() {
        let executions = Arc::new(MemoryExecutionRepository::new());
        let approvals = Arc::new(MemoryApprovalRepository::new());
        let org = Uuid::now_v7();

        // Not yet due.
        let mut future = overdue_execution(org, ExecutionStatus::Running, 60);
        future.timeout_at = Some(Utc::now() + TimeDelta::seconds(120));
        // Paused rows are outside the sweeper's statuses.
        let paused = overdue_execution(org, ExecutionStatus::Paused, 60);
        executions.create(&future).await.unwrap();
        executions.create(&paused).await.unwrap();

        let stats = sweeper(Arc::clone(&executions), approvals)
            .sweep_once()
            .await
            .unwrap();
        assert_eq!(stats.executions_failed, 0);
        assert_eq!(
            executions.get(org, paused.id).await.unwrap().unwrap().status,
            ExecutionStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_sweep_expires_overdue_approvals() {
        let executions = Arc::new(MemoryExecutionRepository::new());
        let approvals = Arc::new(MemoryApprovalRepository::new());
        let org = Uuid::now_v7();

        // One active execution so the org is visited.
        executions
            .create(&overdue_execution(org, ExecutionStatus::Running, 60))
            .await
            .unwrap();

        let request = ApprovalRequest {
            id: Uuid::now_v7(),
            organization_id: org,
            request_id: ApprovalRequest::display_id(),
            execution_id: Uuid::now_v7(),
            entity_type: "order".to_string(),
            entity_id: "o-1".to_string(),
            requester_id: "system".to_string(),
            approver_role: "finance".to_string(),
            approver_id: None,
            status: ApprovalStatus::Pending,
            reason: "review".to_string(),
            decision_reason: None,
            requested_at: Utc::now() - TimeDelta::hours(2),
            decided_at: None,
            expires_at: Some(Utc::now() - TimeDelta::hours(1)),
        };
        approvals.create(&request).await.unwrap();

        let stats = sweeper(executions, Arc::clone(&approvals))
            .sweep_once()
            .await
            .unwrap();
        assert_eq!(stats.approvals_expired, 1);

        let expired = approvals.get(org, request.id).await.unwrap().unwrap();
        assert_eq!(expired.status, ApprovalStatus::Expired);
        assert!(expired.decided_at.is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let executions = Arc::new(MemoryExecutionRepository::new());
        let approvals = Arc::new(MemoryApprovalRepository::new());
        let sweeper = TimeoutSweeper::new(
            executions,
            approvals,
            SweeperConfig {
                interval: Duration::from_millis(10),
                batch_size: 100,
            },
        );

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        // Returns once the token fires.
        sweeper.run(shutdown).await;
        handle.await.unwrap();
    }
}
