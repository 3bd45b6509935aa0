//! Wave-barriered parallel execution of units of SQL work.
//!
//! Every [`Unit`] runs on its own freshly opened session; a semaphore caps how
//! many run at once. Waves are barriers: wave N+1 starts only after every unit of
//! wave N has finished. The first failure stops the issue of further units in the
//! current and every later wave, while units already running are allowed to
//! finish. Committed work is never rolled back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RootPhase;
use crate::core::traits::Connector;
use crate::error::{Result, SliceError};
use crate::plan::{Operation, ShardKey, Task};
use crate::report::{Phase, PhaseReport, PhaseStatus, TaskReport, TaskStatus};

/// One step of a unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Run a statement; consecutive statements share a transaction.
    Execute(String),
    /// Run a count query and fail with an integrity error unless it returns 0.
    ExpectNone { sql: String, constraint: String },
}

/// Work executed on one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub table: String,
    pub shard: ShardKey,
    pub label: String,
    pub steps: Vec<Step>,
}

impl Unit {
    /// A unit of plain statements run in one transaction.
    pub fn statements(table: &str, label: impl Into<String>, statements: Vec<String>) -> Self {
        Self {
            table: table.to_string(),
            shard: ShardKey::Global,
            label: label.into(),
            steps: statements.into_iter().map(Step::Execute).collect(),
        }
    }

    /// The unit executing a copy task.
    pub fn from_task(task: &Task) -> Self {
        Self {
            table: task.table.clone(),
            shard: task.shard,
            label: match task.operation {
                Operation::CreateAsSelect => format!("create {}", task.target),
                Operation::Insert => format!("insert {}", task.target),
            },
            steps: task.statements().into_iter().map(Step::Execute).collect(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.table, self.shard, self.label)
    }

    /// SQL text of every step, in order.
    pub fn sql(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| match s {
                Step::Execute(sql) => sql.clone(),
                Step::ExpectNone { sql, .. } => sql.clone(),
            })
            .collect()
    }
}

/// A barrier group of units.
#[derive(Debug, Clone, Default)]
pub struct Wave {
    pub units: Vec<Unit>,
    /// Run units one at a time regardless of the phase limit.
    pub serial: bool,
}

impl Wave {
    pub fn parallel(units: Vec<Unit>) -> Self {
        Self {
            units,
            serial: false,
        }
    }

    pub fn serial(units: Vec<Unit>) -> Self {
        Self {
            units,
            serial: true,
        }
    }
}

/// Group copy tasks into waves of units.
pub fn task_waves(tasks: &[Task]) -> Vec<Wave> {
    crate::plan::waves(tasks)
        .into_iter()
        .map(|wave| Wave::parallel(wave.into_iter().map(Unit::from_task).collect()))
        .collect()
}

/// Runs waves of units against a connector.
pub struct Scheduler {
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(connector: Arc<dyn Connector>, cancel: CancellationToken) -> Self {
        Self { connector, cancel }
    }

    /// Record `waves` as planned without executing anything.
    pub fn plan_only(phase: Phase, stage: Option<RootPhase>, waves: &[Wave]) -> PhaseReport {
        let mut report = PhaseReport::new(phase, stage);
        report.status = PhaseStatus::Planned;
        for (index, wave) in waves.iter().enumerate() {
            for unit in &wave.units {
                let mut task = task_report(unit, index, TaskStatus::Planned);
                task.statements = unit.sql();
                report.tasks.push(task);
            }
        }
        report
    }

    /// Execute `waves` with at most `limit` units in flight.
    ///
    /// The phase report is filled in whether or not the phase succeeds.
    pub async fn run(
        &self,
        phase: Phase,
        stage: Option<RootPhase>,
        waves: Vec<Wave>,
        limit: usize,
    ) -> (PhaseReport, Result<()>) {
        let started = Instant::now();
        let mut report = PhaseReport::new(phase, stage);
        let failed = Arc::new(AtomicBool::new(false));
        let rows = Arc::new(AtomicU64::new(0));
        let mut first_error: Option<SliceError> = None;
        let total_waves = waves.len();

        for (index, wave) in waves.into_iter().enumerate() {
            let offset = report.tasks.len();
            for unit in &wave.units {
                report
                    .tasks
                    .push(task_report(unit, index, TaskStatus::NotStarted));
            }
            if failed.load(Ordering::SeqCst) {
                continue;
            }
            if self.cancel.is_cancelled() {
                mark_cancelled(&mut report.tasks[offset..]);
                continue;
            }

            let permits = if wave.serial { 1 } else { limit.max(1) };
            debug!(
                "{}: wave {}/{} with {} unit(s), limit {}",
                phase,
                index + 1,
                total_waves,
                wave.units.len(),
                permits
            );
            let semaphore = Arc::new(Semaphore::new(permits));
            let mut handles = Vec::new();

            for (position, unit) in wave.units.into_iter().enumerate() {
                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = self.cancel.cancelled() => break,
                };
                if failed.load(Ordering::SeqCst) {
                    break;
                }

                let connector = self.connector.clone();
                let failed = failed.clone();
                let rows = rows.clone();
                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let result = execute_unit(connector.as_ref(), &unit).await;
                    match &result {
                        Ok(affected) => {
                            rows.fetch_add(*affected, Ordering::Relaxed);
                        }
                        Err(_) => failed.store(true, Ordering::SeqCst),
                    }
                    // Release only after the failure flag is visible.
                    drop(permit);
                    (unit, result, started.elapsed())
                });
                handles.push((offset + position, handle));
            }

            let joined = join_all(
                handles
                    .into_iter()
                    .map(|(slot, handle)| async move { (slot, handle.await) }),
            )
            .await;
            for (slot, outcome) in joined {
                let entry = &mut report.tasks[slot];
                match outcome {
                    Ok((unit, Ok(affected), elapsed)) => {
                        entry.status = TaskStatus::Succeeded;
                        entry.rows = affected;
                        entry.duration_ms = elapsed.as_millis() as u64;
                        debug!("{}: {} done ({} rows)", phase, unit.id(), affected);
                    }
                    Ok((unit, Err(e), elapsed)) => {
                        error!("{}: {} failed - {}", phase, unit.id(), e);
                        entry.status = TaskStatus::Failed;
                        entry.duration_ms = elapsed.as_millis() as u64;
                        entry.error = Some(e.to_string());
                        if first_error.is_none() {
                            first_error = Some(classify(phase, index, &unit, e));
                        }
                    }
                    Err(e) => {
                        error!("{}: {} panicked - {}", phase, entry.id, e);
                        failed.store(true, Ordering::SeqCst);
                        entry.status = TaskStatus::Failed;
                        entry.error = Some(format!("task panicked: {}", e));
                        if first_error.is_none() {
                            first_error = Some(SliceError::Fanout {
                                phase: phase.to_string(),
                                wave: index,
                                table: entry.table.clone(),
                                shard: entry.shard.clone(),
                                message: format!("task panicked: {}", e),
                            });
                        }
                    }
                }
            }

            if self.cancel.is_cancelled() {
                mark_cancelled(&mut report.tasks[offset..]);
            }
        }

        report.duration_seconds = started.elapsed().as_secs_f64();
        let outcome = match first_error {
            Some(e) => {
                report.status = PhaseStatus::Failed;
                Err(e)
            }
            None if self.cancel.is_cancelled()
                && report.tasks.iter().any(|t| t.status == TaskStatus::Cancelled) =>
            {
                warn!("{}: cancelled", phase);
                report.status = PhaseStatus::Cancelled;
                Err(SliceError::Cancelled)
            }
            None => {
                report.status = PhaseStatus::Succeeded;
                info!(
                    "{}: {} unit(s) in {:.1}s, {} row(s)",
                    phase,
                    report.tasks.len(),
                    report.duration_seconds,
                    rows.load(Ordering::Relaxed)
                );
                Ok(())
            }
        };
        (report, outcome)
    }
}

fn task_report(unit: &Unit, wave: usize, status: TaskStatus) -> TaskReport {
    TaskReport {
        id: unit.id(),
        table: unit.table.clone(),
        shard: unit.shard.to_string(),
        label: unit.label.clone(),
        wave,
        status,
        rows: 0,
        duration_ms: 0,
        error: None,
        statements: Vec::new(),
    }
}

fn mark_cancelled(tasks: &mut [TaskReport]) {
    for task in tasks {
        if task.status == TaskStatus::NotStarted {
            task.status = TaskStatus::Cancelled;
        }
    }
}

/// Run a unit on its own session. Consecutive statements share a transaction.
async fn execute_unit(connector: &dyn Connector, unit: &Unit) -> Result<u64> {
    let mut session = connector.connect().await?;
    let mut affected = 0u64;
    let mut pending: Vec<String> = Vec::new();

    for step in &unit.steps {
        match step {
            Step::Execute(sql) => pending.push(sql.clone()),
            Step::ExpectNone { sql, constraint } => {
                if !pending.is_empty() {
                    affected += session.execute_batch(&pending).await?;
                    pending.clear();
                }
                let violations = session.query_scalar(sql).await?.unwrap_or(0);
                if violations > 0 {
                    return Err(SliceError::Integrity {
                        table: unit.table.clone(),
                        constraint: constraint.clone(),
                        rows: violations as u64,
                    });
                }
            }
        }
    }
    if !pending.is_empty() {
        affected += session.execute_batch(&pending).await?;
    }
    Ok(affected)
}

/// Attach phase context to a unit failure.
fn classify(phase: Phase, wave: usize, unit: &Unit, error: SliceError) -> SliceError {
    match (phase, error) {
        (_, e @ SliceError::Integrity { .. }) => e,
        (_, SliceError::Cancelled) => SliceError::Cancelled,
        (Phase::Create | Phase::Load, e) => SliceError::Fanout {
            phase: phase.to_string(),
            wave,
            table: unit.table.clone(),
            shard: unit.shard.to_string(),
            message: e.to_string(),
        },
        (_, e) => SliceError::reconciliation(
            phase.to_string(),
            &unit.table,
            format!("{}: {}", unit.label, e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::MockConnector;

    fn unit(table: &str, shard: u32, sql: &str) -> Unit {
        Unit {
            table: table.into(),
            shard: ShardKey::Index(shard),
            label: "insert".into(),
            steps: vec![Step::Execute(sql.into())],
        }
    }

    fn scheduler(connector: &MockConnector) -> Scheduler {
        Scheduler::new(Arc::new(connector.clone()), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_waves_run_in_order() {
        let connector = MockConnector::new();
        let waves = vec![
            Wave::parallel(vec![unit("store", 0, "A1"), unit("store", 1, "A2")]),
            Wave::parallel(vec![unit("order", 0, "B1")]),
        ];
        let (report, result) = scheduler(&connector)
            .run(Phase::Load, Some(RootPhase::Pre), waves, 4)
            .await;
        result.unwrap();
        let executed = connector.executed();
        assert_eq!(executed.len(), 3);
        assert_eq!(executed[2], "B1");
        assert_eq!(report.count(TaskStatus::Succeeded), 3);
        assert_eq!(connector.sessions(), 3);
    }

    #[tokio::test]
    async fn test_failed_shard_does_not_stop_sibling_but_blocks_next_wave() {
        let connector = MockConnector::new().fail_on("BROKEN");
        let waves = vec![
            Wave::parallel(vec![
                unit("order_item", 1, "INSERT shard 1"),
                unit("order_item", 0, "INSERT BROKEN shard 0"),
            ]),
            Wave::parallel(vec![unit("refund", 0, "INSERT refund")]),
        ];
        let (report, result) = scheduler(&connector)
            .run(Phase::Load, Some(RootPhase::Pre), waves, 4)
            .await;

        match result.unwrap_err() {
            SliceError::Fanout {
                phase,
                wave,
                table,
                shard,
                ..
            } => {
                assert_eq!(phase, "load");
                assert_eq!(wave, 0);
                assert_eq!(table, "order_item");
                assert_eq!(shard, "0");
            }
            other => panic!("expected fanout error, got {:?}", other),
        }

        // The sibling shard committed; the next wave never started.
        assert_eq!(connector.executed(), vec!["INSERT shard 1".to_string()]);
        assert_eq!(report.status, PhaseStatus::Failed);
        assert_eq!(report.tasks[0].status, TaskStatus::Succeeded);
        assert_eq!(report.tasks[1].status, TaskStatus::Failed);
        assert_eq!(report.tasks[2].status, TaskStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_serial_limit_stops_issuing_after_failure() {
        let connector = MockConnector::new().fail_on("FK1");
        let waves = vec![Wave::serial(vec![
            unit("a", 0, "FK1"),
            unit("b", 0, "FK2"),
        ])];
        let (report, result) = scheduler(&connector)
            .run(Phase::Constraints, None, waves, 8)
            .await;
        assert!(matches!(
            result.unwrap_err(),
            SliceError::Reconciliation { .. }
        ));
        assert!(connector.executed().is_empty());
        assert_eq!(report.tasks[1].status, TaskStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_expect_none_reports_integrity() {
        let connector = MockConnector::new().with_rows("count(*)", vec![vec![Some(3)]]);
        let waves = vec![Wave::parallel(vec![Unit {
            table: "order_item".into(),
            shard: ShardKey::Global,
            label: "validate".into(),
            steps: vec![
                Step::ExpectNone {
                    sql: "SELECT count(*) FROM orphans".into(),
                    constraint: "order_item_order_id_fkey".into(),
                },
                Step::Execute("ALTER TABLE x VALIDATE CONSTRAINT y".into()),
            ],
        }])];
        let (_, result) = scheduler(&connector)
            .run(Phase::Validation, None, waves, 2)
            .await;
        match result.unwrap_err() {
            SliceError::Integrity { rows, constraint, .. } => {
                assert_eq!(rows, 3);
                assert_eq!(constraint, "order_item_order_id_fkey");
            }
            other => panic!("expected integrity error, got {:?}", other),
        }
        assert!(connector.executed().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let connector = MockConnector::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scheduler = Scheduler::new(Arc::new(connector.clone()), cancel);
        let (report, result) = scheduler
            .run(
                Phase::Create,
                Some(RootPhase::Pre),
                vec![Wave::parallel(vec![unit("store", 0, "X")])],
                2,
            )
            .await;
        assert!(matches!(result.unwrap_err(), SliceError::Cancelled));
        assert_eq!(report.tasks[0].status, TaskStatus::Cancelled);
        assert_eq!(connector.sessions(), 0);
    }

    #[tokio::test]
    async fn test_rows_are_reported() {
        let connector = MockConnector::new().affecting("INSERT", 7);
        let (report, result) = scheduler(&connector)
            .run(
                Phase::Load,
                None,
                vec![Wave::parallel(vec![unit("t", 0, "INSERT 1"), unit("t", 1, "INSERT 2")])],
                1,
            )
            .await;
        result.unwrap();
        assert_eq!(report.rows(), 14);
    }

    #[test]
    fn test_plan_only_records_statements() {
        let report = Scheduler::plan_only(
            Phase::Index,
            None,
            &[Wave::parallel(vec![unit("t", 0, "CREATE INDEX")])],
        );
        assert_eq!(report.status, PhaseStatus::Planned);
        assert_eq!(report.tasks[0].statements, vec!["CREATE INDEX".to_string()]);
    }
}
