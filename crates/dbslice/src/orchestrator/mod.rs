//! Run orchestrator - main workflow coordinator.
//!
//! A run is a fixed sequence of phases, each a hard barrier:
//!
//! 1. Create → Load for families of `pre` roots
//! 2. Create → Load for families of `post` roots
//! 3. Neuter
//! 4. Index, StorageFinalize, Constraints, Sequences, TriggersFunctions, Validation
//!
//! The first failing phase ends the run. The [`ExecutionReport`] is returned either
//! way; on failure it travels inside [`RunFailure`] next to the error.
//!
//! A run may be scoped to the precopy tables or to some families; reconcile
//! phases then still cover the whole destination.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::{self, HealthReport, SwapDirection};
use crate::audit::{self, AuditReport, SequenceAuditReport};
use crate::config::{Profile, RootPhase};
use crate::core::identifier::quote_pg;
use crate::core::schema::SchemaSnapshot;
use crate::core::traits::{CatalogSource, Connector};
use crate::drivers::PgConnector;
use crate::error::{Result, SliceError};
use crate::fanout::{task_waves, Scheduler, Unit, Wave};
use crate::neuter;
use crate::plan::{plan_root, resolve, CopyScope, SelectionSet, SelectorContext, StageInput};
use crate::reconcile::{self, ReconcileContext};
use crate::report::{ExecutionReport, Phase, RunStatus, SelectionSummary};

/// Phases run after both copy stages, in order.
pub const RECONCILE_PHASES: [Phase; 6] = [
    Phase::Index,
    Phase::StorageFinalize,
    Phase::Constraints,
    Phase::Sequences,
    Phase::TriggersFunctions,
    Phase::Validation,
];

/// Options of the `run` command.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resolve selections and plan Create/Load without executing.
    pub dry_run: bool,
    /// Drop and recreate the destination schema first.
    pub restart: bool,
    pub scope: CopyScope,
}

/// A failed command, with the report of everything that ran before the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: SliceError,
    pub report: Box<ExecutionReport>,
}

impl RunFailure {
    /// Process exit code for the underlying error.
    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

/// Run orchestrator.
pub struct Orchestrator {
    profile: Profile,
    connector: Arc<dyn Connector>,
    catalog: Arc<dyn CatalogSource>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator over any connector that can also read the catalog.
    pub fn new<C>(profile: Profile, connector: Arc<C>) -> Self
    where
        C: Connector + CatalogSource + 'static,
    {
        Self {
            profile,
            connector: connector.clone(),
            catalog: connector,
            cancel: CancellationToken::new(),
        }
    }

    /// Create an orchestrator connected to the profile's PostgreSQL database.
    pub fn connect(profile: Profile) -> Result<Self> {
        let url = profile.database.url()?;
        let connector = PgConnector::new(
            &url,
            profile.database.ssl_mode,
            profile.database.connect_timeout_secs.map(Duration::from_secs),
        )?;
        info!("Connecting to {}", Connector::describe(&connector));
        Ok(Self::new(profile, Arc::new(connector)))
    }

    /// Cancel the run when `token` fires.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Override the profile's concurrency limits.
    pub fn with_parallelism(mut self, fanout: Option<usize>, validate: Option<usize>) -> Result<Self> {
        if fanout == Some(0) || validate == Some(0) {
            return Err(SliceError::config("parallelism must be at least 1"));
        }
        if fanout.is_some() {
            self.profile.run.fanout_parallel = fanout;
        }
        if validate.is_some() {
            self.profile.run.validate_parallel = validate;
        }
        Ok(self)
    }

    /// Leave foreign keys NOT VALID instead of validating them.
    pub fn with_fk_validation(mut self, enabled: bool) -> Self {
        self.profile.reconcile.validate_foreign_keys = enabled;
        self
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Run the full pipeline.
    pub async fn run(&self, options: RunOptions) -> std::result::Result<ExecutionReport, RunFailure> {
        let mut report = self.start_report("run", options.dry_run);
        info!("Starting run: {}", report.run_id);
        let outcome = self.execute_run(&options, &mut report).await;
        let success = if options.dry_run {
            RunStatus::DryRun
        } else {
            RunStatus::Succeeded
        };
        self.finish(report, outcome, success)
    }

    /// Run only the Neuter phase, optionally restricted to some tables.
    pub async fn neuter(
        &self,
        tables: Option<&[String]>,
    ) -> std::result::Result<ExecutionReport, RunFailure> {
        let mut report = self.start_report("neuter", false);
        let outcome = async {
            let config = self
                .profile
                .neuter
                .as_ref()
                .ok_or_else(|| SliceError::config("profile has no neuter section"))?;
            let dest = self.catalog.snapshot(&self.profile.dest_schema).await?;
            let waves = neuter::plan(config, &dest, tables)?;
            info!("Phase 1: {}", Phase::Neuter.title());
            self.execute_phase(
                &mut report,
                Phase::Neuter,
                None,
                waves,
                neuter::parallelism(&self.profile),
            )
            .await
        }
        .await;
        self.finish(report, outcome, RunStatus::Succeeded)
    }

    /// Drop the destination and staging tables of the named families.
    pub async fn reset(&self, families: &[String]) -> std::result::Result<ExecutionReport, RunFailure> {
        let mut report = self.start_report("reset", false);
        let outcome = async {
            let waves = admin::reset_waves(&self.profile, families)?;
            self.execute_phase(
                &mut report,
                Phase::Reset,
                None,
                waves,
                self.profile.run.get_fanout_parallel(),
            )
            .await
        }
        .await;
        self.finish(report, outcome, RunStatus::Succeeded)
    }

    /// Swap the destination into place of the source, or back.
    pub async fn swap(
        &self,
        direction: SwapDirection,
    ) -> std::result::Result<ExecutionReport, RunFailure> {
        let command = match direction {
            SwapDirection::Swap => "swap",
            SwapDirection::Unswap => "unswap",
        };
        let mut report = self.start_report(command, false);
        let outcome = async {
            let renames =
                admin::swap_statements(&self.profile, self.catalog.as_ref(), direction).await?;
            let unit = Unit::statements(&self.profile.source_schema, command, renames);
            self.execute_phase(&mut report, Phase::Swap, None, vec![Wave::serial(vec![unit])], 1)
                .await
        }
        .await;
        self.finish(report, outcome, RunStatus::Succeeded)
    }

    /// Run some reconcile phases on their own, optionally for one table.
    ///
    /// Phases run in the order given, each against a fresh destination snapshot.
    pub async fn reconcile(
        &self,
        phases: &[Phase],
        table: Option<&str>,
    ) -> std::result::Result<ExecutionReport, RunFailure> {
        let mut report = self.start_report("reconcile", false);
        let outcome = async {
            let profile = &self.profile;
            if phases.is_empty() {
                return Err(SliceError::config("no reconcile phases given"));
            }
            if let Some(phase) = phases.iter().find(|p| !RECONCILE_PHASES.contains(*p)) {
                return Err(SliceError::config(format!(
                    "{} is not a reconcile phase",
                    phase
                )));
            }
            let source = self.catalog.snapshot(&profile.source_schema).await?;
            if let Some(table) = table {
                if !source.has_table(table) {
                    return Err(SliceError::missing_table(table));
                }
            }
            for (step, phase) in phases.iter().enumerate() {
                self.check_cancelled()?;
                info!("Phase {}: {}", step + 1, phase.title());
                let dest = self.catalog.snapshot(&profile.dest_schema).await?;
                let ctx = ReconcileContext::new(&source, &dest, &profile.reconcile)?;
                let mut waves = reconcile::plan(*phase, &ctx)?;
                if let Some(table) = table {
                    waves = reconcile::restrict(waves, table);
                }
                self.execute_phase(&mut report, *phase, None, waves, self.phase_limit(*phase))
                    .await?;
            }
            Ok(())
        }
        .await;
        self.finish(report, outcome, RunStatus::Succeeded)
    }

    /// Definition diff of the sequences of both schemas.
    pub async fn audit_sequences(&self) -> Result<SequenceAuditReport> {
        let source = self.catalog.snapshot(&self.profile.source_schema).await?;
        let dest = self.catalog.snapshot(&self.profile.dest_schema).await?;
        Ok(audit::audit_sequences(&source, &dest))
    }

    /// Column-level diff of every profile table.
    pub async fn audit(&self) -> Result<AuditReport> {
        let source = self.catalog.snapshot(&self.profile.source_schema).await?;
        let dest = self.catalog.snapshot(&self.profile.dest_schema).await?;
        Ok(audit::audit(&source, &dest, &profile_tables(&self.profile)))
    }

    /// Check connectivity and the profile's schemas.
    pub async fn health_check(&self) -> HealthReport {
        admin::health_check(&self.profile, self.connector.as_ref(), self.catalog.as_ref()).await
    }

    async fn execute_run(&self, options: &RunOptions, report: &mut ExecutionReport) -> Result<()> {
        let profile = &self.profile;
        let fanout_parallel = profile.run.get_fanout_parallel();
        let mut step = 0usize;
        self.check_cancelled()?;
        options.scope.check(profile)?;
        if options.scope != CopyScope::All {
            info!("Copy scope: {:?}", options.scope);
        }

        info!("Reading source catalog {}", profile.source_schema);
        if !self.catalog.schema_exists(&profile.source_schema).await? {
            return Err(SliceError::config(format!(
                "source schema {} does not exist",
                profile.source_schema
            )));
        }
        let source = self.catalog.snapshot(&profile.source_schema).await?;
        info!("Found {} source table(s)", source.tables.len());

        if options.restart {
            if options.dry_run {
                info!("Dry run: would recreate schema {}", profile.dest_schema);
            } else {
                step += 1;
                info!("Phase {}: {}", step, Phase::Restart.title());
                let unit = Unit::statements(
                    &profile.dest_schema,
                    "restart",
                    admin::restart_statements(profile)?,
                );
                self.execute_phase(report, Phase::Restart, None, vec![Wave::serial(vec![unit])], 1)
                    .await?;
            }
        }
        if !options.dry_run {
            self.execute_statements(&[format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_pg(&profile.dest_schema)?
            )])
            .await?;
        }

        let mut selections = SelectionSet::default();
        let mut earlier: BTreeSet<String> = BTreeSet::new();

        for stage in [RootPhase::Pre, RootPhase::Post] {
            self.check_cancelled()?;
            let dest = if options.dry_run && options.restart {
                SchemaSnapshot::empty(&profile.dest_schema)
            } else {
                self.catalog.snapshot(&profile.dest_schema).await?
            };

            self.select_roots(stage, &options.scope, &source, &dest, &mut selections, report)
                .await?;

            let plan = resolve(&StageInput {
                profile,
                stage,
                selections: &selections,
                source: &source,
                dest: &dest,
                earlier: &earlier,
                scope: &options.scope,
            })?;
            report.skipped_families.extend(plan.skipped_families.iter().cloned());
            earlier = plan.present.clone();

            if plan.is_empty() {
                debug!("Stage {}: nothing to copy", stage.as_str());
                continue;
            }

            let create = task_waves(&plan.create);
            let load = task_waves(&plan.load);
            if options.dry_run {
                report
                    .phases
                    .push(Scheduler::plan_only(Phase::Create, Some(stage), &create));
                report
                    .phases
                    .push(Scheduler::plan_only(Phase::Load, Some(stage), &load));
                continue;
            }

            let shards = quote_pg(&profile.shards_schema)?;
            if plan.staging_used {
                self.execute_statements(&[format!("CREATE SCHEMA IF NOT EXISTS {}", shards)])
                    .await?;
            }

            step += 1;
            info!(
                "Phase {}: {} ({} stage, {} table(s))",
                step,
                Phase::Create.title(),
                stage.as_str(),
                plan.tables.len()
            );
            self.execute_phase(report, Phase::Create, Some(stage), create, fanout_parallel)
                .await?;

            step += 1;
            info!("Phase {}: {} ({} stage)", step, Phase::Load.title(), stage.as_str());
            self.execute_phase(report, Phase::Load, Some(stage), load, fanout_parallel)
                .await?;

            if plan.staging_used {
                self.execute_statements(&[format!("DROP SCHEMA IF EXISTS {} CASCADE", shards)])
                    .await?;
            }
        }

        if options.dry_run {
            info!("Dry run complete, nothing executed");
            return Ok(());
        }

        if let Some(config) = profile.neuter.as_ref().filter(|n| n.enabled) {
            // A scoped run redacts only the tables it wrote.
            let only: Option<Vec<String>> = options.scope.tables(profile).map(|tables| {
                config
                    .targets
                    .keys()
                    .filter(|t| tables.contains(t.as_str()))
                    .cloned()
                    .collect()
            });
            let has_targets = only.as_ref().map_or(!config.targets.is_empty(), |t| !t.is_empty());
            if has_targets {
                step += 1;
                info!("Phase {}: {}", step, Phase::Neuter.title());
                let dest = self.catalog.snapshot(&profile.dest_schema).await?;
                let waves = neuter::plan(config, &dest, only.as_deref())?;
                self.execute_phase(
                    report,
                    Phase::Neuter,
                    None,
                    waves,
                    neuter::parallelism(profile),
                )
                .await?;
            }
        }

        for phase in RECONCILE_PHASES {
            self.check_cancelled()?;
            step += 1;
            info!("Phase {}: {}", step, phase.title());
            // Every phase diffs against the destination as the previous one left it.
            let dest = self.catalog.snapshot(&profile.dest_schema).await?;
            let ctx = ReconcileContext::new(&source, &dest, &profile.reconcile)?;
            let waves = reconcile::plan(phase, &ctx)?;
            self.execute_phase(report, phase, None, waves, self.phase_limit(phase))
                .await?;
        }

        Ok(())
    }

    fn phase_limit(&self, phase: Phase) -> usize {
        match phase {
            Phase::Validation => self.profile.run.get_validate_parallel(),
            _ => self.profile.run.get_fanout_parallel(),
        }
    }

    /// Resolve the selections of the roots copied in `stage`.
    ///
    /// `dest` is the destination as the stage found it; selectors reading
    /// copied tables see the rows of earlier stages.
    async fn select_roots(
        &self,
        stage: RootPhase,
        scope: &CopyScope,
        source: &SchemaSnapshot,
        dest: &SchemaSnapshot,
        selections: &mut SelectionSet,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        let profile = &self.profile;
        let wanted = match scope {
            CopyScope::All => None,
            scope => Some(scope.roots(profile)),
        };
        let roots: Vec<_> = profile
            .roots
            .iter()
            .filter(|r| r.phase == stage)
            .filter(|r| wanted.as_ref().map_or(true, |w| w.contains(r.name.as_str())))
            .collect();
        if roots.is_empty() {
            return Ok(());
        }

        let mut others = BTreeMap::new();
        for root in &roots {
            for schema in root
                .selector
                .extra_schemas(&profile.source_schema, &profile.dest_schema)
            {
                if !others.contains_key(schema) {
                    others.insert(schema.to_string(), self.catalog.snapshot(schema).await?);
                }
            }
        }
        let ctx = SelectorContext {
            source,
            dest,
            others: &others,
        };

        let mut session = self.connector.connect().await?;
        for root in roots {
            let selection = plan_root(root, &ctx, session.as_mut()).await?;
            report.selections.push(SelectionSummary {
                root: root.name.clone(),
                stage,
                ids: selection.ids.len(),
                shards: selection
                    .shards
                    .iter()
                    .map(|(key, ids)| (key.to_string(), ids.len()))
                    .collect(),
            });
            selections.insert(selection);
        }
        Ok(())
    }

    async fn execute_phase(
        &self,
        report: &mut ExecutionReport,
        phase: Phase,
        stage: Option<RootPhase>,
        waves: Vec<Wave>,
        limit: usize,
    ) -> Result<()> {
        self.check_cancelled()?;
        let scheduler = Scheduler::new(self.connector.clone(), self.cancel.clone());
        let (phase_report, outcome) = scheduler.run(phase, stage, waves, limit).await;
        report.phases.push(phase_report);
        outcome
    }

    /// Run statements in one transaction outside of any phase.
    async fn execute_statements(&self, statements: &[String]) -> Result<()> {
        let mut session = self.connector.connect().await?;
        session.execute_batch(statements).await?;
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SliceError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn start_report(&self, command: &str, dry_run: bool) -> ExecutionReport {
        ExecutionReport::start(
            command,
            self.profile.hash(),
            &self.profile.source_schema,
            &self.profile.dest_schema,
            dry_run,
        )
    }

    fn finish(
        &self,
        mut report: ExecutionReport,
        outcome: Result<()>,
        success: RunStatus,
    ) -> std::result::Result<ExecutionReport, RunFailure> {
        match outcome {
            Ok(()) => {
                report.finish(success, None);
                info!(
                    "{} finished in {:.1}s: {} task(s), {} row(s)",
                    report.command,
                    report.duration_seconds,
                    report.totals.tasks,
                    report.totals.rows
                );
                Ok(report)
            }
            Err(error) => {
                let status = match error {
                    SliceError::Cancelled => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                };
                report.finish(status, Some(error.to_string()));
                warn!("{} {:?}: {}", report.command, status, error);
                Err(RunFailure {
                    error,
                    report: Box::new(report),
                })
            }
        }
    }
}

/// Every table the profile writes: precopy tables, then family tables.
pub fn profile_tables(profile: &Profile) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    let precopy = profile
        .precopy
        .schema_only
        .iter()
        .chain(&profile.precopy.full_copy)
        .cloned();
    let families = profile
        .families
        .iter()
        .flat_map(|f| f.tables().into_iter().map(str::to_string));
    for table in precopy.chain(families) {
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    tables
}
