//! Scheduler entry points: queue rebuilds, testbox polls and the gang sweeper.
//!
//! Every entry point takes the in-process locks of the scheduling groups it touches,
//! in ascending id order, and then runs inside one immediate SQLite transaction. A
//! failure anywhere drops the transaction, which rolls everything back.

use crate::build_cache::{ArtifactProbe, BuildCache, FsArtifactProbe, NoArtifactProbe};
use crate::catalog::CatalogSnapshot;
use crate::catalog_import::{self, CatalogImport};
use crate::config::SchedConfig;
use crate::dispatch::{self, DispatchContext, DispatchOutcome};
use crate::error::SchedError;
use crate::group_picker;
use crate::model::*;
use crate::queue::{self, RebuildReport};
use crate::store::{self, SchedDb};
use crate::{anyhow_loc, bail_loc, function_name, timed_span};
use dashmap::DashMap;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

// ----------------------------------------------------------------------------
// per-group critical sections
// ----------------------------------------------------------------------------
/// One mutex per scheduling group. Share a single instance between every scheduler
/// of a process that talks to the same database.
#[derive(Default)]
pub struct GroupLocks {
    locks: DashMap<SchedGroupId, Arc<Mutex<()>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the locks of `group_ids`.
    pub fn with_groups<T>(&self, group_ids: &[SchedGroupId], f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut ids = group_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mutexes: Vec<Arc<Mutex<()>>> = ids
            .iter()
            .map(|id| self.locks.entry(*id).or_default().clone())
            .collect();
        let _guards = mutexes
            .iter()
            .map(|m| m.lock().map_err(|e| anyhow_loc!("Lock poisoned: {}", e)))
            .collect::<anyhow::Result<Vec<MutexGuard<'_, ()>>>>()?;
        f()
    }
}

// ----------------------------------------------------------------------------
// strategies
// ----------------------------------------------------------------------------
impl SchedulerStrategy {
    pub fn recreate_queue(&self, conn: &Connection, catalog: &CatalogSnapshot, now: Timestamp) -> anyhow::Result<RebuildReport> {
        match self {
            SchedulerStrategy::BestEffortCi => queue::recreate_queue(conn, catalog, now),
        }
    }

    pub fn schedule_next(&self, ctx: &mut DispatchContext<'_>, view: &TestBoxView) -> anyhow::Result<DispatchOutcome> {
        match self {
            SchedulerStrategy::BestEffortCi => dispatch::schedule_next(ctx, view),
        }
    }

    pub fn compose_command(
        &self,
        conn: &Connection,
        catalog: &CatalogSnapshot,
        test_set_id: TestSetId,
        test_box: &TestBox,
        now: Timestamp,
    ) -> anyhow::Result<ExecCommand> {
        match self {
            SchedulerStrategy::BestEffortCi => compose_command(conn, catalog, test_set_id, test_box, now),
        }
    }
}

/// Builds the command a testbox executes for one of its test sets.
pub fn compose_command(
    conn: &Connection,
    catalog: &CatalogSnapshot,
    test_set_id: TestSetId,
    test_box: &TestBox,
    now: Timestamp,
) -> anyhow::Result<ExecCommand> {
    let test_set = store::get_test_set(conn, test_set_id)?.ok_or_else(|| anyhow_loc!("No test set #{}", test_set_id))?;
    let Some(case) = catalog.test_case(test_set.test_case_id) else {
        bail_loc!("Test set #{} refers to unknown test case #{}", test_set_id, test_set.test_case_id);
    };
    let Some(variation) = catalog.arg_variation(test_set.arg_variation_id) else {
        bail_loc!(
            "Test set #{} refers to unknown argument variation #{}",
            test_set_id,
            test_set.arg_variation_id
        );
    };
    let build = store::get_build(conn, test_set.build_id)?.ok_or_else(|| anyhow_loc!("No build #{}", test_set.build_id))?;
    let validation_kit_binaries = match test_set.validation_kit_build_id {
        Some(id) => store::get_build(conn, id)?.map(|b| b.binaries),
        None => None,
    };

    let script_bundle_ref = case
        .validation_kit_zips
        .as_deref()
        .unwrap_or_default()
        .replace(VALIDATIONKIT_ZIP_PLACEHOLDER, validation_kit_binaries.as_deref().unwrap_or_default())
        .replace(BUILD_BINARIES_PLACEHOLDER, &build.binaries);

    let mut command_line = format!("{} {}", case.base_cmd, variation.args)
        .trim()
        .replace(BUILD_BINARIES_PLACEHOLDER, &build.binaries)
        .replace(TESTSET_ID_PLACEHOLDER, &test_set.id.to_string());

    if test_set.gang_size > 1 {
        let members = store::gang_members(conn, test_set.gang_id())?;
        command_line.push_str(&format!(
            " --gang-member-no {} --gang-members {}",
            test_set.gang_member_no, test_set.gang_size
        ));
        for member in &members {
            let ip = store::get_test_box(conn, member.test_box_id, now)?
                .map(|tb| tb.ip)
                .unwrap_or_default();
            command_line.push_str(&format!(" --gang-ipv4-{} {}", member.gang_member_no, ip));
        }
    }

    let base_timeout = variation.timeout_secs.unwrap_or(case.timeout_secs);
    Ok(ExecCommand {
        test_set_id,
        script_bundle_ref,
        command_line,
        timeout_secs: base_timeout * test_box.timeout_scale_pct / 100,
    })
}

// ----------------------------------------------------------------------------
// scheduler
// ----------------------------------------------------------------------------
pub struct Scheduler {
    db: SchedDb,
    config: SchedConfig,
    locks: Arc<GroupLocks>,
    probe: Box<dyn ArtifactProbe>,
}

impl Scheduler {
    pub fn new(db: SchedDb, config: SchedConfig) -> Self {
        Self::with_locks(db, config, Arc::new(GroupLocks::new()))
    }

    pub fn with_locks(db: SchedDb, config: SchedConfig, locks: Arc<GroupLocks>) -> Self {
        let probe: Box<dyn ArtifactProbe> = if config.verify_build_artifacts {
            Box::new(FsArtifactProbe::new(config.build_root.clone().unwrap_or_default()))
        } else {
            Box::new(NoArtifactProbe)
        };
        Self {
            db,
            config,
            locks,
            probe,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn ArtifactProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn db(&self) -> &SchedDb {
        &self.db
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn new_build_cache(&self) -> BuildCache {
        BuildCache::new(self.config.build_page_size)
    }

    /// Replaces the current catalog with `doc`, effective at `now`.
    pub fn import_catalog(&mut self, doc: &CatalogImport, now: Timestamp) -> anyhow::Result<()> {
        let tx = self
            .db
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        catalog_import::import_catalog(&tx, doc, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Rebuilds the queue of a scheduling group. Configuration errors come back in the
    /// report and leave the stored queue as it was.
    pub fn rebuild_queue(&mut self, sched_group_id: SchedGroupId, now: Timestamp) -> anyhow::Result<RebuildReport> {
        let _span = timed_span!(tracing::Level::INFO, "rebuild_queue", sched_group_id = sched_group_id);
        let locks = self.locks.clone();
        locks.with_groups(&[sched_group_id], || {
            let tx = self
                .db
                .conn_mut()
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(catalog) = CatalogSnapshot::load(&tx, sched_group_id, now)? else {
                return Err(SchedError::UnknownSchedGroup(sched_group_id).into());
            };
            let report = catalog.sched_group.strategy.recreate_queue(&tx, &catalog, now)?;
            if report.is_ok() {
                tx.commit()?;
            }
            Ok(report)
        })
    }

    /// Loads a testbox and polls on its behalf.
    pub fn poll_test_box(&mut self, test_box_id: TestBoxId, now: Timestamp) -> anyhow::Result<Decision> {
        let Some(view) = store::load_test_box_view(self.db.conn(), test_box_id, now)? else {
            return Err(SchedError::UnknownTestBox(test_box_id).into());
        };
        self.poll(&view, now)
    }

    /// Decides what a polling testbox does next.
    pub fn poll(&mut self, view: &TestBoxView, now: Timestamp) -> anyhow::Result<Decision> {
        let mut build_cache = self.new_build_cache();
        self.poll_with_cache(view, now, &mut build_cache)
    }

    /// Like [`Scheduler::poll`], reusing a build cache across the polls of one pass.
    pub fn poll_with_cache(
        &mut self,
        view: &TestBoxView,
        now: Timestamp,
        build_cache: &mut BuildCache,
    ) -> anyhow::Result<Decision> {
        let _span = timed_span!(tracing::Level::DEBUG, "poll", test_box = view.test_box.name.as_str());
        let group_ids: Vec<SchedGroupId> = view.sched_groups.iter().map(|g| g.sched_group_id).collect();
        let locks = self.locks.clone();
        let result = locks.with_groups(&group_ids, || {
            let deadline = Instant::now() + self.config.poll_time_budget();
            let tx = self
                .db
                .conn_mut()
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut poll = Poll {
                conn: &tx,
                probe: self.probe.as_ref(),
                build_cache,
                now,
                deadline,
            };
            let decision = poll.run(view)?;
            tx.commit()?;
            Ok(decision)
        });

        match result {
            Err(e) => match e.downcast_ref::<SchedError>() {
                Some(sched_error) if sched_error.is_retryable() => {
                    tracing::warn!("Poll of testbox {} abandoned: {}", view.test_box.name, sched_error);
                    Ok(Decision::None)
                }
                _ => Err(e),
            },
            ok => ok,
        }
    }

    /// Times out every gang that has been gathering longer than the configured limit.
    pub fn sweep_gang_timeouts(&mut self, now: Timestamp) -> anyhow::Result<usize> {
        let mut group_ids = queue::groups_with_gangs(self.db.conn())?;
        loop {
            match self.sweep_groups(&group_ids, now)? {
                Ok(swept) => return Ok(swept),
                Err(gathering) => {
                    tracing::debug!("Gangs started gathering in {:?} before the sweep got its locks", gathering);
                    group_ids = gathering;
                }
            }
        }
    }

    /// Sweeps with the locks of `locked` held. The gathering groups are re-read inside the
    /// transaction; if any of them is not in `locked`, nothing is written and the full
    /// list comes back as the error.
    pub(crate) fn sweep_groups(
        &mut self,
        locked: &[SchedGroupId],
        now: Timestamp,
    ) -> anyhow::Result<Result<usize, Vec<SchedGroupId>>> {
        let timeout = self.config.gang_gathering_timeout_secs;
        let locks = self.locks.clone();
        locks.with_groups(locked, || {
            let tx = self
                .db
                .conn_mut()
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let gathering = queue::groups_with_gangs(&tx)?;
            if gathering.iter().any(|id| !locked.contains(id)) {
                return Ok(Err(gathering));
            }
            let mut swept = 0;
            for &group_id in &gathering {
                swept += queue::sweep_gang_timeouts(&tx, group_id, now, timeout)?;
            }
            tx.commit()?;
            if swept > 0 {
                tracing::info!("Swept {} timed out gangs", swept);
            }
            Ok(Ok(swept))
        })
    }
}

/// State of one poll inside its transaction.
struct Poll<'a> {
    conn: &'a Connection,
    probe: &'a dyn ArtifactProbe,
    build_cache: &'a mut BuildCache,
    now: Timestamp,
    deadline: Instant,
}

impl Poll<'_> {
    fn run(&mut self, view: &TestBoxView) -> anyhow::Result<Decision> {
        let test_box_id = view.test_box.id;
        let Some(current) = store::load_test_box_view(self.conn, test_box_id, self.now)? else {
            return Err(SchedError::UnknownTestBox(test_box_id).into());
        };
        if current.test_box.generation_id != view.test_box.generation_id {
            return Err(SchedError::ConsistencyViolation {
                test_box_id,
                reason: format!(
                    "generation changed from {} to {}",
                    view.test_box.generation_id, current.test_box.generation_id
                ),
            }
            .into());
        }
        if !current.test_box.enabled {
            tracing::debug!("Testbox {} is disabled", current.test_box.name);
            return Ok(Decision::None);
        }

        let status = store::ensure_test_box_status(self.conn, &current.test_box, self.now)?;
        match (status.state, status.test_set_id) {
            (TestBoxState::GangGathering, Some(test_set_id)) => {
                return self.gang_follow_up(&current.test_box, test_set_id);
            }
            (TestBoxState::Testing | TestBoxState::GangTesting, Some(test_set_id)) => {
                // Asking for new work means the previous test set is not running anymore.
                tracing::warn!(
                    "Testbox {} polled while running test set #{}; aborting it",
                    current.test_box.name,
                    test_set_id
                );
                store::complete_test_set(self.conn, test_set_id, TestStatus::Aborted, self.now)?;
            }
            (TestBoxState::Idle, _) => {}
            (state, None) => {
                tracing::warn!("Testbox {} in state {} without a test set", current.test_box.name, state.as_str());
                store::set_test_box_state(self.conn, test_box_id, TestBoxState::Idle, None, self.now)?;
            }
        }

        let mut ignore: HashSet<SchedGroupId> = HashSet::new();
        let mut last_index = status.sched_group_index;
        while Instant::now() < self.deadline {
            let Some((group_id, index)) = group_picker::pick(&current.sched_groups, last_index, &ignore) else {
                break;
            };
            ignore.insert(group_id);
            last_index = index;
            store::set_sched_group_index(self.conn, test_box_id, index)?;

            let Some(catalog) = CatalogSnapshot::load(self.conn, group_id, self.now)? else {
                continue;
            };
            if !catalog.sched_group.enabled {
                continue;
            }
            let strategy = catalog.sched_group.strategy;
            let mut ctx = DispatchContext {
                conn: self.conn,
                catalog: &catalog,
                build_cache: &mut *self.build_cache,
                probe: self.probe,
                now: self.now,
                deadline: self.deadline,
            };
            match strategy.schedule_next(&mut ctx, &current)? {
                DispatchOutcome::Exec(test_set_id) => {
                    let command = strategy.compose_command(self.conn, &catalog, test_set_id, &current.test_box, self.now)?;
                    return Ok(Decision::Exec(command));
                }
                DispatchOutcome::Wait(_) => return Ok(Decision::Wait),
                DispatchOutcome::NoWork => {}
            }
        }
        Ok(Decision::None)
    }

    /// A testbox that is part of a gathering gang learns whether the gang is complete.
    fn gang_follow_up(&mut self, test_box: &TestBox, test_set_id: TestSetId) -> anyhow::Result<Decision> {
        let test_set = store::get_test_set(self.conn, test_set_id)?;
        let Some(test_set) = test_set.filter(|ts| ts.status == TestStatus::Running) else {
            tracing::info!("Gang of testbox {} is gone; back to idle", test_box.name);
            store::set_test_box_state(self.conn, test_box.id, TestBoxState::Idle, None, self.now)?;
            return Ok(Decision::None);
        };

        let members = store::gang_members(self.conn, test_set.gang_id())?;
        if (members.len() as i64) < test_set.gang_size {
            return Ok(Decision::Wait);
        }

        let Some(catalog) = CatalogSnapshot::load(self.conn, test_set.sched_group_id, self.now)? else {
            store::complete_test_set(self.conn, test_set_id, TestStatus::Aborted, self.now)?;
            return Ok(Decision::None);
        };
        store::set_test_box_state(self.conn, test_box.id, TestBoxState::GangTesting, Some(test_set_id), self.now)?;
        let strategy = catalog.sched_group.strategy;
        let command = strategy.compose_command(self.conn, &catalog, test_set_id, test_box, self.now)?;
        tracing::info!("Testbox {} starts gang test set #{}", test_box.name, test_set_id);
        Ok(Decision::Exec(command))
    }
}
