//! SQLite backing store.
//!
//! Every scheduler operation runs inside one immediate (write-locking) transaction, so
//! concurrent schedulers sharing a database file serialize on SQLite's writer lock.
//! The helpers here take `&Connection` so they work the same on a plain connection, a
//! `Transaction`, or inside a [`SavepointGuard`].

use crate::model::*;
use crate::{anyhow_loc, bail_loc, function_name};
use anyhow::Context;
use camino::Utf8Path;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// `ts_expire` of catalog rows that are still current.
pub const TS_INFINITY: Timestamp = i64::MAX;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sched_groups (
    id INTEGER NOT NULL,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    strategy TEXT NOT NULL,
    build_source_id INTEGER,
    validation_kit_build_source_id INTEGER,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sched_group_members (
    sched_group_id INTEGER NOT NULL,
    test_group_id INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    prereq_test_group_id INTEGER,
    hourly_schedule BLOB,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS test_groups (
    id INTEGER NOT NULL,
    name TEXT NOT NULL,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS test_group_members (
    test_group_id INTEGER NOT NULL,
    test_case_id INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    arg_variation_ids TEXT,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS test_cases (
    id INTEGER NOT NULL,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    base_cmd TEXT NOT NULL,
    validation_kit_zips TEXT,
    timeout_secs INTEGER NOT NULL,
    test_box_req_expr TEXT,
    build_req_expr TEXT,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS test_case_deps (
    test_case_id INTEGER NOT NULL,
    prereq_test_case_id INTEGER NOT NULL,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS arg_variations (
    id INTEGER NOT NULL,
    test_case_id INTEGER NOT NULL,
    args TEXT NOT NULL,
    timeout_secs INTEGER,
    gang_size INTEGER NOT NULL,
    global_resource_ids TEXT NOT NULL,
    test_box_req_expr TEXT,
    build_req_expr TEXT,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS build_sources (
    id INTEGER NOT NULL,
    name TEXT NOT NULL,
    product TEXT NOT NULL,
    branch TEXT,
    build_types TEXT NOT NULL,
    os_arches TEXT,
    first_revision INTEGER,
    last_revision INTEGER,
    max_age_secs INTEGER,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS build_blacklist (
    id INTEGER NOT NULL,
    product TEXT NOT NULL,
    branch TEXT,
    build_types TEXT,
    os_arches TEXT,
    first_revision INTEGER NOT NULL,
    last_revision INTEGER NOT NULL,
    reason TEXT NOT NULL,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS builds (
    id INTEGER PRIMARY KEY,
    product TEXT NOT NULL,
    branch TEXT NOT NULL,
    build_type TEXT NOT NULL,
    os TEXT NOT NULL,
    arch TEXT NOT NULL,
    revision INTEGER NOT NULL,
    version TEXT NOT NULL,
    binaries TEXT NOT NULL,
    ts_created INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS builds_by_platform ON builds (product, os, arch, ts_created DESC, id DESC);
CREATE TABLE IF NOT EXISTS test_boxes (
    id INTEGER NOT NULL,
    generation_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    ip TEXT NOT NULL,
    os TEXT NOT NULL,
    arch TEXT NOT NULL,
    cpu_vendor TEXT NOT NULL,
    cpu_count INTEGER NOT NULL,
    mem_mb INTEGER NOT NULL,
    scratch_mb INTEGER NOT NULL,
    has_hw_virt INTEGER NOT NULL,
    has_nested_paging INTEGER NOT NULL,
    has_64bit_guest INTEGER NOT NULL,
    has_iommu INTEGER NOT NULL,
    timeout_scale_pct INTEGER NOT NULL,
    enabled INTEGER NOT NULL,
    properties TEXT NOT NULL,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS test_box_in_sched_groups (
    test_box_id INTEGER NOT NULL,
    sched_group_id INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS global_resources (
    id INTEGER NOT NULL,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    ts_effective INTEGER NOT NULL,
    ts_expire INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS global_resource_statuses (
    global_resource_id INTEGER PRIMARY KEY,
    test_box_id INTEGER NOT NULL,
    ts_allocated INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS test_box_statuses (
    test_box_id INTEGER PRIMARY KEY,
    generation_id INTEGER NOT NULL,
    state TEXT NOT NULL,
    test_set_id INTEGER,
    sched_group_index INTEGER NOT NULL DEFAULT 0,
    ts_updated INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sched_queues (
    item_id INTEGER PRIMARY KEY AUTOINCREMENT,
    sched_group_id INTEGER NOT NULL,
    off_queue INTEGER NOT NULL,
    arg_variation_id INTEGER NOT NULL,
    test_group_id INTEGER NOT NULL,
    test_group_prereqs TEXT NOT NULL,
    hourly_schedule BLOB,
    ts_config INTEGER NOT NULL,
    ts_last_scheduled INTEGER,
    gang_leader_test_set_id INTEGER,
    missing_gang_members INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS sched_queues_by_group ON sched_queues (sched_group_id, item_id);
CREATE TABLE IF NOT EXISTS test_sets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_created INTEGER NOT NULL,
    ts_done INTEGER,
    status TEXT NOT NULL,
    build_id INTEGER NOT NULL,
    validation_kit_build_id INTEGER,
    test_box_id INTEGER NOT NULL,
    test_case_id INTEGER NOT NULL,
    arg_variation_id INTEGER NOT NULL,
    test_group_id INTEGER NOT NULL,
    sched_group_id INTEGER NOT NULL,
    gang_leader_id INTEGER,
    gang_member_no INTEGER NOT NULL,
    gang_size INTEGER NOT NULL,
    test_result_id INTEGER
);
CREATE INDEX IF NOT EXISTS test_sets_by_build_case ON test_sets (build_id, test_case_id);
CREATE INDEX IF NOT EXISTS test_sets_by_gang ON test_sets (gang_leader_id);
CREATE TABLE IF NOT EXISTS test_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER,
    test_set_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    ts_created INTEGER NOT NULL,
    ts_done INTEGER
);
"#;

/// SQL fragment selecting rows current at `?1`.
pub const CURRENT_AT: &str = "ts_effective <= ?1 AND ts_expire > ?1";

pub struct SchedDb {
    conn: Connection,
}

impl SchedDb {
    /// Open or create the scheduler database
    pub fn open(db_path: &Utf8Path) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

// ----------------------------------------------------------------------------
// column types
// ----------------------------------------------------------------------------
/// A column holding a JSON document.
#[derive(Debug)]
pub struct JsonCol<T>(pub T);

impl<T: DeserializeOwned> FromSql for JsonCol<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        serde_json::from_str(value.as_str()?)
            .map(JsonCol)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl<T: Serialize> ToSql for JsonCol<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        serde_json::to_string(&self.0)
            .map(ToSqlOutput::from)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    }
}

impl FromSql for TestStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

impl ToSql for TestStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for TestBoxState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

impl ToSql for TestBoxState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for SchedulerStrategy {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

impl ToSql for SchedulerStrategy {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for HourlySchedule {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        HourlySchedule::from_blob(value.as_blob()?).map_err(|e| FromSqlError::Other(e.into()))
    }
}

impl ToSql for HourlySchedule {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_blob()))
    }
}

// ----------------------------------------------------------------------------
// savepoints
// ----------------------------------------------------------------------------
/// A nested transaction that rolls back unless released.
pub struct SavepointGuard<'conn> {
    conn: &'conn Connection,
    name: &'static str,
    done: bool,
}

impl<'conn> SavepointGuard<'conn> {
    pub fn new(conn: &'conn Connection, name: &'static str) -> anyhow::Result<Self> {
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(Self { conn, name, done: false })
    }

    pub fn release(mut self) -> anyhow::Result<()> {
        self.done = true;
        self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        Ok(())
    }

    pub fn rollback(mut self) -> anyhow::Result<()> {
        self.done = true;
        self.conn
            .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name))?;
        Ok(())
    }
}

impl Drop for SavepointGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self
                .conn
                .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name))
            {
                tracing::error!("Failed to roll back savepoint {}: {}", self.name, e);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// builds
// ----------------------------------------------------------------------------
const BUILD_COLUMNS: &str =
    "id, product, branch, build_type, os, arch, revision, version, binaries, ts_created, deleted";

fn build_from_row(row: &Row<'_>) -> rusqlite::Result<Build> {
    Ok(Build {
        id: row.get(0)?,
        product: row.get(1)?,
        branch: row.get(2)?,
        build_type: row.get(3)?,
        os: row.get(4)?,
        arch: row.get(5)?,
        revision: row.get(6)?,
        version: row.get(7)?,
        binaries: row.get(8)?,
        ts_created: row.get(9)?,
        deleted: row.get(10)?,
    })
}

pub fn insert_build(conn: &Connection, build: &Build) -> anyhow::Result<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO builds ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)", BUILD_COLUMNS),
        params![
            build.id,
            build.product,
            build.branch,
            build.build_type,
            build.os,
            build.arch,
            build.revision,
            build.version,
            build.binaries,
            build.ts_created,
            build.deleted
        ],
    )?;
    Ok(())
}

pub fn get_build(conn: &Connection, id: BuildId) -> anyhow::Result<Option<Build>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM builds WHERE id = ?1", BUILD_COLUMNS),
            params![id],
            build_from_row,
        )
        .optional()?)
}

/// Position of the last build a cursor has seen: (creation time, id).
pub type BuildCursorKey = (Timestamp, BuildId);

/// One page of candidate builds for a build source and platform, newest first,
/// strictly after `after` in that order.
pub fn fetch_build_page(
    conn: &Connection,
    source: &BuildSource,
    os: &str,
    arch: &str,
    now: Timestamp,
    after: Option<BuildCursorKey>,
    limit: usize,
) -> anyhow::Result<Vec<Build>> {
    let (after_ts, after_id) = after.unwrap_or((TS_INFINITY, BuildId::MAX));
    let min_created = source.max_age_secs.map(|age| now - age).unwrap_or(i64::MIN);
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM builds
         WHERE product = ?1
           AND (?2 IS NULL OR branch = ?2)
           AND os IN (?3, ?4)
           AND arch IN (?5, ?6)
           AND deleted = 0
           AND ts_created <= ?7
           AND ts_created >= ?8
           AND (?9 IS NULL OR revision >= ?9)
           AND (?10 IS NULL OR revision <= ?10)
           AND (ts_created < ?11 OR (ts_created = ?11 AND id < ?12))
         ORDER BY ts_created DESC, id DESC
         LIMIT ?13",
        BUILD_COLUMNS
    ))?;
    let rows = stmt.query_map(
        params![
            source.product,
            source.branch,
            os,
            OS_AGNOSTIC,
            arch,
            ARCH_AGNOSTIC,
            now,
            min_created,
            source.first_revision,
            source.last_revision,
            after_ts,
            after_id,
            limit as i64
        ],
        build_from_row,
    )?;
    let mut builds = Vec::new();
    for build in rows {
        builds.push(build?);
    }
    Ok(builds)
}

/// The build of the same product, branch, type and revision as `template` that runs
/// on the given platform.
pub fn find_matching_build(
    conn: &Connection,
    template: &Build,
    os: &str,
    arch: &str,
) -> anyhow::Result<Option<Build>> {
    if template.runs_on(os, arch) && !template.deleted {
        return Ok(Some(template.clone()));
    }
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM builds
                 WHERE product = ?1 AND branch = ?2 AND build_type = ?3 AND revision = ?4
                   AND os IN (?5, ?6) AND arch IN (?7, ?8) AND deleted = 0
                 ORDER BY ts_created DESC, id DESC
                 LIMIT 1",
                BUILD_COLUMNS
            ),
            params![
                template.product,
                template.branch,
                template.build_type,
                template.revision,
                os,
                OS_AGNOSTIC,
                arch,
                ARCH_AGNOSTIC
            ],
            build_from_row,
        )
        .optional()?)
}

pub fn is_build_blacklisted(conn: &Connection, build: &Build, now: Timestamp) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT branch, build_types, os_arches FROM build_blacklist
         WHERE {} AND product = ?2 AND first_revision <= ?3 AND last_revision >= ?3",
        CURRENT_AT
    ))?;
    let rows = stmt.query_map(params![now, build.product, build.revision], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, Option<JsonCol<Vec<String>>>>(1)?,
            row.get::<_, Option<JsonCol<Vec<String>>>>(2)?,
        ))
    })?;
    let os_arch = build.os_arch();
    for row in rows {
        let (branch, build_types, os_arches) = row?;
        let branch_hit = branch.map_or(true, |b| b == build.branch);
        let type_hit = build_types.map_or(true, |t| t.0.iter().any(|t| *t == build.build_type));
        let platform_hit = os_arches.map_or(true, |p| p.0.iter().any(|p| *p == os_arch));
        if branch_hit && type_hit && platform_hit {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Runs of a test case against a build: (passed or skipped, failed/timed out/rebooted).
pub fn prereq_run_counts(conn: &Connection, build_id: BuildId, test_case_id: TestCaseId) -> anyhow::Result<(i64, i64)> {
    let counts = conn.query_row(
        "SELECT
            COALESCE(SUM(status IN ('success', 'skipped')), 0),
            COALESCE(SUM(status IN ('failure', 'timed-out', 'rebooted')), 0)
         FROM test_sets
         WHERE build_id = ?1 AND test_case_id = ?2",
        params![build_id, test_case_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(counts)
}

// ----------------------------------------------------------------------------
// global resources
// ----------------------------------------------------------------------------
/// True when every resource exists, is enabled and is not held by another testbox.
pub fn resources_free(
    conn: &Connection,
    resource_ids: &[GlobalResourceId],
    test_box_id: TestBoxId,
    now: Timestamp,
) -> anyhow::Result<bool> {
    for &id in resource_ids {
        let enabled: Option<bool> = conn
            .query_row(
                &format!("SELECT enabled FROM global_resources WHERE {} AND id = ?2", CURRENT_AT),
                params![now, id],
                |row| row.get(0),
            )
            .optional()?;
        if enabled != Some(true) {
            return Ok(false);
        }
        let holder: Option<TestBoxId> = conn
            .query_row(
                "SELECT test_box_id FROM global_resource_statuses WHERE global_resource_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if holder.is_some_and(|h| h != test_box_id) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Claims the resources for a testbox. Returns false without claiming anything when
/// one of them is unavailable; call inside a savepoint to undo partial claims.
pub fn allocate_resources(
    conn: &Connection,
    resource_ids: &[GlobalResourceId],
    test_box_id: TestBoxId,
    now: Timestamp,
) -> anyhow::Result<bool> {
    if !resources_free(conn, resource_ids, test_box_id, now)? {
        return Ok(false);
    }
    for &id in resource_ids {
        conn.execute(
            "INSERT OR REPLACE INTO global_resource_statuses (global_resource_id, test_box_id, ts_allocated)
             VALUES (?1, ?2, ?3)",
            params![id, test_box_id, now],
        )?;
    }
    Ok(true)
}

pub fn free_resources(conn: &Connection, test_box_id: TestBoxId) -> anyhow::Result<usize> {
    Ok(conn.execute(
        "DELETE FROM global_resource_statuses WHERE test_box_id = ?1",
        params![test_box_id],
    )?)
}

// ----------------------------------------------------------------------------
// test sets
// ----------------------------------------------------------------------------
#[derive(Clone, Debug)]
pub struct NewTestSet {
    pub build_id: BuildId,
    pub validation_kit_build_id: Option<BuildId>,
    pub test_box_id: TestBoxId,
    pub test_case_id: TestCaseId,
    pub test_case_name: String,
    pub arg_variation_id: ArgVariationId,
    pub test_group_id: TestGroupId,
    pub sched_group_id: SchedGroupId,
    pub gang_leader_id: Option<TestSetId>,
    pub gang_member_no: i64,
    pub gang_size: i64,
}

const TEST_SET_COLUMNS: &str = "id, ts_created, ts_done, status, build_id, validation_kit_build_id, test_box_id, \
     test_case_id, arg_variation_id, test_group_id, sched_group_id, gang_leader_id, gang_member_no, gang_size, \
     test_result_id";

fn test_set_from_row(row: &Row<'_>) -> rusqlite::Result<TestSet> {
    Ok(TestSet {
        id: row.get(0)?,
        ts_created: row.get(1)?,
        ts_done: row.get(2)?,
        status: row.get(3)?,
        build_id: row.get(4)?,
        validation_kit_build_id: row.get(5)?,
        test_box_id: row.get(6)?,
        test_case_id: row.get(7)?,
        arg_variation_id: row.get(8)?,
        test_group_id: row.get(9)?,
        sched_group_id: row.get(10)?,
        gang_leader_id: row.get(11)?,
        gang_member_no: row.get(12)?,
        gang_size: row.get(13)?,
        test_result_id: row.get(14)?,
    })
}

/// Inserts a running test set together with its root test result.
pub fn create_test_set(conn: &Connection, new: &NewTestSet, now: Timestamp) -> anyhow::Result<TestSetId> {
    conn.execute(
        "INSERT INTO test_sets (ts_created, status, build_id, validation_kit_build_id, test_box_id, test_case_id,
             arg_variation_id, test_group_id, sched_group_id, gang_leader_id, gang_member_no, gang_size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            now,
            TestStatus::Running,
            new.build_id,
            new.validation_kit_build_id,
            new.test_box_id,
            new.test_case_id,
            new.arg_variation_id,
            new.test_group_id,
            new.sched_group_id,
            new.gang_leader_id,
            new.gang_member_no,
            new.gang_size
        ],
    )?;
    let test_set_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO test_results (parent_id, test_set_id, name, status, ts_created) VALUES (NULL, ?1, ?2, ?3, ?4)",
        params![test_set_id, new.test_case_name, TestStatus::Running, now],
    )?;
    let test_result_id = conn.last_insert_rowid();

    conn.execute(
        "UPDATE test_sets SET test_result_id = ?1 WHERE id = ?2",
        params![test_result_id, test_set_id],
    )?;
    Ok(test_set_id)
}

pub fn get_test_set(conn: &Connection, id: TestSetId) -> anyhow::Result<Option<TestSet>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM test_sets WHERE id = ?1", TEST_SET_COLUMNS),
            params![id],
            test_set_from_row,
        )
        .optional()?)
}

/// Every test set of a gang, leader first.
pub fn gang_members(conn: &Connection, leader_id: TestSetId) -> anyhow::Result<Vec<TestSet>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM test_sets WHERE id = ?1 OR gang_leader_id = ?1 ORDER BY gang_member_no, id",
        TEST_SET_COLUMNS
    ))?;
    let rows = stmt.query_map(params![leader_id], test_set_from_row)?;
    let mut members = Vec::new();
    for member in rows {
        members.push(member?);
    }
    Ok(members)
}

/// Records the final status of a test set, releases the testbox's global resources
/// and returns the testbox to idle if this was its current test set.
pub fn complete_test_set(conn: &Connection, id: TestSetId, status: TestStatus, now: Timestamp) -> anyhow::Result<()> {
    let Some(test_set) = get_test_set(conn, id)? else {
        bail_loc!("Test set #{} does not exist", id);
    };
    conn.execute(
        "UPDATE test_sets SET status = ?1, ts_done = ?2 WHERE id = ?3",
        params![status, now, id],
    )?;
    if let Some(result_id) = test_set.test_result_id {
        conn.execute(
            "UPDATE test_results SET status = ?1, ts_done = ?2 WHERE id = ?3",
            params![status, now, result_id],
        )?;
    }
    free_resources(conn, test_set.test_box_id)?;
    conn.execute(
        "UPDATE test_box_statuses SET state = ?1, test_set_id = NULL, ts_updated = ?2
         WHERE test_box_id = ?3 AND test_set_id = ?4",
        params![TestBoxState::Idle, now, test_set.test_box_id, id],
    )?;
    Ok(())
}

// ----------------------------------------------------------------------------
// testboxes
// ----------------------------------------------------------------------------
pub fn insert_test_box(conn: &Connection, tb: &TestBox, now: Timestamp) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO test_boxes (id, generation_id, name, ip, os, arch, cpu_vendor, cpu_count, mem_mb, scratch_mb,
             has_hw_virt, has_nested_paging, has_64bit_guest, has_iommu, timeout_scale_pct, enabled, properties,
             ts_effective, ts_expire)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            tb.id,
            tb.generation_id,
            tb.name,
            tb.ip,
            tb.os,
            tb.arch,
            tb.cpu_vendor,
            tb.cpu_count,
            tb.mem_mb,
            tb.scratch_mb,
            tb.has_hw_virt,
            tb.has_nested_paging,
            tb.has_64bit_guest,
            tb.has_iommu,
            tb.timeout_scale_pct,
            tb.enabled,
            JsonCol(&tb.properties),
            now,
            TS_INFINITY
        ],
    )?;
    Ok(())
}

pub fn get_test_box(conn: &Connection, id: TestBoxId, now: Timestamp) -> anyhow::Result<Option<TestBox>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT id, generation_id, name, ip, os, arch, cpu_vendor, cpu_count, mem_mb, scratch_mb,
                    has_hw_virt, has_nested_paging, has_64bit_guest, has_iommu, timeout_scale_pct, enabled, properties
                 FROM test_boxes WHERE {} AND id = ?2",
                CURRENT_AT
            ),
            params![now, id],
            |row| {
                Ok(TestBox {
                    id: row.get(0)?,
                    generation_id: row.get(1)?,
                    name: row.get(2)?,
                    ip: row.get(3)?,
                    os: row.get(4)?,
                    arch: row.get(5)?,
                    cpu_vendor: row.get(6)?,
                    cpu_count: row.get(7)?,
                    mem_mb: row.get(8)?,
                    scratch_mb: row.get(9)?,
                    has_hw_virt: row.get(10)?,
                    has_nested_paging: row.get(11)?,
                    has_64bit_guest: row.get(12)?,
                    has_iommu: row.get(13)?,
                    timeout_scale_pct: row.get(14)?,
                    enabled: row.get(15)?,
                    properties: row.get::<_, JsonCol<BTreeMap<String, String>>>(16)?.0,
                })
            },
        )
        .optional()?)
}

/// Loads what a poll needs to know about a testbox: its properties and the enabled
/// state and priority of each scheduling group it belongs to.
pub fn load_test_box_view(conn: &Connection, id: TestBoxId, now: Timestamp) -> anyhow::Result<Option<TestBoxView>> {
    let Some(test_box) = get_test_box(conn, id, now)? else {
        return Ok(None);
    };
    let mut stmt = conn.prepare_cached(
        "SELECT m.sched_group_id, m.priority, COALESCE(g.enabled, 0)
         FROM test_box_in_sched_groups m
         LEFT JOIN sched_groups g
           ON g.id = m.sched_group_id AND g.ts_effective <= ?1 AND g.ts_expire > ?1
         WHERE m.ts_effective <= ?1 AND m.ts_expire > ?1 AND m.test_box_id = ?2
         ORDER BY m.sched_group_id",
    )?;
    let rows = stmt.query_map(params![now, id], |row| {
        Ok(TestBoxInSchedGroup {
            sched_group_id: row.get(0)?,
            priority: row.get(1)?,
            enabled: row.get(2)?,
        })
    })?;
    let mut sched_groups = Vec::new();
    for group in rows {
        sched_groups.push(group?);
    }
    Ok(Some(TestBoxView { test_box, sched_groups }))
}

pub fn get_test_box_status(conn: &Connection, id: TestBoxId) -> anyhow::Result<Option<TestBoxStatus>> {
    Ok(conn
        .query_row(
            "SELECT test_box_id, generation_id, state, test_set_id, sched_group_index
             FROM test_box_statuses WHERE test_box_id = ?1",
            params![id],
            |row| {
                Ok(TestBoxStatus {
                    test_box_id: row.get(0)?,
                    generation_id: row.get(1)?,
                    state: row.get(2)?,
                    test_set_id: row.get(3)?,
                    sched_group_index: row.get(4)?,
                })
            },
        )
        .optional()?)
}

/// Fetches the status row of a testbox, creating an idle one on first contact.
pub fn ensure_test_box_status(conn: &Connection, tb: &TestBox, now: Timestamp) -> anyhow::Result<TestBoxStatus> {
    conn.execute(
        "INSERT OR IGNORE INTO test_box_statuses (test_box_id, generation_id, state, sched_group_index, ts_updated)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![tb.id, tb.generation_id, TestBoxState::Idle, now],
    )?;
    get_test_box_status(conn, tb.id)?.ok_or_else(|| anyhow_loc!("Status row for testbox #{} vanished", tb.id))
}

pub fn set_test_box_state(
    conn: &Connection,
    id: TestBoxId,
    state: TestBoxState,
    test_set_id: Option<TestSetId>,
    now: Timestamp,
) -> anyhow::Result<()> {
    let updated = conn.execute(
        "UPDATE test_box_statuses SET state = ?1, test_set_id = ?2, ts_updated = ?3 WHERE test_box_id = ?4",
        params![state, test_set_id, now, id],
    )?;
    if updated != 1 {
        bail_loc!("No status row for testbox #{}", id);
    }
    Ok(())
}

pub fn set_sched_group_index(conn: &Connection, id: TestBoxId, index: i64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE test_box_statuses SET sched_group_index = ?1 WHERE test_box_id = ?2",
        params![index, id],
    )?;
    Ok(())
}

/// Moves every testbox currently attached to one of the given test sets back to idle.
pub fn reset_test_boxes_of(conn: &Connection, test_set_ids: &[TestSetId], now: Timestamp) -> anyhow::Result<()> {
    for &id in test_set_ids {
        conn.execute(
            "UPDATE test_box_statuses SET state = ?1, test_set_id = NULL, ts_updated = ?2 WHERE test_set_id = ?3",
            params![TestBoxState::Idle, now, id],
        )?;
    }
    Ok(())
}
