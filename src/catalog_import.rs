//! JSON catalog documents.
//!
//! An import replaces the whole current catalog: every current catalog row is expired
//! at the import time and the document's rows become effective at that time, so a
//! scheduling pass that started earlier keeps seeing a consistent snapshot. Builds are
//! not versioned; they are inserted or replaced by id.

use crate::model::*;
use crate::store::{self, JsonCol, CURRENT_AT, TS_INFINITY};
use anyhow::Context;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

const CATALOG_TABLES: &[&str] = &[
    "sched_groups",
    "sched_group_members",
    "test_groups",
    "test_group_members",
    "test_cases",
    "test_case_deps",
    "arg_variations",
    "build_sources",
    "build_blacklist",
    "test_boxes",
    "test_box_in_sched_groups",
    "global_resources",
];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogImport {
    #[serde(default)]
    pub sched_groups: Vec<SchedGroupDoc>,
    #[serde(default)]
    pub test_groups: Vec<TestGroupDoc>,
    #[serde(default)]
    pub test_cases: Vec<TestCaseDoc>,
    #[serde(default)]
    pub build_sources: Vec<BuildSource>,
    #[serde(default)]
    pub blacklist: Vec<BlacklistDoc>,
    #[serde(default)]
    pub builds: Vec<Build>,
    #[serde(default)]
    pub test_boxes: Vec<TestBoxDoc>,
    #[serde(default)]
    pub global_resources: Vec<GlobalResourceDoc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedGroupDoc {
    pub id: SchedGroupId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: SchedulerStrategy,
    #[serde(default)]
    pub build_source_id: Option<BuildSourceId>,
    #[serde(default)]
    pub validation_kit_build_source_id: Option<BuildSourceId>,
    #[serde(default)]
    pub members: Vec<SchedGroupMemberDoc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedGroupMemberDoc {
    pub test_group_id: TestGroupId,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub prereq_test_group_id: Option<TestGroupId>,
    /// Hours of the week (0 = Monday 00:00 UTC) the group may run; absent means always.
    #[serde(default)]
    pub hours: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestGroupDoc {
    pub id: TestGroupId,
    pub name: String,
    #[serde(default)]
    pub members: Vec<TestGroupMemberDoc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestGroupMemberDoc {
    pub test_case_id: TestCaseId,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub arg_variation_ids: Option<Vec<ArgVariationId>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCaseDoc {
    pub id: TestCaseId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_cmd: String,
    #[serde(default)]
    pub validation_kit_zips: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: i64,
    #[serde(default)]
    pub test_box_req_expr: Option<String>,
    #[serde(default)]
    pub build_req_expr: Option<String>,
    #[serde(default)]
    pub prereq_test_case_ids: Vec<TestCaseId>,
    #[serde(default)]
    pub arg_variations: Vec<ArgVariationDoc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArgVariationDoc {
    pub id: ArgVariationId,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub timeout_secs: Option<i64>,
    #[serde(default = "default_gang_size")]
    pub gang_size: i64,
    #[serde(default)]
    pub global_resource_ids: Vec<GlobalResourceId>,
    #[serde(default)]
    pub test_box_req_expr: Option<String>,
    #[serde(default)]
    pub build_req_expr: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlacklistDoc {
    pub id: i64,
    pub product: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub build_types: Option<Vec<String>>,
    #[serde(default)]
    pub os_arches: Option<Vec<String>>,
    pub first_revision: i64,
    pub last_revision: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestBoxDoc {
    #[serde(flatten)]
    pub test_box: TestBox,
    #[serde(default)]
    pub sched_groups: Vec<TestBoxMembershipDoc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestBoxMembershipDoc {
    pub sched_group_id: SchedGroupId,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalResourceDoc {
    pub id: GlobalResourceId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> i64 {
    3600
}

fn default_gang_size() -> i64 {
    1
}

impl CatalogImport {
    pub fn from_json(text: &str) -> anyhow::Result<CatalogImport> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Replaces the current catalog with `doc`, effective at `now`. Run inside a transaction.
pub fn import_catalog(conn: &Connection, doc: &CatalogImport, now: Timestamp) -> anyhow::Result<()> {
    for table in CATALOG_TABLES {
        conn.execute(
            &format!("UPDATE {} SET ts_expire = ?1 WHERE {}", table, CURRENT_AT),
            params![now],
        )?;
    }

    for group in &doc.sched_groups {
        conn.execute(
            "INSERT INTO sched_groups (id, name, enabled, strategy, build_source_id, validation_kit_build_source_id,
                 ts_effective, ts_expire)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                group.id,
                group.name,
                group.enabled,
                group.strategy,
                group.build_source_id,
                group.validation_kit_build_source_id,
                now,
                TS_INFINITY
            ],
        )?;
        for member in &group.members {
            let schedule = member
                .hours
                .as_deref()
                .map(HourlySchedule::from_hours)
                .transpose()
                .with_context(|| format!("Sched group #{} member #{}", group.id, member.test_group_id))?;
            conn.execute(
                "INSERT INTO sched_group_members (sched_group_id, test_group_id, priority, prereq_test_group_id,
                     hourly_schedule, ts_effective, ts_expire)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    group.id,
                    member.test_group_id,
                    member.priority,
                    member.prereq_test_group_id,
                    schedule,
                    now,
                    TS_INFINITY
                ],
            )?;
        }
    }

    for group in &doc.test_groups {
        conn.execute(
            "INSERT INTO test_groups (id, name, ts_effective, ts_expire) VALUES (?1, ?2, ?3, ?4)",
            params![group.id, group.name, now, TS_INFINITY],
        )?;
        for member in &group.members {
            conn.execute(
                "INSERT INTO test_group_members (test_group_id, test_case_id, priority, arg_variation_ids,
                     ts_effective, ts_expire)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    group.id,
                    member.test_case_id,
                    member.priority,
                    member.arg_variation_ids.as_ref().map(JsonCol),
                    now,
                    TS_INFINITY
                ],
            )?;
        }
    }

    for case in &doc.test_cases {
        conn.execute(
            "INSERT INTO test_cases (id, name, enabled, base_cmd, validation_kit_zips, timeout_secs,
                 test_box_req_expr, build_req_expr, ts_effective, ts_expire)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                case.id,
                case.name,
                case.enabled,
                case.base_cmd,
                case.validation_kit_zips,
                case.timeout_secs,
                case.test_box_req_expr,
                case.build_req_expr,
                now,
                TS_INFINITY
            ],
        )?;
        for prereq in &case.prereq_test_case_ids {
            conn.execute(
                "INSERT INTO test_case_deps (test_case_id, prereq_test_case_id, ts_effective, ts_expire)
                 VALUES (?1, ?2, ?3, ?4)",
                params![case.id, prereq, now, TS_INFINITY],
            )?;
        }
        for variation in &case.arg_variations {
            conn.execute(
                "INSERT INTO arg_variations (id, test_case_id, args, timeout_secs, gang_size, global_resource_ids,
                     test_box_req_expr, build_req_expr, ts_effective, ts_expire)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    variation.id,
                    case.id,
                    variation.args,
                    variation.timeout_secs,
                    variation.gang_size.max(1),
                    JsonCol(&variation.global_resource_ids),
                    variation.test_box_req_expr,
                    variation.build_req_expr,
                    now,
                    TS_INFINITY
                ],
            )?;
        }
    }

    for source in &doc.build_sources {
        conn.execute(
            "INSERT INTO build_sources (id, name, product, branch, build_types, os_arches, first_revision,
                 last_revision, max_age_secs, ts_effective, ts_expire)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                source.id,
                source.name,
                source.product,
                source.branch,
                JsonCol(&source.build_types),
                source.os_arches.as_ref().map(JsonCol),
                source.first_revision,
                source.last_revision,
                source.max_age_secs,
                now,
                TS_INFINITY
            ],
        )?;
    }

    for entry in &doc.blacklist {
        conn.execute(
            "INSERT INTO build_blacklist (id, product, branch, build_types, os_arches, first_revision,
                 last_revision, reason, ts_effective, ts_expire)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id,
                entry.product,
                entry.branch,
                entry.build_types.as_ref().map(JsonCol),
                entry.os_arches.as_ref().map(JsonCol),
                entry.first_revision,
                entry.last_revision,
                entry.reason,
                now,
                TS_INFINITY
            ],
        )?;
    }

    for build in &doc.builds {
        store::insert_build(conn, build)?;
    }

    for doc_box in &doc.test_boxes {
        store::insert_test_box(conn, &doc_box.test_box, now)?;
        for membership in &doc_box.sched_groups {
            conn.execute(
                "INSERT INTO test_box_in_sched_groups (test_box_id, sched_group_id, priority, ts_effective, ts_expire)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    doc_box.test_box.id,
                    membership.sched_group_id,
                    membership.priority,
                    now,
                    TS_INFINITY
                ],
            )?;
        }
    }

    for resource in &doc.global_resources {
        conn.execute(
            "INSERT INTO global_resources (id, name, enabled, ts_effective, ts_expire) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![resource.id, resource.name, resource.enabled, now, TS_INFINITY],
        )?;
    }

    tracing::info!(
        "Imported catalog: {} sched groups, {} test groups, {} test cases, {} builds, {} testboxes",
        doc.sched_groups.len(),
        doc.test_groups.len(),
        doc.test_cases.len(),
        doc.builds.len(),
        doc.test_boxes.len()
    );
    Ok(())
}
