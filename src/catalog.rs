//! Read-only snapshot of one scheduling group's configuration at one point in time.
//!
//! Relations between entities are plain id lookups into the snapshot's maps; the
//! snapshot is built for one rebuild or poll and then dropped.

use crate::model::*;
use crate::req_expr::Requirement;
use crate::store::{JsonCol, CURRENT_AT};
use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;

#[derive(Clone, Debug)]
pub struct CatalogSnapshot {
    pub now: Timestamp,
    pub sched_group: SchedGroup,
    pub build_source: Option<BuildSource>,
    pub validation_kit_source: Option<BuildSource>,
    /// Member test groups, by descending priority then id.
    pub test_groups: IndexMap<TestGroupId, TestGroup>,
    /// Every test case referenced by a member test group, by id.
    pub test_cases: IndexMap<TestCaseId, TestCase>,
    /// Variations of those test cases, by id.
    pub arg_variations: IndexMap<ArgVariationId, ArgVariation>,
}

impl CatalogSnapshot {
    /// Loads the snapshot of a scheduling group, or `None` if the group does not exist at `now`.
    pub fn load(conn: &Connection, sched_group_id: SchedGroupId, now: Timestamp) -> anyhow::Result<Option<Self>> {
        let sched_group = conn
            .query_row(
                &format!(
                    "SELECT id, name, enabled, strategy, build_source_id, validation_kit_build_source_id
                     FROM sched_groups WHERE {} AND id = ?2",
                    CURRENT_AT
                ),
                params![now, sched_group_id],
                |row| {
                    Ok(SchedGroup {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        enabled: row.get(2)?,
                        strategy: row.get(3)?,
                        build_source_id: row.get(4)?,
                        validation_kit_build_source_id: row.get(5)?,
                    })
                },
            )
            .optional()?;
        let Some(sched_group) = sched_group else {
            return Ok(None);
        };

        let build_source = match sched_group.build_source_id {
            Some(id) => load_build_source(conn, id, now)?,
            None => None,
        };
        let validation_kit_source = match sched_group.validation_kit_build_source_id {
            Some(id) => load_build_source(conn, id, now)?,
            None => None,
        };

        let test_groups = load_test_groups(conn, sched_group_id, now)?;

        let case_ids: BTreeSet<TestCaseId> = test_groups
            .values()
            .flat_map(|g| g.members.iter().map(|m| m.test_case_id))
            .collect();
        let mut test_cases = IndexMap::new();
        let mut arg_variations = IndexMap::new();
        for case_id in case_ids {
            let Some(case) = load_test_case(conn, case_id, now)? else {
                tracing::warn!(
                    "Sched group #{} references test case #{} which does not exist",
                    sched_group_id,
                    case_id
                );
                continue;
            };
            for variation in load_arg_variations(conn, case_id, now)? {
                arg_variations.insert(variation.id, variation);
            }
            test_cases.insert(case_id, case);
        }

        Ok(Some(CatalogSnapshot {
            now,
            sched_group,
            build_source,
            validation_kit_source,
            test_groups,
            test_cases,
            arg_variations,
        }))
    }

    pub fn test_group(&self, id: TestGroupId) -> Option<&TestGroup> {
        self.test_groups.get(&id)
    }

    pub fn test_case(&self, id: TestCaseId) -> Option<&TestCase> {
        self.test_cases.get(&id)
    }

    pub fn arg_variation(&self, id: ArgVariationId) -> Option<&ArgVariation> {
        self.arg_variations.get(&id)
    }

    /// Variations a test group member contributes, by id.
    pub fn member_variations<'a>(&'a self, member: &'a TestGroupMember) -> impl Iterator<Item = &'a ArgVariation> + 'a {
        self.arg_variations.values().filter(move |v| {
            v.test_case_id == member.test_case_id
                && member
                    .arg_variation_ids
                    .as_ref()
                    .map_or(true, |subset| subset.contains(&v.id))
        })
    }

    /// Transitive prerequisite test groups of a group, nearest first. Stops at missing
    /// groups and repeats, so it is safe to call on unvalidated data.
    pub fn test_group_chain(&self, id: TestGroupId) -> Vec<TestGroupId> {
        let mut chain = Vec::new();
        let mut cur = self.test_group(id).and_then(|g| g.prereq_group_id);
        while let Some(prereq) = cur {
            if prereq == id || chain.contains(&prereq) {
                break;
            }
            chain.push(prereq);
            cur = self.test_group(prereq).and_then(|g| g.prereq_group_id);
        }
        chain
    }

    /// Test cases that must have passed against a build before `variation` may run on
    /// it as part of `item`: the test case's own prerequisites plus every enabled test
    /// case of the item's prerequisite test groups.
    pub fn prereq_test_cases(&self, item: &QueueItem, variation: &ArgVariation) -> BTreeSet<TestCaseId> {
        let mut prereqs = BTreeSet::new();
        if let Some(case) = self.test_case(variation.test_case_id) {
            prereqs.extend(case.prereq_test_case_ids.iter().copied());
        }
        for group_id in &item.test_group_prereqs {
            if let Some(group) = self.test_group(*group_id) {
                for member in &group.members {
                    if self.test_case(member.test_case_id).is_some_and(|c| c.enabled) {
                        prereqs.insert(member.test_case_id);
                    }
                }
            }
        }
        prereqs
    }
}

pub fn load_build_source(conn: &Connection, id: BuildSourceId, now: Timestamp) -> anyhow::Result<Option<BuildSource>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT id, name, product, branch, build_types, os_arches, first_revision, last_revision, max_age_secs
                 FROM build_sources WHERE {} AND id = ?2",
                CURRENT_AT
            ),
            params![now, id],
            |row| {
                Ok(BuildSource {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    product: row.get(2)?,
                    branch: row.get(3)?,
                    build_types: row.get::<_, JsonCol<Vec<String>>>(4)?.0,
                    os_arches: row.get::<_, Option<JsonCol<Vec<String>>>>(5)?.map(|c| c.0),
                    first_revision: row.get(6)?,
                    last_revision: row.get(7)?,
                    max_age_secs: row.get(8)?,
                })
            },
        )
        .optional()?)
}

fn load_test_groups(
    conn: &Connection,
    sched_group_id: SchedGroupId,
    now: Timestamp,
) -> anyhow::Result<IndexMap<TestGroupId, TestGroup>> {
    let mut stmt = conn.prepare_cached(
        "SELECT m.test_group_id, COALESCE(g.name, ''), m.priority, m.prereq_test_group_id, m.hourly_schedule
         FROM sched_group_members m
         LEFT JOIN test_groups g ON g.id = m.test_group_id AND g.ts_effective <= ?1 AND g.ts_expire > ?1
         WHERE m.ts_effective <= ?1 AND m.ts_expire > ?1 AND m.sched_group_id = ?2
         ORDER BY m.priority DESC, m.test_group_id",
    )?;
    let rows = stmt.query_map(params![now, sched_group_id], |row| {
        Ok(TestGroup {
            id: row.get(0)?,
            name: row.get(1)?,
            priority: row.get(2)?,
            prereq_group_id: row.get(3)?,
            hourly_schedule: row.get(4)?,
            members: Vec::new(),
        })
    })?;
    let mut groups = IndexMap::new();
    for group in rows {
        let group = group?;
        groups.insert(group.id, group);
    }

    let mut member_stmt = conn.prepare_cached(&format!(
        "SELECT test_case_id, priority, arg_variation_ids FROM test_group_members
         WHERE {} AND test_group_id = ?2
         ORDER BY priority DESC, test_case_id",
        CURRENT_AT
    ))?;
    for group in groups.values_mut() {
        let rows = member_stmt.query_map(params![now, group.id], |row| {
            Ok(TestGroupMember {
                test_case_id: row.get(0)?,
                priority: row.get(1)?,
                arg_variation_ids: row.get::<_, Option<JsonCol<Vec<ArgVariationId>>>>(2)?.map(|c| c.0),
            })
        })?;
        for member in rows {
            group.members.push(member?);
        }
    }
    Ok(groups)
}

fn load_test_case(conn: &Connection, id: TestCaseId, now: Timestamp) -> anyhow::Result<Option<TestCase>> {
    let case = conn
        .query_row(
            &format!(
                "SELECT id, name, enabled, base_cmd, validation_kit_zips, timeout_secs, test_box_req_expr, build_req_expr
                 FROM test_cases WHERE {} AND id = ?2",
                CURRENT_AT
            ),
            params![now, id],
            |row| {
                Ok(TestCase {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    enabled: row.get(2)?,
                    prereq_test_case_ids: Vec::new(),
                    base_cmd: row.get(3)?,
                    validation_kit_zips: row.get(4)?,
                    timeout_secs: row.get(5)?,
                    test_box_req: Requirement::parse(row.get::<_, Option<String>>(6)?.as_deref()),
                    build_req: Requirement::parse(row.get::<_, Option<String>>(7)?.as_deref()),
                })
            },
        )
        .optional()?;
    let Some(mut case) = case else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT prereq_test_case_id FROM test_case_deps WHERE {} AND test_case_id = ?2 ORDER BY prereq_test_case_id",
        CURRENT_AT
    ))?;
    let rows = stmt.query_map(params![now, id], |row| row.get(0))?;
    for prereq in rows {
        case.prereq_test_case_ids.push(prereq?);
    }
    Ok(Some(case))
}

fn load_arg_variations(conn: &Connection, test_case_id: TestCaseId, now: Timestamp) -> anyhow::Result<Vec<ArgVariation>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT id, test_case_id, args, timeout_secs, gang_size, global_resource_ids, test_box_req_expr, build_req_expr
         FROM arg_variations WHERE {} AND test_case_id = ?2 ORDER BY id",
        CURRENT_AT
    ))?;
    let rows = stmt.query_map(params![now, test_case_id], |row| {
        Ok(ArgVariation {
            id: row.get(0)?,
            test_case_id: row.get(1)?,
            args: row.get(2)?,
            timeout_secs: row.get(3)?,
            gang_size: row.get(4)?,
            global_resource_ids: row.get::<_, JsonCol<Vec<GlobalResourceId>>>(5)?.0,
            test_box_req: Requirement::parse(row.get::<_, Option<String>>(6)?.as_deref()),
            build_req: Requirement::parse(row.get::<_, Option<String>>(7)?.as_deref()),
        })
    })?;
    let mut variations = Vec::new();
    for variation in rows {
        variations.push(variation?);
    }
    Ok(variations)
}
