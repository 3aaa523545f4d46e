//! Prerequisite validation and dependency-aware ordering of test groups and test cases.

use crate::catalog::CatalogSnapshot;
use crate::model::{TestCaseId, TestGroupId};
use crate::{bail_loc, function_name};
use itertools::Itertools;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Longest allowed prerequisite chain, counted in hops.
pub const MAX_PREREQ_HOPS: usize = 9;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConfigEntity {
    TestGroup { test_group_id: TestGroupId },
    TestCase { test_group_id: TestGroupId, test_case_id: TestCaseId },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigErrorKind {
    Cycle,
    Dangling,
    TooDeep,
    InvalidExpression,
}

/// A configuration problem that prevents a queue rebuild.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConfigError {
    pub entity: ConfigEntity,
    pub kind: ConfigErrorKind,
    /// The prerequisite chain that exposed the problem, starting at `entity`.
    pub chain: Vec<i64>,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Dependency-ordered view of a catalog, ready to be materialized into a queue.
#[derive(Clone, Debug, Default)]
pub struct SortedCatalog {
    pub test_groups: Vec<TestGroupId>,
    pub test_cases: HashMap<TestGroupId, Vec<TestCaseId>>,
}

/// Validates every prerequisite graph of the catalog and, if they are all sound,
/// returns the dependency-adjusted order.
pub fn validate_and_sort(catalog: &CatalogSnapshot) -> anyhow::Result<Result<SortedCatalog, Vec<ConfigError>>> {
    let errors = validate(catalog);
    if !errors.is_empty() {
        return Ok(Err(errors));
    }
    Ok(Ok(sort(catalog)?))
}

pub fn validate(catalog: &CatalogSnapshot) -> Vec<ConfigError> {
    let mut errors = Vec::new();

    // Test groups.
    let group_ids: Vec<TestGroupId> = catalog.test_groups.keys().copied().collect();
    let group_members: HashSet<TestGroupId> = group_ids.iter().copied().collect();
    let group_problems = check_prereq_graph(&group_ids, &group_members, |id| {
        catalog
            .test_group(id)
            .and_then(|g| g.prereq_group_id)
            .into_iter()
            .collect()
    });
    for (kind, chain) in group_problems {
        let test_group_id = chain[0];
        errors.push(ConfigError {
            entity: ConfigEntity::TestGroup { test_group_id },
            kind,
            message: describe("Test group", kind, &chain),
            chain,
        });
    }

    // Test cases, scoped to each group.
    for group in catalog.test_groups.values() {
        let case_ids: Vec<TestCaseId> = group
            .members
            .iter()
            .map(|m| m.test_case_id)
            .filter(|id| catalog.test_case(*id).is_some())
            .collect();
        let case_members: HashSet<TestCaseId> = case_ids.iter().copied().collect();
        let case_problems = check_prereq_graph(&case_ids, &case_members, |id| {
            catalog
                .test_case(id)
                .map(|c| c.prereq_test_case_ids.clone())
                .unwrap_or_default()
        });
        for (kind, chain) in case_problems {
            let test_case_id = chain[0];
            errors.push(ConfigError {
                entity: ConfigEntity::TestCase {
                    test_group_id: group.id,
                    test_case_id,
                },
                kind,
                message: format!(
                    "{} (in test group #{})",
                    describe("Test case", kind, &chain),
                    group.id
                ),
                chain,
            });
        }

        // Unparsable requirement expressions would silently never match.
        for &case_id in &case_ids {
            let Some(case) = catalog.test_case(case_id) else {
                continue;
            };
            let variation_errors = catalog
                .arg_variations
                .values()
                .filter(|v| v.test_case_id == case_id)
                .flat_map(|v| [v.test_box_req.parse_error(), v.build_req.parse_error()]);
            let case_errors = [case.test_box_req.parse_error(), case.build_req.parse_error()];
            if let Some(error) = case_errors.into_iter().chain(variation_errors).flatten().next() {
                errors.push(ConfigError {
                    entity: ConfigEntity::TestCase {
                        test_group_id: group.id,
                        test_case_id: case_id,
                    },
                    kind: ConfigErrorKind::InvalidExpression,
                    chain: vec![case_id],
                    message: format!("Test case #{} has an invalid requirement: {}", case_id, error),
                });
            }
        }
    }

    errors
}

fn describe(what: &str, kind: ConfigErrorKind, chain: &[i64]) -> String {
    let path = chain.iter().map(|id| format!("#{}", id)).join(" -> ");
    match kind {
        ConfigErrorKind::Cycle => format!("{} #{} is its own prerequisite: {}", what, chain[0], path),
        ConfigErrorKind::Dangling => format!(
            "{} #{} depends on #{} which is not a member: {}",
            what,
            chain[0],
            chain[chain.len() - 1],
            path
        ),
        ConfigErrorKind::TooDeep => format!(
            "{} #{} has a prerequisite chain longer than {} hops: {}",
            what, chain[0], MAX_PREREQ_HOPS, path
        ),
        ConfigErrorKind::InvalidExpression => format!("{} #{} has an invalid requirement", what, chain[0]),
    }
}

type Problem = (ConfigErrorKind, Vec<i64>);

/// Hops below each node whose prerequisites are all sound, with the prerequisite that
/// starts its longest chain.
type Depths = HashMap<i64, (usize, Option<i64>)>;

/// Walks the prerequisite graph from every node in `ids` and reports each distinct
/// problem once, with the chain that led to it. Nodes whose walk runs into an already
/// reported chain are not reported again.
fn check_prereq_graph<F>(ids: &[i64], members: &HashSet<i64>, prereqs_of: F) -> Vec<Problem>
where
    F: Fn(i64) -> Vec<i64>,
{
    let mut problems = Vec::new();
    let mut reported: HashSet<i64> = HashSet::new();
    let mut depths = Depths::new();

    for &start in ids {
        if reported.contains(&start) || depths.contains_key(&start) {
            continue;
        }
        let mut path = vec![start];
        match walk(&mut path, members, &prereqs_of, &reported, &mut depths) {
            Ok(below) => {
                depths.insert(start, below);
            }
            Err((kind, chain)) => {
                reported.extend(chain.iter().copied());
                problems.push((kind, chain));
            }
        }
    }
    problems
}

/// Returns the depth entry of the last node of `path`.
fn walk<F>(
    path: &mut Vec<i64>,
    members: &HashSet<i64>,
    prereqs_of: &F,
    reported: &HashSet<i64>,
    depths: &mut Depths,
) -> Result<(usize, Option<i64>), Problem>
where
    F: Fn(i64) -> Vec<i64>,
{
    let Some(&cur) = path.last() else {
        return Ok((0, None));
    };
    let mut deepest: (usize, Option<i64>) = (0, None);
    for next in prereqs_of(cur) {
        if reported.contains(&next) {
            continue;
        }
        let below = match depths.get(&next) {
            Some(&(below, _)) => below,
            None => {
                if path.len() > MAX_PREREQ_HOPS {
                    return Err((ConfigErrorKind::TooDeep, path.clone()));
                }
                if !members.contains(&next) {
                    let mut chain = path.clone();
                    chain.push(next);
                    return Err((ConfigErrorKind::Dangling, chain));
                }
                if path.contains(&next) {
                    let mut chain = path.clone();
                    chain.push(next);
                    return Err((ConfigErrorKind::Cycle, chain));
                }
                path.push(next);
                let entry = walk(path, members, prereqs_of, reported, depths)?;
                path.pop();
                depths.insert(next, entry);
                entry.0
            }
        };
        // path.len() hops reach `next`, `below` more reach the end of its chain.
        if path.len() + below > MAX_PREREQ_HOPS {
            let mut chain = path.clone();
            let mut node = Some(next);
            while let Some(id) = node {
                if chain.len() > MAX_PREREQ_HOPS {
                    break;
                }
                chain.push(id);
                node = depths.get(&id).and_then(|entry| entry.1);
            }
            return Err((ConfigErrorKind::TooDeep, chain));
        }
        if deepest.1.is_none() || below + 1 > deepest.0 {
            deepest = (below + 1, Some(next));
        }
    }
    Ok(deepest)
}

/// Orders test groups and their test cases: by descending priority as loaded, with
/// each dependent moved to just after its prerequisites.
pub fn sort(catalog: &CatalogSnapshot) -> anyhow::Result<SortedCatalog> {
    let mut test_groups: Vec<TestGroupId> = catalog.test_groups.keys().copied().collect();
    move_after_prereqs(&mut test_groups, |id| {
        catalog
            .test_group(id)
            .and_then(|g| g.prereq_group_id)
            .into_iter()
            .collect()
    })?;

    let mut test_cases = HashMap::new();
    for group in catalog.test_groups.values() {
        let mut cases: Vec<TestCaseId> = group
            .members
            .iter()
            .map(|m| m.test_case_id)
            .filter(|id| catalog.test_case(*id).is_some())
            .collect();
        move_after_prereqs(&mut cases, |id| {
            catalog
                .test_case(id)
                .map(|c| c.prereq_test_case_ids.clone())
                .unwrap_or_default()
        })?;
        test_cases.insert(group.id, cases);
    }

    Ok(SortedCatalog { test_groups, test_cases })
}

/// Single left-to-right pass: an entry that precedes one of its prerequisites is
/// re-inserted right after the last of them. The input must be acyclic.
pub fn move_after_prereqs<F>(ids: &mut Vec<i64>, prereqs_of: F) -> anyhow::Result<()>
where
    F: Fn(i64) -> Vec<i64>,
{
    let max_moves = ids.len() * ids.len() + 1;
    let mut moves = 0;
    let mut i = 0;
    while i < ids.len() {
        let last_prereq_pos = prereqs_of(ids[i])
            .into_iter()
            .filter_map(|p| ids.iter().position(|id| *id == p))
            .max();
        match last_prereq_pos {
            Some(pos) if pos > i => {
                moves += 1;
                if moves > max_moves {
                    bail_loc!("Prerequisite ordering did not settle; is the graph cyclic? {:?}", ids);
                }
                let id = ids.remove(i);
                // The prerequisite shifted down to pos - 1, so pos is right after it.
                ids.insert(pos, id);
            }
            _ => i += 1,
        }
    }
    Ok(())
}
