//! Picks which scheduling group a testbox that belongs to several of them serves next.

use crate::model::{SchedGroupId, TestBoxInSchedGroup};
use itertools::Itertools;
use std::collections::HashSet;

pub const MIN_PRIORITY: i64 = 0;
pub const MAX_PRIORITY: i64 = 31;

/// Flattened round-robin list for a testbox's groups.
///
/// Enabled groups are bucketed by clamped priority. Buckets are taken alternately from
/// the high and the low end so low-priority groups still get regular turns, and each
/// group appears `1 + priority / 8` times inside its bucket.
pub fn candidate_list(groups: &[TestBoxInSchedGroup]) -> Vec<SchedGroupId> {
    let buckets = groups
        .iter()
        .filter(|g| g.enabled)
        .map(|g| (g.priority.clamp(MIN_PRIORITY, MAX_PRIORITY), g.sched_group_id))
        .into_group_map();
    let mut priorities: Vec<i64> = buckets.keys().copied().sorted().rev().collect();

    let mut order = Vec::with_capacity(priorities.len());
    while !priorities.is_empty() {
        order.push(priorities.remove(0));
        if let Some(low) = priorities.pop() {
            order.push(low);
        }
    }

    let mut list = Vec::new();
    for priority in order {
        let Some(ids) = buckets.get(&priority) else {
            continue;
        };
        let ids: Vec<SchedGroupId> = ids.iter().copied().sorted().dedup().collect();
        let repeats = 1 + priority / 8;
        for _ in 0..repeats {
            list.extend(ids.iter().copied());
        }
    }
    list
}

/// Next group to serve, starting just after `last_index` and wrapping around once.
/// Returns the group and its position in the candidate list.
pub fn pick(
    groups: &[TestBoxInSchedGroup],
    last_index: i64,
    ignore: &HashSet<SchedGroupId>,
) -> Option<(SchedGroupId, i64)> {
    let enabled: Vec<&TestBoxInSchedGroup> = groups.iter().filter(|g| g.enabled).collect();
    if enabled.len() == 1 {
        let only = enabled[0].sched_group_id;
        return (!ignore.contains(&only)).then_some((only, 0));
    }

    let list = candidate_list(groups);
    if list.is_empty() {
        return None;
    }
    let len = list.len() as i64;
    let start = (last_index + 1).rem_euclid(len);
    (0..len)
        .map(|step| (start + step) % len)
        .map(|index| (list[index as usize], index))
        .find(|(id, _)| !ignore.contains(id))
}
