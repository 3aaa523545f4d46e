//! Persisted work queue of a scheduling group: rebuild with position-preserving
//! rotation, tail rotation after dispatch and gang gathering state.

use crate::catalog::CatalogSnapshot;
use crate::deps::{self, ConfigError};
use crate::model::*;
use crate::store::{self, JsonCol};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// Outcome of a queue rebuild. A non-empty `errors` means nothing was written.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RebuildReport {
    pub errors: Vec<ConfigError>,
    pub messages: Vec<String>,
}

impl RebuildReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

const ITEM_COLUMNS: &str = "item_id, sched_group_id, off_queue, arg_variation_id, test_group_id, test_group_prereqs, \
     hourly_schedule, ts_config, ts_last_scheduled, gang_leader_test_set_id, missing_gang_members";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        item_id: row.get(0)?,
        sched_group_id: row.get(1)?,
        offset: row.get(2)?,
        arg_variation_id: row.get(3)?,
        test_group_id: row.get(4)?,
        test_group_prereqs: row.get::<_, JsonCol<Vec<TestGroupId>>>(5)?.0,
        hourly_schedule: row.get(6)?,
        ts_config: row.get(7)?,
        ts_last_scheduled: row.get(8)?,
        gang_leader_test_set_id: row.get(9)?,
        missing_gang_members: row.get(10)?,
    })
}

/// Queue of a scheduling group in dispatch order.
pub fn load_queue(conn: &Connection, sched_group_id: SchedGroupId) -> anyhow::Result<Vec<QueueItem>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM sched_queues WHERE sched_group_id = ?1 ORDER BY item_id",
        ITEM_COLUMNS
    ))?;
    let rows = stmt.query_map(params![sched_group_id], item_from_row)?;
    let mut items = Vec::new();
    for item in rows {
        items.push(item?);
    }
    Ok(items)
}

pub fn get_item(conn: &Connection, item_id: QueueItemId) -> anyhow::Result<Option<QueueItem>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM sched_queues WHERE item_id = ?1", ITEM_COLUMNS),
            params![item_id],
            item_from_row,
        )
        .optional()?)
}

/// The queue item whose gang is led by `leader_id`, if it is still gathering.
pub fn item_for_gang(conn: &Connection, leader_id: TestSetId) -> anyhow::Result<Option<QueueItem>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM sched_queues WHERE gang_leader_test_set_id = ?1",
                ITEM_COLUMNS
            ),
            params![leader_id],
            item_from_row,
        )
        .optional()?)
}

/// Appends an item; the stored id is fresh and larger than any id handed out before.
fn insert_item(conn: &Connection, item: &QueueItem) -> anyhow::Result<QueueItemId> {
    conn.execute(
        "INSERT INTO sched_queues (sched_group_id, off_queue, arg_variation_id, test_group_id, test_group_prereqs,
             hourly_schedule, ts_config, ts_last_scheduled, gang_leader_test_set_id, missing_gang_members)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            item.sched_group_id,
            item.offset,
            item.arg_variation_id,
            item.test_group_id,
            JsonCol(&item.test_group_prereqs),
            item.hourly_schedule,
            item.ts_config,
            item.ts_last_scheduled,
            item.gang_leader_test_set_id,
            item.missing_gang_members
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Moves a dispatched item to the tail of its queue under a fresh id, clearing any
/// gang state.
pub fn rotate_to_tail(conn: &Connection, item: &QueueItem, now: Timestamp) -> anyhow::Result<QueueItemId> {
    let mut moved = item.clone();
    moved.ts_last_scheduled = Some(now);
    moved.gang_leader_test_set_id = None;
    moved.missing_gang_members = 0;
    let new_id = insert_item(conn, &moved)?;
    conn.execute("DELETE FROM sched_queues WHERE item_id = ?1", params![item.item_id])?;
    tracing::trace!("Queue item #{} rotated to tail as #{}", item.item_id, new_id);
    Ok(new_id)
}

pub fn set_gang_state(
    conn: &Connection,
    item_id: QueueItemId,
    leader_id: Option<TestSetId>,
    missing_members: i64,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE sched_queues SET gang_leader_test_set_id = ?1, missing_gang_members = ?2 WHERE item_id = ?3",
        params![leader_id, missing_members, item_id],
    )?;
    Ok(())
}

/// Force-completes every still-running test set of a gang as gang-gathering-timedout
/// and sends the testboxes that were waiting on it back to idle.
pub fn time_out_gang(conn: &Connection, leader_id: TestSetId, now: Timestamp) -> anyhow::Result<usize> {
    let members = store::gang_members(conn, leader_id)?;
    let mut timed_out = 0;
    for member in &members {
        if member.status == TestStatus::Running {
            store::complete_test_set(conn, member.id, TestStatus::GangGatheringTimedout, now)?;
            timed_out += 1;
        }
    }
    let ids: Vec<TestSetId> = members.iter().map(|m| m.id).collect();
    store::reset_test_boxes_of(conn, &ids, now)?;
    tracing::warn!("Gang #{} timed out with {}/{} members gathered", leader_id, members.len(), members.first().map_or(0, |m| m.gang_size));
    Ok(timed_out)
}

/// Scheduling groups with at least one gathering gang.
pub fn groups_with_gangs(conn: &Connection) -> anyhow::Result<Vec<SchedGroupId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT sched_group_id FROM sched_queues
         WHERE gang_leader_test_set_id IS NOT NULL ORDER BY sched_group_id",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    let mut ids = Vec::new();
    for id in rows {
        ids.push(id?);
    }
    Ok(ids)
}

/// Times out gangs of one scheduling group whose leader was created more than
/// `timeout_secs` ago, or whose leader no longer exists, and rotates their items.
pub fn sweep_gang_timeouts(
    conn: &Connection,
    sched_group_id: SchedGroupId,
    now: Timestamp,
    timeout_secs: i64,
) -> anyhow::Result<usize> {
    let mut swept = 0;
    for item in load_queue(conn, sched_group_id)? {
        let Some(leader_id) = item.gang_leader_test_set_id else {
            continue;
        };
        let expired = match store::get_test_set(conn, leader_id)? {
            Some(leader) => leader.ts_created + timeout_secs <= now || leader.status != TestStatus::Running,
            None => true,
        };
        if expired {
            time_out_gang(conn, leader_id, now)?;
            rotate_to_tail(conn, &item, now)?;
            swept += 1;
        }
    }
    Ok(swept)
}

/// Materializes the sorted catalog into queue items, before rotation.
fn build_items(catalog: &CatalogSnapshot, sorted: &deps::SortedCatalog) -> Vec<QueueItem> {
    let sched_group_id = catalog.sched_group.id;
    let mut items = Vec::new();
    for &group_id in &sorted.test_groups {
        let Some(group) = catalog.test_group(group_id) else {
            continue;
        };
        let chain = catalog.test_group_chain(group_id);
        let Some(case_ids) = sorted.test_cases.get(&group_id) else {
            continue;
        };
        for &case_id in case_ids {
            if !catalog.test_case(case_id).is_some_and(|c| c.enabled) {
                continue;
            }
            for member in group.members.iter().filter(|m| m.test_case_id == case_id) {
                for variation in catalog.member_variations(member) {
                    items.push(QueueItem {
                        item_id: 0,
                        sched_group_id,
                        offset: items.len() as i64,
                        arg_variation_id: variation.id,
                        test_group_id: group_id,
                        test_group_prereqs: chain.clone(),
                        hourly_schedule: group.hourly_schedule.clone(),
                        ts_config: catalog.now,
                        ts_last_scheduled: None,
                        gang_leader_test_set_id: None,
                        missing_gang_members: 0,
                    });
                }
            }
        }
    }
    items
}

/// Position the rebuilt queue resumes at, scaled from the old queue's position.
pub fn rotation_offset(old_first_offset: i64, old_count: usize, new_count: usize) -> usize {
    if old_count == 0 || new_count == 0 {
        return 0;
    }
    let scaled = old_first_offset.max(0) as u128 * new_count as u128 / old_count as u128;
    (scaled as usize).min(new_count - 1)
}

/// Rebuilds the queue of a scheduling group from a catalog snapshot. Must run inside a
/// transaction: configuration errors leave the stored queue untouched, and any other
/// failure is expected to roll the whole transaction back.
pub fn recreate_queue(conn: &Connection, catalog: &CatalogSnapshot, now: Timestamp) -> anyhow::Result<RebuildReport> {
    let sched_group_id = catalog.sched_group.id;
    let mut report = RebuildReport::default();

    let sorted = match deps::validate_and_sort(catalog)? {
        Ok(sorted) => sorted,
        Err(errors) => {
            for error in &errors {
                tracing::warn!("Sched group #{}: {}", sched_group_id, error);
            }
            report.errors = errors;
            report.messages.push(format!(
                "Queue of sched group #{} not rebuilt: {} configuration error(s)",
                sched_group_id,
                report.errors.len()
            ));
            return Ok(report);
        }
    };

    let mut new_items = if catalog.sched_group.enabled {
        build_items(catalog, &sorted)
    } else {
        report
            .messages
            .push(format!("Sched group #{} is disabled; queue emptied", sched_group_id));
        Vec::new()
    };

    let old_items = load_queue(conn, sched_group_id)?;
    let new_offset = rotation_offset(
        old_items.first().map_or(0, |item| item.offset),
        old_items.len(),
        new_items.len(),
    );
    new_items.rotate_left(new_offset);

    for item in old_items.iter().filter(|item| item.is_gathering()) {
        if let Some(leader_id) = item.gang_leader_test_set_id {
            time_out_gang(conn, leader_id, now)?;
            report
                .messages
                .push(format!("Gang #{} timed out by queue rebuild", leader_id));
        }
    }

    conn.execute("DELETE FROM sched_queues WHERE sched_group_id = ?1", params![sched_group_id])?;
    for item in &new_items {
        insert_item(conn, item)?;
    }

    tracing::info!(
        "Rebuilt queue of sched group #{}: {} -> {} items, resuming at offset {}",
        sched_group_id,
        old_items.len(),
        new_items.len(),
        new_offset
    );
    report.messages.push(format!(
        "Queue of sched group #{} rebuilt with {} items",
        sched_group_id,
        new_items.len()
    ));
    Ok(report)
}
