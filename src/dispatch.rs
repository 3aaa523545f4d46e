//! Walks one scheduling group's queue on behalf of a polling testbox and either starts
//! a test set, joins a gathering gang, or finds nothing.

use crate::build_cache::{ArtifactProbe, BuildCache, BuildQuery};
use crate::catalog::CatalogSnapshot;
use crate::error::SchedError;
use crate::model::*;
use crate::queue;
use crate::store::{self, NewTestSet, SavepointGuard};
use crate::util;
use rusqlite::Connection;
use std::collections::HashSet;
use std::time::Instant;

/// Everything one dispatch attempt reads from or writes to.
pub struct DispatchContext<'a> {
    pub conn: &'a Connection,
    pub catalog: &'a CatalogSnapshot,
    pub build_cache: &'a mut BuildCache,
    pub probe: &'a dyn ArtifactProbe,
    pub now: Timestamp,
    pub deadline: Instant,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// A test set was started for the testbox.
    Exec(TestSetId),
    /// The testbox joined a gang that is still gathering.
    Wait(TestSetId),
    NoWork,
}

/// Finds work for `view.test_box` in the queue of `ctx.catalog`'s scheduling group.
///
/// Items the testbox cannot run are skipped; only store failures and a vanished gang
/// leader abort the walk. The caller owns the enclosing transaction.
pub fn schedule_next(ctx: &mut DispatchContext<'_>, view: &TestBoxView) -> anyhow::Result<DispatchOutcome> {
    let sched_group_id = ctx.catalog.sched_group.id;
    let test_box = &view.test_box;
    let hour = util::hour_of_week(ctx.now);
    let items = queue::load_queue(ctx.conn, sched_group_id)?;
    let mut rejected: HashSet<(ArgVariationId, TestGroupId)> = HashSet::new();

    for item in &items {
        if Instant::now() >= ctx.deadline {
            tracing::debug!(
                "Poll budget exhausted in sched group #{} for testbox {}",
                sched_group_id,
                test_box.name
            );
            break;
        }

        let pair = (item.arg_variation_id, item.test_group_id);
        if rejected.contains(&pair) {
            continue;
        }
        if item.hourly_schedule.as_ref().is_some_and(|s| !s.is_active(hour)) {
            continue;
        }

        let catalog = ctx.catalog;
        let Some(variation) = catalog.arg_variation(item.arg_variation_id) else {
            rejected.insert(pair);
            continue;
        };
        let Some(case) = catalog.test_case(variation.test_case_id) else {
            rejected.insert(pair);
            continue;
        };
        if !case.enabled {
            rejected.insert(pair);
            continue;
        }
        if !case.test_box_req.matches(test_box) || !variation.test_box_req.matches(test_box) {
            tracing::trace!("Testbox {} does not meet the requirements of variation #{}", test_box.name, variation.id);
            rejected.insert(pair);
            continue;
        }

        let outcome = if item.gang_leader_test_set_id.is_none() || variation.gang_size <= 1 {
            try_leader(ctx, test_box, item, case, variation)?
        } else {
            try_member(ctx, test_box, item, case, variation)?
        };
        match outcome {
            Some(outcome) => return Ok(outcome),
            None => {
                rejected.insert(pair);
            }
        }
    }
    Ok(DispatchOutcome::NoWork)
}

fn try_leader(
    ctx: &mut DispatchContext<'_>,
    test_box: &TestBox,
    item: &QueueItem,
    case: &TestCase,
    variation: &ArgVariation,
) -> anyhow::Result<Option<DispatchOutcome>> {
    let (conn, catalog, now) = (ctx.conn, ctx.catalog, ctx.now);

    if !store::resources_free(conn, &variation.global_resource_ids, test_box.id, now)? {
        tracing::debug!("Variation #{}: global resources busy", variation.id);
        return Ok(None);
    }

    let Some(source) = catalog.build_source.as_ref() else {
        tracing::debug!("Sched group #{} has no build source", catalog.sched_group.id);
        return Ok(None);
    };
    let prereqs = catalog.prereq_test_cases(item, variation);
    let filters = [&case.build_req, &variation.build_req];
    let query = BuildQuery {
        source,
        test_box,
        filters: &filters,
        prereqs: &prereqs,
        now,
    };
    let Some(build) = ctx.build_cache.find_build(conn, &query, ctx.probe)? else {
        tracing::debug!("Variation #{}: no build for {}.{}", variation.id, test_box.os, test_box.arch);
        return Ok(None);
    };

    let validation_kit = if case.needs_validation_kit() {
        let Some(vk_source) = catalog.validation_kit_source.as_ref() else {
            tracing::debug!("Test case #{} needs a validation kit but the group has no source for one", case.id);
            return Ok(None);
        };
        match ctx.build_cache.find_validation_kit_build(conn, vk_source, now, ctx.probe)? {
            Some(vk) => Some(vk),
            None => {
                tracing::debug!("Test case #{}: no validation kit build", case.id);
                return Ok(None);
            }
        }
    } else {
        None
    };

    let gang_size = variation.gang_size.max(1);
    let savepoint = SavepointGuard::new(conn, "dispatch_leader")?;
    let test_set_id = store::create_test_set(
        conn,
        &NewTestSet {
            build_id: build.id,
            validation_kit_build_id: validation_kit.as_ref().map(|b| b.id),
            test_box_id: test_box.id,
            test_case_id: case.id,
            test_case_name: case.name.clone(),
            arg_variation_id: variation.id,
            test_group_id: item.test_group_id,
            sched_group_id: item.sched_group_id,
            gang_leader_id: None,
            gang_member_no: 0,
            gang_size,
        },
        now,
    )?;

    if gang_size <= 1 {
        if !store::allocate_resources(conn, &variation.global_resource_ids, test_box.id, now)? {
            savepoint.rollback()?;
            tracing::debug!("Variation #{}: lost the race for global resources", variation.id);
            return Ok(None);
        }
        queue::rotate_to_tail(conn, item, now)?;
        store::set_test_box_state(conn, test_box.id, TestBoxState::Testing, Some(test_set_id), now)?;
        savepoint.release()?;
        tracing::info!(
            "Testbox {} runs test set #{}: {} [{}] on build #{} r{}",
            test_box.name,
            test_set_id,
            case.name,
            variation.args,
            build.id,
            build.revision
        );
        Ok(Some(DispatchOutcome::Exec(test_set_id)))
    } else {
        queue::set_gang_state(conn, item.item_id, Some(test_set_id), gang_size - 1)?;
        store::set_test_box_state(conn, test_box.id, TestBoxState::GangGathering, Some(test_set_id), now)?;
        savepoint.release()?;
        tracing::info!(
            "Testbox {} leads gang #{} for {} [{}], waiting for {} more",
            test_box.name,
            test_set_id,
            case.name,
            variation.args,
            gang_size - 1
        );
        Ok(Some(DispatchOutcome::Wait(test_set_id)))
    }
}

fn try_member(
    ctx: &mut DispatchContext<'_>,
    test_box: &TestBox,
    item: &QueueItem,
    case: &TestCase,
    variation: &ArgVariation,
) -> anyhow::Result<Option<DispatchOutcome>> {
    let (conn, now) = (ctx.conn, ctx.now);
    let Some(leader_id) = item.gang_leader_test_set_id else {
        return Ok(None);
    };
    let Some(leader) = store::get_test_set(conn, leader_id)? else {
        return Err(SchedError::GangLeaderVanished(leader_id).into());
    };
    if leader.test_box_id == test_box.id {
        return Ok(None);
    }

    let Some(leader_build) = store::get_build(conn, leader.build_id)? else {
        return Err(SchedError::GangLeaderVanished(leader_id).into());
    };
    let Some(build) = store::find_matching_build(conn, &leader_build, &test_box.os, &test_box.arch)? else {
        tracing::debug!(
            "Gang #{}: no build matching #{} for {}.{}",
            leader_id,
            leader_build.id,
            test_box.os,
            test_box.arch
        );
        return Ok(None);
    };

    let member_no = store::gang_members(conn, leader_id)?.len() as i64;
    let savepoint = SavepointGuard::new(conn, "dispatch_member")?;
    let test_set_id = store::create_test_set(
        conn,
        &NewTestSet {
            build_id: build.id,
            validation_kit_build_id: leader.validation_kit_build_id,
            test_box_id: test_box.id,
            test_case_id: case.id,
            test_case_name: case.name.clone(),
            arg_variation_id: variation.id,
            test_group_id: item.test_group_id,
            sched_group_id: item.sched_group_id,
            gang_leader_id: Some(leader_id),
            gang_member_no: member_no,
            gang_size: leader.gang_size,
        },
        now,
    )?;

    let missing = item.missing_gang_members - 1;
    if missing <= 0 {
        queue::rotate_to_tail(conn, item, now)?;
        store::set_test_box_state(conn, test_box.id, TestBoxState::GangTesting, Some(test_set_id), now)?;
        savepoint.release()?;
        tracing::info!("Gang #{} complete with testbox {} as member {}", leader_id, test_box.name, member_no);
        Ok(Some(DispatchOutcome::Exec(test_set_id)))
    } else {
        queue::set_gang_state(conn, item.item_id, Some(leader_id), missing)?;
        store::set_test_box_state(conn, test_box.id, TestBoxState::GangGathering, Some(test_set_id), now)?;
        savepoint.release()?;
        tracing::info!(
            "Testbox {} joined gang #{} as member {}, waiting for {} more",
            test_box.name,
            leader_id,
            member_no,
            missing
        );
        Ok(Some(DispatchOutcome::Wait(test_set_id)))
    }
}
