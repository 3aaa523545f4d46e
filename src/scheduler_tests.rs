//! Tests for scheduler.rs

use crate::catalog_import::*;
use crate::config::SchedConfig;
use crate::error::SchedError;
use crate::model::*;
use crate::queue;
use crate::scheduler::*;
use crate::store;
use crate::test_utils::*;
use crate::{assert_err, assert_ok};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const T1: Timestamp = T0 + 10;

fn gang_catalog(gang_size: i64, test_boxes: i64) -> CatalogImport {
    let mut case = test_case(1);
    case.arg_variations[0].gang_size = gang_size;
    let mut doc = basic_catalog(vec![test_group(1, &[1])], vec![case]);
    doc.test_boxes = (1..=test_boxes).map(test_box).collect();
    doc
}

fn ready(doc: &CatalogImport) -> anyhow::Result<Scheduler> {
    let mut scheduler = open_scheduler(doc)?;
    scheduler.rebuild_queue(1, T0)?;
    Ok(scheduler)
}

fn current_test_set(scheduler: &Scheduler, test_box_id: TestBoxId) -> anyhow::Result<Option<TestSetId>> {
    Ok(store::get_test_box_status(scheduler.db().conn(), test_box_id)?.and_then(|s| s.test_set_id))
}

fn test_set_status(scheduler: &Scheduler, id: TestSetId) -> anyhow::Result<Option<TestStatus>> {
    Ok(store::get_test_set(scheduler.db().conn(), id)?.map(|ts| ts.status))
}

#[test]
fn rebuild_unknown_group_fails() -> anyhow::Result<()> {
    let mut scheduler = open_scheduler(&basic_catalog(Vec::new(), Vec::new()))?;
    let err = match scheduler.rebuild_queue(77, T0) {
        Ok(report) => anyhow::bail!("unexpected report {:?}", report),
        Err(err) => err,
    };
    assert!(matches!(err.downcast_ref::<SchedError>(), Some(SchedError::UnknownSchedGroup(77))));
    Ok(())
}

#[test]
fn poll_unknown_test_box_fails() -> anyhow::Result<()> {
    let mut scheduler = ready(&basic_catalog(vec![test_group(1, &[1])], vec![test_case(1)]))?;
    let result = scheduler.poll_test_box(5, T1);
    assert_err!(result);
    Ok(())
}

#[test]
fn disabled_test_box_gets_nothing() -> anyhow::Result<()> {
    let mut doc = basic_catalog(vec![test_group(1, &[1])], vec![test_case(1)]);
    doc.test_boxes[0].test_box.enabled = false;
    let mut scheduler = ready(&doc)?;
    assert_eq!(scheduler.poll_test_box(1, T1)?, Decision::None);
    Ok(())
}

#[test]
fn disabled_sched_group_gets_nothing() -> anyhow::Result<()> {
    let mut doc = basic_catalog(vec![test_group(1, &[1])], vec![test_case(1)]);
    let mut scheduler = ready(&doc)?;
    doc.sched_groups[0].enabled = false;
    scheduler.import_catalog(&doc, T1)?;
    assert_eq!(scheduler.poll_test_box(1, T1)?, Decision::None);
    Ok(())
}

#[test]
fn stale_generation_abandons_poll() -> anyhow::Result<()> {
    let doc = basic_catalog(vec![test_group(1, &[1])], vec![test_case(1)]);
    let mut scheduler = ready(&doc)?;
    let mut view = store::load_test_box_view(scheduler.db().conn(), 1, T1)?
        .ok_or_else(|| anyhow::anyhow!("no testbox"))?;
    view.test_box.generation_id += 1;

    assert_eq!(scheduler.poll(&view, T1)?, Decision::None);
    // Nothing was dispatched.
    assert_eq!(queue::load_queue(scheduler.db().conn(), 1)?[0].ts_last_scheduled, None);
    Ok(())
}

#[test]
fn polling_while_testing_aborts_previous_test_set() -> anyhow::Result<()> {
    let mut scheduler = ready(&basic_catalog(vec![test_group(1, &[1])], vec![test_case(1)]))?;
    let Decision::Exec(first) = scheduler.poll_test_box(1, T1)? else {
        anyhow::bail!("expected exec");
    };
    let Decision::Exec(second) = scheduler.poll_test_box(1, T1 + 5)? else {
        anyhow::bail!("expected exec");
    };
    assert_ne!(first.test_set_id, second.test_set_id);
    assert_eq!(test_set_status(&scheduler, first.test_set_id)?, Some(TestStatus::Aborted));
    assert_eq!(test_set_status(&scheduler, second.test_set_id)?, Some(TestStatus::Running));
    Ok(())
}

#[test]
fn sweeper_times_out_stale_gangs() -> anyhow::Result<()> {
    let mut scheduler = ready(&gang_catalog(3, 2))?;
    assert_eq!(scheduler.poll_test_box(1, T1)?, Decision::Wait);
    assert_eq!(scheduler.poll_test_box(2, T1 + 1)?, Decision::Wait);
    let leader = current_test_set(&scheduler, 1)?.ok_or_else(|| anyhow::anyhow!("no leader"))?;
    let member = current_test_set(&scheduler, 2)?.ok_or_else(|| anyhow::anyhow!("no member"))?;

    assert_eq!(scheduler.sweep_gang_timeouts(T1 + 60)?, 0);

    let timeout = scheduler.config().gang_gathering_timeout_secs;
    assert_eq!(scheduler.sweep_gang_timeouts(T1 + timeout)?, 1);
    assert_eq!(test_set_status(&scheduler, leader)?, Some(TestStatus::GangGatheringTimedout));
    assert_eq!(test_set_status(&scheduler, member)?, Some(TestStatus::GangGatheringTimedout));
    assert_eq!(current_test_set(&scheduler, 1)?, None);
    assert_eq!(current_test_set(&scheduler, 2)?, None);
    assert!(queue::groups_with_gangs(scheduler.db().conn())?.is_empty());

    // Both testboxes can start over.
    assert_eq!(scheduler.poll_test_box(2, T1 + timeout + 1)?, Decision::Wait);
    assert_eq!(scheduler.sweep_gang_timeouts(T1 + timeout + 2)?, 0);
    Ok(())
}

#[test]
fn sweep_rechecks_gathering_groups_under_locks() -> anyhow::Result<()> {
    let mut scheduler = ready(&gang_catalog(3, 2))?;
    assert_eq!(scheduler.poll_test_box(1, T1)?, Decision::Wait);
    let leader = current_test_set(&scheduler, 1)?.ok_or_else(|| anyhow::anyhow!("no leader"))?;
    let timeout = scheduler.config().gang_gathering_timeout_secs;

    // Group 1 started gathering after the unlocked read that found no gangs.
    assert_eq!(scheduler.sweep_groups(&[], T1 + timeout)?, Err(vec![1]));
    assert_eq!(test_set_status(&scheduler, leader)?, Some(TestStatus::Running));
    assert_eq!(current_test_set(&scheduler, 1)?, Some(leader));

    assert_eq!(scheduler.sweep_groups(&[1], T1 + timeout)?, Ok(1));
    assert_eq!(test_set_status(&scheduler, leader)?, Some(TestStatus::GangGatheringTimedout));
    Ok(())
}

#[test]
fn rebuild_times_out_gathering_gang() -> anyhow::Result<()> {
    let mut scheduler = ready(&gang_catalog(2, 2))?;
    assert_eq!(scheduler.poll_test_box(1, T1)?, Decision::Wait);
    let leader = current_test_set(&scheduler, 1)?.ok_or_else(|| anyhow::anyhow!("no leader"))?;

    let report = scheduler.rebuild_queue(1, T1 + 1)?;
    assert!(report.is_ok());
    assert_eq!(test_set_status(&scheduler, leader)?, Some(TestStatus::GangGatheringTimedout));

    assert_eq!(current_test_set(&scheduler, 1)?, None);

    // The former leader is idle again and starts a new gang.
    assert_eq!(scheduler.poll_test_box(1, T1 + 2)?, Decision::Wait);
    assert_ne!(current_test_set(&scheduler, 1)?, Some(leader));
    Ok(())
}

#[test]
fn rebuild_with_config_errors_keeps_queue() -> anyhow::Result<()> {
    let mut doc = basic_catalog(vec![test_group(1, &[1]), test_group(2, &[2])], vec![test_case(1), test_case(2)]);
    let mut scheduler = ready(&doc)?;
    let before = queue::load_queue(scheduler.db().conn(), 1)?.len();

    doc.sched_groups[0].members = vec![member(1, 0, Some(2)), member(2, 0, Some(1))];
    scheduler.import_catalog(&doc, T1)?;
    let report = scheduler.rebuild_queue(1, T1)?;
    assert!(!report.is_ok());
    assert_eq!(queue::load_queue(scheduler.db().conn(), 1)?.len(), before);
    Ok(())
}

#[test]
fn multi_group_test_box_rotates_groups() -> anyhow::Result<()> {
    let mut doc = basic_catalog(vec![test_group(1, &[1]), test_group(2, &[2])], vec![test_case(1), test_case(2)]);
    doc.sched_groups = vec![sched_group(1, vec![member(1, 0, None)]), sched_group(2, vec![member(2, 0, None)])];
    doc.test_boxes[0].sched_groups = vec![
        TestBoxMembershipDoc {
            sched_group_id: 1,
            priority: 0,
        },
        TestBoxMembershipDoc {
            sched_group_id: 2,
            priority: 0,
        },
    ];
    let mut scheduler = open_scheduler(&doc)?;
    scheduler.rebuild_queue(1, T0)?;
    scheduler.rebuild_queue(2, T0)?;

    let mut groups = Vec::new();
    for step in 0..4 {
        let Decision::Exec(command) = scheduler.poll_test_box(1, T1 + step)? else {
            anyhow::bail!("expected exec");
        };
        let ts = store::get_test_set(scheduler.db().conn(), command.test_set_id)?
            .ok_or_else(|| anyhow::anyhow!("no test set"))?;
        store::complete_test_set(scheduler.db().conn(), ts.id, TestStatus::Success, T1 + step)?;
        groups.push(ts.sched_group_id);
    }
    // A fresh testbox status points at index 0, so the first poll starts after it.
    assert_eq!(groups, vec![2, 1, 2, 1]);
    Ok(())
}

#[test]
fn group_locks_serialize_overlapping_sets() -> anyhow::Result<()> {
    let locks = Arc::new(GroupLocks::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..8 {
        let locks = locks.clone();
        let inside = inside.clone();
        handles.push(std::thread::spawn(move || {
            let ids = if i % 2 == 0 { vec![1, 2] } else { vec![2, 1, 1] };
            locks.with_groups(&ids, || {
                let before = inside.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(2));
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok(before)
            })
        }));
    }
    for handle in handles {
        let result = handle.join().map_err(|_| anyhow::anyhow!("thread panicked"))?;
        assert_eq!(result?, 0);
    }
    Ok(())
}

#[test]
fn shared_locks_between_schedulers() -> anyhow::Result<()> {
    let locks = Arc::new(GroupLocks::new());
    let doc = basic_catalog(vec![test_group(1, &[1])], vec![test_case(1)]);
    let mut a = Scheduler::with_locks(open_db(&doc)?, SchedConfig::default(), locks.clone());
    let mut b = Scheduler::with_locks(open_db(&doc)?, SchedConfig::default(), locks);
    assert_ok!(a.rebuild_queue(1, T0));
    assert_ok!(b.rebuild_queue(1, T0));
    Ok(())
}
