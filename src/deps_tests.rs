//! Tests for deps.rs

use crate::catalog_import::*;
use crate::deps::*;
use crate::model::*;
use crate::test_utils::*;
use crate::assert_err;

/// Scheduling group whose test groups 1..=n each require the next, and the last one
/// requires `last_prereq`.
fn chained_groups(n: i64, last_prereq: Option<TestGroupId>) -> CatalogImport {
    let mut doc = basic_catalog(
        (1..=n).map(|id| test_group(id, &[id])).collect(),
        (1..=n).map(test_case).collect(),
    );
    doc.sched_groups[0].members = (1..=n)
        .map(|id| member(id, 0, if id < n { Some(id + 1) } else { last_prereq }))
        .collect();
    doc
}

#[test]
fn group_cycles_report_exactly_one_error() -> anyhow::Result<()> {
    for len in 2..=12 {
        let db = open_db(&chained_groups(len, Some(1)))?;
        let errors = validate(&snapshot(&db, 1)?);
        assert_eq!(errors.len(), 1, "cycle of length {}: {:?}", len, errors);

        let error = &errors[0];
        assert!(error.chain.len() <= 10, "cycle of length {}: {:?}", len, error.chain);
        assert!(matches!(error.entity, ConfigEntity::TestGroup { .. }));
        assert!(matches!(error.kind, ConfigErrorKind::Cycle | ConfigErrorKind::TooDeep));
    }
    Ok(())
}

#[test]
fn short_cycle_chain_names_the_loop() -> anyhow::Result<()> {
    let db = open_db(&chained_groups(3, Some(1)))?;
    let errors = validate(&snapshot(&db, 1)?);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ConfigErrorKind::Cycle);
    assert_eq!(errors[0].chain, vec![1, 2, 3, 1]);
    assert!(errors[0].message.contains("#1 -> #2 -> #3 -> #1"), "{}", errors[0].message);
    Ok(())
}

#[test]
fn prereq_group_outside_sched_group_is_dangling() -> anyhow::Result<()> {
    let db = open_db(&chained_groups(2, Some(99)))?;
    let errors = validate(&snapshot(&db, 1)?);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ConfigErrorKind::Dangling);
    assert_eq!(errors[0].chain, vec![1, 2, 99]);
    Ok(())
}

#[test]
fn chain_depth_limit() -> anyhow::Result<()> {
    // Ten groups in a row is nine hops.
    let db = open_db(&chained_groups(10, None))?;
    assert!(validate(&snapshot(&db, 1)?).is_empty());

    let db = open_db(&chained_groups(12, None))?;
    let errors = validate(&snapshot(&db, 1)?);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ConfigErrorKind::TooDeep);
    assert_eq!(errors[0].chain.len(), MAX_PREREQ_HOPS + 1);
    Ok(())
}

#[test]
fn chain_depth_limit_when_walked_from_the_shallow_end() -> anyhow::Result<()> {
    // Each group requires the one before it, so earlier walks have already cleared the
    // lower part of the chain when the deep end is reached.
    let reversed = |n: i64| {
        let mut doc = chained_groups(n, None);
        doc.sched_groups[0].members = (1..=n)
            .map(|id| member(id, 0, if id > 1 { Some(id - 1) } else { None }))
            .collect();
        doc
    };

    let db = open_db(&reversed(10))?;
    assert!(validate(&snapshot(&db, 1)?).is_empty());

    let db = open_db(&reversed(12))?;
    let errors = validate(&snapshot(&db, 1)?);
    assert_eq!(errors.len(), 1, "{:?}", errors);
    assert_eq!(errors[0].kind, ConfigErrorKind::TooDeep);
    assert_eq!(errors[0].entity, ConfigEntity::TestGroup { test_group_id: 11 });
    assert_eq!(errors[0].chain, (2..=11).rev().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_case_chain_depth_limit() -> anyhow::Result<()> {
    // Case id requires id - 1 within a single test group.
    let cases = |n: i64| -> Vec<TestCaseDoc> {
        (1..=n)
            .map(|id| {
                let mut case = test_case(id);
                if id > 1 {
                    case.prereq_test_case_ids = vec![id - 1];
                }
                case
            })
            .collect()
    };
    let ids = |n: i64| (1..=n).collect::<Vec<TestCaseId>>();

    let db = open_db(&basic_catalog(vec![test_group(5, &ids(10))], cases(10)))?;
    assert!(validate(&snapshot(&db, 1)?).is_empty());

    let db = open_db(&basic_catalog(vec![test_group(5, &ids(11))], cases(11)))?;
    let errors = validate(&snapshot(&db, 1)?);
    assert_eq!(errors.len(), 1, "{:?}", errors);
    assert_eq!(errors[0].kind, ConfigErrorKind::TooDeep);
    assert_eq!(
        errors[0].entity,
        ConfigEntity::TestCase {
            test_group_id: 5,
            test_case_id: 11
        }
    );
    assert_eq!(errors[0].chain.len(), MAX_PREREQ_HOPS + 1);
    Ok(())
}

#[test]
fn shared_prereq_depth_is_counted_per_path() -> anyhow::Result<()> {
    // Case 1 heads a short branch into case 3, case 20 a long one. Both meet at case 3,
    // whose own chain of six hops is fine on its own.
    let mut cases: Vec<TestCaseDoc> = Vec::new();
    let mut link = |id: TestCaseId, prereq: Option<TestCaseId>| {
        let mut case = test_case(id);
        case.prereq_test_case_ids = prereq.into_iter().collect();
        cases.push(case);
    };
    link(1, Some(3));
    for id in 3..=8 {
        link(id, Some(id + 1));
    }
    link(9, None);
    link(20, Some(21));
    link(21, Some(22));
    link(22, Some(23));
    link(23, Some(3));
    let ids: Vec<TestCaseId> = cases.iter().map(|c| c.id).collect();
    let db = open_db(&basic_catalog(vec![test_group(5, &ids)], cases))?;

    let errors = validate(&snapshot(&db, 1)?);
    assert_eq!(errors.len(), 1, "{:?}", errors);
    assert_eq!(errors[0].kind, ConfigErrorKind::TooDeep);
    assert_eq!(errors[0].chain, vec![20, 21, 22, 23, 3, 4, 5, 6, 7, 8]);
    Ok(())
}

#[test]
fn test_case_cycle_within_group() -> anyhow::Result<()> {
    let mut case1 = test_case(1);
    case1.prereq_test_case_ids = vec![2];
    let mut case2 = test_case(2);
    case2.prereq_test_case_ids = vec![1];
    let db = open_db(&basic_catalog(vec![test_group(5, &[1, 2])], vec![case1, case2]))?;

    let errors = validate(&snapshot(&db, 1)?);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ConfigErrorKind::Cycle);
    assert_eq!(
        errors[0].entity,
        ConfigEntity::TestCase {
            test_group_id: 5,
            test_case_id: 1
        }
    );
    Ok(())
}

#[test]
fn test_case_prereq_outside_group() -> anyhow::Result<()> {
    let mut case1 = test_case(1);
    case1.prereq_test_case_ids = vec![3];
    let db = open_db(&basic_catalog(
        vec![test_group(5, &[1, 2]), test_group(6, &[3])],
        vec![case1, test_case(2), test_case(3)],
    ))?;

    let errors = validate(&snapshot(&db, 1)?);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ConfigErrorKind::Dangling);
    assert_eq!(errors[0].chain, vec![1, 3]);
    Ok(())
}

#[test]
fn invalid_requirement_is_reported() -> anyhow::Result<()> {
    let mut case = test_case(1);
    case.arg_variations[0].test_box_req_expr = Some("os ==".to_owned());
    let db = open_db(&basic_catalog(vec![test_group(5, &[1])], vec![case]))?;

    let errors = validate(&snapshot(&db, 1)?);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ConfigErrorKind::InvalidExpression);
    Ok(())
}

#[test]
fn move_after_prereqs_single_pass() -> anyhow::Result<()> {
    let prereqs = |id: i64| match id {
        1 => vec![3],
        _ => vec![],
    };
    let mut ids = vec![1, 2, 3];
    move_after_prereqs(&mut ids, prereqs)?;
    assert_eq!(ids, vec![2, 3, 1]);

    // Entities that are already behind their prerequisites do not move.
    let prereqs = |id: i64| match id {
        2 => vec![4],
        4 => vec![1],
        _ => vec![],
    };
    let mut ids = vec![1, 2, 3, 4];
    move_after_prereqs(&mut ids, prereqs)?;
    assert_eq!(ids, vec![1, 3, 4, 2]);
    Ok(())
}

#[test]
fn move_after_prereqs_rejects_cycles() {
    let prereqs = |id: i64| match id {
        1 => vec![2],
        _ => vec![1],
    };
    let mut ids = vec![1, 2];
    let result = move_after_prereqs(&mut ids, prereqs);
    assert_err!(result);
}

#[test]
fn sort_moves_dependent_group_after_prereq() -> anyhow::Result<()> {
    // Group 2 has the higher priority but depends on group 1.
    let mut doc = basic_catalog(
        vec![test_group(1, &[1]), test_group(2, &[2]), test_group(3, &[3])],
        vec![test_case(1), test_case(2), test_case(3)],
    );
    doc.sched_groups[0].members = vec![member(1, 10, None), member(2, 30, Some(1)), member(3, 20, None)];
    let db = open_db(&doc)?;

    let sorted = sort(&snapshot(&db, 1)?)?;
    assert_eq!(sorted.test_groups, vec![3, 1, 2]);
    Ok(())
}

#[test]
fn sort_orders_test_cases_within_group() -> anyhow::Result<()> {
    let mut case1 = test_case(1);
    case1.prereq_test_case_ids = vec![2];
    let db = open_db(&basic_catalog(
        vec![test_group(5, &[1, 2, 3])],
        vec![case1, test_case(2), test_case(3)],
    ))?;

    let sorted = validate_and_sort(&snapshot(&db, 1)?)?.map_err(|errors| anyhow::anyhow!("{:?}", errors))?;
    assert_eq!(sorted.test_cases[&5], vec![2, 1, 3]);
    Ok(())
}
