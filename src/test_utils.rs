//! Shared test utilities and macros.

use crate::catalog::CatalogSnapshot;
use crate::catalog_import::*;
use crate::config::SchedConfig;
use crate::model::*;
use crate::scheduler::Scheduler;
use crate::store::SchedDb;
use std::collections::BTreeMap;

/// Asserts that a Result is Ok, printing the error if not.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        assert!($result.is_ok(), "Expected Ok, got Err: {:#?}", $result);
    };
}

/// Asserts that a Result is Err, printing the value if not.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        assert!($result.is_err(), "Expected Err, got Ok: {:#?}", $result);
    };
}

/// Catalog import time used by every fixture. Builds are created before it, polls
/// happen after it.
pub const T0: Timestamp = 1_700_000_000;

pub const PRODUCT: &str = "VirtualBox";
pub const BRANCH: &str = "trunk";

pub fn sched_group(id: SchedGroupId, members: Vec<SchedGroupMemberDoc>) -> SchedGroupDoc {
    SchedGroupDoc {
        id,
        name: format!("group-{}", id),
        enabled: true,
        strategy: SchedulerStrategy::BestEffortCi,
        build_source_id: Some(1),
        validation_kit_build_source_id: None,
        members,
    }
}

pub fn member(test_group_id: TestGroupId, priority: i64, prereq: Option<TestGroupId>) -> SchedGroupMemberDoc {
    SchedGroupMemberDoc {
        test_group_id,
        priority,
        prereq_test_group_id: prereq,
        hours: None,
    }
}

pub fn test_group(id: TestGroupId, test_case_ids: &[TestCaseId]) -> TestGroupDoc {
    TestGroupDoc {
        id,
        name: format!("tg-{}", id),
        members: test_case_ids
            .iter()
            .map(|&test_case_id| TestGroupMemberDoc {
                test_case_id,
                priority: 0,
                arg_variation_ids: None,
            })
            .collect(),
    }
}

/// A test case with one argument variation whose id is `id * 10`.
pub fn test_case(id: TestCaseId) -> TestCaseDoc {
    TestCaseDoc {
        id,
        name: format!("tc-{}", id),
        enabled: true,
        base_cmd: format!("tdTest{}.py", id),
        validation_kit_zips: None,
        timeout_secs: 600,
        test_box_req_expr: None,
        build_req_expr: None,
        prereq_test_case_ids: Vec::new(),
        arg_variations: vec![variation(id * 10)],
    }
}

pub fn variation(id: ArgVariationId) -> ArgVariationDoc {
    ArgVariationDoc {
        id,
        args: format!("--variation {}", id),
        timeout_secs: None,
        gang_size: 1,
        global_resource_ids: Vec::new(),
        test_box_req_expr: None,
        build_req_expr: None,
    }
}

pub fn build_source(id: BuildSourceId) -> BuildSource {
    BuildSource {
        id,
        name: format!("source-{}", id),
        product: PRODUCT.to_owned(),
        branch: Some(BRANCH.to_owned()),
        build_types: vec!["release".to_owned()],
        os_arches: None,
        first_revision: None,
        last_revision: None,
        max_age_secs: None,
    }
}

/// A linux.amd64 release build created `age` seconds before [`T0`].
pub fn build(id: BuildId, revision: i64, age: i64) -> Build {
    Build {
        id,
        product: PRODUCT.to_owned(),
        branch: BRANCH.to_owned(),
        build_type: "release".to_owned(),
        os: "linux".to_owned(),
        arch: "amd64".to_owned(),
        revision,
        version: "7.1.0".to_owned(),
        binaries: format!("r{}/VirtualBox-linux.run", revision),
        ts_created: T0 - age,
        deleted: false,
    }
}

/// A linux.amd64 testbox in scheduling group 1.
pub fn test_box(id: TestBoxId) -> TestBoxDoc {
    TestBoxDoc {
        test_box: TestBox {
            id,
            generation_id: 1,
            name: format!("tb-{}", id),
            ip: format!("10.0.0.{}", id),
            os: "linux".to_owned(),
            arch: "amd64".to_owned(),
            cpu_vendor: "GenuineIntel".to_owned(),
            cpu_count: 8,
            mem_mb: 16384,
            scratch_mb: 100_000,
            has_hw_virt: true,
            has_nested_paging: true,
            has_64bit_guest: true,
            has_iommu: false,
            timeout_scale_pct: 100,
            enabled: true,
            properties: BTreeMap::new(),
        },
        sched_groups: vec![TestBoxMembershipDoc {
            sched_group_id: 1,
            priority: 16,
        }],
    }
}

/// Scheduling group 1 with the given test groups (each member priority 0, no
/// prerequisites), one build source, one build and one testbox.
pub fn basic_catalog(test_groups: Vec<TestGroupDoc>, test_cases: Vec<TestCaseDoc>) -> CatalogImport {
    let members = test_groups.iter().map(|g| member(g.id, 0, None)).collect();
    CatalogImport {
        sched_groups: vec![sched_group(1, members)],
        test_groups,
        test_cases,
        build_sources: vec![build_source(1)],
        blacklist: Vec::new(),
        builds: vec![build(100, 1000, 60)],
        test_boxes: vec![test_box(1)],
        global_resources: Vec::new(),
    }
}

pub fn open_db(doc: &CatalogImport) -> anyhow::Result<SchedDb> {
    let mut db = SchedDb::open_in_memory()?;
    let tx = db.conn_mut().transaction()?;
    import_catalog(&tx, doc, T0)?;
    tx.commit()?;
    Ok(db)
}

pub fn open_scheduler(doc: &CatalogImport) -> anyhow::Result<Scheduler> {
    Ok(Scheduler::new(open_db(doc)?, SchedConfig::default()))
}

pub fn snapshot(db: &SchedDb, sched_group_id: SchedGroupId) -> anyhow::Result<CatalogSnapshot> {
    CatalogSnapshot::load(db.conn(), sched_group_id, T0)?
        .ok_or_else(|| anyhow::anyhow!("sched group #{} missing", sched_group_id))
}
