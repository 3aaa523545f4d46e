use crate::req_expr::{PropertySource, ReqValue, Requirement};
use crate::{anyhow_loc, function_name};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

// ----------------------------------------------------------------------------
// ids
// ----------------------------------------------------------------------------
/// Seconds since the unix epoch.
pub type Timestamp = i64;

pub type SchedGroupId = i64;
pub type TestGroupId = i64;
pub type TestCaseId = i64;
pub type ArgVariationId = i64;
pub type QueueItemId = i64;
pub type TestSetId = i64;
pub type TestResultId = i64;
pub type BuildId = i64;
pub type BuildSourceId = i64;
pub type TestBoxId = i64;
pub type GlobalResourceId = i64;

/// Sentinel os for builds that run on any os (validation kits, scripts).
pub const OS_AGNOSTIC: &str = "os-agnostic";

/// Sentinel arch for builds that run on any arch.
pub const ARCH_AGNOSTIC: &str = "noarch";

// ----------------------------------------------------------------------------
// statuses
// ----------------------------------------------------------------------------
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    Running,
    Success,
    Skipped,
    BadTestbox,
    Aborted,
    Failure,
    TimedOut,
    Rebooted,
    GangGatheringTimedout,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Running => "running",
            TestStatus::Success => "success",
            TestStatus::Skipped => "skipped",
            TestStatus::BadTestbox => "bad-testbox",
            TestStatus::Aborted => "aborted",
            TestStatus::Failure => "failure",
            TestStatus::TimedOut => "timed-out",
            TestStatus::Rebooted => "rebooted",
            TestStatus::GangGatheringTimedout => "gang-gathering-timedout",
        }
    }

    /// Outcomes that let a dependent test run against the same build.
    pub fn is_passing(&self) -> bool {
        matches!(self, TestStatus::Success | TestStatus::Skipped)
    }

    /// Outcomes that block dependent tests against the same build.
    pub fn is_blocking_failure(&self) -> bool {
        matches!(self, TestStatus::Failure | TestStatus::TimedOut | TestStatus::Rebooted)
    }
}

impl FromStr for TestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TestStatus::Running),
            "success" => Ok(TestStatus::Success),
            "skipped" => Ok(TestStatus::Skipped),
            "bad-testbox" => Ok(TestStatus::BadTestbox),
            "aborted" => Ok(TestStatus::Aborted),
            "failure" => Ok(TestStatus::Failure),
            "timed-out" => Ok(TestStatus::TimedOut),
            "rebooted" => Ok(TestStatus::Rebooted),
            "gang-gathering-timedout" => Ok(TestStatus::GangGatheringTimedout),
            _ => Err(anyhow_loc!("Invalid test status '{}'", s)),
        }
    }
}

/// What a testbox is currently doing, as far as the scheduler is concerned.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestBoxState {
    #[default]
    Idle,
    Testing,
    GangGathering,
    GangTesting,
}

impl TestBoxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestBoxState::Idle => "idle",
            TestBoxState::Testing => "testing",
            TestBoxState::GangGathering => "gang-gathering",
            TestBoxState::GangTesting => "gang-testing",
        }
    }
}

impl FromStr for TestBoxState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TestBoxState::Idle),
            "testing" => Ok(TestBoxState::Testing),
            "gang-gathering" => Ok(TestBoxState::GangGathering),
            "gang-testing" => Ok(TestBoxState::GangTesting),
            _ => Err(anyhow_loc!("Invalid testbox state '{}'", s)),
        }
    }
}

/// The closed set of scheduling strategies a scheduling group can select.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SchedulerStrategy {
    /// Best effort continuous integration: round robin over the queue, newest
    /// acceptable build first.
    #[default]
    #[serde(rename = "best-effort-ci")]
    BestEffortCi,
}

impl SchedulerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStrategy::BestEffortCi => "best-effort-ci",
        }
    }
}

impl FromStr for SchedulerStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best-effort-ci" => Ok(SchedulerStrategy::BestEffortCi),
            _ => Err(anyhow_loc!("Unknown scheduler strategy '{}'", s)),
        }
    }
}

// ----------------------------------------------------------------------------
// hourly schedule
// ----------------------------------------------------------------------------
pub const HOURS_PER_WEEK: usize = 7 * 24;

/// One bit per hour of the week, hour 0 being Monday 00:00-00:59 UTC.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HourlySchedule([u8; HOURS_PER_WEEK / 8]);

impl HourlySchedule {
    pub fn from_hours(hours: &[u8]) -> anyhow::Result<Self> {
        let mut bits = [0u8; HOURS_PER_WEEK / 8];
        for &hour in hours {
            let hour = hour as usize;
            if hour >= HOURS_PER_WEEK {
                return Err(anyhow_loc!("Hour of week {} is out of range", hour));
            }
            bits[hour / 8] |= 1 << (hour % 8);
        }
        Ok(HourlySchedule(bits))
    }

    pub fn from_blob(blob: &[u8]) -> anyhow::Result<Self> {
        let bits: [u8; HOURS_PER_WEEK / 8] = blob
            .try_into()
            .map_err(|_| anyhow_loc!("Hourly schedule blob has {} bytes", blob.len()))?;
        Ok(HourlySchedule(bits))
    }

    pub fn as_blob(&self) -> &[u8] {
        &self.0
    }

    pub fn is_active(&self, hour_of_week: usize) -> bool {
        let hour = hour_of_week % HOURS_PER_WEEK;
        self.0[hour / 8] & (1 << (hour % 8)) != 0
    }
}

// ----------------------------------------------------------------------------
// catalog entities
// ----------------------------------------------------------------------------
#[derive(Clone, Debug)]
pub struct SchedGroup {
    pub id: SchedGroupId,
    pub name: String,
    pub enabled: bool,
    pub strategy: SchedulerStrategy,
    pub build_source_id: Option<BuildSourceId>,
    pub validation_kit_build_source_id: Option<BuildSourceId>,
}

/// A test group as configured inside one scheduling group.
#[derive(Clone, Debug)]
pub struct TestGroup {
    pub id: TestGroupId,
    pub name: String,
    pub priority: i64,
    pub prereq_group_id: Option<TestGroupId>,
    pub hourly_schedule: Option<HourlySchedule>,
    /// Sorted by descending priority, then id.
    pub members: Vec<TestGroupMember>,
}

#[derive(Clone, Debug)]
pub struct TestGroupMember {
    pub test_case_id: TestCaseId,
    pub priority: i64,
    /// Restricts the member to these variations; `None` means all of them.
    pub arg_variation_ids: Option<Vec<ArgVariationId>>,
}

#[derive(Clone, Debug)]
pub struct TestCase {
    pub id: TestCaseId,
    pub name: String,
    pub enabled: bool,
    pub prereq_test_case_ids: Vec<TestCaseId>,
    pub base_cmd: String,
    pub validation_kit_zips: Option<String>,
    pub timeout_secs: i64,
    pub test_box_req: Requirement,
    pub build_req: Requirement,
}

/// Placeholder in script bundle lists that is replaced by the validation kit build.
pub const VALIDATIONKIT_ZIP_PLACEHOLDER: &str = "@VALIDATIONKIT_ZIP@";
/// Replaced by the chosen build's binaries in script bundles and command lines.
pub const BUILD_BINARIES_PLACEHOLDER: &str = "@BUILD_BINARIES@";
pub const TESTSET_ID_PLACEHOLDER: &str = "@TESTSET_ID@";

impl TestCase {
    pub fn needs_validation_kit(&self) -> bool {
        self.validation_kit_zips
            .as_deref()
            .is_some_and(|zips| zips.contains(VALIDATIONKIT_ZIP_PLACEHOLDER))
    }
}

#[derive(Clone, Debug)]
pub struct ArgVariation {
    pub id: ArgVariationId,
    pub test_case_id: TestCaseId,
    pub args: String,
    pub timeout_secs: Option<i64>,
    pub gang_size: i64,
    pub global_resource_ids: Vec<GlobalResourceId>,
    pub test_box_req: Requirement,
    pub build_req: Requirement,
}

// ----------------------------------------------------------------------------
// builds
// ----------------------------------------------------------------------------
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub product: String,
    pub branch: String,
    pub build_type: String,
    pub os: String,
    pub arch: String,
    pub revision: i64,
    pub version: String,
    /// Comma separated artifact locations.
    pub binaries: String,
    pub ts_created: Timestamp,
    #[serde(default)]
    pub deleted: bool,
}

impl Build {
    pub fn os_arch(&self) -> String {
        format!("{}.{}", self.os, self.arch)
    }

    /// True when the build can run on a machine with the given os and arch.
    pub fn runs_on(&self, os: &str, arch: &str) -> bool {
        (self.os == os || self.os == OS_AGNOSTIC) && (self.arch == arch || self.arch == ARCH_AGNOSTIC)
    }
}

impl PropertySource for Build {
    fn property(&self, name: &str) -> Option<ReqValue> {
        Some(match name {
            "product" => ReqValue::Str(self.product.clone()),
            "branch" => ReqValue::Str(self.branch.clone()),
            "type" => ReqValue::Str(self.build_type.clone()),
            "os" => ReqValue::Str(self.os.clone()),
            "arch" => ReqValue::Str(self.arch.clone()),
            "revision" => ReqValue::Int(self.revision),
            "version" => ReqValue::Str(self.version.clone()),
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildSource {
    pub id: BuildSourceId,
    pub name: String,
    pub product: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Empty means any build type.
    #[serde(default)]
    pub build_types: Vec<String>,
    /// `os.arch` pairs; `None` means any.
    #[serde(default)]
    pub os_arches: Option<Vec<String>>,
    #[serde(default)]
    pub first_revision: Option<i64>,
    #[serde(default)]
    pub last_revision: Option<i64>,
    #[serde(default)]
    pub max_age_secs: Option<i64>,
}

impl BuildSource {
    pub fn accepts_type(&self, build_type: &str) -> bool {
        self.build_types.is_empty() || self.build_types.iter().any(|t| t == build_type)
    }

    pub fn covers_os_arch(&self, os: &str, arch: &str) -> bool {
        match &self.os_arches {
            None => true,
            Some(pairs) => {
                let os_arch = format!("{}.{}", os, arch);
                pairs.iter().any(|p| *p == os_arch)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// testboxes
// ----------------------------------------------------------------------------
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestBox {
    pub id: TestBoxId,
    pub generation_id: i64,
    pub name: String,
    #[serde(default)]
    pub ip: String,
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub cpu_vendor: String,
    #[serde(default = "default_one")]
    pub cpu_count: i64,
    #[serde(default)]
    pub mem_mb: i64,
    #[serde(default)]
    pub scratch_mb: i64,
    #[serde(default)]
    pub has_hw_virt: bool,
    #[serde(default)]
    pub has_nested_paging: bool,
    #[serde(default)]
    pub has_64bit_guest: bool,
    #[serde(default)]
    pub has_iommu: bool,
    #[serde(default = "default_timeout_scale_pct")]
    pub timeout_scale_pct: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_one() -> i64 {
    1
}

fn default_timeout_scale_pct() -> i64 {
    100
}

fn default_true() -> bool {
    true
}

impl PropertySource for TestBox {
    fn property(&self, name: &str) -> Option<ReqValue> {
        Some(match name {
            "name" => ReqValue::Str(self.name.clone()),
            "os" => ReqValue::Str(self.os.clone()),
            "arch" => ReqValue::Str(self.arch.clone()),
            "cpu_vendor" => ReqValue::Str(self.cpu_vendor.clone()),
            "cpu_count" => ReqValue::Int(self.cpu_count),
            "mem_mb" => ReqValue::Int(self.mem_mb),
            "scratch_mb" => ReqValue::Int(self.scratch_mb),
            "has_hw_virt" => ReqValue::Bool(self.has_hw_virt),
            "has_nested_paging" => ReqValue::Bool(self.has_nested_paging),
            "has_64bit_guest" => ReqValue::Bool(self.has_64bit_guest),
            "has_iommu" => ReqValue::Bool(self.has_iommu),
            _ => ReqValue::Str(self.properties.get(name)?.clone()),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TestBoxInSchedGroup {
    pub sched_group_id: SchedGroupId,
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Everything the scheduler needs to know about a polling testbox.
#[derive(Clone, Debug)]
pub struct TestBoxView {
    pub test_box: TestBox,
    pub sched_groups: Vec<TestBoxInSchedGroup>,
}

#[derive(Clone, Debug)]
pub struct TestBoxStatus {
    pub test_box_id: TestBoxId,
    pub generation_id: i64,
    pub state: TestBoxState,
    pub test_set_id: Option<TestSetId>,
    pub sched_group_index: i64,
}

// ----------------------------------------------------------------------------
// queue and execution records
// ----------------------------------------------------------------------------
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub item_id: QueueItemId,
    pub sched_group_id: SchedGroupId,
    pub offset: i64,
    pub arg_variation_id: ArgVariationId,
    pub test_group_id: TestGroupId,
    /// Transitive prerequisite test groups of `test_group_id`, nearest first.
    pub test_group_prereqs: Vec<TestGroupId>,
    pub hourly_schedule: Option<HourlySchedule>,
    pub ts_config: Timestamp,
    pub ts_last_scheduled: Option<Timestamp>,
    pub gang_leader_test_set_id: Option<TestSetId>,
    pub missing_gang_members: i64,
}

impl QueueItem {
    pub fn is_gathering(&self) -> bool {
        self.gang_leader_test_set_id.is_some()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TestSet {
    pub id: TestSetId,
    pub ts_created: Timestamp,
    pub ts_done: Option<Timestamp>,
    pub status: TestStatus,
    pub build_id: BuildId,
    pub validation_kit_build_id: Option<BuildId>,
    pub test_box_id: TestBoxId,
    pub test_case_id: TestCaseId,
    pub arg_variation_id: ArgVariationId,
    pub test_group_id: TestGroupId,
    pub sched_group_id: SchedGroupId,
    pub gang_leader_id: Option<TestSetId>,
    pub gang_member_no: i64,
    pub gang_size: i64,
    pub test_result_id: Option<TestResultId>,
}

impl TestSet {
    /// The id every member of this test set's gang points at.
    pub fn gang_id(&self) -> TestSetId {
        self.gang_leader_id.unwrap_or(self.id)
    }
}

// ----------------------------------------------------------------------------
// decisions
// ----------------------------------------------------------------------------
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ExecCommand {
    pub test_set_id: TestSetId,
    pub script_bundle_ref: String,
    pub command_line: String,
    pub timeout_secs: i64,
}

/// What a polling testbox is told to do.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum Decision {
    Exec(ExecCommand),
    /// Joined a gang that is still gathering; poll again.
    Wait,
    /// Nothing to do right now.
    None,
}
