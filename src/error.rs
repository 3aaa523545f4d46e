use crate::model::{SchedGroupId, TestBoxId, TestSetId};

#[macro_export]
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        type_name_of(f)
            .rsplit("::")
            .find(|&part| part != "f" && part != "{{closure}}")
            .expect("Short function name")
    }};
}

#[macro_export]
macro_rules! bail_loc {
    ($msg:expr) => {
        anyhow::bail!("[{}:{} - {}] {}", file!(), function_name!(), line!(), $msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        anyhow::bail!("[{}:{} - {}] {}", file!(), function_name!(), line!(), format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! anyhow_loc {
    ($msg:expr) => {
        anyhow::anyhow!("[{}:{} - {}] {}", file!(), function_name!(), line!(), $msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        anyhow::anyhow!("[{}:{} - {}] {}", file!(), function_name!(), line!(), format!($fmt, $($arg)*))
    };
}

/// Typed scheduler failures that callers inspect with `anyhow::Error::downcast_ref`.
///
/// Store failures (SQLite errors, lock timeouts) are not listed here; they travel as
/// plain `anyhow::Error` and abort the operation, rolling back its transaction.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// The poll observed state that changed underneath it. The poll is abandoned and
    /// the testbox is expected to ask again.
    #[error("consistency violation for testbox #{test_box_id}: {reason}")]
    ConsistencyViolation { test_box_id: TestBoxId, reason: String },

    #[error("gang leader test set #{0} vanished while its gang was gathering")]
    GangLeaderVanished(TestSetId),

    #[error("scheduling group #{0} does not exist")]
    UnknownSchedGroup(SchedGroupId),

    #[error("testbox #{0} does not exist")]
    UnknownTestBox(TestBoxId),
}

impl SchedError {
    /// True for conditions that end the current poll quietly with no work.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedError::ConsistencyViolation { .. } | SchedError::GangLeaderVanished(_)
        )
    }
}
