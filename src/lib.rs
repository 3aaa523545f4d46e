#![allow(dead_code)]
#![allow(unused_imports)]

pub mod build_cache;
pub mod catalog;
pub mod catalog_import;
pub mod config;
pub mod deps;
pub mod dispatch;
pub mod error;
pub mod group_picker;
pub mod logging;
pub mod model;
pub mod queue;
pub mod req_expr;
pub mod scheduler;
pub mod store;
pub mod util;

pub use error::SchedError;
pub use model::Decision;
pub use queue::RebuildReport;
pub use scheduler::{GroupLocks, Scheduler};

#[cfg(test)]
mod config_tests;
#[cfg(test)]
mod deps_tests;
#[cfg(test)]
mod req_expr_tests;
#[cfg(test)]
mod scheduler_tests;
#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod util_tests;
