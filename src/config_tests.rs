//! Tests for config.rs

use crate::config::SchedConfig;
use crate::logging::LogFormat;
use crate::{assert_err, assert_ok};

#[test]
fn empty_config_uses_defaults() -> anyhow::Result<()> {
    let config = SchedConfig::from_json("{}")?;
    assert_eq!(config.db_path.as_str(), "testfarm.db");
    assert_eq!(config.poll_time_budget_ms, 10_000);
    assert_eq!(config.gang_gathering_timeout_secs, 1800);
    assert_eq!(config.build_page_size, 16);
    assert!(!config.verify_build_artifacts);
    assert!(config.build_root.is_none());
    Ok(())
}

#[test]
fn config_overrides() -> anyhow::Result<()> {
    let config = SchedConfig::from_json(
        r#"{
            "db_path": "/var/lib/testfarm/sched.db",
            "build_root": "/srv/builds",
            "verify_build_artifacts": true,
            "poll_time_budget_ms": 250,
            "logging": { "level": "debug", "format": "json" }
        }"#,
    )?;
    assert_eq!(config.db_path.as_str(), "/var/lib/testfarm/sched.db");
    assert_eq!(config.build_root.as_ref().map(|p| p.as_str()), Some("/srv/builds"));
    assert!(config.verify_build_artifacts);
    assert_eq!(config.poll_time_budget().as_millis(), 250);
    assert!(matches!(config.logging.format, LogFormat::Json));
    Ok(())
}

#[test]
fn config_rejects_unknown_fields_and_zero_page() {
    assert_err!(SchedConfig::from_json(r#"{ "db": "x" }"#));
    assert_err!(SchedConfig::from_json(r#"{ "build_page_size": 0 }"#));
    assert_ok!(SchedConfig::from_json(r#"{ "build_page_size": 1 }"#));
}
