//! Tests for req_expr.rs

use crate::req_expr::*;
use crate::{assert_err, assert_ok};
use std::collections::HashMap;

struct Props(HashMap<&'static str, ReqValue>);

impl PropertySource for Props {
    fn property(&self, name: &str) -> Option<ReqValue> {
        self.0.get(name).cloned()
    }
}

fn linux_box() -> Props {
    Props(HashMap::from([
        ("os", ReqValue::Str("linux".to_owned())),
        ("arch", ReqValue::Str("amd64".to_owned())),
        ("cpu_count", ReqValue::Int(8)),
        ("has_iommu", ReqValue::Bool(false)),
        ("gpu.model", ReqValue::Str("1080".to_owned())),
    ]))
}

fn eval(src: &str) -> anyhow::Result<bool> {
    ReqExpr::parse(src)?.evaluate(&linux_box())
}

#[test]
fn req_expr_comparisons() -> anyhow::Result<()> {
    assert!(eval(r#"os == "linux""#)?);
    assert!(eval("os != 'windows'")?);
    assert!(eval("cpu_count >= 8")?);
    assert!(!eval("cpu_count > 8")?);
    assert!(eval("cpu_count < 9 && cpu_count <= 8")?);
    assert!(eval("has_iommu == false")?);
    Ok(())
}

#[test]
fn req_expr_boolean_logic() -> anyhow::Result<()> {
    assert!(eval(r#"os == "linux" and not has_iommu"#)?);
    assert!(eval(r#"os == "windows" or arch == "amd64""#)?);
    assert!(!eval(r#"!(os == "linux")"#)?);
    assert!(eval(r#"(os == "windows" or os == "linux") and cpu_count > 2"#)?);
    assert!(eval("true || false")?);
    Ok(())
}

#[test]
fn req_expr_in_operator() -> anyhow::Result<()> {
    assert!(eval(r#"os in ["linux", "solaris"]"#)?);
    assert!(!eval(r#"arch in ["x86", "arm64"]"#)?);
    assert!(eval("cpu_count in [4, 8, 16]")?);
    assert!(eval(r#""md" in arch"#)?);
    Ok(())
}

#[test]
fn req_expr_string_properties_compare_with_numbers() -> anyhow::Result<()> {
    assert!(eval("gpu.model >= 1000")?);
    assert_err!(eval("os > 3"));
    Ok(())
}

#[test]
fn req_expr_short_circuits_unknown_properties() -> anyhow::Result<()> {
    assert!(!eval("has_iommu and iommu_groups > 2")?);
    assert!(eval("not has_iommu or iommu_groups > 2")?);
    assert_err!(eval("iommu_groups > 2"));
    Ok(())
}

#[test]
fn req_expr_parse_errors() {
    assert_err!(ReqExpr::parse("os =="));
    assert_err!(ReqExpr::parse("(os == 'linux'"));
    assert_err!(ReqExpr::parse("os == 'linux' cpu_count"));
    assert_err!(ReqExpr::parse("os ~ 'linux'"));
    assert_ok!(ReqExpr::parse("os == 'linux'"));

    let err = ReqExpr::parse("os == ").unwrap_err().to_string();
    assert!(err.contains("Invalid requirement expression"), "{}", err);
}

#[test]
fn req_expr_non_boolean_result_is_error() {
    assert_err!(eval("cpu_count"));
    assert_err!(eval("[1, 2]"));
}

#[test]
fn requirement_wrapper() {
    let props = linux_box();

    assert!(matches!(Requirement::parse(None), Requirement::Always));
    assert!(matches!(Requirement::parse(Some("   ")), Requirement::Always));
    assert!(Requirement::parse(None).matches(&props));

    let good = Requirement::parse(Some("os == 'linux'"));
    assert!(good.matches(&props));
    assert!(good.parse_error().is_none());

    let bad = Requirement::parse(Some("os =="));
    assert!(!bad.matches(&props));
    assert!(bad.parse_error().is_some());

    // Evaluation failures never match.
    let unknown = Requirement::parse(Some("ram_gb > 4"));
    assert!(unknown.parse_error().is_none());
    assert!(!unknown.matches(&props));
}
