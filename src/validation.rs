//! Input validation for sandbox and pool specs.
//!
//! Everything a client declares that ends up in pod specs, label values, or
//! shell commands passes through here first. Validation failures are
//! terminal: the resource is parked in Failed rather than retried.

use crate::crd::{SandboxSpec, WarmPoolSpec};
use crate::errors::Error;
use crate::runtimes;

/// Maximum length for sandbox and pool names (DNS label)
const MAX_NAME_LEN: usize = 63;

/// Quantity suffixes accepted by the resource grammar
const QUANTITY_SUFFIXES: &[&str] = &[
    "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E",
];

/// Validate a sandbox or pool name.
///
/// Names become pod names and label values, so they follow DNS-label rules:
/// lowercase alphanumerics and hyphens, starting and ending alphanumeric,
/// at most 63 characters.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Validation("name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "name too long (max {} characters)",
            MAX_NAME_LEN
        )));
    }
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    if !name.chars().all(valid_char) {
        return Err(Error::Validation(format!(
            "name '{}' may only contain lowercase alphanumerics and hyphens",
            name
        )));
    }
    let first = name.chars().next().unwrap();
    let last = name.chars().last().unwrap();
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(Error::Validation(format!(
            "name '{}' must start and end with an alphanumeric character",
            name
        )));
    }
    Ok(())
}

/// Validate a full sandbox spec.
pub fn validate_sandbox(spec: &SandboxSpec) -> Result<(), Error> {
    if !runtimes::is_known(&spec.runtime) {
        return Err(Error::Validation(format!(
            "unknown runtime '{}' (supported: {})",
            spec.runtime,
            runtimes::known_names().join(", ")
        )));
    }

    validate_quantity("resources.cpu", &spec.resources.cpu)?;
    validate_quantity("resources.memory", &spec.resources.memory)?;
    if let Some(ref storage) = spec.resources.ephemeral_storage {
        validate_quantity("resources.ephemeralStorage", storage)?;
    }

    for (i, rule) in spec.network_access.egress.iter().enumerate() {
        validate_egress_rule(i, rule)?;
    }

    for path in &spec.filesystem.writable_paths {
        if !path.starts_with('/') {
            return Err(Error::Validation(format!(
                "writable path '{}' must be absolute",
                path
            )));
        }
        if path == "/" {
            return Err(Error::Validation(
                "writable path cannot be the filesystem root".to_string(),
            ));
        }
    }

    Ok(())
}

/// Validate a warm pool spec.
pub fn validate_pool(spec: &WarmPoolSpec) -> Result<(), Error> {
    if !runtimes::is_known(&spec.runtime) {
        return Err(Error::Validation(format!(
            "unknown runtime '{}'",
            spec.runtime
        )));
    }
    if spec.max_size > 0 && spec.max_size < spec.min_size {
        return Err(Error::Validation(format!(
            "maxSize {} is smaller than minSize {}",
            spec.max_size, spec.min_size
        )));
    }
    validate_quantity("resources.cpu", &spec.resources.cpu)?;
    validate_quantity("resources.memory", &spec.resources.memory)?;
    if let Some(ref auto) = spec.auto_scaling {
        if auto.target_utilization_percent == 0 || auto.target_utilization_percent > 100 {
            return Err(Error::Validation(format!(
                "targetUtilizationPercent {} must be in 1..=100",
                auto.target_utilization_percent
            )));
        }
    }
    for script in &spec.preload_scripts {
        if script.name.is_empty() {
            return Err(Error::Validation(
                "preload script name cannot be empty".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_egress_rule(index: usize, rule: &crate::crd::EgressRule) -> Result<(), Error> {
    if rule.domain.is_empty() {
        return Err(Error::Validation(format!(
            "egress rule {} has an empty domain",
            index
        )));
    }
    let domain_char =
        |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*';
    if !rule.domain.chars().all(domain_char) {
        return Err(Error::Validation(format!(
            "egress domain '{}' contains invalid characters",
            rule.domain
        )));
    }
    for port in &rule.ports {
        if port.port == 0 {
            return Err(Error::Validation(format!(
                "egress rule for '{}' has port 0 (must be 1..=65535)",
                rule.domain
            )));
        }
        match port.protocol.as_str() {
            "" | "TCP" | "UDP" => {}
            other => {
                return Err(Error::Validation(format!(
                    "egress rule for '{}' has unsupported protocol '{}' (TCP or UDP)",
                    rule.domain, other
                )));
            }
        }
    }
    Ok(())
}

/// Check a resource string against the Kubernetes quantity grammar:
/// a decimal number with an optional binary or SI suffix.
pub fn validate_quantity(field: &str, value: &str) -> Result<(), Error> {
    if is_valid_quantity(value) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{} value '{}' is not a valid quantity",
            field, value
        )))
    }
}

fn is_valid_quantity(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    let number = QUANTITY_SUFFIXES
        .iter()
        .find(|s| value.ends_with(**s))
        .map(|s| &value[..value.len() - s.len()])
        .unwrap_or(value);
    if number.is_empty() {
        return false;
    }
    let mut seen_dot = false;
    for (i, c) in number.chars().enumerate() {
        match c {
            '0'..='9' => {}
            '.' if i > 0 && !seen_dot && i + 1 < number.len() => seen_dot = true,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EgressRule, NetworkAccess, PortRule, SandboxSpec};

    fn base_spec() -> SandboxSpec {
        serde_json::from_value(serde_json::json!({ "runtime": "python:3.10" })).unwrap()
    }

    #[test]
    fn test_valid_names() {
        for name in ["a", "sb-1", "my-sandbox-42", "x0"] {
            assert!(validate_name(name).is_ok(), "expected '{}' valid", name);
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "-leading", "trailing-", "UpperCase", "under_score", "dot.name"] {
            assert!(validate_name(name).is_err(), "expected '{}' invalid", name);
        }
        assert!(validate_name(&"a".repeat(64)).is_err());
        assert!(validate_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_quantity_grammar() {
        for q in ["500m", "2", "1.5", "512Mi", "4Gi", "1000000k", "0.5"] {
            assert!(is_valid_quantity(q), "expected '{}' valid", q);
        }
        for q in ["", "Mi", "1..5", "abc", "1.5.2", "12Q", "-5", "5.", ".5"] {
            assert!(!is_valid_quantity(q), "expected '{}' invalid", q);
        }
    }

    #[test]
    fn test_unknown_runtime_rejected() {
        let mut spec = base_spec();
        spec.runtime = "fortran:77".to_string();
        assert!(validate_sandbox(&spec).is_err());
    }

    #[test]
    fn test_egress_rules() {
        let mut spec = base_spec();
        spec.network_access = NetworkAccess {
            egress: vec![EgressRule {
                domain: "pypi.org".to_string(),
                ports: vec![PortRule {
                    port: 443,
                    protocol: String::new(),
                }],
            }],
            ingress: false,
        };
        assert!(validate_sandbox(&spec).is_ok());

        spec.network_access.egress[0].domain = String::new();
        assert!(validate_sandbox(&spec).is_err());

        spec.network_access.egress[0].domain = "pypi.org".to_string();
        spec.network_access.egress[0].ports[0].port = 0;
        assert!(validate_sandbox(&spec).is_err());

        spec.network_access.egress[0].ports[0].port = 443;
        spec.network_access.egress[0].ports[0].protocol = "ICMP".to_string();
        assert!(validate_sandbox(&spec).is_err());
    }

    #[test]
    fn test_writable_paths_must_be_absolute() {
        let mut spec = base_spec();
        spec.filesystem.writable_paths = vec!["relative/path".to_string()];
        assert!(validate_sandbox(&spec).is_err());
        spec.filesystem.writable_paths = vec!["/".to_string()];
        assert!(validate_sandbox(&spec).is_err());
        spec.filesystem.writable_paths = vec!["/scratch".to_string()];
        assert!(validate_sandbox(&spec).is_ok());
    }

    #[test]
    fn test_pool_size_bounds() {
        let mut spec: WarmPoolSpec = serde_json::from_value(serde_json::json!({
            "runtime": "python:3.10",
            "minSize": 5,
            "maxSize": 3,
        }))
        .unwrap();
        assert!(validate_pool(&spec).is_err());
        spec.max_size = 0; // unbounded
        assert!(validate_pool(&spec).is_ok());
        spec.max_size = 5;
        assert!(validate_pool(&spec).is_ok());
    }
}
