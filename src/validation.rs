//! Input validation for security- and admission-critical fields.
//!
//! Anything written into a pod spec, a shell command, or a file path MUST
//! be validated through this module before it leaves the Gateway's
//! admission path (spec.md §4.A: "the gateway validates before writing
//! the object").

const MAX_TOOL_NAME_LEN: usize = 63;
const MAX_POOL_NAME_LEN: usize = 63;

fn is_tool_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Validate an `InlineTool.name` against spec.md §3's pattern:
/// `[A-Za-z0-9][A-Za-z0-9_.-]{0,62}`.
pub fn validate_tool_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("tool name must not be empty".into());
    }
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(format!(
            "tool name too long (max {MAX_TOOL_NAME_LEN} characters)"
        ));
    }
    let first = name.chars().next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(format!(
            "tool name '{name}' must start with a letter or number"
        ));
    }
    for ch in name.chars() {
        if !is_tool_name_char(ch) {
            return Err(format!(
                "tool name '{name}' contains invalid character '{ch}'; only letters, numbers, '_', '.', '-' are allowed"
            ));
        }
    }
    Ok(())
}

/// Validate a tool name supplied to the call API, per spec.md §4.E.5:
/// `^[A-Za-z0-9][A-Za-z0-9_.-]*$` (no length cap in the source, but we
/// still bound it to keep the shell command we build around it sane).
pub fn validate_tool_call_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("tool_name must not be empty".into());
    }
    if name.len() > 4096 {
        return Err("tool_name too long".into());
    }
    let first = name.chars().next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(format!(
            "tool_name '{name}' must start with a letter or number"
        ));
    }
    for ch in name.chars() {
        if !is_tool_name_char(ch) {
            return Err(format!(
                "tool_name '{name}' contains characters unsafe to embed in a shell command"
            ));
        }
    }
    Ok(())
}

/// Validate a WarmPool or Sandbox name (Kubernetes DNS-1123 label shape,
/// the part of the rules the pod-template builder actually depends on).
pub fn validate_pool_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".into());
    }
    if name.len() > MAX_POOL_NAME_LEN {
        return Err(format!("name too long (max {MAX_POOL_NAME_LEN} characters)"));
    }
    let first_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let last_ok = name.chars().next_back().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_ok || !last_ok {
        return Err("name must start and end with a letter or number".into());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("name must be lowercase alphanumeric or '-'".into());
    }
    Ok(())
}

/// Validate a Kubernetes resource quantity string (spec.md §3: "Kubernetes
/// quantity strings"), matching the shape
/// `examples/original_source/sdk/python/arl/arl/types.py::validate_resource_quantities`
/// accepts: an optional sign, digits with an optional decimal point and
/// exponent, and an optional unit suffix (`m`, binary `Ki/Mi/.../Ei`, or
/// decimal `k/M/.../E`).
pub fn validate_quantity(resource_name: &str, quantity: &str) -> Result<(), String> {
    if quantity.is_empty() {
        return Err(format!("resource '{resource_name}' has empty quantity"));
    }

    let bytes = quantity.as_bytes();
    let mut i = 0;
    if bytes[i] == b'+' || bytes[i] == b'-' {
        i += 1;
    }
    let digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i == digits_start {
        return Err(invalid_quantity(resource_name, quantity));
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return Err(invalid_quantity(resource_name, quantity));
        }
    }
    let suffix = &quantity[i..];
    const VALID_SUFFIXES: &[&str] = &[
        "", "m", "k", "K", "M", "G", "T", "P", "E", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei",
    ];
    if !VALID_SUFFIXES.contains(&suffix) {
        return Err(invalid_quantity(resource_name, quantity));
    }

    if resource_name == "cpu" {
        if let Some(millis) = quantity.strip_suffix('m') {
            let millicores: i64 = millis
                .parse()
                .map_err(|_| format!("invalid cpu millicore quantity: {quantity}"))?;
            if !(1..=1_000_000).contains(&millicores) {
                return Err(format!(
                    "CPU millicores must be between 1 and 1000000, got {millicores}"
                ));
            }
        }
    } else if resource_name == "memory" && suffix.is_empty() && !quantity.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!(
            "memory quantity '{quantity}' should include a unit suffix (e.g. 'Mi', 'Gi', 'M', 'G')"
        ));
    }

    Ok(())
}

fn invalid_quantity(resource_name: &str, quantity: &str) -> String {
    format!(
        "invalid quantity format for '{resource_name}': '{quantity}'. Expected Kubernetes quantity format (e.g. '100m', '1', '128Mi', '1Gi')"
    )
}

/// Validate a duplicate-free set of tool names, per spec.md §4.A:
/// "duplicate tool names ... refuse pool admission".
pub fn validate_no_duplicate_tool_names(names: &[&str]) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(*name) {
            return Err(format!("duplicate tool name '{name}'"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_accepted() {
        assert!(validate_tool_name("greet").is_ok());
        assert!(validate_tool_name("a").is_ok());
        assert!(validate_tool_name("my-tool_1.2").is_ok());
        assert!(validate_tool_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn tool_names_rejected() {
        assert!(validate_tool_name("").is_err());
        assert!(validate_tool_name("-tool").is_err());
        assert!(validate_tool_name("_tool").is_err());
        assert!(validate_tool_name("tool name").is_err());
        assert!(validate_tool_name(&"a".repeat(64)).is_err());
        assert!(validate_tool_name("tool;rm -rf /").is_err());
    }

    #[test]
    fn tool_call_name_rejects_injection() {
        assert!(validate_tool_call_name("greet").is_ok());
        assert!(validate_tool_call_name("greet; rm -rf /").is_err());
        assert!(validate_tool_call_name("$(whoami)").is_err());
        assert!(validate_tool_call_name("").is_err());
    }

    #[test]
    fn quantities() {
        assert!(validate_quantity("cpu", "100m").is_ok());
        assert!(validate_quantity("cpu", "1").is_ok());
        assert!(validate_quantity("cpu", "2.5").is_ok());
        assert!(validate_quantity("memory", "128Mi").is_ok());
        assert!(validate_quantity("memory", "1Gi").is_ok());
        assert!(validate_quantity("cpu", "").is_err());
        assert!(validate_quantity("cpu", "2000000m").is_err());
        assert!(validate_quantity("cpu", "abc").is_err());
        assert!(validate_quantity("memory", "not-a-number").is_err());
    }

    #[test]
    fn pool_names() {
        assert!(validate_pool_name("python-39").is_ok());
        assert!(validate_pool_name("p1").is_ok());
        assert!(validate_pool_name("-bad").is_err());
        assert!(validate_pool_name("Bad").is_err());
        assert!(validate_pool_name("").is_err());
    }

    #[test]
    fn duplicate_tool_names_rejected() {
        assert!(validate_no_duplicate_tool_names(&["a", "b"]).is_ok());
        assert!(validate_no_duplicate_tool_names(&["a", "a"]).is_err());
    }
}
