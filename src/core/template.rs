//! `{{settings.x}}` and `{{params.x}}` template resolution.

use super::types::{yaml_value_to_string, Settings};
use std::collections::HashMap;

/// Resolve all template variables in a string.
pub fn resolve_template(
    template: &str,
    settings: &Settings,
    params: &HashMap<String, serde_yaml_ng::Value>,
) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = if let Some(param_key) = key.strip_prefix("params.") {
            params
                .get(param_key)
                .map(yaml_value_to_string)
                .ok_or_else(|| format!("unknown param: {}", param_key))?
        } else if let Some(field) = key.strip_prefix("settings.") {
            settings
                .lookup(field)
                .ok_or_else(|| format!("unknown setting: {}", field))?
        } else {
            return Err(format!("unknown template variable: {}", key));
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// True when the string contains a template opener.
pub fn has_template(s: &str) -> bool {
    s.contains("{{")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HashMap<String, serde_yaml_ng::Value> {
        let mut p = HashMap::new();
        p.insert("team".to_string(), serde_yaml_ng::Value::String("platform".into()));
        p.insert("cost_center".to_string(), serde_yaml_ng::Value::Number(42.into()));
        p
    }

    #[test]
    fn test_resolve_settings_and_params() {
        let s = Settings::default();
        let out = resolve_template(
            "{{ settings.cluster_name }}-{{params.team}}-{{params.cost_center}}",
            &s,
            &params(),
        )
        .unwrap();
        assert_eq!(out, "eks-cluster-platform-42");
    }

    #[test]
    fn test_no_template_passthrough() {
        let out = resolve_template("plain", &Settings::default(), &params()).unwrap();
        assert_eq!(out, "plain");
        assert!(!has_template("plain"));
        assert!(has_template("{{params.team}}"));
    }

    #[test]
    fn test_unknown_param() {
        let err = resolve_template("{{params.ghost}}", &Settings::default(), &params()).unwrap_err();
        assert!(err.contains("unknown param: ghost"));
    }

    #[test]
    fn test_unknown_setting() {
        let err =
            resolve_template("{{settings.ghost}}", &Settings::default(), &params()).unwrap_err();
        assert!(err.contains("unknown setting: ghost"));
    }

    #[test]
    fn test_unknown_namespace() {
        let err = resolve_template("{{outputs.vpc.id}}", &Settings::default(), &params())
            .unwrap_err();
        assert!(err.contains("unknown template variable"));
    }

    #[test]
    fn test_unclosed() {
        let err = resolve_template("{{params.team", &Settings::default(), &params()).unwrap_err();
        assert!(err.contains("unclosed template"));
    }

    #[test]
    fn test_value_containing_braces_not_reexpanded() {
        let mut p = params();
        p.insert("raw".into(), serde_yaml_ng::Value::String("{{params.team}}".into()));
        let out = resolve_template("x={{params.raw}}", &Settings::default(), &p).unwrap();
        assert_eq!(out, "x={{params.team}}");
    }
}
