//! `{{ name }}` placeholder expansion

use regex::{NoExpand, Regex};
use relay_common::Variables;
use serde_json::Value;
use tracing::warn;

/// Replace every `{{ key }}` in `template` with the key's value. Unknown
/// placeholders are left as they are.
pub fn expand(template: Option<&str>, vars: Option<&Variables>) -> Option<String> {
    let template = template?;
    let Some(vars) = vars else {
        return Some(template.to_string());
    };

    let mut expanded = template.to_string();
    for (key, value) in vars {
        let pattern = format!(r"\{{\{{\s*{}\s*\}}\}}", regex::escape(key));
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping template variable");
                continue;
            }
        };
        let replacement = value_to_string(value);
        expanded = re.replace_all(&expanded, NoExpand(&replacement)).into_owned();
    }

    Some(expanded)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_basic_substitution() {
        let vars = vars(&[("name", json!("Ana"))]);
        assert_eq!(expand(Some("Hi {{name}}"), Some(&vars)).as_deref(), Some("Hi Ana"));
    }

    #[test]
    fn test_whitespace_inside_braces() {
        let vars = vars(&[("name", json!("Ana"))]);
        assert_eq!(
            expand(Some("{{ name }}, {{name  }} and {{  name}}"), Some(&vars)).as_deref(),
            Some("Ana, Ana and Ana")
        );
    }

    #[test]
    fn test_unknown_placeholder_left_intact() {
        let vars = vars(&[("name", json!("Ana"))]);
        assert_eq!(
            expand(Some("Hi {{name}}, your code is {{code}}"), Some(&vars)).as_deref(),
            Some("Hi Ana, your code is {{code}}")
        );
    }

    #[test]
    fn test_absent_inputs() {
        assert_eq!(expand(Some("Hi"), None).as_deref(), Some("Hi"));
        assert_eq!(expand(None, Some(&vars(&[("a", json!(1))]))), None);
    }

    #[test]
    fn test_value_coercion() {
        let vars = vars(&[
            ("count", json!(3)),
            ("vip", json!(true)),
            ("missing", Value::Null),
        ]);
        assert_eq!(
            expand(Some("{{count}}|{{vip}}|{{missing}}"), Some(&vars)).as_deref(),
            Some("3|true|")
        );
    }

    #[test]
    fn test_keys_are_literal_and_case_sensitive() {
        let vars = vars(&[("a.b", json!("dot")), ("Name", json!("upper"))]);
        assert_eq!(
            expand(Some("{{a.b}} {{axb}} {{name}} {{Name}}"), Some(&vars)).as_deref(),
            Some("dot {{axb}} {{name}} upper")
        );
    }

    #[test]
    fn test_replacement_not_expanded() {
        let vars = vars(&[("price", json!("$1 off"))]);
        assert_eq!(
            expand(Some("Save {{price}}"), Some(&vars)).as_deref(),
            Some("Save $1 off")
        );
    }
}
