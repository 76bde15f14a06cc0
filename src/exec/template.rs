// src/exec/template.rs

//! `{placeholder}` expansion for stage command templates.
//!
//! Supported placeholders:
//! - `{item}`: the work item (strings verbatim, anything else as JSON)
//! - `{item.N}`: element `N` of an array work item
//! - `{node}` and `{stage}`: names of the running node and stage
//! - `{params.KEY}`: a value from `[params]`

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([a-z]+)(?:\.([A-Za-z0-9_\-]+))?\}").expect("placeholder regex is valid")
});

/// Values available while expanding one command.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub node: &'a str,
    pub stage: &'a str,
    pub item: Option<&'a Value>,
    pub params: &'a Value,
}

/// Expand every placeholder in `template`.
pub fn expand(template: &str, ctx: &TemplateContext<'_>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&resolve(&caps, ctx)?);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Check a template against the params it will be expanded with, before any
/// item exists. `mappable` says whether `{item}` will be available.
pub fn check(template: &str, params: &Map<String, Value>, mappable: bool) -> Result<(), String> {
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = &caps[1];
        let key = caps.get(2).map(|m| m.as_str());
        match (name, key) {
            ("node" | "stage", None) => {}
            ("item", key) => {
                if !mappable {
                    return Err(format!("'{}' needs a stage with items or grid", &caps[0]));
                }
                if let Some(key) = key {
                    key.parse::<usize>()
                        .map_err(|_| format!("'{}': item index must be a number", &caps[0]))?;
                }
            }
            ("params", Some(key)) => {
                if !params.contains_key(key) {
                    return Err(format!("'{}': no such key in [params]", &caps[0]));
                }
            }
            _ => return Err(format!("unknown placeholder '{}'", &caps[0])),
        }
    }
    Ok(())
}

fn resolve(caps: &Captures<'_>, ctx: &TemplateContext<'_>) -> Result<String, String> {
    let name = &caps[1];
    let key = caps.get(2).map(|m| m.as_str());

    match (name, key) {
        ("node", None) => Ok(ctx.node.to_string()),
        ("stage", None) => Ok(ctx.stage.to_string()),
        ("item", None) => ctx
            .item
            .map(render)
            .ok_or_else(|| "{item} used in a single stage".to_string()),
        ("item", Some(index)) => {
            let item = ctx
                .item
                .ok_or_else(|| format!("{{item.{index}}} used in a single stage"))?;
            let idx: usize = index
                .parse()
                .map_err(|_| format!("item index '{index}' is not a number"))?;
            item.get(idx)
                .map(render)
                .ok_or_else(|| format!("work item {item} has no element {idx}"))
        }
        ("params", Some(key)) => ctx
            .params
            .get(key)
            .map(render)
            .ok_or_else(|| format!("no such key in [params]: '{key}'")),
        _ => Err(format!("unknown placeholder '{}'", &caps[0])),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(item: Option<&'a Value>, params: &'a Value) -> TemplateContext<'a> {
        TemplateContext {
            node: "a",
            stage: "write",
            item,
            params,
        }
    }

    #[test]
    fn expands_all_placeholder_kinds() {
        let params = json!({"prefix": "out", "level": 3});
        let item = json!([1, 2]);
        let cmd = expand(
            "run {node}/{stage} {params.prefix} {params.level} {item} {item.1}",
            &ctx(Some(&item), &params),
        )
        .unwrap();
        assert_eq!(cmd, "run a/write out 3 [1,2] 2");
    }

    #[test]
    fn string_items_are_inserted_verbatim() {
        let params = json!({});
        let item = json!("chunk-7");
        assert_eq!(
            expand("echo {item}", &ctx(Some(&item), &params)).unwrap(),
            "echo chunk-7"
        );
    }

    #[test]
    fn unrelated_braces_are_left_alone() {
        let params = json!({});
        let out = expand("awk '{ print $1 }' {node}", &ctx(None, &params)).unwrap();
        assert_eq!(out, "awk '{ print $1 }' a");
    }

    #[test]
    fn expansion_errors_name_the_problem() {
        let params = json!({});
        assert!(expand("{item}", &ctx(None, &params)).is_err());
        let item = json!([0]);
        assert!(
            expand("{item.4}", &ctx(Some(&item), &params))
                .unwrap_err()
                .contains("no element 4")
        );
        assert!(expand("{params.nope}", &ctx(None, &params)).is_err());
    }

    #[test]
    fn check_rejects_unknown_and_misplaced_placeholders() {
        let mut params = Map::new();
        params.insert("prefix".to_string(), json!("out"));

        assert!(check("{params.prefix} {node} {stage}", &params, false).is_ok());
        assert!(check("{item.0}", &params, true).is_ok());
        assert!(check("{item}", &params, false).is_err());
        assert!(check("{item.x}", &params, true).is_err());
        assert!(check("{params.missing}", &params, true).is_err());
        assert!(check("{bogus}", &params, true).is_err());
    }
}
