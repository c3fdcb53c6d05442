// src/dag/outputs.rs

//! Output paths of a task and whether it may be cached.

use std::collections::BTreeSet;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::errors::TaskGraphError;
use crate::graph::ProjectNode;

/// Resolve the workspace-relative outputs of `target` for `node`.
///
/// Declared outputs are interpolated with `{projectRoot}`, `{projectName}`
/// and `{options.*}`; entries that still contain an unresolved token are
/// dropped. Without declared outputs, `options.outputPath` is used, and
/// `build`/`prepare` targets fall back to the conventional build folders.
pub fn get_outputs_for_target_and_configuration(
    node: &ProjectNode,
    target: &str,
    configuration: Option<&str>,
    overrides: &Map<String, Value>,
) -> Result<Vec<String>, TaskGraphError> {
    let Some(target_config) = node.targets.get(target) else {
        return Ok(Vec::new());
    };

    let mut options = target_config.options.clone().unwrap_or_default();
    if let Some(cfg) = configuration
        .and_then(|c| target_config.configurations.as_ref()?.get(c))
    {
        options.extend(cfg.clone());
    }
    options.extend(overrides.clone());

    if let Some(outputs) = &target_config.outputs {
        validate_outputs(outputs)?;
        let token = Regex::new(TOKEN_PATTERN)?;
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for output in outputs {
            let interpolated = interpolate(output, &node.root, &node.name, &options, &token);
            if interpolated.is_empty() || has_unresolved_token(&interpolated) {
                continue;
            }
            if seen.insert(interpolated.clone()) {
                result.push(interpolated);
            }
        }
        return Ok(result);
    }

    if let Some(Value::String(output_path)) = options.get("outputPath") {
        return Ok(vec![output_path.clone()]);
    }

    if target == "build" || target == "prepare" {
        return Ok(vec![
            join(&format!("dist/{}", node.root)),
            join(&format!("{}/dist", node.root)),
            join(&format!("{}/build", node.root)),
            join(&format!("{}/public", node.root)),
        ]);
    }

    Ok(Vec::new())
}

/// Every output must start with a token (`{projectRoot}/...`,
/// `{workspaceRoot}/...`, `!{projectRoot}/...`).
pub fn validate_outputs(outputs: &[String]) -> Result<(), TaskGraphError> {
    let invalid: Vec<String> = outputs
        .iter()
        .filter(|o| !(o.starts_with('{') || o.starts_with("!{")))
        .cloned()
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(TaskGraphError::InvalidOutputs(invalid))
    }
}

/// `{projectRoot}`, `{projectName}`, `{options.a.b}`.
const TOKEN_PATTERN: &str = r"\{([A-Za-z][A-Za-z0-9_.-]*)\}";

fn interpolate(
    template: &str,
    root: &str,
    name: &str,
    options: &Map<String, Value>,
    token: &Regex,
) -> String {
    let mut template = template.to_string();
    if root == "." {
        template = template.replacen("{projectRoot}/", "", 1);
    }
    template = template.replacen("{workspaceRoot}/", "", 1);

    token
        .replace_all(&template, |caps: &Captures<'_>| {
            lookup(&caps[1], root, name, options).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn lookup(key: &str, root: &str, name: &str, options: &Map<String, Value>) -> Option<String> {
    match key {
        "projectRoot" => Some(root.to_string()),
        "projectName" => Some(name.to_string()),
        _ => {
            let path = key.strip_prefix("options.")?;
            let mut value = options.get(path.split('.').next()?)?;
            for segment in path.split('.').skip(1) {
                value = value.get(segment)?;
            }
            match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }
        }
    }
}

fn has_unresolved_token(output: &str) -> bool {
    output.contains("{projectRoot}")
        || output.contains("{workspaceRoot}")
        || output.contains("{options.")
}

fn join(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a task's result may come from (and go into) the cache.
///
/// Long-running tasks (`watch` override, `*:watch`/`*-watch` targets,
/// `serve`/`dev`/`start`) are never cached.
pub fn is_cacheable_task(
    cache: Option<bool>,
    target: &str,
    overrides: &Map<String, Value>,
) -> bool {
    cache.unwrap_or(false) && !is_long_running(target, overrides)
}

fn is_long_running(target: &str, overrides: &Map<String, Value>) -> bool {
    let watch = match overrides.get("watch") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s != "false",
        Some(Value::Null) | None => false,
        Some(_) => true,
    };
    watch
        || target.ends_with(":watch")
        || target.ends_with("-watch")
        || matches!(target, "serve" | "dev" | "start")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfiguration;
    use serde_json::json;

    fn node(root: &str, target: Value) -> ProjectNode {
        let mut node = ProjectNode {
            name: "app".to_string(),
            root: root.to_string(),
            ..Default::default()
        };
        let t: TargetConfiguration = serde_json::from_value(target).unwrap();
        node.targets.insert("build".to_string(), t);
        node
    }

    #[test]
    fn interpolates_declared_outputs() {
        let n = node(
            "apps/app",
            json!({
                "executor": "x",
                "outputs": [
                    "{projectRoot}/dist",
                    "{workspaceRoot}/coverage/{projectName}",
                    "{options.out}/x",
                    "{options.missing}"
                ],
                "options": {"out": "tmp/out"}
            }),
        );
        let outputs =
            get_outputs_for_target_and_configuration(&n, "build", None, &Map::new()).unwrap();
        assert_eq!(outputs, vec!["apps/app/dist", "coverage/app", "tmp/out/x"]);
    }

    #[test]
    fn configuration_and_overrides_feed_options() {
        let n = node(
            "apps/app",
            json!({
                "executor": "x",
                "outputs": ["{options.out}"],
                "options": {"out": "a"},
                "configurations": {"prod": {"out": "b"}}
            }),
        );
        let prod = get_outputs_for_target_and_configuration(&n, "build", Some("prod"), &Map::new())
            .unwrap();
        assert_eq!(prod, vec!["b"]);

        let mut overrides = Map::new();
        overrides.insert("out".into(), json!("c"));
        let overridden =
            get_outputs_for_target_and_configuration(&n, "build", Some("prod"), &overrides)
                .unwrap();
        assert_eq!(overridden, vec!["c"]);
    }

    #[test]
    fn root_project_strips_project_root_prefix() {
        let n = node(".", json!({"executor": "x", "outputs": ["{projectRoot}/dist"]}));
        let outputs =
            get_outputs_for_target_and_configuration(&n, "build", None, &Map::new()).unwrap();
        assert_eq!(outputs, vec!["dist"]);
    }

    #[test]
    fn build_targets_default_to_conventional_folders() {
        let n = node("libs/a", json!({"executor": "x"}));
        let outputs =
            get_outputs_for_target_and_configuration(&n, "build", None, &Map::new()).unwrap();
        assert_eq!(outputs, vec!["dist/libs/a", "libs/a/dist", "libs/a/build", "libs/a/public"]);
    }

    #[test]
    fn outputs_must_start_with_a_token() {
        let n = node("libs/a", json!({"executor": "x", "outputs": ["dist"]}));
        assert!(matches!(
            get_outputs_for_target_and_configuration(&n, "build", None, &Map::new()),
            Err(TaskGraphError::InvalidOutputs(_))
        ));
    }

    #[test]
    fn long_running_tasks_are_not_cacheable() {
        let mut watch = Map::new();
        watch.insert("watch".into(), json!("true"));
        assert!(is_cacheable_task(Some(true), "build", &Map::new()));
        assert!(!is_cacheable_task(Some(true), "build", &watch));
        assert!(!is_cacheable_task(Some(true), "serve", &Map::new()));
        assert!(!is_cacheable_task(Some(true), "build-watch", &Map::new()));
        assert!(!is_cacheable_task(None, "build", &Map::new()));
    }
}
