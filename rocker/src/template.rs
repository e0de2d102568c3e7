//! Template pre-processing of build files.
//!
//! The build file is rendered through handlebars before it is parsed, with
//! variables collected from `--vars` files, `--var k=v` flags, and the
//! process environment (lowest precedence first: environment, files, flags).
//! Strict mode is on, so referencing an undefined variable fails the build
//! instead of silently producing an empty string.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub(crate) fn expand(content: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .render_template(content, vars)
        .context("failed to render build file template")
}

/// Merge template variables from the environment, `--vars` files, and
/// `--var` flags, in that order of precedence.
pub(crate) fn collect_vars(
    var_flags: &[(String, String)],
    var_files: &[PathBuf],
) -> Result<BTreeMap<String, String>> {
    let mut vars: BTreeMap<String, String> = std::env::vars().collect();
    for path in var_files {
        for (key, value) in load_vars_file(path)? {
            vars.insert(key, value);
        }
    }
    for (key, value) in var_flags {
        vars.insert(key.clone(), value.clone());
    }
    Ok(vars)
}

fn load_vars_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read vars file '{}'", path.display()))?;
    // YAML is a superset of JSON, so one parser covers both file kinds.
    let raw: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse vars file '{}'", path.display()))?;
    raw.into_iter()
        .map(|(key, value)| Ok((key, scalar_to_string(value)?)))
        .collect()
}

fn scalar_to_string(value: serde_yaml::Value) -> Result<String> {
    Ok(match value {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => anyhow::bail!("vars file values must be scalars, got {other:?}"),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_variables() {
        let out = expand(
            "FROM {{base}}\nRUN echo {{greeting}}\n",
            &vars(&[("base", "busybox"), ("greeting", "hi")]),
        )
        .unwrap();
        assert_eq!(out, "FROM busybox\nRUN echo hi\n");
    }

    #[test]
    fn unknown_variable_fails() {
        assert!(expand("FROM {{missing}}\n", &vars(&[])).is_err());
    }

    #[test]
    fn values_are_not_escaped() {
        let out = expand("RUN echo {{cmd}}\n", &vars(&[("cmd", "a && b")])).unwrap();
        assert_eq!(out, "RUN echo a && b\n");
    }

    #[test]
    fn flags_override_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vars.yml");
        std::fs::write(&path, "version: 1.2.3\nname: from-file\n").unwrap();
        let collected =
            collect_vars(&[("name".to_string(), "from-flag".to_string())], &[path]).unwrap();
        assert_eq!(collected.get("version").unwrap(), "1.2.3");
        assert_eq!(collected.get("name").unwrap(), "from-flag");
    }
}
