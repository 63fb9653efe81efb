//! Template rendering for startup tasks.
//!
//! Substitution is single-pass: `%NAME%` tokens are replaced left to right
//! and replacement text is never rescanned. A token resolves to the process
//! environment value for the upper-cased name, falling back to a configured
//! default whose upper-cased key matches; a token that resolves to neither
//! fails the task.

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::config::TemplateTask;
use crate::tree::{apply_owner, apply_permissions};

fn token_pattern() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new("%([A-Za-z_]+)%").expect("token pattern"))
}

/// Render `source`, substituting every `%NAME%` token.
pub fn render(source: &str, defaults: &IndexMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    for token in token_pattern().find_iter(source) {
        out.push_str(&source[last..token.start()]);
        let name = token.as_str().trim_matches('%');
        out.push_str(&resolve(name, defaults)?);
        last = token.end();
    }
    out.push_str(&source[last..]);
    Ok(out)
}

fn resolve(name: &str, defaults: &IndexMap<String, String>) -> Result<String> {
    let upper = name.to_ascii_uppercase();
    if let Ok(value) = std::env::var(&upper) {
        return Ok(value);
    }
    for (key, value) in defaults {
        if key.to_ascii_uppercase() == upper {
            return Ok(value.clone());
        }
    }
    bail!("unresolved template variable %{name}%");
}

/// Execute a template task: read the source, substitute, write the target,
/// then apply ownership and permissions.
pub fn fill(task: &TemplateTask, defaults: &IndexMap<String, String>) -> Result<()> {
    let source = std::fs::read_to_string(&task.source)
        .with_context(|| format!("read template source {}", task.source))?;
    let rendered = render(&source, defaults)?;
    let target = Path::new(&task.target.path);
    std::fs::write(target, rendered)
        .with_context(|| format!("write template target {}", task.target.path))?;
    apply_owner(target, task.target.owner.as_deref(), task.target.group.as_deref())?;
    if let Some(permissions) = &task.target.permissions {
        apply_permissions(target, permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateTarget;
    use std::os::unix::fs::PermissionsExt;

    fn defaults(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_from_defaults() {
        let rendered = render(
            "Hello %REGILO_TEST_TPL_NAME%!",
            &defaults(&[("REGILO_TEST_TPL_NAME", "World")]),
        )
        .unwrap();
        assert_eq!(rendered, "Hello World!");
    }

    #[test]
    fn environment_wins_over_default() {
        // SAFETY: test-only; key is unique to this test.
        unsafe {
            std::env::set_var("REGILO_TEST_TPL_WINNER", "env");
        }
        let rendered = render(
            "%REGILO_TEST_TPL_WINNER%",
            &defaults(&[("regilo_test_tpl_winner", "default")]),
        )
        .unwrap();
        unsafe {
            std::env::remove_var("REGILO_TEST_TPL_WINNER");
        }
        assert_eq!(rendered, "env");
    }

    #[test]
    fn token_name_is_case_insensitive() {
        let rendered = render(
            "%regilo_test_tpl_case%",
            &defaults(&[("REGILO_TEST_TPL_CASE", "x")]),
        )
        .unwrap();
        assert_eq!(rendered, "x");
    }

    #[test]
    fn default_key_matches_case_insensitively() {
        let rendered = render(
            "%REGILO_TEST_TPL_PORT%",
            &defaults(&[("regilo_test_tpl_port", "8080")]),
        )
        .unwrap();
        assert_eq!(rendered, "8080");
    }

    #[test]
    fn unresolved_variable_is_an_error() {
        let err = render("%MISSING_REGILO_VAR%", &defaults(&[])).unwrap_err();
        assert!(err.to_string().contains("%MISSING_REGILO_VAR%"));
    }

    #[test]
    fn replacement_text_is_not_rescanned() {
        let rendered = render(
            "%REGILO_TEST_TPL_OUTER%",
            &defaults(&[
                ("REGILO_TEST_TPL_OUTER", "%REGILO_TEST_TPL_INNER%"),
                ("REGILO_TEST_TPL_INNER", "nope"),
            ]),
        )
        .unwrap();
        assert_eq!(rendered, "%REGILO_TEST_TPL_INNER%");
    }

    #[test]
    fn stray_percent_signs_pass_through() {
        let rendered = render("100% done, 50%% left", &defaults(&[])).unwrap();
        assert_eq!(rendered, "100% done, 50%% left");
    }

    #[test]
    fn fill_writes_target_with_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("app.conf.in");
        let target = dir.path().join("app.conf");
        std::fs::write(&source, "port=%REGILO_TEST_FILL_PORT%\n").unwrap();
        // SAFETY: test-only; key is unique to this test.
        unsafe {
            std::env::set_var("REGILO_TEST_FILL_PORT", "9090");
        }
        let task = TemplateTask {
            description: "render app.conf".to_string(),
            source: source.to_string_lossy().into_owned(),
            target: TemplateTarget {
                path: target.to_string_lossy().into_owned(),
                owner: None,
                group: None,
                permissions: Some("0640".to_string()),
            },
            every_start: false,
        };
        fill(&task, &defaults(&[])).unwrap();
        unsafe {
            std::env::remove_var("REGILO_TEST_FILL_PORT");
        }
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "port=9090\n");
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn fill_overwrites_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in");
        let target = dir.path().join("out");
        std::fs::write(&source, "fresh").unwrap();
        std::fs::write(&target, "stale contents that are longer").unwrap();
        let task = TemplateTask {
            description: "overwrite".to_string(),
            source: source.to_string_lossy().into_owned(),
            target: TemplateTarget {
                path: target.to_string_lossy().into_owned(),
                owner: None,
                group: None,
                permissions: None,
            },
            every_start: false,
        };
        fill(&task, &defaults(&[])).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "fresh");
    }
}
