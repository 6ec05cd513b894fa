//! Environment variable fallbacks.
//!
//! Variables are fallbacks, not overrides: they only fill fields that no
//! config file set.

use std::collections::{HashMap, HashSet};
use std::hash::BuildHasher;
use std::path::PathBuf;

use tracing::debug;

/// Prefix shared by every variable this crate reads.
pub const ENV_PREFIX: &str = "TESSERA_";

/// How a variable's text becomes a TOML value.
#[derive(Clone, Copy)]
enum EnvKind {
    String,
    PathList,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: EnvKind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "TESSERA_MODULE_ROOTS",
        field_path: "modules.roots",
        kind: EnvKind::PathList,
    },
    EnvMapping {
        var_name: "TESSERA_LOG_LEVEL",
        field_path: "logging.level",
        kind: EnvKind::String,
    },
    EnvMapping {
        var_name: "TESSERA_LOG_FORMAT",
        field_path: "logging.format",
        kind: EnvKind::String,
    },
];

/// Collect the process environment variables this crate cares about.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}

/// Apply environment fallbacks to fields that were not set by any file.
///
/// `set_fields` holds the dotted paths of every field a file set.
/// Returns the number of variables applied.
pub fn apply_env_fallbacks<S: BuildHasher, T: BuildHasher>(
    merged: &mut toml::Value,
    set_fields: &HashSet<String, T>,
    env_vars: &HashMap<String, String, S>,
) -> usize {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        if set_fields.contains(mapping.field_path) {
            continue;
        }
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        if raw.trim().is_empty() {
            continue;
        }

        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );
        let value = match mapping.kind {
            EnvKind::String => toml::Value::String(raw.trim().to_owned()),
            EnvKind::PathList => toml::Value::Array(
                std::env::split_paths(raw)
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p: PathBuf| toml::Value::String(p.display().to_string()))
                    .collect(),
            ),
        };
        set_field(merged, mapping.field_path, value);
        count = count.saturating_add(1);
    }

    count
}

/// Set a dotted field path, creating intermediate tables as needed.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let toml::Value::Table(table) = current else {
            return;
        };
        if parts.peek().is_none() {
            table.insert(part.to_owned(), value);
            return;
        }
        current = table
            .entry(part.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> toml::Value {
        toml::from_str(
            r#"
            [modules]
            roots = []
            [logging]
            level = "info"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_fallbacks_fill_unset_fields() {
        let mut merged = defaults();
        let env: HashMap<String, String> = [
            ("TESSERA_LOG_LEVEL".to_owned(), "debug".to_owned()),
            ("TESSERA_LOG_FORMAT".to_owned(), "json".to_owned()),
        ]
        .into();

        let applied = apply_env_fallbacks(&mut merged, &HashSet::<String>::new(), &env);
        assert_eq!(applied, 2);
        assert_eq!(merged["logging"]["level"].as_str(), Some("debug"));
        assert_eq!(merged["logging"]["format"].as_str(), Some("json"));
    }

    #[test]
    fn test_fallbacks_never_override_files() {
        let mut merged = defaults();
        let env: HashMap<String, String> =
            [("TESSERA_LOG_LEVEL".to_owned(), "trace".to_owned())].into();
        let set: HashSet<String> = ["logging.level".to_owned()].into();

        assert_eq!(apply_env_fallbacks(&mut merged, &set, &env), 0);
        assert_eq!(merged["logging"]["level"].as_str(), Some("info"));
    }

    #[test]
    fn test_module_roots_split_on_platform_separator() {
        let mut merged = defaults();
        let joined = std::env::join_paths(["/srv/modules", "/opt/extra"]).unwrap();
        let env: HashMap<String, String> = [(
            "TESSERA_MODULE_ROOTS".to_owned(),
            joined.to_string_lossy().into_owned(),
        )]
        .into();

        apply_env_fallbacks(&mut merged, &HashSet::<String>::new(), &env);
        let roots: Vec<&str> = merged["modules"]["roots"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert_eq!(roots, ["/srv/modules", "/opt/extra"]);
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let mut merged = defaults();
        let env: HashMap<String, String> =
            [("TESSERA_LOG_LEVEL".to_owned(), "  ".to_owned())].into();
        assert_eq!(apply_env_fallbacks(&mut merged, &HashSet::<String>::new(), &env), 0);
    }
}
