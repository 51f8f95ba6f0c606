//! Scalar lookups in a repository's project config file
//!
//! Only top-level `key: value` lines are understood. Nested mappings,
//! sequences and multi-line scalars are ignored.

use crate::{ConfigError, Result};
use std::path::Path;

/// Look up `key` in the project config file at `path`.
///
/// Returns `Ok(None)` when the file exists but has no such key.
pub fn get_config_value(path: &Path, key: &str) -> Result<Option<String>> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(config_value_from_str(&content, key))
}

/// Look up `key` in already-loaded project config text
pub fn config_value_from_str(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        // Indented lines belong to a nested mapping
        if line.starts_with(char::is_whitespace) {
            return None;
        }
        let (k, v) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        let value = strip_comment(v.trim());
        let value = unquote(value.trim());
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn strip_comment(value: &str) -> &str {
    if value.starts_with('"') || value.starts_with('\'') {
        return value;
    }
    match value.find(" #") {
        Some(idx) => &value[..idx],
        None => value,
    }
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(q).and_then(|v| v.strip_suffix(q)) {
            return inner;
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# project settings
iteration_n: 10
output_dir: /data/outputs # where results go
synthpop_dir: "/data/synthpop"
quoted_single: 'a b'
nested:
  output_dir: /ignored
empty_value:
"#;

    #[test]
    fn test_plain_value_with_comment() {
        assert_eq!(
            config_value_from_str(SAMPLE, "output_dir").as_deref(),
            Some("/data/outputs")
        );
    }

    #[test]
    fn test_quoted_values() {
        assert_eq!(
            config_value_from_str(SAMPLE, "synthpop_dir").as_deref(),
            Some("/data/synthpop")
        );
        assert_eq!(
            config_value_from_str(SAMPLE, "quoted_single").as_deref(),
            Some("a b")
        );
    }

    #[test]
    fn test_missing_and_empty_keys() {
        assert_eq!(config_value_from_str(SAMPLE, "absent"), None);
        assert_eq!(config_value_from_str(SAMPLE, "empty_value"), None);
        assert_eq!(config_value_from_str(SAMPLE, "nested"), None);
    }

    #[test]
    fn test_first_top_level_match_wins() {
        let content = "output_dir: first\noutput_dir: second\n";
        assert_eq!(
            config_value_from_str(content, "output_dir").as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_windows_path_value() {
        let content = "output_dir: C:/work/out\n";
        assert_eq!(
            config_value_from_str(content, "output_dir").as_deref(),
            Some("C:/work/out")
        );
    }

    #[test]
    fn test_get_config_value_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sim_design.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(
            get_config_value(&path, "iteration_n").unwrap().as_deref(),
            Some("10")
        );
        assert_eq!(get_config_value(&path, "absent").unwrap(), None);
    }

    #[test]
    fn test_get_config_value_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = get_config_value(&tmp.path().join("missing.yaml"), "k").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
