// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/quorum/config.yaml"));
    paths.push(PathBuf::from("/etc/quorum/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/quorum/config.yaml"));
        paths.push(home.join(".config/quorum/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("quorum/config.yaml"));
        paths.push(cfg.join("quorum/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".quorum/config.yaml"));
    paths.push(PathBuf::from(".quorum/config.yml"));
    paths.push(PathBuf::from(".quorum.yaml"));
    paths.push(PathBuf::from(".quorum.yml"));
    paths.push(PathBuf::from("quorum.yaml"));
    paths.push(PathBuf::from("quorum.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
///
/// Sequences are replaced wholesale — merging agent rosters element-wise
/// would make it impossible for a project-local file to shrink the roster.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("coordination:\n  deadline: 30s\n  restart_budget: 5");
        let src = val("coordination:\n  deadline: 2m");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["coordination"]["deadline"].as_str(), Some("2m"));
        assert_eq!(dst["coordination"]["restart_budget"].as_i64(), Some(5));
    }

    #[test]
    fn merge_replaces_agent_roster_wholesale() {
        let mut dst = val("agents:\n  - id: a\n  - id: b");
        let src = val("agents:\n  - id: only");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["agents"].as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/quorum_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "coordination:\n  deadline: 90s\n  restart_budget: 2"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(
            cfg.coordination.deadline_duration(),
            std::time::Duration::from_secs(90)
        );
        assert_eq!(cfg.coordination.restart_budget, 2);
    }

    #[test]
    fn load_explicit_file_parses_rate_limits() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "rate_limits:\n  gemini:\n    max_requests: 7\n    time_window: 60s"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        let entry = cfg.rate_limits.get("gemini").unwrap();
        assert_eq!(entry.max_requests, 7);
    }
}
