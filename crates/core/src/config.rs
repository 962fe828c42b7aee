//! TOML-based configuration for the Gitwing core.
//!
//! The desktop shell persists its own settings store; the core only consumes
//! the resolver section, either deserialized from that store or loaded from a
//! standalone TOML file via [`CoreConfig::load_from_file`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level core configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Conflict-resolution settings.
    #[serde(default)]
    pub resolve: ResolveConfig,
}

// ---------------------------------------------------------------------------
// Resolve
// ---------------------------------------------------------------------------

/// Conflict-resolution behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConfig {
    /// Merge tool per file-name suffix, e.g. `".rc" = "araxis"`. The longest
    /// matching suffix wins; matching is case-insensitive.
    #[serde(default)]
    pub mergetool_by_suffix: BTreeMap<String, String>,

    /// Merge tool for files without a suffix match. When unset, the
    /// repository's own `merge.tool` git config is used instead.
    #[serde(default)]
    pub mergetool: Option<String>,

    /// Whether the assistant handler runs ahead of the merge tool
    /// (default true). The panel exposes a runtime toggle on top of this.
    #[serde(default = "default_auto_resolve")]
    pub auto_resolve: bool,
}

fn default_auto_resolve() -> bool {
    true
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            mergetool_by_suffix: BTreeMap::new(),
            mergetool: None,
            auto_resolve: default_auto_resolve(),
        }
    }
}

impl ResolveConfig {
    /// Pick the configured merge tool for a path: longest case-insensitive
    /// suffix match first, then the global fallback. Returns `None` when
    /// neither is configured; callers may still fall back to the
    /// repository's own `merge.tool`.
    pub fn tool_for_path(&self, path: &str) -> Option<&str> {
        let lower = path.to_lowercase();
        self.mergetool_by_suffix
            .iter()
            .filter(|(suffix, _)| lower.ends_with(&suffix.to_lowercase()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, tool)| tool.as_str())
            .or(self.mergetool.as_deref())
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: CoreConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate semantic constraints that the TOML schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (suffix, tool) in &self.resolve.mergetool_by_suffix {
            if suffix.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "resolve.mergetool_by_suffix".into(),
                    detail: "suffix must not be empty".into(),
                });
            }
            if tool.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "resolve.mergetool_by_suffix".into(),
                    detail: format!("tool for suffix '{}' must not be empty", suffix),
                });
            }
        }
        if let Some(tool) = &self.resolve.mergetool {
            if tool.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "resolve.mergetool".into(),
                    detail: "merge tool must not be empty when set".into(),
                });
            }
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[resolve]
mergetool = "meld"
auto_resolve = false

[resolve.mergetool_by_suffix]
".rc" = "araxis"
".resx" = "semanticmerge"
".designer.cs" = "semanticmerge"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: CoreConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.resolve.mergetool.as_deref(), Some("meld"));
        assert!(!config.resolve.auto_resolve);
        assert_eq!(
            config.resolve.mergetool_by_suffix.get(".rc").map(String::as_str),
            Some("araxis")
        );
    }

    #[test]
    fn test_defaults() {
        let config: CoreConfig = toml::from_str("").expect("empty toml should parse");
        assert!(config.resolve.auto_resolve);
        assert!(config.resolve.mergetool.is_none());
        assert!(config.resolve.mergetool_by_suffix.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = CoreConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.resolve.mergetool.as_deref(), Some("meld"));
    }

    #[test]
    fn test_file_not_found() {
        let result = CoreConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_empty_suffix() {
        let mut config = CoreConfig::default();
        config
            .resolve
            .mergetool_by_suffix
            .insert(String::new(), "meld".into());
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. })
                if field == "resolve.mergetool_by_suffix"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_tool() {
        let mut config = CoreConfig::default();
        config.resolve.mergetool = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tool_for_path_longest_suffix_wins() {
        let config: CoreConfig = toml::from_str(sample_toml()).unwrap();
        // ".designer.cs" is longer than any other matching suffix.
        assert_eq!(
            config.resolve.tool_for_path("Forms/Main.Designer.cs"),
            Some("semanticmerge")
        );
        assert_eq!(config.resolve.tool_for_path("app.rc"), Some("araxis"));
    }

    #[test]
    fn test_tool_for_path_case_insensitive() {
        let config: CoreConfig = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.resolve.tool_for_path("RES/APP.RC"), Some("araxis"));
    }

    #[test]
    fn test_tool_for_path_falls_back_to_global() {
        let config: CoreConfig = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.resolve.tool_for_path("src/main.c"), Some("meld"));

        let bare = CoreConfig::default();
        assert_eq!(bare.resolve.tool_for_path("src/main.c"), None);
    }
}
