// File: src/config.rs
//
// VM configuration. Defaults are compiled in; a TOML file (`--config`) and
// `STRAND_*` environment variables may override them, and CLI flags win last.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    /// Call depth at which the fiber is aborted with a frame overflow
    pub max_frames: usize,
    /// Initial operand stack slots per fiber (grows ×4 on demand)
    pub initial_stack: usize,
    /// Emit and honor `// @break` markers
    pub breakpoints: bool,
    /// Log every executed instruction at TRACE level
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { max_frames: 65_536, initial_stack: 256, breakpoints: true, trace_execution: false }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {name}: {value}")]
    Env { name: &'static str, value: String },
}

impl VmConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Applies `STRAND_MAX_FRAMES`, `STRAND_INITIAL_STACK` and `STRAND_TRACE`
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env { name, value })
        }

        if let Some(value) = lookup("STRAND_MAX_FRAMES") {
            self.max_frames = parse("STRAND_MAX_FRAMES", value)?;
        }
        if let Some(value) = lookup("STRAND_INITIAL_STACK") {
            self.initial_stack = parse("STRAND_INITIAL_STACK", value)?;
        }
        if let Some(value) = lookup("STRAND_TRACE") {
            self.trace_execution = matches!(value.trim(), "1" | "true" | "yes");
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = VmConfig::from_toml_str("max_frames = 128\nbreakpoints = false\n").unwrap();
        assert_eq!(config.max_frames, 128);
        assert!(!config.breakpoints);
        assert_eq!(config.initial_stack, VmConfig::default().initial_stack);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(matches!(VmConfig::from_toml_str("max_frame = 1"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let config = VmConfig::default()
            .with_overrides(|name| match name {
                "STRAND_MAX_FRAMES" => Some("32".into()),
                "STRAND_TRACE" => Some("true".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.max_frames, 32);
        assert!(config.trace_execution);

        let bad = VmConfig::default().with_overrides(|name| (name == "STRAND_INITIAL_STACK").then(|| "lots".into()));
        assert!(matches!(bad, Err(ConfigError::Env { .. })));
    }
}
