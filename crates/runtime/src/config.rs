use anyhow::{Context, Result};
use compute::DispatchConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "CLOTH_COMPUTE_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// GPU when available, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub shader_dir: PathBuf,
    pub backend: BackendChoice,
    /// Number of triggers issued before shutting down.
    pub triggers: u32,
    pub trigger_interval_ms: u64,
    pub watch_shaders: bool,
    pub dispatch: DispatchConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shader_dir: compute::kernel::default_shader_dir(),
            backend: BackendChoice::Auto,
            triggers: 1,
            trigger_interval_ms: 0,
            watch_shaders: false,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Reads the file named by [`CONFIG_ENV`], or returns the defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        if config.dispatch.preview_count == 0 {
            tracing::warn!("preview_count is 0; readback values will not be logged");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute::ReadbackPolicy;

    #[test]
    fn empty_object_is_all_defaults() {
        let config = RuntimeConfig::parse("{}").unwrap();
        assert_eq!(config.backend, BackendChoice::Auto);
        assert_eq!(config.triggers, 1);
        assert!(!config.watch_shaders);
        assert_eq!(config.dispatch, DispatchConfig::default());
        assert!(config.shader_dir.ends_with("shaders"));
    }

    #[test]
    fn nested_dispatch_settings_override_defaults() {
        let config = RuntimeConfig::parse(
            r#"{
                "backend": "cpu",
                "triggers": 3,
                "dispatch": { "multiplier": 4.0, "readback_policy": "blocking" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendChoice::Cpu);
        assert_eq!(config.triggers, 3);
        assert!((config.dispatch.multiplier - 4.0).abs() < f32::EPSILON);
        assert_eq!(config.dispatch.readback_policy, ReadbackPolicy::Blocking);
        assert_eq!(config.dispatch.element_count, 256);
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(RuntimeConfig::parse(r#"{ "backend": "tpu" }"#).is_err());
        assert!(RuntimeConfig::parse("not json").is_err());
    }

    #[test]
    fn missing_file_reports_the_path() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/cloth.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/cloth.json"));
    }
}
