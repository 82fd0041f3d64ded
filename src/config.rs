//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__ORCHESTRATOR__AUTO_PAUSE_ON_EVENT=true`）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::detect::DetectorConfig;
use crate::orchestrator::OrchestratorConfig;

/// 应用配置根
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub detector: DetectorSection,
}

/// [app] 段：名称与默认日志级别
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// RUST_LOG 未设置时使用
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// [orchestrator] 段：检测到事件时是否自动暂停、单任务超时
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default)]
    pub auto_pause_on_event: bool,
    /// 秒；不设则不限
    pub task_timeout_secs: Option<u64>,
}

/// [detector] 段：启发式开关与各项上限
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorSection {
    #[serde(default = "default_heuristics_enabled")]
    pub heuristics_enabled: bool,
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
    #[serde(default = "default_max_args_len")]
    pub max_args_len: usize,
    #[serde(default = "default_max_text_buffer")]
    pub max_text_buffer: usize,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            heuristics_enabled: default_heuristics_enabled(),
            max_name_len: default_max_name_len(),
            max_args_len: default_max_args_len(),
            max_text_buffer: default_max_text_buffer(),
        }
    }
}

fn default_heuristics_enabled() -> bool {
    true
}

fn default_max_name_len() -> usize {
    64
}

fn default_max_args_len() -> usize {
    8 * 1024
}

fn default_max_text_buffer() -> usize {
    16 * 1024
}

impl From<&DetectorSection> for DetectorConfig {
    fn from(s: &DetectorSection) -> Self {
        Self {
            heuristics_enabled: s.heuristics_enabled,
            max_name_len: s.max_name_len,
            max_args_len: s.max_args_len,
            max_text_buffer: s.max_text_buffer,
        }
    }
}

impl From<&OrchestratorSection> for OrchestratorConfig {
    fn from(s: &OrchestratorSection) -> Self {
        Self {
            auto_pause_on_event: s.auto_pause_on_event,
            task_timeout: s.task_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl AppConfig {
    /// 检测器上限需互相兼容：单个事件的参数必须能完整放进文本滚动缓冲
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let d = &self.detector;
        if d.max_name_len == 0 || d.max_args_len == 0 {
            return Err(config::ConfigError::Message(
                "detector.max_name_len and detector.max_args_len must be positive".to_string(),
            ));
        }
        if d.max_args_len > d.max_text_buffer {
            return Err(config::ConfigError::Message(format!(
                "detector.max_args_len ({}) exceeds detector.max_text_buffer ({})",
                d.max_args_len, d.max_text_buffer
            )));
        }
        if self.orchestrator.task_timeout_secs == Some(0) {
            return Err(config::ConfigError::Message(
                "orchestrator.task_timeout_secs must be positive (omit it for no timeout)".to_string(),
            ));
        }
        Ok(())
    }
}

/// 依次查找的默认配置文件（不含 .toml 后缀）
const DEFAULT_CONFIG_NAMES: [&str; 3] = ["config/default", "../config/default", "default"];

/// 加载并校验配置
///
/// 1. DEFAULT_CONFIG_NAMES 中第一个存在的文件作为基础
/// 2. config_path 指向的文件覆盖其上（不存在时记录 warn 并忽略）
/// 3. 环境变量 BEE__<SECTION>__<KEY> 最后覆盖
/// 4. 反序列化后执行 [`AppConfig::validate`]
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(name) = DEFAULT_CONFIG_NAMES
        .iter()
        .find(|name| Path::new(&format!("{}.toml", name)).exists())
    {
        builder = builder.add_source(config::File::with_name(name).required(false));
    }

    match config_path {
        Some(path) if path.exists() => builder = builder.add_source(config::File::from(path)),
        Some(path) => tracing::warn!("Config file {} not found, ignored", path.display()),
        None => {}
    }

    let cfg: AppConfig = builder
        .add_source(config::Environment::with_prefix("BEE").separator("__").try_parsing(true))
        .build()?
        .try_deserialize()?;
    cfg.validate()?;
    tracing::debug!(
        auto_pause = cfg.orchestrator.auto_pause_on_event,
        heuristics = cfg.detector.heuristics_enabled,
        "Config loaded"
    );
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.log_level, "info");
        assert!(!cfg.orchestrator.auto_pause_on_event);
        assert!(cfg.detector.heuristics_enabled);

        let detector = DetectorConfig::from(&cfg.detector);
        assert_eq!(detector.max_name_len, 64);
        let orch = OrchestratorConfig::from(&cfg.orchestrator);
        assert_eq!(orch.task_timeout, None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[app]
name = "compare"

[orchestrator]
auto_pause_on_event = true
task_timeout_secs = 90

[detector]
heuristics_enabled = false
max_args_len = 512
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.app.name.as_deref(), Some("compare"));
        assert!(cfg.orchestrator.auto_pause_on_event);
        assert!(!cfg.detector.heuristics_enabled);
        assert_eq!(cfg.detector.max_args_len, 512);
        assert_eq!(cfg.detector.max_name_len, 64);

        let orch = OrchestratorConfig::from(&cfg.orchestrator);
        assert_eq!(orch.task_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_validate_rejects_args_larger_than_text_buffer() {
        let mut cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());

        cfg.detector.max_args_len = cfg.detector.max_text_buffer + 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_text_buffer"));

        cfg.detector = DetectorSection::default();
        cfg.orchestrator.task_timeout_secs = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_rejects_inconsistent_detector_limits() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[detector]
max_args_len = 4096
max_text_buffer = 1024
"#
        )
        .unwrap();
        assert!(load_config(Some(file.path().to_path_buf())).is_err());
    }
}
