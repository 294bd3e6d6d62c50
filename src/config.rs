//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__AGENT__MAX_ITERATIONS=40`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::codeact::{LoopSettings, PlanningMode};
use crate::core::OrchestratorSettings;
use crate::llm::CompletionSettings;
use crate::runtime::{PortSettings, RuntimeKind, RuntimeSettings};
use crate::tools::DEFAULT_FORBIDDEN_PATTERNS;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub runtime: RuntimeSection,
    pub tools: ToolsSection,
}

/// [app] 段：工作区根目录、对话轮数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话工作区根目录，每个会话位于 `<root>/<user>/<conversation>`
    pub workspace_root: PathBuf,
    /// 作为运行前历史带入的对话轮数
    pub max_context_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            workspace_root: PathBuf::from("workspace"),
            max_context_turns: 20,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / deepseek / compatible / mock
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 从哪个环境变量读取 API Key；未设置时按提供方默认变量
    pub api_key_env: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: None,
            base_url: None,
            api_key_env: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次流式补全超时（秒）
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { stream: 120 }
    }
}

/// [agent] 段：循环上限、失败阈值、格式重试、规划模式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    pub failure_threshold: usize,
    pub format_retries: usize,
    pub retry_backoff_ms: u64,
    pub planning_mode: PlanningMode,
    pub summarize: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            failure_threshold: 3,
            format_retries: 3,
            retry_backoff_ms: 1500,
            planning_mode: PlanningMode::SingleShot,
            summarize: true,
        }
    }
}

/// [runtime] 段：后端选择、超时与各后端参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub kind: RuntimeKind,
    pub provision_timeout_secs: u64,
    pub action_timeout_secs: u64,
    pub docker: DockerSection,
    pub remote: RemoteSection,
    pub ports: PortSettings,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Local,
            provision_timeout_secs: 60,
            action_timeout_secs: 120,
            docker: DockerSection::default(),
            remote: RemoteSection::default(),
            ports: PortSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    pub image: String,
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub base_url: String,
    pub api_key_env: String,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8700".to_string(),
            api_key_env: "HIVE_SANDBOX_API_KEY".to_string(),
        }
    }
}

/// [tools] 段：工具超时与 Shell 禁用模式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub shell: ShellSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            shell: ShellSection::default(),
        }
    }
}

/// [tools.shell] 段：命令中出现即拒绝执行的片段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub forbidden_patterns: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            forbidden_patterns: DEFAULT_FORBIDDEN_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl AppConfig {
    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings {
            format_retries: self.agent.format_retries,
            retry_backoff: Duration::from_millis(self.agent.retry_backoff_ms),
            stream_timeout: Duration::from_secs(self.llm.timeouts.stream),
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            kind: self.runtime.kind,
            workspace_root: self.app.workspace_root.clone(),
            provision_timeout_secs: self.runtime.provision_timeout_secs,
            action_timeout_secs: self.runtime.action_timeout_secs,
            docker_image: self.runtime.docker.image.clone(),
            remote_base_url: self.runtime.remote.base_url.clone(),
            remote_api_key: std::env::var(&self.runtime.remote.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty()),
            ports: self.runtime.ports.clone(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            loop_settings: LoopSettings {
                max_iterations: self.agent.max_iterations,
                failure_threshold: self.agent.failure_threshold,
            },
            tool_timeout: Duration::from_secs(self.tools.tool_timeout_secs),
            provision_timeout: Duration::from_secs(self.runtime.provision_timeout_secs),
            summarize: self.agent.summarize,
            default_runtime: self.runtime.kind,
            default_planning_mode: self.agent.planning_mode,
            max_context_turns: self.app.max_context_turns,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        let o = cfg.orchestrator_settings();
        assert_eq!(o.loop_settings.max_iterations, 25);
        assert_eq!(o.loop_settings.failure_threshold, 3);
        assert_eq!(cfg.completion_settings().format_retries, 3);
        assert_eq!(cfg.completion_settings().retry_backoff, Duration::from_millis(1500));
        assert_eq!(cfg.runtime_settings().provision_timeout_secs, 60);
        assert!(cfg
            .tools
            .shell
            .forbidden_patterns
            .iter()
            .any(|p| p == "mkfs"));
    }

    #[test]
    fn test_explicit_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_iterations = 7\nplanning_mode = \"local_only\"\n\n[runtime]\nkind = \"docker\"\n\n[runtime.docker]\nimage = \"node:20\"\n"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_iterations, 7);
        assert_eq!(cfg.agent.planning_mode, PlanningMode::LocalOnly);
        assert_eq!(cfg.runtime.kind, RuntimeKind::Docker);
        assert_eq!(cfg.runtime_settings().docker_image, "node:20");
        // 未写的键保持默认
        assert_eq!(cfg.agent.failure_threshold, 3);
    }
}
