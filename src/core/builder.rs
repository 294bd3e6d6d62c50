//! Agent 构建器：从配置组装 LLM、工具注册表、运行时工厂与编排器
//!
//! CLI 与嵌入方共用同一套组装逻辑，避免不同入口的工具集合不一致。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{load_config, AppConfig};
use crate::core::{AgentError, Orchestrator};
use crate::llm::{
    create_deepseek_client, CompletionChannel, HttpStreamClient, LlmClient, MockLlmClient,
    OpenAiClient, DEEPSEEK_CHAT,
};
use crate::persistence::{NoopStore, RunStore};
use crate::runtime::{BackendFactory, RuntimeFactory};
use crate::tools::{builtin_tools, Tool, ToolRegistry};

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

fn api_key(cfg: &AppConfig, fallback_env: &str) -> Option<String> {
    let var = cfg.llm.api_key_env.as_deref().unwrap_or(fallback_env);
    std::env::var(var).ok().filter(|k| !k.trim().is_empty())
}

/// 根据 [llm] 段选择后端
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    let provider = cfg.llm.provider.trim().to_lowercase();
    let model = cfg.llm.model.clone();
    match provider.as_str() {
        "openai" => {
            let model = model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
            tracing::info!("Using OpenAI LLM ({})", model);
            Ok(Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &model,
                api_key(cfg, "OPENAI_API_KEY").as_deref(),
            )))
        }
        "deepseek" => {
            tracing::info!("Using DeepSeek LLM ({})", model.as_deref().unwrap_or(DEEPSEEK_CHAT));
            Ok(Arc::new(create_deepseek_client(
                cfg.llm.base_url.as_deref(),
                model.as_deref(),
                api_key(cfg, "DEEPSEEK_API_KEY"),
            )))
        }
        "compatible" => {
            let base = cfg.llm.base_url.as_deref().ok_or_else(|| {
                AgentError::Config("provider 'compatible' requires llm.base_url".to_string())
            })?;
            let model = model.ok_or_else(|| {
                AgentError::Config("provider 'compatible' requires llm.model".to_string())
            })?;
            tracing::info!("Using OpenAI-compatible LLM at {} ({})", base, model);
            Ok(Arc::new(HttpStreamClient::new(
                "compatible",
                base,
                &model,
                api_key(cfg, "OPENAI_API_KEY"),
            )))
        }
        "mock" => {
            tracing::warn!("Using Mock LLM");
            Ok(Arc::new(MockLlmClient))
        }
        other => Err(AgentError::Config(format!("unknown llm provider: {}", other))),
    }
}

/// Agent 构建器
pub struct AgentBuilder {
    config: AppConfig,
    store: Arc<dyn RunStore>,
    extra_tools: Vec<Arc<dyn Tool>>,
    llm: Option<Arc<dyn LlmClient>>,
    factory: Option<Arc<dyn RuntimeFactory>>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: Arc::new(NoopStore),
            extra_tools: Vec::new(),
            llm: None,
            factory: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    /// 追加工具（例如 MCP 桥接出来的工具）
    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.extra_tools.extend(tools);
        self
    }

    /// 替换 LLM 客户端（不走配置）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_runtime_factory(mut self, factory: Arc<dyn RuntimeFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 内置工具 + 追加工具；不合格的工具告警后跳过
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = builtin_tools(
            self.config.tools.shell.forbidden_patterns.clone(),
            self.config.runtime.action_timeout_secs,
        );
        tools.extend(self.extra_tools.iter().cloned());
        ToolRegistry::load(tools)
    }

    pub fn build(self) -> Result<Orchestrator, AgentError> {
        let llm = match self.llm.clone() {
            Some(llm) => llm,
            None => create_llm_from_config(&self.config)?,
        };
        let channel = CompletionChannel::new(llm, self.config.completion_settings());
        let registry = Arc::new(self.build_tool_registry());
        let factory: Arc<dyn RuntimeFactory> = match self.factory.clone() {
            Some(f) => f,
            None => Arc::new(BackendFactory::new(self.config.runtime_settings())?),
        };
        tracing::info!(
            tools = registry.len(),
            runtime = %self.config.runtime.kind,
            "orchestrator ready"
        );
        Ok(Orchestrator::new(channel, registry, factory)
            .with_store(self.store)
            .with_settings(self.config.orchestrator_settings()))
    }
}

/// 加载配置并创建构建器；配置加载失败时使用默认值
pub fn create_agent_builder(config_path: Option<PathBuf>) -> AgentBuilder {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    AgentBuilder::new(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_builtins() {
        let builder = AgentBuilder::new(AppConfig::default());
        let names = builder.build_tool_registry().tool_names();
        assert_eq!(
            names,
            vec!["apply_patch", "echo", "execute_command", "read_file", "write_file"]
        );
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "palm".into();
        assert!(matches!(create_llm_from_config(&cfg), Err(AgentError::Config(_))));
        cfg.llm.provider = "compatible".into();
        assert!(create_llm_from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_build_with_mock() {
        let orchestrator = AgentBuilder::new(AppConfig::default()).build().unwrap();
        assert_eq!(orchestrator.settings().loop_settings.max_iterations, 25);
    }
}
