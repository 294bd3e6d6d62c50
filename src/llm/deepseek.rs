//! DeepSeek：OpenAI 兼容的 SSE 端点，复用 HttpStreamClient

use crate::llm::HttpStreamClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 未显式给出 Key 时依次读 `DEEPSEEK_API_KEY`、`OPENAI_API_KEY`；base_url 为空时用官方端点
pub fn create_deepseek_client(
    base_url: Option<&str>,
    model: Option<&str>,
    api_key: Option<String>,
) -> HttpStreamClient {
    let api_key = api_key
        .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    HttpStreamClient::new(
        "deepseek",
        base_url.unwrap_or(DEEPSEEK_BASE_URL),
        model.unwrap_or(DEEPSEEK_CHAT),
        api_key,
    )
}
