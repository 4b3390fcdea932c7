use std::env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini 生成接口客户端，标题生成与查询增强共用
///
/// 构造时即检查 API 密钥，缺失配置在这里立即失败，而不是拖到第一次请求
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self { role: "user".to_string(), parts: vec![Part::text(text)] }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self { role: "model".to_string(), parts: vec![Part::text(text)] }
    }

    pub fn user_parts(parts: Vec<Part>) -> Self {
        Self { role: "user".to_string(), parts }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Default::default() }
    }

    pub fn inline_data(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            inline_data: Some(InlineData { mime_type: mime_type.into(), data: data.into() }),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: &'a [Content],
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
struct UsageMetadata {
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
}

#[derive(Serialize)]
struct CountTokensRequest<'a> {
    contents: &'a [Content],
}

#[derive(Deserialize)]
struct CountTokensResponse {
    #[serde(rename = "totalTokens")]
    total_tokens: u64,
}

/// 一次生成调用的结果
pub struct Generated {
    pub text: String,
    /// 输出 token 数，服务端未返回时为 None
    pub output_tokens: Option<u64>,
}

impl GeminiClient {
    pub fn from_env(model: &str) -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .context("GEMINI_API_KEY 未配置，请在 .env 文件中设置")?;
        Ok(Self { http: reqwest::Client::new(), api_key, model: model.to_string() })
    }

    pub async fn generate(
        &self,
        contents: &[Content],
        temperature: Option<f32>,
    ) -> Result<Generated> {
        let url = format!("{}/models/{}:generateContent", GEMINI_BASE_URL, self.model);
        let req = GenerateRequest {
            contents,
            generation_config: temperature.map(|t| GenerationConfig { temperature: t }),
        };

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&req)
            .send()
            .await
            .context("Gemini 请求失败")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Gemini 返回 {}: {}", status, body);
        }

        let body: GenerateResponse = resp.json().await.context("Gemini 响应解析失败")?;
        let output_tokens = body.usage_metadata.and_then(|um| um.candidates_token_count);
        Ok(Generated { text: extract_text(&body), output_tokens })
    }

    /// 统计一组内容的输入 token 数
    pub async fn count_tokens(&self, contents: &[Content]) -> Result<u64> {
        let url = format!("{}/models/{}:countTokens", GEMINI_BASE_URL, self.model);
        let req = CountTokensRequest { contents };

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&req)
            .send()
            .await
            .context("Gemini countTokens 请求失败")?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("Gemini countTokens 返回 {}", status);
        }

        let body: CountTokensResponse = resp.json().await?;
        Ok(body.total_tokens)
    }
}

fn extract_text(resp: &GenerateResponse) -> String {
    for candidate in &resp.candidates {
        let Some(content) = &candidate.content else {
            continue;
        };
        let texts = content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>();
        if !texts.is_empty() {
            return texts.join(" ");
        }
    }
    String::new()
}
