use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::debug;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{NATIVE_DIM, Settings};
use crate::projection::Projection;
use crate::rerank::TextEncoder;

/// 嵌入服务客户端
///
/// 图片和文本共享同一个嵌入模型，服务端返回单位范数的原生向量。
/// 每种模态有两条编码路径：
/// - 索引空间：原生向量经随机投影降维并重新归一化，用于一切写入或查询索引的场景
/// - 原生空间：不投影，仅供标题重排使用，保留全精度相似度信号
pub struct EmbedClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    projection: Projection,
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    inputs: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl EmbedClient {
    pub fn new(settings: &Settings, projection: Projection) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: settings.clip_api_url.trim_end_matches('/').to_string(),
            model: settings.clip_model.clone(),
            projection,
        }
    }

    async fn embed(&self, endpoint: &str, inputs: Vec<String>) -> Result<Array2<f32>> {
        let url = format!("{}/embed/{}", self.base_url, endpoint);
        let count = inputs.len();
        let req = EmbedRequest { model: self.model.clone(), inputs };

        let resp = self
            .http
            .post(&url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("嵌入服务请求失败: {}", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("嵌入服务返回 {}: {}", status, body);
        }

        let body: EmbedResponse = resp.json().await.context("嵌入服务响应解析失败")?;
        anyhow::ensure!(
            body.embeddings.len() == count,
            "嵌入数量不匹配: 请求 {}，返回 {}",
            count,
            body.embeddings.len()
        );

        let mut flat = Vec::with_capacity(count * NATIVE_DIM);
        for emb in &body.embeddings {
            anyhow::ensure!(
                emb.len() == NATIVE_DIM,
                "嵌入维度不匹配: 期望 {}，返回 {}",
                NATIVE_DIM,
                emb.len()
            );
            flat.extend_from_slice(emb);
        }
        Ok(Array2::from_shape_vec((count, NATIVE_DIM), flat)?)
    }

    /// 原生空间批量编码文本
    pub async fn encode_texts_native(&self, texts: &[String]) -> Result<Array2<f32>> {
        self.embed("text", texts.to_vec()).await
    }

    /// 索引空间编码查询文本
    pub async fn encode_text_index(&self, text: &str) -> Result<Array1<f32>> {
        let native = self.embed("text", vec![text.to_string()]).await?;
        Ok(self.projection.project(&native).row(0).to_owned())
    }

    /// 索引空间编码单张图片
    pub async fn encode_image(&self, path: impl AsRef<Path>) -> Result<Array1<f32>> {
        let data = std::fs::read(path.as_ref())?;
        let native = self.embed("image", vec![STANDARD.encode(&data)]).await?;
        Ok(self.projection.project(&native).row(0).to_owned())
    }

    /// 索引空间批量编码图片，按 batch_size 分批调用服务
    pub async fn encode_images(
        &self,
        paths: &[impl AsRef<Path>],
        batch_size: usize,
    ) -> Result<Array2<f32>> {
        let batch_size = batch_size.max(1);
        let mut flat = Vec::with_capacity(paths.len() * NATIVE_DIM);

        for chunk in paths.chunks(batch_size) {
            let inputs = chunk
                .iter()
                .map(|p| Ok(STANDARD.encode(std::fs::read(p.as_ref())?)))
                .collect::<Result<Vec<_>>>()?;
            debug!("编码 {} 张图片", inputs.len());
            let native = self.embed("image", inputs).await?;
            flat.extend(native.iter().copied());
        }

        let native = Array2::from_shape_vec((paths.len(), NATIVE_DIM), flat)?;
        Ok(self.projection.project(&native))
    }
}

impl TextEncoder for EmbedClient {
    async fn encode_texts(&self, texts: &[String]) -> Result<Array2<f32>> {
        self.encode_texts_native(texts).await
    }
}
