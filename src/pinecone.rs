use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Settings;

const CONTROL_PLANE_URL: &str = "https://api.pinecone.io";

/// Pinecone 控制面客户端，负责索引的创建与查找
pub struct Pinecone {
    http: reqwest::Client,
    api_key: String,
}

#[derive(Deserialize)]
struct IndexDescription {
    host: String,
    #[serde(default)]
    status: IndexStatus,
}

#[derive(Deserialize, Default)]
struct IndexStatus {
    #[serde(default)]
    ready: bool,
}

impl Pinecone {
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("PINECONE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .context("PINECONE_API_KEY 未配置，请在 .env 文件中设置")?;
        Ok(Self { http: reqwest::Client::new(), api_key })
    }

    /// 索引不存在则按配置创建，等待就绪后返回数据面句柄
    pub async fn ensure_index(&self, settings: &Settings) -> Result<PineconeIndex> {
        let name = &settings.index_name;

        if self.describe(name).await?.is_none() {
            info!("创建索引: {} (维度 {})", name, settings.reduce_dim);
            self.create(settings).await?;
        }

        // 新建的 serverless 索引要等几秒才可写
        for _ in 0..30 {
            if let Some(desc) = self.describe(name).await? {
                if desc.status.ready {
                    return Ok(PineconeIndex {
                        http: self.http.clone(),
                        api_key: self.api_key.clone(),
                        name: name.clone(),
                        base_url: format!("https://{}", desc.host),
                    });
                }
            }
            debug!("等待索引就绪: {}", name);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        anyhow::bail!("索引 {} 长时间未就绪", name)
    }

    async fn describe(&self, name: &str) -> Result<Option<IndexDescription>> {
        let url = format!("{}/indexes/{}", CONTROL_PLANE_URL, name);
        let resp = self
            .http
            .get(&url)
            .header("Api-Key", &self.api_key)
            .send()
            .await
            .context("Pinecone 请求失败")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Pinecone 返回 {}: {}", status, body);
        }
        Ok(Some(resp.json().await.context("Pinecone 索引描述解析失败")?))
    }

    async fn create(&self, settings: &Settings) -> Result<()> {
        let url = format!("{}/indexes", CONTROL_PLANE_URL);
        let body = json!({
            "name": settings.index_name,
            "dimension": settings.reduce_dim,
            "metric": "cosine",
            "spec": {
                "serverless": {
                    "cloud": settings.pinecone_cloud,
                    "region": settings.pinecone_region,
                }
            }
        });

        let resp = self
            .http
            .post(&url)
            .header("Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Pinecone 创建索引请求失败")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("创建索引失败 {}: {}", status, body);
        }
        Ok(())
    }
}

/// 向量元数据，目前只保存相对路径
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct VectorMetadata {
    #[serde(default)]
    pub path: String,
}

/// 待写入索引的向量记录
#[derive(Serialize, Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// 一条检索结果，score 为服务端归一化后的余弦相似度，范围 [0, 1]
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub id: String,
    pub score: f32,
    pub path: String,
}

/// 索引统计信息
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    #[serde(default)]
    pub total_vector_count: u64,
    pub dimension: Option<usize>,
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceStats>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceStats {
    #[serde(default)]
    pub vector_count: u64,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    vector: &'a [f32],
    #[serde(rename = "topK")]
    top_k: usize,
    #[serde(rename = "includeMetadata")]
    include_metadata: bool,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<ApiMatch>,
}

#[derive(Deserialize)]
struct ApiMatch {
    id: String,
    #[serde(default)]
    score: f32,
    metadata: Option<VectorMetadata>,
}

/// Pinecone 数据面客户端
pub struct PineconeIndex {
    http: reqwest::Client,
    api_key: String,
    name: String,
    base_url: String,
}

impl PineconeIndex {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Pinecone 请求失败: {}", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Pinecone 返回 {}: {}", status, body);
        }
        Ok(resp)
    }

    /// 写入或更新一批向量，相同 ID 覆盖旧记录
    pub async fn upsert(&self, vectors: &[VectorRecord]) -> Result<()> {
        if vectors.is_empty() {
            return Ok(());
        }
        let body = json!({ "vectors": vectors });
        self.post("/vectors/upsert", &body).await?;
        Ok(())
    }

    /// 查询最近邻
    pub async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<SearchMatch>> {
        let req = QueryRequest { vector, top_k, include_metadata: true };
        let body = serde_json::to_value(&req)?;
        let resp: QueryResponse = self.post("/query", &body).await?.json().await?;

        Ok(resp
            .matches
            .into_iter()
            .map(|m| SearchMatch {
                id: m.id,
                score: m.score,
                path: m.metadata.map(|md| md.path).unwrap_or_default(),
            })
            .collect())
    }

    /// 按 ID 删除
    pub async fn delete_ids(&self, ids: &[String]) -> Result<()> {
        let body = json!({ "ids": ids });
        self.post("/vectors/delete", &body).await?;
        Ok(())
    }

    /// 按存储路径删除
    pub async fn delete_by_path(&self, path: &str) -> Result<()> {
        let body = json!({ "filter": { "path": { "$eq": path } } });
        self.post("/vectors/delete", &body).await?;
        Ok(())
    }

    /// 清空整个索引
    pub async fn wipe(&self) -> Result<()> {
        let body = json!({ "deleteAll": true });
        self.post("/vectors/delete", &body).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let resp = self.post("/describe_index_stats", &json!({})).await?;
        Ok(resp.json().await.context("Pinecone 统计信息解析失败")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_request_uses_wire_field_names() {
        let req = QueryRequest { vector: &[0.1, 0.2], top_k: 5, include_metadata: true };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["topK"], 5);
        assert_eq!(v["includeMetadata"], true);
    }

    #[test]
    fn stats_parse_camel_case() {
        let stats: IndexStats = serde_json::from_str(
            r#"{"totalVectorCount": 42, "dimension": 384, "namespaces": {"": {"vectorCount": 42}}}"#,
        )
        .unwrap();
        assert_eq!(stats.total_vector_count, 42);
        assert_eq!(stats.dimension, Some(384));
        assert_eq!(stats.namespaces[""].vector_count, 42);
    }

    #[test]
    fn match_without_metadata_gets_empty_path() {
        let resp: QueryResponse =
            serde_json::from_str(r#"{"matches": [{"id": "a", "score": 0.7}]}"#).unwrap();
        assert_eq!(resp.matches.len(), 1);
        assert_eq!(resp.matches[0].score, 0.7);
        assert!(resp.matches[0].metadata.is_none());
    }
}
