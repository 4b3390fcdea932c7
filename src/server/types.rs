use axum::body::Bytes;
use axum_typed_multipart::{FieldData, TryFromMultipart};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// 上传请求参数
#[derive(TryFromMultipart)]
pub struct UploadRequest {
    pub files: Vec<FieldData<Bytes>>,
}

/// 上传表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct UploadForm {
    /// 上传的图片文件，可以是多张图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub files: String,
}

/// 搜索请求
#[derive(Debug, Deserialize, ToSchema)]
pub struct SearchRequest {
    /// 查询文本
    pub query: String,
    /// 返回的结果数量
    #[serde(default = "default_top_k")]
    #[schema(default = 10)]
    pub top_k: usize,
    /// 标题相似度的混合权重
    #[serde(default = "default_alpha")]
    #[schema(default = 0.4)]
    pub alpha: f32,
    /// 搜索前是否增强查询
    #[serde(default = "default_enhance")]
    #[schema(default = true)]
    pub enhance: bool,
}

fn default_top_k() -> usize {
    10
}

fn default_alpha() -> f32 {
    0.4
}

fn default_enhance() -> bool {
    true
}

/// 搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// 原始查询
    pub query: String,
    /// 实际使用的增强查询，未启用增强时为空
    pub enhanced_query: Option<String>,
    pub total: usize,
}

/// 返回给前端的一条结果
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResult {
    pub path: String,
    /// 混合后的最终分数
    pub score: f32,
    pub caption: String,
    pub id: String,
}

/// 上传响应
#[derive(Debug, Serialize, ToSchema)]
pub struct UploadResponse {
    pub success: bool,
    /// 成功保存的文件数
    pub uploaded: usize,
    /// 成功写入索引的文件数
    pub inserted: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// 配置校验响应
#[derive(Debug, Serialize, ToSchema)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 索引统计响应
#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    pub total_images: u64,
    pub dimension: Option<usize>,
    pub index_name: String,
}
