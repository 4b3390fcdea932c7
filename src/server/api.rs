use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum_typed_multipart::TypedMultipart;
use log::warn;
use serde_json::{Value, json};

use super::error::Result;
use super::state::AppState;
use super::types::*;
use crate::metrics;
use crate::utils::{is_within_dir, sanitize_filename};

const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// 主页
pub async fn index_page() -> Html<&'static str> {
    Html(include_str!("../../static/index.html"))
}

/// 设置页
pub async fn settings_page() -> Html<&'static str> {
    Html(include_str!("../../static/settings.html"))
}

/// 校验外部服务配置是否可用
#[utoipa::path(
    get,
    path = "/api/validate",
    responses(
        (status = 200, body = ValidateResponse),
    )
)]
pub async fn validate_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ValidateResponse>) {
    let mut errors = vec![];

    if let Err(e) = state.searcher.index.stats().await {
        errors.push(format!("Pinecone 错误: {}", e));
    }
    if let Err(e) = state.searcher.enhance("test").await {
        errors.push(format!("Gemini 错误: {}", e));
    }

    if errors.is_empty() {
        let resp = ValidateResponse {
            valid: true,
            errors,
            message: Some("所有 API 配置有效".to_string()),
        };
        (StatusCode::OK, Json(resp))
    } else {
        (StatusCode::BAD_REQUEST, Json(ValidateResponse { valid: false, errors, message: None }))
    }
}

/// 读取设置文件
#[utoipa::path(get, path = "/api/settings")]
pub async fn get_settings_handler(State(state): State<Arc<AppState>>) -> Result<Response> {
    if !state.env_path.exists() {
        let body = json!({ "error": ".env 文件不存在" });
        return Ok((StatusCode::NOT_FOUND, Json(body)).into_response());
    }

    let content = std::fs::read_to_string(&state.env_path)?;
    Ok(Json(parse_settings(&content)).into_response())
}

/// 更新设置文件
///
/// 只改写给到的键，保留原有注释与顺序；新键追加到末尾。
/// 已构造的客户端不会热更新，改动在下次启动时生效。
#[utoipa::path(post, path = "/api/settings")]
pub async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    Json(data): Json<BTreeMap<String, String>>,
) -> Result<Json<Value>> {
    let existing = std::fs::read_to_string(&state.env_path).unwrap_or_default();
    let updated = apply_settings(&existing, &data);
    std::fs::write(&state.env_path, updated)?;

    Ok(Json(json!({ "success": true, "message": "设置已更新" })))
}

fn parse_settings(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            line.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

fn apply_settings(existing: &str, updates: &BTreeMap<String, String>) -> String {
    let mut updated_keys = HashSet::new();
    let mut lines = vec![];

    for line in existing.lines() {
        let stripped = line.trim();
        if !stripped.is_empty() && !stripped.starts_with('#') {
            if let Some((key, _)) = stripped.split_once('=') {
                if let Some(value) = updates.get(key) {
                    lines.push(format!("{}={}", key, value));
                    updated_keys.insert(key.to_string());
                    continue;
                }
            }
        }
        lines.push(line.to_string());
    }

    for (key, value) in updates {
        if !updated_keys.contains(key) {
            lines.push(format!("{}={}", key, value));
        }
    }

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// 上传图片并写入索引
#[utoipa::path(
    post,
    path = "/api/upload",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = UploadResponse),
    )
)]
pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<UploadRequest>,
) -> Result<Response> {
    if data.files.is_empty() {
        let body = json!({ "error": "未提供文件" });
        return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
    }

    let mut saved = vec![];
    let mut warnings = vec![];

    for file in &data.files {
        let Some(name) = file.metadata.file_name.clone().filter(|n| !n.is_empty()) else {
            warnings.push("文件缺少文件名".to_string());
            continue;
        };

        let clean = sanitize_filename(&name);
        let allowed = std::path::Path::new(&clean)
            .extension()
            .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
            .unwrap_or(false);
        if !allowed {
            warnings.push(format!("{}: 不支持的文件类型", name));
            continue;
        }

        let path = state.uploads_dir.join(&clean);
        match std::fs::write(&path, &file.contents) {
            Ok(()) => saved.push(path),
            Err(e) => warnings.push(format!("{}: {}", name, e)),
        }
    }

    if saved.is_empty() {
        let body = json!({ "error": "没有有效的图片", "details": warnings });
        return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
    }

    // 单个文件写索引失败只记告警，不影响其它文件
    let mut inserted = 0;
    for path in &saved {
        match state.searcher.upsert_one(path).await {
            Ok(_) => inserted += 1,
            Err(e) => {
                let name = path.file_name().map(|n| n.to_string_lossy().to_string());
                warnings.push(format!("{}: {}", name.unwrap_or_default(), e));
            }
        }
    }

    let resp = UploadResponse { success: true, uploaded: saved.len(), inserted, warnings };
    Ok(Json(resp).into_response())
}

/// 搜索图片
#[utoipa::path(
    post,
    path = "/api/search",
    request_body = SearchRequest,
    responses(
        (status = 200, body = SearchResponse),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Result<Response> {
    let query = req.query.trim().to_string();
    if query.is_empty() {
        let body = json!({ "error": "查询不能为空" });
        return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
    }

    let start = Instant::now();
    metrics::inc_search_count("clip_rerank", req.enhance);

    // 增强失败时退回原查询，不让搜索整体失败
    let used_query = if req.enhance {
        match state.searcher.enhance(&query).await {
            Ok(enhanced) => enhanced,
            Err(e) => {
                warn!("查询增强失败: {}", e);
                query.clone()
            }
        }
    } else {
        query.clone()
    };

    let fetch_k = (req.top_k * 3).max(1);
    let matches = state.searcher.search(&used_query, fetch_k).await?;

    if matches.is_empty() {
        let resp = SearchResponse {
            results: vec![],
            query,
            enhanced_query: req.enhance.then_some(used_query),
            total: 0,
        };
        return Ok(Json(resp).into_response());
    }

    let mut reranked = state.searcher.rerank(&used_query, &matches, req.alpha, true).await?;
    reranked.truncate(req.top_k);

    if let Some(top) = reranked.first() {
        metrics::observe_top_score(top.final_score);
    }
    metrics::observe_search_duration("clip_rerank", start.elapsed().as_secs_f32());

    let results = reranked
        .into_iter()
        .map(|r| SearchResult { path: r.path, score: r.final_score, caption: r.caption, id: r.id })
        .collect::<Vec<_>>();
    let total = results.len();

    let resp = SearchResponse {
        results,
        query,
        enhanced_query: req.enhance.then_some(used_query),
        total,
    };
    Ok(Json(resp).into_response())
}

/// 提供上传目录内的图片文件
///
/// 只按文件名在上传目录中查找，防止路径穿越到目录之外
#[utoipa::path(
    get,
    path = "/api/image/{path}",
    params(("path" = String, Path, description = "图片路径")),
    responses(
        (status = 200),
        (status = 404),
    )
)]
pub async fn image_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response> {
    let not_found = || {
        (StatusCode::NOT_FOUND, Json(json!({ "error": "图片不存在" }))).into_response()
    };

    let Some(file_name) = std::path::Path::new(&path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
    else {
        return Ok(not_found());
    };

    let candidate = state.uploads_dir.join(&file_name);
    if !is_within_dir(&candidate, &state.uploads_dir) {
        return Ok(not_found());
    }

    let Ok(bytes) = std::fs::read(&candidate) else {
        return Ok(not_found());
    };

    let mime = match candidate.extension().map(|e| e.to_string_lossy().to_lowercase()) {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    };

    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

/// 获取索引统计信息
#[utoipa::path(
    get,
    path = "/api/stats",
    responses(
        (status = 200, body = StatsResponse),
    )
)]
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>> {
    let stats = state.searcher.index.stats().await?;
    Ok(Json(StatsResponse {
        total_images: stats.total_vector_count,
        dimension: stats.dimension,
        index_name: state.searcher.index.name().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let content = "# 注释\nPINECONE_API_KEY=abc\n\nREDUCE_DIM=384\nbad line\n";
        let settings = parse_settings(content);
        assert_eq!(settings.len(), 2);
        assert_eq!(settings["PINECONE_API_KEY"], "abc");
        assert_eq!(settings["REDUCE_DIM"], "384");
    }

    #[test]
    fn apply_updates_existing_and_appends_new() {
        let existing = "# 注释\nREDUCE_DIM=384\nINDEX_NAME=old\n";
        let updates = BTreeMap::from([
            ("INDEX_NAME".to_string(), "new".to_string()),
            ("GEMINI_MODEL".to_string(), "gemini-2.0-flash".to_string()),
        ]);

        let out = apply_settings(existing, &updates);
        assert_eq!(out, "# 注释\nREDUCE_DIM=384\nINDEX_NAME=new\nGEMINI_MODEL=gemini-2.0-flash\n");
    }

    #[test]
    fn apply_on_empty_file() {
        let updates = BTreeMap::from([("A".to_string(), "1".to_string())]);
        assert_eq!(apply_settings("", &updates), "A=1\n");
    }
}
