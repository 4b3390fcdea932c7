use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::{ENHANCE_FEW_SHOTS, ENHANCE_SYSTEM_PROMPT};
use crate::gemini::{Content, GeminiClient};

/// 构造带 few-shot 示例的对话内容
fn build_contents(user_query: &str) -> Vec<Content> {
    let mut contents = vec![Content::user_text(ENHANCE_SYSTEM_PROMPT)];
    for (q, a) in ENHANCE_FEW_SHOTS {
        contents.push(Content::user_text(*q));
        contents.push(Content::model_text(*a));
    }
    contents.push(Content::user_text(user_query));
    contents
}

/// 把模型输出裁剪成单句：取第一行、去引号、截到第一个句号
fn postprocess(text: &str, original: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return original.trim().to_string();
    }

    let mut out = text.lines().next().unwrap_or("").trim().trim_matches([' ', '"', '\'']);

    if out.contains('.') {
        if let Some(first) = out.split('.').map(str::trim).find(|p| !p.is_empty()) {
            out = first;
        }
    }

    out.to_string()
}

/// 把简短的用户查询改写成一句更具描述性的查询
///
/// 增强结果保证以原查询开头，低温度让输出贴近字面；
/// 模型返回空时退回原查询。
pub async fn enhance_query(gemini: &GeminiClient, query: &str) -> Result<String> {
    let contents = build_contents(query);
    let generated = gemini.generate(&contents, Some(0.1)).await?;
    Ok(postprocess(&generated.text, query))
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    enhanced: String,
    ts: u64,
}

/// 按查询 ID 缓存增强结果，每个键一个文件，不设过期
pub struct QueryCache {
    dir: PathBuf,
}

impl QueryCache {
    pub fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let data = std::fs::read_to_string(self.entry_path(key)).ok()?;
        let entry: CacheEntry = serde_json::from_str(&data).ok()?;
        Some(entry.enhanced)
    }

    pub fn put(&self, key: &str, enhanced: &str) -> Result<()> {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        let entry = CacheEntry { enhanced: enhanced.to_string(), ts };
        std::fs::write(self.entry_path(key), serde_json::to_string(&entry)?)?;
        Ok(())
    }
}

/// 增强查询数据库，查询 ID 到增强文本的单个 JSON 文件
///
/// 评估扫描依赖它保证可复现，不必每轮重复调用模型
pub struct EnhancedDb {
    path: PathBuf,
    pub entries: BTreeMap<String, String>,
}

impl EnhancedDb {
    /// 加载数据库，文件不存在视作空库
    pub fn load(path: PathBuf) -> Result<Self> {
        let entries = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("增强查询数据库解析失败: {}", path.display()))?,
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { path, entries })
    }

    /// 加载数据库，文件不存在时报错并提示先运行 prepare
    pub fn load_required(path: PathBuf) -> Result<Self> {
        anyhow::ensure!(
            path.exists(),
            "未找到 {}，请先运行 `semsearch prepare` 生成增强查询缓存",
            path.display()
        );
        Self::load(path)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }

    pub fn get(&self, query_id: &str) -> Option<&str> {
        self.entries.get(query_id).map(String::as_str).filter(|s| !s.is_empty())
    }

    pub fn insert(&mut self, query_id: String, enhanced: String) {
        self.entries.insert(query_id, enhanced);
    }

    /// 评估时选择实际使用的查询文本：增强模式下查不到就退回原文
    pub fn used_query(&self, query_id: &str, original: &str, enhanced: bool) -> String {
        if enhanced {
            self.get(query_id).unwrap_or(original).to_string()
        } else {
            original.to_string()
        }
    }
}

/// 查询集中的一个难度档
#[derive(Deserialize, Debug, Clone)]
pub struct QueryBucket {
    /// 该难度档评估时使用的 k 值列表
    pub k_vals: Vec<usize>,
    /// 查询 ID 到查询文本
    pub queries: BTreeMap<String, String>,
}

/// 查询集定义，难度档名到查询分组
pub type QueriesSpec = BTreeMap<String, QueryBucket>;

/// 加载查询集定义文件
pub fn load_queries_spec(path: &Path) -> Result<QueriesSpec> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取查询集定义: {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("查询集定义解析失败: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contents_carry_system_prompt_and_few_shots() {
        let contents = build_contents("sunset");
        // 系统提示 + 5 组 few-shot 问答 + 用户查询
        assert_eq!(contents.len(), 1 + ENHANCE_FEW_SHOTS.len() * 2 + 1);
        assert_eq!(contents[0].role, "user");
        assert_eq!(contents[1].role, "user");
        assert_eq!(contents[2].role, "model");
        assert_eq!(contents.last().unwrap().parts[0].text.as_deref(), Some("sunset"));
    }

    #[test]
    fn postprocess_takes_first_line_and_strips_quotes() {
        let out = postprocess("\"a dog, the image might include a park\"\nsecond line", "a dog");
        assert_eq!(out, "a dog, the image might include a park");
    }

    #[test]
    fn postprocess_truncates_to_first_sentence() {
        let out = postprocess("a cat on a sofa. It looks sleepy.", "a cat");
        assert_eq!(out, "a cat on a sofa");
    }

    #[test]
    fn postprocess_empty_falls_back_to_original() {
        assert_eq!(postprocess("   ", " a boat "), "a boat");
    }

    #[test]
    fn used_query_falls_back_when_missing() {
        let db = EnhancedDb { path: PathBuf::new(), entries: BTreeMap::new() };
        assert_eq!(db.used_query("eq1", "a boat", true), "a boat");
        assert_eq!(db.used_query("eq1", "a boat", false), "a boat");

        let mut db = db;
        db.insert("eq1".to_string(), "a boat, the image might include sails".to_string());
        assert_eq!(db.used_query("eq1", "a boat", true), "a boat, the image might include sails");
        assert_eq!(db.used_query("eq1", "a boat", false), "a boat");
    }

    #[test]
    fn query_cache_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = QueryCache::open(dir.path().to_path_buf())?;
        cache.put("eq1", "a boat, the image might include sails")?;
        assert_eq!(cache.get("eq1").as_deref(), Some("a boat, the image might include sails"));
        assert_eq!(cache.get("eq2"), None);
        Ok(())
    }
}
