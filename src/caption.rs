use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::CAPTION_PROMPT;
use crate::gemini::{Content, GeminiClient, Part};
use crate::rerank::CaptionSource;
use crate::utils::{hash_file, image_stem};

/// 标题缓存默认过期天数
const CAPTION_TTL_DAYS: u64 = 365;

/// 发给视觉模型前的图片长边上限
const MAX_LONG_EDGE: u32 = 256;

/// 重编码 JPEG 质量
const JPEG_QUALITY: u8 = 50;

/// 图片预处理统计
#[derive(Debug, Clone, Copy)]
pub struct PrepStats {
    pub orig_size: (u32, u32),
    pub new_size: (u32, u32),
    pub jpeg_bytes: usize,
}

/// 一次标题生成的统计信息
#[derive(Debug, Clone, Copy)]
pub struct CaptionStats {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub prep: PrepStats,
}

/// 压缩图片并编码为 base64，控制发给视觉模型的体积
fn prep_image(path: &Path) -> Result<(&'static str, String, PrepStats)> {
    let img = image::ImageReader::open(path)
        .with_context(|| format!("无法打开图片: {}", path.display()))?
        .decode()
        .with_context(|| format!("无法解码图片: {}", path.display()))?;

    let (w, h) = (img.width(), img.height());
    let long_edge = w.max(h);
    let img = if long_edge > MAX_LONG_EDGE {
        let scale = MAX_LONG_EDGE as f64 / long_edge as f64;
        let new_w = ((w as f64 * scale) as u32).max(1);
        let new_h = ((h as f64 * scale) as u32).max(1);
        img.resize_exact(new_w, new_h, FilterType::Lanczos3)
    } else {
        img
    };
    let new_size = (img.width(), img.height());

    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(&img.to_rgb8())
        .context("JPEG 编码失败")?;
    let data = buf.into_inner();

    let stats = PrepStats { orig_size: (w, h), new_size, jpeg_bytes: data.len() };
    Ok(("image/jpeg", STANDARD.encode(&data), stats))
}

/// 清洗模型输出，去掉啰嗦的前缀
pub fn clean_caption(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let mut text = raw.trim().to_string();

    // 丢弃第一个冒号之前的标签式前缀
    if let Some(pos) = text.find(':') {
        text = text[pos + 1..].to_string();
    }

    text = text.split_whitespace().collect::<Vec<_>>().join(" ");

    const PREFIXES: &[&str] = &["Here is", "Here's", "Certainly", "This image", "The image shows"];
    for prefix in PREFIXES {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.trim_start_matches([' ', ',', '.', '-']).trim().to_string();
            break;
        }
    }

    text
}

/// 调用视觉模型为图片生成标题
pub async fn describe_image(
    gemini: &GeminiClient,
    path: &Path,
) -> Result<(String, CaptionStats)> {
    let (mime, b64, prep) = prep_image(path)?;
    let contents =
        vec![Content::user_parts(vec![Part::inline_data(mime, b64), Part::text(CAPTION_PROMPT)])];

    let input_tokens = gemini.count_tokens(&contents).await.ok();
    let generated = gemini.generate(&contents, None).await?;
    let caption = clean_caption(&generated.text);

    Ok((caption, CaptionStats { input_tokens, output_tokens: generated.output_tokens, prep }))
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    caption: String,
    ts: u64,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// 按内容哈希缓存标题，每个键一个文件
///
/// 写入即落盘，长批次中途崩溃也不会丢已生成的部分
pub struct CaptionCache {
    dir: PathBuf,
}

impl CaptionCache {
    pub fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// 读取缓存的标题，超过 TTL 视作不存在
    pub fn get(&self, key: &str) -> Option<String> {
        let data = std::fs::read_to_string(self.entry_path(key)).ok()?;
        let entry: CacheEntry = serde_json::from_str(&data).ok()?;
        if now_secs().saturating_sub(entry.ts) > CAPTION_TTL_DAYS * 86400 {
            return None;
        }
        Some(entry.caption)
    }

    pub fn put(&self, key: &str, caption: &str) -> Result<()> {
        let entry = CacheEntry { caption: caption.to_string(), ts: now_secs() };
        std::fs::write(self.entry_path(key), serde_json::to_string(&entry)?)?;
        Ok(())
    }
}

/// 标题数据库中的一条记录
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CaptionRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub caption: String,
    pub source: String,
}

/// 标题数据库，以向量 ID 为键的单个 JSON 文件
pub struct CaptionDb {
    path: PathBuf,
    pub records: BTreeMap<String, CaptionRecord>,
}

impl CaptionDb {
    /// 加载数据库，文件不存在视作空库
    pub fn load(path: PathBuf) -> Result<Self> {
        let records = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("标题数据库解析失败: {}", path.display()))?,
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { path, records })
    }

    /// 加载数据库，文件不存在时报错并提示先运行 prepare
    pub fn load_required(path: PathBuf) -> Result<Self> {
        anyhow::ensure!(
            path.exists(),
            "未找到 {}，请先运行 `semsearch prepare` 生成标题缓存",
            path.display()
        );
        Self::load(path)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.records)?)?;
        Ok(())
    }

    pub fn insert(&mut self, id: String, record: CaptionRecord) {
        self.records.insert(id, record);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    /// 构建图片主干名到标题的映射，供离线重排查询
    ///
    /// 记录未存路径时退回用键本身作为主干名
    pub fn stem_map(&self) -> HashMap<String, String> {
        self.records
            .iter()
            .map(|(id, record)| {
                let stem = record
                    .path
                    .as_deref()
                    .map(image_stem)
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| id.clone());
                (stem, record.caption.clone())
            })
            .collect()
    }
}

/// 在线标题来源：优先查缓存，未命中时调用视觉模型并写回
pub struct CachedCaptioner<'a> {
    gemini: &'a GeminiClient,
    cache: CaptionCache,
}

impl<'a> CachedCaptioner<'a> {
    pub fn new(gemini: &'a GeminiClient, cache: CaptionCache) -> Self {
        Self { gemini, cache }
    }

    pub async fn caption_for(&self, path: &str) -> String {
        let file = Path::new(path);
        if !file.exists() {
            warn!("图片文件不存在: {}", path);
            return String::new();
        }

        let key = match hash_file(file) {
            Ok(key) => key,
            Err(e) => {
                warn!("计算哈希失败 {}: {}", path, e);
                return String::new();
            }
        };

        if let Some(caption) = self.cache.get(&key) {
            return caption;
        }

        match describe_image(self.gemini, file).await {
            Ok((caption, _)) => {
                if let Err(e) = self.cache.put(&key, &caption) {
                    warn!("写入标题缓存失败 {}: {}", path, e);
                }
                caption
            }
            Err(e) => {
                warn!("生成标题失败 {}: {}", path, e);
                String::new()
            }
        }
    }
}

impl CaptionSource for CachedCaptioner<'_> {
    async fn caption(&self, path: &str) -> String {
        self.caption_for(path).await
    }
}

/// 离线标题来源：只查预生成的标题数据库，不发起任何外部调用
pub struct OfflineCaptions {
    stems: HashMap<String, String>,
}

impl OfflineCaptions {
    pub fn new(db: &CaptionDb) -> Self {
        Self { stems: db.stem_map() }
    }
}

impl CaptionSource for OfflineCaptions {
    async fn caption(&self, path: &str) -> String {
        self.stems.get(&image_stem(path)).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_label_prefix_before_colon() {
        assert_eq!(
            clean_caption("Caption: a red fox in the snow"),
            "a red fox in the snow"
        );
    }

    #[test]
    fn clean_collapses_whitespace() {
        assert_eq!(clean_caption("a  cat\n sitting\ton a mat"), "a cat sitting on a mat");
    }

    #[test]
    fn clean_removes_filler_openers() {
        assert_eq!(clean_caption("Here is a dog running on grass"), "a dog running on grass");
        assert_eq!(clean_caption("The image shows a blue car"), "a blue car");
    }

    #[test]
    fn clean_empty_input() {
        assert_eq!(clean_caption(""), "");
    }

    #[test]
    fn cache_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = CaptionCache::open(dir.path().to_path_buf())?;
        cache.put("abc", "a quiet harbor at dusk")?;
        assert_eq!(cache.get("abc").as_deref(), Some("a quiet harbor at dusk"));
        assert_eq!(cache.get("missing"), None);
        Ok(())
    }

    #[test]
    fn cache_expires_after_ttl() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = CaptionCache::open(dir.path().to_path_buf())?;
        // 手工写入一个已过期的条目
        let stale = CacheEntry {
            caption: "old".to_string(),
            ts: now_secs() - (CAPTION_TTL_DAYS + 1) * 86400,
        };
        std::fs::write(dir.path().join("old.json"), serde_json::to_string(&stale)?)?;
        assert_eq!(cache.get("old"), None);
        Ok(())
    }

    #[test]
    fn corrupt_cache_entry_is_absent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = CaptionCache::open(dir.path().to_path_buf())?;
        std::fs::write(dir.path().join("bad.json"), "not json")?;
        assert_eq!(cache.get("bad"), None);
        Ok(())
    }

    #[test]
    fn stem_map_prefers_path_over_key() {
        let mut db = CaptionDb { path: PathBuf::new(), records: BTreeMap::new() };
        db.insert(
            "hash1".to_string(),
            CaptionRecord {
                path: Some("imgs/eq1_1.jpg".to_string()),
                caption: "a".to_string(),
                source: "generated".to_string(),
            },
        );
        db.insert(
            "hash2".to_string(),
            CaptionRecord { path: None, caption: "b".to_string(), source: "cache".to_string() },
        );

        let stems = db.stem_map();
        assert_eq!(stems.get("eq1_1").map(String::as_str), Some("a"));
        assert_eq!(stems.get("hash2").map(String::as_str), Some("b"));
    }
}
