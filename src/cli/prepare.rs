use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio::time::sleep;

use crate::caption::{CaptionCache, CaptionDb, CaptionRecord, describe_image};
use crate::cli::SubCommandExtend;
use crate::config::{Opts, Settings};
use crate::enhance::{EnhancedDb, QueryCache, enhance_query, load_queries_spec};
use crate::gemini::GeminiClient;
use crate::utils::{hash_file, image_stem, list_images, suffix_regex, to_relative_path};

// 限流参数按生成模型免费档的配额设定
const MAX_CALLS_PER_BATCH: usize = 60;
const SLEEP_BETWEEN_CALLS: Duration = Duration::from_secs(1);
const SLEEP_AFTER_BATCH: Duration = Duration::from_secs(10);

#[derive(Parser, Debug, Clone)]
pub struct PrepareCommand {
    /// 图片目录，缺省时跳过标题生成
    #[arg(long)]
    pub images: Option<PathBuf>,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png,webp,bmp")]
    pub suffix: String,
}

impl SubCommandExtend for PrepareCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let settings = Settings::from_env();
        let gemini = GeminiClient::from_env(&settings.gemini_model)?;

        match &self.images {
            Some(images) if images.exists() => {
                generate_missing_captions(opts, &gemini, images, &self.suffix).await?;
            }
            Some(images) => error!("图片目录不存在: {}", images.display()),
            None => info!("未指定 --images，跳过标题生成"),
        }

        generate_missing_enhanced_queries(opts, &gemini).await?;

        info!("缓存准备完成");
        info!("标题数据库: {}", opts.data_dir.captions_db().display());
        info!("增强查询数据库: {}", opts.data_dir.enhanced_db().display());
        Ok(())
    }
}

/// 为目录下还没有标题的图片逐张生成标题
///
/// 每生成一条就写回数据库，中途失败不会丢掉已完成的进度
async fn generate_missing_captions(
    opts: &Opts,
    gemini: &GeminiClient,
    images_dir: &Path,
    suffix: &str,
) -> Result<()> {
    let mut db = CaptionDb::load(opts.data_dir.captions_db())?;
    let cache = CaptionCache::open(opts.data_dir.caption_cache_dir())?;

    let re = suffix_regex(suffix);
    let files = list_images(images_dir, &re);
    info!("[标题] 在 {} 中找到 {} 张图片", images_dir.display(), files.len());

    let mut known_stems: HashSet<String> = db.stem_map().into_keys().collect();
    let mut calls_in_batch = 0;
    let mut new_captions = 0;

    for img in files {
        let stem = image_stem(&img.to_string_lossy());
        if known_stems.contains(&stem) {
            continue;
        }
        let fid = match hash_file(&img) {
            Ok(fid) => fid,
            Err(e) => {
                error!("[标题] 计算哈希失败 {}: {}", img.display(), e);
                continue;
            }
        };
        if cache.get(&fid).is_some() {
            continue;
        }

        if calls_in_batch >= MAX_CALLS_PER_BATCH {
            info!("[标题] 达到批次上限，休眠 {} 秒", SLEEP_AFTER_BATCH.as_secs());
            sleep(SLEEP_AFTER_BATCH).await;
            calls_in_batch = 0;
        }

        info!("[标题] 处理 {}", img.display());
        match describe_image(gemini, &img).await {
            Ok((caption, _)) => {
                cache.put(&fid, &caption)?;
                db.insert(
                    fid,
                    CaptionRecord {
                        path: Some(to_relative_path(&img)),
                        caption,
                        source: "generated".to_string(),
                    },
                );
                known_stems.insert(stem);
                new_captions += 1;
                calls_in_batch += 1;

                sleep(SLEEP_BETWEEN_CALLS).await;
                db.save()?;
            }
            Err(e) => {
                error!("[标题] 处理 {} 失败: {}", img.display(), e);
                continue;
            }
        }
    }

    info!("[标题] 完成，新生成 {} 条", new_captions);
    db.save()?;
    Ok(())
}

/// 为查询集中还没有增强形式的查询逐条生成
async fn generate_missing_enhanced_queries(opts: &Opts, gemini: &GeminiClient) -> Result<()> {
    let spec_path = opts.data_dir.queries_spec();
    if !spec_path.exists() {
        info!("[增强] 未找到查询集定义 {}，跳过", spec_path.display());
        return Ok(());
    }

    let spec = load_queries_spec(&spec_path)?;
    let mut db = EnhancedDb::load(opts.data_dir.enhanced_db())?;
    let cache = QueryCache::open(opts.data_dir.query_cache_dir())?;

    let todo: Vec<(String, String)> = spec
        .values()
        .flat_map(|bucket| bucket.queries.iter().map(|(id, text)| (id.clone(), text.clone())))
        .collect();
    info!("[增强] 共 {} 条查询", todo.len());

    let mut calls_in_batch = 0;
    let mut new_queries = 0;

    for (query_id, query_text) in todo {
        if db.get(&query_id).is_some() {
            continue;
        }
        if let Some(hit) = cache.get(&query_id) {
            db.insert(query_id, hit);
            db.save()?;
            continue;
        }

        if calls_in_batch >= MAX_CALLS_PER_BATCH {
            info!("[增强] 达到批次上限，休眠 {} 秒", SLEEP_AFTER_BATCH.as_secs());
            sleep(SLEEP_AFTER_BATCH).await;
            calls_in_batch = 0;
        }

        info!("[增强] 处理 {}: \"{}\"", query_id, query_text);
        match enhance_query(gemini, &query_text).await {
            Ok(enhanced) => {
                cache.put(&query_id, &enhanced)?;
                db.insert(query_id, enhanced);
                new_queries += 1;
                calls_in_batch += 1;

                // 文本生成稍慢一点调用
                sleep(2 * SLEEP_BETWEEN_CALLS).await;
                db.save()?;
            }
            Err(e) => {
                error!("[增强] 处理 {} 失败: {}", query_id, e);
                continue;
            }
        }
    }

    info!("[增强] 完成，新生成 {} 条", new_queries);
    db.save()?;
    Ok(())
}
