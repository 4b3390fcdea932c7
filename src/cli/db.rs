use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::debug;

use crate::caption::{CaptionCache, CaptionDb, CaptionRecord, describe_image};
use crate::cli::SubCommandExtend;
use crate::config::{Opts, Settings};
use crate::embed::EmbedClient;
use crate::gemini::GeminiClient;
use crate::projection::Projection;
use crate::utils::{hash_file, list_images, read_line, suffix_regex, to_relative_path};
use crate::{Searcher, SearcherBuilder};

#[derive(Parser, Debug, Clone)]
pub struct DbCommand {
    #[command(subcommand)]
    pub subcmd: DbSubCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum DbSubCommand {
    /// 添加图片，可选同时生成标题
    Add(DbAddCommand),
    /// 从索引与标题数据库中删除图片
    Delete(DbDeleteCommand),
    /// 列出标题数据库内容
    List(DbListCommand),
    /// 查看单张图片的详细信息
    Info(DbInfoCommand),
    /// 查看索引与标题数据库的统计信息
    Stats(DbStatsCommand),
    /// 导出标题数据库到 JSON 文件
    Export(DbExportCommand),
    /// 清空数据库（危险操作）
    Wipe(DbWipeCommand),
}

impl SubCommandExtend for DbCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        match &self.subcmd {
            DbSubCommand::Add(c) => c.run(opts).await,
            DbSubCommand::Delete(c) => c.run(opts).await,
            DbSubCommand::List(c) => c.run(opts).await,
            DbSubCommand::Info(c) => c.run(opts).await,
            DbSubCommand::Stats(c) => c.run(opts).await,
            DbSubCommand::Export(c) => c.run(opts).await,
            DbSubCommand::Wipe(c) => c.run(opts).await,
        }
    }
}

/// 先查缓存，未命中再调用视觉模型生成标题
async fn get_or_generate_caption(
    gemini: &GeminiClient,
    cache: &CaptionCache,
    path: &Path,
) -> Result<(String, &'static str)> {
    let key = hash_file(path)?;
    if let Some(caption) = cache.get(&key) {
        return Ok((caption, "cache"));
    }

    let (caption, stats) = describe_image(gemini, path).await?;
    cache.put(&key, &caption)?;
    debug!(
        "标题生成: input_tokens={:?} output_tokens={:?} {:?}→{:?} jpeg_bytes={}",
        stats.input_tokens,
        stats.output_tokens,
        stats.prep.orig_size,
        stats.prep.new_size,
        stats.prep.jpeg_bytes
    );
    Ok((caption, "generated"))
}

async fn add_one(
    searcher: &Searcher,
    db: &mut CaptionDb,
    cache: &CaptionCache,
    path: &Path,
    with_caption: bool,
) -> Result<()> {
    let caption = if with_caption {
        match get_or_generate_caption(searcher.gemini()?, cache, path).await {
            Ok(pair) => Some(pair),
            Err(e) => {
                eprintln!("  生成标题失败: {}", e);
                None
            }
        }
    } else {
        None
    };

    let vid = searcher.upsert_one(path).await?;
    println!("  向量 ID: {}", vid);

    if let Some((caption, source)) = caption {
        println!("  标题: {}", caption);
        db.insert(
            vid,
            CaptionRecord {
                path: Some(to_relative_path(path)),
                caption,
                source: source.to_string(),
            },
        );
        db.save()?;
    }

    Ok(())
}

#[derive(Parser, Debug, Clone)]
pub struct DbAddCommand {
    /// 单张图片路径
    #[arg(long, conflicts_with = "dir")]
    pub path: Option<PathBuf>,
    /// 图片所在目录
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// 同时为图片生成标题
    #[arg(long)]
    pub caption: bool,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png")]
    pub suffix: String,
}

impl SubCommandExtend for DbAddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let searcher =
            SearcherBuilder::new(opts.data_dir.clone()).gemini(self.caption).open().await?;
        let mut db = CaptionDb::load(opts.data_dir.captions_db())?;
        let cache = CaptionCache::open(opts.data_dir.caption_cache_dir())?;

        match (&self.path, &self.dir) {
            (Some(path), _) => {
                println!("添加图片: {}", path.display());
                add_one(&searcher, &mut db, &cache, path, self.caption).await?;
                println!("  向量维度: {}", searcher.settings.reduce_dim);
            }
            (None, Some(dir)) => {
                let re = suffix_regex(&self.suffix);
                let files = list_images(dir, &re);
                if files.is_empty() {
                    println!("目录中没有找到图片: {}", dir.display());
                    return Ok(());
                }
                println!("找到 {} 张图片，标题生成: {}", files.len(), self.caption);

                for (i, file) in files.iter().enumerate() {
                    println!("[{}/{}] 处理: {}", i + 1, files.len(), file.display());
                    if let Err(e) = add_one(&searcher, &mut db, &cache, file, self.caption).await
                    {
                        eprintln!("  添加失败: {}", e);
                    }
                }
                println!("共添加 {} 张图片", files.len());
            }
            (None, None) => anyhow::bail!("需要提供 --path 或 --dir"),
        }

        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DbDeleteCommand {
    /// 按图片路径删除
    #[arg(long, conflicts_with = "id")]
    pub path: Option<PathBuf>,
    /// 按向量 ID 删除
    #[arg(long)]
    pub id: Option<String>,
}

impl SubCommandExtend for DbDeleteCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let searcher = SearcherBuilder::new(opts.data_dir.clone()).open().await?;
        let mut db = CaptionDb::load(opts.data_dir.captions_db())?;

        let vid = match (&self.path, &self.id) {
            (Some(path), _) => {
                let vid = hash_file(path)?;
                searcher.index.delete_by_path(&to_relative_path(path)).await?;
                println!("已删除向量: {}", vid);
                vid
            }
            (None, Some(id)) => {
                searcher.index.delete_ids(std::slice::from_ref(id)).await?;
                println!("已删除向量: {}", id);
                id.clone()
            }
            (None, None) => anyhow::bail!("需要提供 --path 或 --id"),
        };

        if db.remove(&vid) {
            db.save()?;
            println!("已从标题数据库移除");
        }

        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DbListCommand {
    /// 显示完整的标题详情
    #[arg(long)]
    pub captions: bool,
}

impl SubCommandExtend for DbListCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let searcher = SearcherBuilder::new(opts.data_dir.clone()).open().await?;
        let stats = searcher.index.stats().await?;

        println!("索引中的向量总数: {}", stats.total_vector_count);
        println!("向量维度: {}\n", searcher.settings.reduce_dim);

        let db = CaptionDb::load(opts.data_dir.captions_db())?;
        if self.captions {
            println!("带标题的图片 ({}):", db.records.len());
            println!("{}", "=".repeat(80));
            for (vid, record) in &db.records {
                println!("\n向量 ID: {}", vid);
                println!("路径: {}", record.path.as_deref().unwrap_or("N/A"));
                println!("标题: {}", record.caption);
                println!("来源: {}", record.source);
            }
        } else {
            println!("带标题的图片: {}", db.records.len());
            println!("使用 --captions 查看完整详情");
        }

        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DbInfoCommand {
    /// 图片路径
    #[arg(long, conflicts_with = "id")]
    pub path: Option<PathBuf>,
    /// 向量 ID
    #[arg(long)]
    pub id: Option<String>,
}

impl SubCommandExtend for DbInfoCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let settings = Settings::from_env();
        let vid = match (&self.path, &self.id) {
            (Some(path), _) => hash_file(path)?,
            (None, Some(id)) => id.clone(),
            (None, None) => anyhow::bail!("需要提供 --path 或 --id"),
        };

        println!("图片信息");
        println!("{}", "=".repeat(80));
        println!("向量 ID: {}", vid);

        let db = CaptionDb::load(opts.data_dir.captions_db())?;
        if let Some(record) = db.records.get(&vid) {
            println!("路径: {}", record.path.as_deref().unwrap_or("N/A"));
            println!("标题: {}", record.caption);
            println!("来源: {}", record.source);
        }

        println!("\n向量维度: {}", settings.reduce_dim);

        // 只有给了存在的路径才请求嵌入服务
        if let Some(path) = self.path.as_deref().filter(|p| p.exists()) {
            let rp_path = opts.data_dir.rp_matrix(settings.reduce_dim);
            let projection = Projection::load_or_create(&rp_path, settings.reduce_dim)?;
            let embed = EmbedClient::new(&settings, projection);
            let vec = embed.encode_image(path).await?;
            println!("嵌入形状: ({},)", vec.len());
            let head = vec.iter().take(10).collect::<Vec<_>>();
            println!("嵌入前 10 个分量: {:?}", head);
        }

        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DbStatsCommand {}

impl SubCommandExtend for DbStatsCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let searcher = SearcherBuilder::new(opts.data_dir.clone()).open().await?;
        let stats = searcher.index.stats().await?;

        println!("向量索引统计");
        println!("{}", "=".repeat(80));
        println!("索引名称: {}", searcher.index.name());
        println!("向量总数: {}", stats.total_vector_count);
        match stats.dimension {
            Some(dim) => println!("维度: {}", dim),
            None => println!("维度: N/A"),
        }
        println!("配置的降维维度: {}", searcher.settings.reduce_dim);

        if !stats.namespaces.is_empty() {
            println!("\n命名空间:");
            for (ns, ns_stats) in &stats.namespaces {
                println!("  {}: {} 个向量", ns, ns_stats.vector_count);
            }
        }

        let db = CaptionDb::load(opts.data_dir.captions_db())?;
        println!("\n标题数据库统计");
        println!("{}", "=".repeat(80));
        println!("标题总数: {}", db.records.len());
        println!("数据库位置: {}", opts.data_dir.captions_db().display());

        let mut sources: BTreeMap<&str, usize> = BTreeMap::new();
        for record in db.records.values() {
            *sources.entry(record.source.as_str()).or_default() += 1;
        }
        if !sources.is_empty() {
            println!("\n标题来源:");
            for (source, count) in sources {
                println!("  {}: {}", source, count);
            }
        }

        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DbExportCommand {
    /// 输出 JSON 文件路径
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl SubCommandExtend for DbExportCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let db = CaptionDb::load(opts.data_dir.captions_db())?;
        let output = self.output.clone().unwrap_or_else(|| opts.data_dir.captions_db());

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&output, serde_json::to_string_pretty(&db.records)?)?;
        println!("已导出 {} 条标题到: {}", db.records.len(), output.display());

        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
#[command(group = clap::ArgGroup::new("target").required(true))]
pub struct DbWipeCommand {
    /// 清空向量索引与标题数据库
    #[arg(long, group = "target")]
    pub all: bool,
    /// 仅清空向量索引
    #[arg(long, group = "target")]
    pub index: bool,
    /// 仅清空标题数据库
    #[arg(long, group = "target")]
    pub captions: bool,
}

impl SubCommandExtend for DbWipeCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let wipe_index = self.all || self.index;
        let wipe_captions = self.all || self.captions;

        let db = CaptionDb::load(opts.data_dir.captions_db())?;

        println!("\n警告: 即将删除:");
        if wipe_index {
            println!("  - 向量索引中的所有向量");
        }
        if wipe_captions {
            println!("  - 标题数据库中的全部 {} 条标题", db.records.len());
        }
        println!("\n该操作无法撤销!");

        let confirm = read_line("\n输入 DELETE EVERYTHING 确认: ")?;
        if confirm != "DELETE EVERYTHING" {
            println!("已取消，未删除任何数据");
            return Ok(());
        }

        if wipe_index {
            println!("\n清空向量索引...");
            let searcher = SearcherBuilder::new(opts.data_dir.clone()).open().await?;
            searcher.index.wipe().await?;
            println!("  向量索引已清空");
        }

        if wipe_captions {
            println!("\n清空标题数据库...");
            let db_path = opts.data_dir.captions_db();
            if db_path.exists() {
                std::fs::remove_file(&db_path)?;
                println!("  已删除 {}", db_path.display());
            }

            let cache_dir = opts.data_dir.caption_cache_dir();
            if cache_dir.exists() {
                let mut removed = 0;
                for entry in std::fs::read_dir(&cache_dir)? {
                    let entry = entry?;
                    if entry.path().extension().is_some_and(|ext| ext == "json") {
                        std::fs::remove_file(entry.path())?;
                        removed += 1;
                    }
                }
                println!("  已清除 {} 条缓存标题", removed);
            }
        }

        println!("\n数据库清理完成");
        Ok(())
    }
}
