use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::SearcherBuilder;
use crate::cli::SubCommandExtend;
use crate::config::Opts;

#[derive(Parser, Debug, Clone)]
pub struct InsertCommand {
    /// 单张图片路径
    #[arg(long, conflicts_with = "dir")]
    pub path: Option<PathBuf>,
    /// 图片所在目录
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// 批处理大小
    #[arg(short, long, default_value_t = 16)]
    pub batch: usize,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png")]
    pub suffix: String,
}

impl SubCommandExtend for InsertCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let searcher = SearcherBuilder::new(opts.data_dir.clone()).open().await?;

        match (&self.path, &self.dir) {
            (Some(path), _) => {
                let vid = searcher.upsert_one(path).await?;
                println!("已添加 {} → {}", vid, path.display());
            }
            (None, Some(dir)) => {
                let total = searcher.upsert_dir(dir, self.batch, &self.suffix).await?;
                println!("从 {} 添加了 {} 张图片", dir.display(), total);
            }
            (None, None) => {
                anyhow::bail!("需要提供 --path 或 --dir");
            }
        }

        Ok(())
    }
}
