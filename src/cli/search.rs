use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::info;

use crate::SearcherBuilder;
use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::pinecone::SearchMatch;
use crate::rerank::RankedMatch;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// 只用索引空间相似度，速度快
    Clip,
    /// 先检索再按标题相似度重排，更准但更慢
    ClipRerank,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    /// 查询文本
    pub query: String,
    /// 返回的结果数量
    #[arg(short = 'k', long, default_value_t = 10)]
    pub top_k: usize,
    /// 扩召回倍数，重排前先取 expand*top_k 条初始结果
    #[arg(short, long, default_value_t = 3)]
    pub expand: usize,
    /// 搜索模式
    #[arg(long, value_enum, default_value_t = SearchMode::Clip)]
    pub mode: SearchMode,
    /// 标题相似度的混合权重，0 仅用原始分数，1 仅用标题
    #[arg(long, default_value_t = 0.6)]
    pub alpha: f32,
    /// 搜索前先用生成模型增强查询
    #[arg(long)]
    pub enhance: bool,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let need_gemini = self.enhance || self.mode == SearchMode::ClipRerank;
        let searcher =
            SearcherBuilder::new(opts.data_dir.clone()).gemini(need_gemini).open().await?;

        let used_query = if self.enhance {
            let enhanced = searcher.enhance(&self.query).await?;
            println!("原始查询: {}", self.query);
            println!("增强查询: {}\n", enhanced);
            enhanced
        } else {
            self.query.clone()
        };

        let fetch_k = (self.top_k * self.expand).max(1);
        let matches = searcher.search(&used_query, fetch_k).await?;

        if matches.is_empty() {
            println!("没有找到结果");
            return Ok(());
        }

        match self.mode {
            SearchMode::Clip => {
                print_matches(&matches[..self.top_k.min(matches.len())], self)
            }
            SearchMode::ClipRerank => {
                info!("按标题相似度重排 {} 条初始结果", matches.len());
                let mut out = searcher.rerank(&used_query, &matches, self.alpha, true).await?;
                out.truncate(self.top_k);
                print_reranked(&out, self)
            }
        }
    }
}

fn print_matches(matches: &[SearchMatch], opts: &SearchCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(matches)?)
        }
        OutputFormat::Table => {
            for (i, m) in matches.iter().enumerate() {
                println!("{:>2}. score={:.3}  id={}", i + 1, m.score, m.id);
                println!("    {}\n", m.path);
            }
        }
    }
    Ok(())
}

fn print_reranked(results: &[RankedMatch], opts: &SearchCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results)?)
        }
        OutputFormat::Table => {
            for (i, r) in results.iter().enumerate() {
                println!(
                    "{:>2}. final={:.3}  caption_sim={:.3}  orig={:.3}",
                    i + 1,
                    r.final_score,
                    r.caption_sim,
                    r.orig_score
                );
                println!("    {}", r.path);
                println!("    标题: {}\n", r.caption);
            }
        }
    }
    Ok(())
}
