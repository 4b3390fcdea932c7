use anyhow::Result;
use clap::Parser;

use crate::SearcherBuilder;
use crate::cli::SubCommandExtend;
use crate::config::Opts;

#[derive(Parser, Debug, Clone)]
pub struct StatsCommand {}

impl SubCommandExtend for StatsCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let searcher = SearcherBuilder::new(opts.data_dir.clone()).open().await?;
        let stats = searcher.index.stats().await?;

        println!("索引统计信息:");
        println!("  名称: {}", searcher.index.name());
        println!("  向量总数: {}", stats.total_vector_count);
        match stats.dimension {
            Some(dim) => println!("  维度: {}", dim),
            None => println!("  维度: N/A"),
        }
        println!("  命名空间: {:?}", stats.namespaces.keys().collect::<Vec<_>>());

        Ok(())
    }
}
