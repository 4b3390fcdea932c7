use anyhow::Result;
use clap::Parser;

use crate::SearcherBuilder;
use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::utils::read_line;

#[derive(Parser, Debug, Clone)]
pub struct WipeCommand {}

impl SubCommandExtend for WipeCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let confirm = read_line("警告: 将删除索引中的所有向量，输入 yes 确认: ")?;
        if !confirm.eq_ignore_ascii_case("yes") {
            println!("已取消");
            return Ok(());
        }

        let searcher = SearcherBuilder::new(opts.data_dir.clone()).open().await?;
        searcher.index.wipe().await?;
        println!("已清空索引: {}", searcher.index.name());

        Ok(())
    }
}
