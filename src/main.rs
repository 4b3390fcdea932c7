use anyhow::Result;
use clap::Parser;

use semsearch::Opts;
use semsearch::cli::SubCommandExtend;
use semsearch::config::SubCommand;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let opts = Opts::parse();
    match &opts.subcmd {
        SubCommand::Insert(config) => config.run(&opts).await,
        SubCommand::Search(config) => config.run(&opts).await,
        SubCommand::Stats(config) => config.run(&opts).await,
        SubCommand::Wipe(config) => config.run(&opts).await,
        SubCommand::Db(config) => config.run(&opts).await,
        SubCommand::Prepare(config) => config.run(&opts).await,
        SubCommand::Evaluate(config) => config.run(&opts).await,
        SubCommand::Server(config) => config.run(&opts).await,
    }
}
