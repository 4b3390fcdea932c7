mod db;
mod evaluate;
mod insert;
mod prepare;
mod search;
pub mod server;
mod stats;
mod wipe;

pub use db::*;
pub use evaluate::*;
pub use insert::*;
pub use prepare::*;
pub use search::*;
pub use server::*;
pub use stats::*;
pub use wipe::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
