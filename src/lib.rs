pub mod caption;
pub mod cli;
pub mod config;
pub mod embed;
pub mod enhance;
pub mod gemini;
mod metrics;
pub mod pinecone;
pub mod projection;
pub mod rerank;
pub mod searcher;
mod server;
pub mod utils;

pub use config::Opts;
pub use searcher::{Searcher, SearcherBuilder};
