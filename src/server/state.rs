use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::Searcher;
use crate::config::DataDir;

/// 应用状态
pub struct AppState {
    /// 搜索管线，持有全部外部服务客户端
    pub searcher: Searcher,
    /// 上传目录
    pub uploads_dir: PathBuf,
    /// 设置文件路径
    pub env_path: PathBuf,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(searcher: Searcher, data_dir: &DataDir) -> Result<Arc<Self>> {
        let uploads_dir = data_dir.uploads_dir();
        std::fs::create_dir_all(&uploads_dir)?;
        let env_path = std::env::current_dir()?.join(".env");

        Ok(Arc::new(AppState { searcher, uploads_dir, env_path }))
    }
}
