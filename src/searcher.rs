use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use log::{error, info};

use crate::caption::{CachedCaptioner, CaptionCache};
use crate::config::{DataDir, Settings};
use crate::embed::EmbedClient;
use crate::enhance::enhance_query;
use crate::gemini::GeminiClient;
use crate::pinecone::{Pinecone, PineconeIndex, SearchMatch, VectorMetadata, VectorRecord};
use crate::projection::Projection;
use crate::rerank::{RankedMatch, rerank_by_caption};
use crate::utils::{hash_file, list_images, pb_style, suffix_regex, to_relative_path};

/// 搜索管线构造器
///
/// 所有外部服务客户端在这里一次性构造完毕，缺失的 API 密钥在构造时报错，
/// 不会拖到第一次调用才暴露。生成模型只在声明需要时才构造，
/// 这样 stats 之类的命令不要求配置 GEMINI_API_KEY。
pub struct SearcherBuilder {
    data_dir: DataDir,
    settings: Settings,
    with_gemini: bool,
}

impl SearcherBuilder {
    pub fn new(data_dir: DataDir) -> Self {
        Self { data_dir, settings: Settings::from_env(), with_gemini: false }
    }

    /// 是否需要生成模型（标题生成 / 查询增强）
    pub fn gemini(mut self, enable: bool) -> Self {
        self.with_gemini = enable;
        self
    }

    pub async fn open(self) -> Result<Searcher> {
        let rp_path = self.data_dir.rp_matrix(self.settings.reduce_dim);
        let projection = Projection::load_or_create(&rp_path, self.settings.reduce_dim)?;
        let embed = EmbedClient::new(&self.settings, projection);

        let pinecone = Pinecone::from_env()?;
        let index = pinecone.ensure_index(&self.settings).await?;

        let gemini = if self.with_gemini {
            Some(GeminiClient::from_env(&self.settings.gemini_model)?)
        } else {
            None
        };

        Ok(Searcher { data_dir: self.data_dir, settings: self.settings, embed, index, gemini })
    }
}

/// 搜索管线门面，持有全部外部服务客户端
pub struct Searcher {
    pub data_dir: DataDir,
    pub settings: Settings,
    pub embed: EmbedClient,
    pub index: PineconeIndex,
    gemini: Option<GeminiClient>,
}

impl Searcher {
    pub fn gemini(&self) -> Result<&GeminiClient> {
        self.gemini.as_ref().context("该操作需要生成模型，构造时未启用 gemini")
    }

    /// 在线标题来源，带内容哈希缓存
    pub fn captioner(&self) -> Result<CachedCaptioner<'_>> {
        let cache = CaptionCache::open(self.data_dir.caption_cache_dir())?;
        Ok(CachedCaptioner::new(self.gemini()?, cache))
    }

    /// 增强用户查询
    pub async fn enhance(&self, query: &str) -> Result<String> {
        enhance_query(self.gemini()?, query).await
    }

    /// 添加单张图片，返回向量 ID
    pub async fn upsert_one(&self, path: &Path) -> Result<String> {
        let values = self.embed.encode_image(path).await?.to_vec();
        let id = hash_file(path)?;
        let record = VectorRecord {
            id: id.clone(),
            values,
            metadata: VectorMetadata { path: to_relative_path(path) },
        };
        self.index.upsert(&[record]).await?;
        Ok(id)
    }

    /// 添加目录下的所有图片，按批处理
    ///
    /// 单个批次失败只记录日志并继续，不中断整个目录
    pub async fn upsert_dir(&self, dir: &Path, batch_size: usize, suffix: &str) -> Result<usize> {
        let re = suffix_regex(suffix);
        let files = list_images(dir, &re);
        if files.is_empty() {
            info!("目录中没有找到图片: {}", dir.display());
            return Ok(0);
        }
        info!("扫描完成，共 {} 张图片", files.len());

        let pb = ProgressBar::new(files.len() as u64).with_style(pb_style());
        let mut total = 0;
        for group in files.chunks(batch_size.max(1)) {
            match self.upsert_batch(group).await {
                Ok(n) => total += n,
                Err(e) => error!("批次添加失败: {}", e),
            }
            pb.inc(group.len() as u64);
        }
        pb.finish_with_message("图片添加完成");

        Ok(total)
    }

    async fn upsert_batch(&self, group: &[PathBuf]) -> Result<usize> {
        let embs = self.embed.encode_images(group, group.len()).await?;
        let mut records = Vec::with_capacity(group.len());
        for (path, emb) in group.iter().zip(embs.rows()) {
            records.push(VectorRecord {
                id: hash_file(path)?,
                values: emb.to_vec(),
                metadata: VectorMetadata { path: to_relative_path(path) },
            });
        }
        self.index.upsert(&records).await?;
        Ok(records.len())
    }

    /// 索引空间检索
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchMatch>> {
        let vector = self.embed.encode_text_index(query).await?.to_vec();
        self.index.query(&vector, top_k).await
    }

    /// 对初始结果做标题混合重排
    pub async fn rerank(
        &self,
        query: &str,
        matches: &[SearchMatch],
        alpha: f32,
        use_blend: bool,
    ) -> Result<Vec<RankedMatch>> {
        let captioner = self.captioner()?;
        rerank_by_caption(&self.embed, &captioner, query, matches, alpha, use_blend).await
    }
}
