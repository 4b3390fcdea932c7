use std::fs::File;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use crate::caption::{CaptionDb, OfflineCaptions};
use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::enhance::{EnhancedDb, QueriesSpec, load_queries_spec};
use crate::rerank::{CaptionSource, rerank_by_caption};
use crate::utils::image_stem;
use crate::{Searcher, SearcherBuilder};

#[derive(Parser, Debug, Clone)]
pub struct EvaluateCommand {
    /// 输出 CSV 文件路径
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// 扩召回倍数，重排前先取 expand*k 条初始结果
    #[arg(long, default_value_t = 3)]
    pub expand: usize,
    /// 参与评估的模型，缺省为全部
    #[arg(long, value_delimiter = ',', value_parser = ["clip", "clip_rerank"])]
    pub models: Vec<String>,
    /// 参与评估的难度档，缺省为全部
    #[arg(long, value_delimiter = ',', value_parser = ["eq", "mq", "hq"])]
    pub difficulties: Vec<String>,
    /// 离线模式：只用预生成的缓存，不调用生成模型
    #[arg(long)]
    pub offline: bool,
}

impl SubCommandExtend for EvaluateCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let spec_path = opts.data_dir.queries_spec();
        anyhow::ensure!(
            spec_path.exists(),
            "未找到查询集定义 {}，请先准备查询集",
            spec_path.display()
        );
        let spec = load_queries_spec(&spec_path)?;

        let enhanced = if self.offline {
            EnhancedDb::load_required(opts.data_dir.enhanced_db())?
        } else {
            EnhancedDb::load(opts.data_dir.enhanced_db())?
        };

        let searcher =
            SearcherBuilder::new(opts.data_dir.clone()).gemini(!self.offline).open().await?;

        let output = self
            .output
            .clone()
            .unwrap_or_else(|| opts.data_dir.evaluation_dir().join("results.csv"));
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(&output)?;
        writer.write_record(["model", "enhancement", "difficulty", "query_id", "k", "results"])?;

        let total_runs = if self.offline {
            let db = CaptionDb::load_required(opts.data_dir.captions_db())?;
            let captions = OfflineCaptions::new(&db);
            self.sweep(&searcher, &captions, &spec, enhanced, &mut writer).await?
        } else {
            let captions = searcher.captioner()?;
            self.sweep(&searcher, &captions, &spec, enhanced, &mut writer).await?
        };
        writer.flush()?;

        info!("评估完成，共 {} 轮", total_runs);
        info!("结果保存到: {}", output.display());
        Ok(())
    }
}

impl EvaluateCommand {
    /// 跑完整个配置扫描：模型 × 增强开关 × 难度档 × 查询 × k 值
    async fn sweep<C: CaptionSource>(
        &self,
        searcher: &Searcher,
        captions: &C,
        spec: &QueriesSpec,
        mut enhanced: EnhancedDb,
        writer: &mut csv::Writer<File>,
    ) -> Result<usize> {
        let models = if self.models.is_empty() {
            vec!["clip".to_string(), "clip_rerank".to_string()]
        } else {
            self.models.clone()
        };
        let difficulties = if self.difficulties.is_empty() {
            vec!["eq".to_string(), "mq".to_string(), "hq".to_string()]
        } else {
            self.difficulties.clone()
        };

        let mut total_runs = 0;
        for model in &models {
            let alphas: Vec<Option<f32>> = if model == "clip_rerank" {
                vec![Some(1.0), Some(0.6), Some(0.4)]
            } else {
                vec![None]
            };

            for use_enhancement in [true, false] {
                for difficulty in &difficulties {
                    let Some(bucket) = spec.get(difficulty) else {
                        warn!("查询集中没有难度档: {}", difficulty);
                        continue;
                    };

                    for (query_id, query_text) in &bucket.queries {
                        let used_query = self
                            .used_query(searcher, &mut enhanced, query_id, query_text, use_enhancement)
                            .await?;

                        for &k in &bucket.k_vals {
                            for &alpha in &alphas {
                                let model_name = match alpha {
                                    Some(a) => format!("clip_rerank_a{:?}", a),
                                    None => model.clone(),
                                };
                                info!(
                                    "运行: {}, enhancement={}, {}, {}, k={}",
                                    model_name, use_enhancement, difficulty, query_id, k
                                );

                                let results = self
                                    .run_search(searcher, captions, &used_query, k, alpha)
                                    .await?;

                                writer.write_record([
                                    model_name.clone(),
                                    use_enhancement.to_string(),
                                    difficulty.clone(),
                                    query_id.clone(),
                                    k.to_string(),
                                    serde_json::to_string(&results)?,
                                ])?;
                                total_runs += 1;
                            }
                        }
                    }
                }
            }
        }

        Ok(total_runs)
    }

    /// 取实际参与检索的查询文本，增强结果写回数据库保证复现
    async fn used_query(
        &self,
        searcher: &Searcher,
        enhanced: &mut EnhancedDb,
        query_id: &str,
        query_text: &str,
        use_enhancement: bool,
    ) -> Result<String> {
        if !use_enhancement {
            return Ok(query_text.to_string());
        }
        if let Some(hit) = enhanced.get(query_id) {
            return Ok(hit.to_string());
        }
        if self.offline {
            warn!("离线模式下缺少增强查询 {}，退回原文", query_id);
            return Ok(query_text.to_string());
        }

        info!("增强查询 {}: {}", query_id, query_text);
        let text = searcher.enhance(query_text).await?;
        info!("  → {}", text);
        enhanced.insert(query_id.to_string(), text.clone());
        enhanced.save()?;
        Ok(text)
    }

    /// 单次检索，返回前 k 个结果的图片主干名
    async fn run_search<C: CaptionSource>(
        &self,
        searcher: &Searcher,
        captions: &C,
        query: &str,
        k: usize,
        alpha: Option<f32>,
    ) -> Result<Vec<String>> {
        let fetch_k = (k * self.expand).max(1);
        let matches = searcher.search(query, fetch_k).await?;
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let paths: Vec<String> = match alpha {
            Some(alpha) => {
                rerank_by_caption(&searcher.embed, captions, query, &matches, alpha, true)
                    .await?
                    .into_iter()
                    .take(k)
                    .map(|r| r.path)
                    .collect()
            }
            None => matches.into_iter().take(k).map(|m| m.path).collect(),
        };

        Ok(paths.iter().filter(|p| !p.is_empty()).map(|p| image_stem(p)).collect())
    }
}
