use std::convert::Infallible;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;

/// 嵌入模型的原生维度
pub const NATIVE_DIM: usize = 512;

/// 随机投影矩阵的固定种子，保证跨机器可复现
pub const RP_SEED: u64 = 42;

static DATA_DIR: LazyLock<DataDir> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "", "semsearch").expect("failed to get project dir");
    DataDir { path: proj_dirs.data_dir().to_path_buf() }
});

fn default_data_dir() -> &'static str {
    DATA_DIR.path().to_str().unwrap()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "semsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// semsearch 数据目录，存放缓存、投影矩阵与标题数据库
    #[arg(short, long, default_value = default_data_dir())]
    pub data_dir: DataDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 添加图片到向量索引
    Insert(InsertCommand),
    /// 使用文本查询搜索图片
    Search(SearchCommand),
    /// 查看索引统计信息
    Stats(StatsCommand),
    /// 清空向量索引
    Wipe(WipeCommand),
    /// 管理本地标题数据库
    Db(DbCommand),
    /// 预生成标题与增强查询缓存
    Prepare(PrepareCommand),
    /// 运行配置扫描评估，输出 CSV 报告
    Evaluate(EvaluateCommand),
    /// 启动 HTTP 搜索服务
    Server(ServerCommand),
}

#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回缓存目录
    pub fn cache_dir(&self) -> PathBuf {
        self.path.join("cache")
    }

    /// 返回标题缓存目录，每个键一个文件
    pub fn caption_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("caption_cache")
    }

    /// 返回增强查询缓存目录，每个键一个文件
    pub fn query_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("query_cache")
    }

    /// 返回随机投影矩阵文件的路径
    pub fn rp_matrix(&self, reduce_dim: usize) -> PathBuf {
        self.cache_dir().join(format!("rp_{}_to_{}.npy", NATIVE_DIM, reduce_dim))
    }

    /// 返回标题数据库文件的路径
    pub fn captions_db(&self) -> PathBuf {
        self.path.join("data").join("captions").join("captions.json")
    }

    /// 返回查询集定义文件的路径
    pub fn queries_spec(&self) -> PathBuf {
        self.path.join("data").join("queries").join("queries.json")
    }

    /// 返回增强查询数据库文件的路径
    pub fn enhanced_db(&self) -> PathBuf {
        self.path.join("data").join("queries").join("enhanced_queries.json")
    }

    /// 返回评估结果目录
    pub fn evaluation_dir(&self) -> PathBuf {
        self.path.join("data").join("evaluation")
    }

    /// 返回网页上传目录
    pub fn uploads_dir(&self) -> PathBuf {
        self.path.join("uploads")
    }
}

impl FromStr for DataDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

/// 从环境变量读取的运行时配置
///
/// 环境变量在 main 中经由 `.env` 文件加载，此处只做读取与缺省值填充。
/// API 密钥不在这里读取，而是在各客户端构造时检查，保证缺失配置在构造时立即报错。
#[derive(Debug, Clone)]
pub struct Settings {
    /// 索引空间的降维目标维度
    pub reduce_dim: usize,
    /// 向量索引名称
    pub index_name: String,
    /// 向量索引部署的云厂商
    pub pinecone_cloud: String,
    /// 向量索引部署的区域
    pub pinecone_region: String,
    /// 嵌入服务地址
    pub clip_api_url: String,
    /// 嵌入模型名称
    pub clip_model: String,
    /// 文本/视觉生成模型名称
    pub gemini_model: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let reduce_dim =
            env::var("REDUCE_DIM").ok().and_then(|v| v.parse().ok()).unwrap_or(384);
        // .env 模板里留空的键等同于未设置
        let var = |key: &str, default: &str| {
            env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
        };
        let index_name = var("INDEX_NAME", &format!("img-search-clip-rp-{}", reduce_dim));

        Self {
            reduce_dim,
            index_name,
            pinecone_cloud: var("PINECONE_CLOUD", "aws"),
            pinecone_region: var("PINECONE_REGION", "us-east-1"),
            clip_api_url: var("CLIP_API_URL", "http://127.0.0.1:8100"),
            clip_model: var("CLIP_MODEL", "clip-vit-b-32"),
            gemini_model: var("GEMINI_MODEL", "gemini-2.0-flash"),
        }
    }
}

/// 图片标题生成提示词
pub const CAPTION_PROMPT: &str = "Describe this image in 2–4 sentences as a single paragraph. \
    Use only visible facts: the main subject and any actions or poses; \
    notable objects or clothing; a few key colors; background elements; \
    and the lighting or atmosphere. Avoid speculation and brand names.";

/// 查询增强系统提示词
pub const ENHANCE_SYSTEM_PROMPT: &str = "\
You rewrite short user queries into one clear, descriptive sentence for an image search engine.

Your output must:
- Keep the user's exact wording at the start.
- Continue the same sentence with a short phrase such as 'the image might show ...' or 'the image might include ...'.
- In that clause, describe only what could visually appear in a photo that matches the query: objects, subjects, environments, or settings directly implied by it.

Strict rules:
- Do NOT invent events, actions, emotions, relationships, props, or scenery not clearly implied.
- Do NOT add story, mood, time of day, or creative embellishment unless already explicit.
- Use neutral, factual language.
- If the query already looks like a complete photo caption, simply return it as-is.
- If the query is abstract (e.g. emotions, ideas), you may briefly ground it in a neutral, plausible visual form (e.g. 'a single person sitting alone').
- Output exactly ONE sentence, no bullet points, no multiple sentences, no quotes.
- Stay concise (under ~40 tokens).
";

/// 查询增强 few-shot 示例
pub const ENHANCE_FEW_SHOTS: &[(&str, &str)] = &[
    (
        "a person reading",
        "a person reading, the image might include an open book and hands holding the pages",
    ),
    (
        "mountain landscape",
        "a mountain landscape, the image might include rocky peaks and a clear sky",
    ),
    (
        "city skyline",
        "a city skyline, the image might include tall modern buildings and an urban horizon",
    ),
    (
        "fruit on a table",
        "fruit on a table, the image might include apples and oranges arranged on a wooden surface",
    ),
    (
        "feeling lonely",
        "feeling lonely, the image might include a single person sitting alone on a bench in an open space",
    ),
];
