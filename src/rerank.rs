use std::cmp::Ordering;
use std::future::Future;

use anyhow::Result;
use ndarray::prelude::*;
use serde::Serialize;

use crate::pinecone::SearchMatch;

/// 原生空间文本编码能力，重排只依赖这一个口子
pub trait TextEncoder {
    fn encode_texts(&self, texts: &[String]) -> impl Future<Output = Result<Array2<f32>>> + Send;
}

/// 标题查询能力：路径到标题，查不到返回空串
pub trait CaptionSource {
    fn caption(&self, path: &str) -> impl Future<Output = String> + Send;
}

/// 重排后的一条结果
#[derive(Debug, Clone, Serialize)]
pub struct RankedMatch {
    pub final_score: f32,
    pub orig_score: f32,
    pub caption_sim: f32,
    pub path: String,
    pub id: String,
    pub caption: String,
}

/// 把索引相似度从 [0, 1] 线性映射到 [-1, 1]，与原生余弦相似度同域
///
/// 依赖索引服务对余弦分数的归一化约定，这里不做运行时检查
pub fn rescale_score(orig: f32) -> f32 {
    2.0 * orig - 1.0
}

/// 按标题相似度重排初始检索结果
///
/// 两阶段检索的第二阶段：初始结果来自降维后的索引空间，
/// 重排在原生空间计算查询与每张图片标题的相似度，
/// 再与初始分数加权混合（或在纯标题模式下直接替换）。
///
/// 返回与输入等长的全部记录，不做截断，截断由调用方负责；
/// 候选为空时直接返回空列表，不发起任何编码或标题查询。
/// 标题缺失不视为错误，空标题照常参与计算，只是得分通常偏低。
pub async fn rerank_by_caption<E, C>(
    encoder: &E,
    captions: &C,
    query: &str,
    matches: &[SearchMatch],
    alpha: f32,
    use_blend: bool,
) -> Result<Vec<RankedMatch>>
where
    E: TextEncoder,
    C: CaptionSource,
{
    if matches.is_empty() {
        return Ok(Vec::new());
    }

    let mut caps = Vec::with_capacity(matches.len());
    for m in matches {
        let cap =
            if m.path.is_empty() { String::new() } else { captions.caption(&m.path).await };
        caps.push(cap);
    }

    let query_vec = encoder.encode_texts(&[query.to_string()]).await?.row(0).to_owned();
    let cap_vecs = encoder.encode_texts(&caps).await?;
    // 两侧都是单位向量，点积即余弦相似度
    let cap_sims = cap_vecs.dot(&query_vec);

    let mut out = Vec::with_capacity(matches.len());
    for ((m, cap), &cs) in matches.iter().zip(caps).zip(cap_sims.iter()) {
        let final_score = if use_blend {
            (1.0 - alpha) * rescale_score(m.score) + alpha * cs
        } else {
            cs
        };
        out.push(RankedMatch {
            final_score,
            orig_score: m.score,
            caption_sim: cs,
            path: m.path.clone(),
            id: m.id.clone(),
            caption: cap,
        });
    }

    out.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(Ordering::Equal));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;

    const DIM: usize = 4;

    /// 固定向量表的编码桩，统计调用次数
    struct StubEncoder {
        vectors: HashMap<String, Vec<f32>>,
        calls: AtomicUsize,
    }

    impl StubEncoder {
        fn new(entries: &[(&str, [f32; DIM])]) -> Self {
            let vectors = entries
                .iter()
                .map(|(text, vec)| (text.to_string(), vec.to_vec()))
                .collect();
            Self { vectors, calls: AtomicUsize::new(0) }
        }
    }

    impl TextEncoder for StubEncoder {
        async fn encode_texts(&self, texts: &[String]) -> Result<Array2<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut flat = Vec::with_capacity(texts.len() * DIM);
            for text in texts {
                match self.vectors.get(text) {
                    Some(vec) => flat.extend_from_slice(vec),
                    None => flat.extend_from_slice(&[0.0; DIM]),
                }
            }
            Ok(Array2::from_shape_vec((texts.len(), DIM), flat)?)
        }
    }

    struct StubCaptions {
        map: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl StubCaptions {
        fn new(entries: &[(&str, &str)]) -> Self {
            let map =
                entries.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect();
            Self { map, calls: AtomicUsize::new(0) }
        }
    }

    impl CaptionSource for StubCaptions {
        async fn caption(&self, path: &str) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.map.get(path).cloned().unwrap_or_default()
        }
    }

    fn candidate(id: &str, score: f32, path: &str) -> SearchMatch {
        SearchMatch { id: id.to_string(), score, path: path.to_string() }
    }

    /// 查询向量为 e1，标题向量第一个分量即与查询的余弦相似度
    fn fixture(cap_sims: [f32; 3]) -> (StubEncoder, StubCaptions) {
        let encoder = StubEncoder::new(&[
            ("q", [1.0, 0.0, 0.0, 0.0]),
            ("cap a", [cap_sims[0], 0.0, 0.0, 0.0]),
            ("cap b", [cap_sims[1], 0.0, 0.0, 0.0]),
            ("cap c", [cap_sims[2], 0.0, 0.0, 0.0]),
        ]);
        let captions =
            StubCaptions::new(&[("a.jpg", "cap a"), ("b.jpg", "cap b"), ("c.jpg", "cap c")]);
        (encoder, captions)
    }

    #[rstest]
    #[case(0.0, -1.0)]
    #[case(0.5, 0.0)]
    #[case(1.0, 1.0)]
    fn rescale_maps_unit_interval(#[case] orig: f32, #[case] expected: f32) {
        assert_eq!(rescale_score(orig), expected);
    }

    #[test]
    fn rescale_is_monotonic() {
        assert!(rescale_score(0.3) < rescale_score(0.31));
    }

    #[tokio::test]
    async fn empty_candidates_skip_all_lookups() -> Result<()> {
        let (encoder, captions) = fixture([0.0; 3]);
        let out = rerank_by_caption(&encoder, &captions, "q", &[], 0.6, true).await?;
        assert!(out.is_empty());
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(captions.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn output_is_a_permutation_with_finite_scores() -> Result<()> {
        let (encoder, captions) = fixture([0.2, 0.8, -0.4]);
        let matches = vec![
            candidate("a", 0.9, "a.jpg"),
            candidate("b", 0.5, "b.jpg"),
            candidate("c", 0.2, "c.jpg"),
        ];

        let out = rerank_by_caption(&encoder, &captions, "q", &matches, 0.6, true).await?;

        assert_eq!(out.len(), matches.len());
        let ids: HashSet<_> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, HashSet::from(["a", "b", "c"]));
        assert!(out.iter().all(|r| r.final_score.is_finite()));
        // 查询一次 + 标题一批
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn alpha_zero_orders_by_original_score() -> Result<()> {
        // 标题相似度与初始分数刻意相反
        let (encoder, captions) = fixture([0.9, 0.1, 0.5]);
        let matches = vec![
            candidate("a", 0.2, "a.jpg"),
            candidate("b", 0.9, "b.jpg"),
            candidate("c", 0.5, "c.jpg"),
        ];

        let out = rerank_by_caption(&encoder, &captions, "q", &matches, 0.0, true).await?;
        let order: Vec<_> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, ["b", "c", "a"]);
        Ok(())
    }

    #[tokio::test]
    async fn alpha_one_orders_by_caption_similarity() -> Result<()> {
        let (encoder, captions) = fixture([0.9, 0.1, 0.5]);
        let matches = vec![
            candidate("a", 0.2, "a.jpg"),
            candidate("b", 0.9, "b.jpg"),
            candidate("c", 0.5, "c.jpg"),
        ];

        let out = rerank_by_caption(&encoder, &captions, "q", &matches, 1.0, true).await?;
        let order: Vec<_> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, ["a", "c", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn pure_caption_mode_ignores_original_score() -> Result<()> {
        let (encoder, captions) = fixture([0.3, 0.7, -0.2]);
        let matches = vec![
            candidate("a", 1.0, "a.jpg"),
            candidate("b", 0.0, "b.jpg"),
            candidate("c", 0.5, "c.jpg"),
        ];

        let out = rerank_by_caption(&encoder, &captions, "q", &matches, 0.6, false).await?;
        for r in &out {
            assert_eq!(r.final_score, r.caption_sim);
        }
        let order: Vec<_> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, ["b", "a", "c"]);
        Ok(())
    }

    #[tokio::test]
    async fn blend_matches_hand_computed_scores() -> Result<()> {
        // final = 0.4 * (2*orig - 1) + 0.6 * cap_sim
        let (encoder, captions) = fixture([0.1, 0.9, 0.5]);
        let matches = vec![
            candidate("a", 0.9, "a.jpg"),
            candidate("b", 0.5, "b.jpg"),
            candidate("c", 0.2, "c.jpg"),
        ];

        let out = rerank_by_caption(&encoder, &captions, "q", &matches, 0.6, true).await?;

        let order: Vec<_> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, ["b", "a", "c"]);

        let expected = [("b", 0.54f32), ("a", 0.38), ("c", 0.06)];
        for (r, (id, score)) in out.iter().zip(expected) {
            assert_eq!(r.id, id);
            assert!((r.final_score - score).abs() < 1e-6, "{}: {}", id, r.final_score);
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_path_skips_caption_lookup() -> Result<()> {
        let (encoder, captions) = fixture([0.5, 0.5, 0.5]);
        let matches = vec![candidate("a", 0.8, ""), candidate("b", 0.4, "b.jpg")];

        let out = rerank_by_caption(&encoder, &captions, "q", &matches, 0.6, true).await?;

        assert_eq!(captions.calls.load(Ordering::SeqCst), 1);
        let a = out.iter().find(|r| r.id == "a").unwrap();
        assert_eq!(a.caption, "");
        Ok(())
    }
}
