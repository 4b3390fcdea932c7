use std::path::Path;

use anyhow::Result;
use log::info;
use ndarray::prelude::*;
use ndarray_npy::{read_npy, write_npy};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use crate::config::{NATIVE_DIM, RP_SEED};

/// 随机投影矩阵
///
/// 同一份索引的所有向量必须使用同一个矩阵投影，否则相似度语义会被悄悄破坏。
/// 因此矩阵生成后立即持久化，此后只从文件加载；
/// 即使文件丢失，固定种子也能重新生成出完全相同的矩阵。
pub struct Projection {
    matrix: Array2<f32>,
}

impl Projection {
    /// 加载或创建投影矩阵，形状为 (NATIVE_DIM, reduce_dim)
    pub fn load_or_create(path: &Path, reduce_dim: usize) -> Result<Self> {
        if path.exists() {
            let matrix: Array2<f32> = read_npy(path)?;
            anyhow::ensure!(
                matrix.dim() == (NATIVE_DIM, reduce_dim),
                "投影矩阵形状不匹配: 文件为 {:?}，配置为 ({}, {})",
                matrix.dim(),
                NATIVE_DIM,
                reduce_dim
            );
            return Ok(Self { matrix });
        }

        let matrix = Self::generate(reduce_dim);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_npy(path, &matrix)?;
        info!("创建投影矩阵 ({}, {})，已保存到 {}", NATIVE_DIM, reduce_dim, path.display());
        Ok(Self { matrix })
    }

    fn generate(reduce_dim: usize) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(RP_SEED);
        Array2::from_shape_fn((NATIVE_DIM, reduce_dim), |_| StandardNormal.sample(&mut rng))
    }

    /// 投影一批向量并重新归一化
    ///
    /// 先除以 sqrt(d) 保持投影后的期望范数，再做逐行 L2 归一化；
    /// 分母加上一个极小量，避免退化向量触发除零。
    pub fn project(&self, vecs: &Array2<f32>) -> Array2<f32> {
        let d = self.matrix.ncols() as f32;
        let x = vecs.dot(&self.matrix) / d.sqrt();
        let norms = x.map_axis(Axis(1), |row| row.dot(&row).sqrt() + 1e-12);
        &x / &norms.insert_axis(Axis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projected_vectors_are_unit_norm() {
        let proj = Projection { matrix: Projection::generate(64) };
        let mut vecs = Array2::zeros((3, NATIVE_DIM));
        vecs[[0, 0]] = 1.0;
        vecs[[1, 5]] = -2.5;
        vecs[[2, 100]] = 0.3;
        vecs[[2, 101]] = 0.4;

        let out = proj.project(&vecs);
        assert_eq!(out.dim(), (3, 64));
        for row in out.rows() {
            let norm = row.dot(&row).sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "norm = {}", norm);
        }
    }

    #[test]
    fn zero_vector_does_not_produce_nan() {
        let proj = Projection { matrix: Projection::generate(16) };
        let out = proj.project(&Array2::zeros((1, NATIVE_DIM)));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn fixed_seed_reproduces_matrix() {
        let a = Projection::generate(32);
        let b = Projection::generate(32);
        assert_eq!(a, b);
    }

    #[test]
    fn persisted_matrix_roundtrips_bit_identical() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rp.npy");

        let first = Projection::load_or_create(&path, 48)?;
        let second = Projection::load_or_create(&path, 48)?;
        let third = Projection::load_or_create(&path, 48)?;

        assert_eq!(first.matrix, second.matrix);
        assert_eq!(second.matrix, third.matrix);
        // 删除文件后由固定种子重建，结果也必须一致
        std::fs::remove_file(&path)?;
        let rebuilt = Projection::load_or_create(&path, 48)?;
        assert_eq!(first.matrix, rebuilt.matrix);
        Ok(())
    }

    #[test]
    fn mismatched_dimension_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rp.npy");
        Projection::load_or_create(&path, 32)?;
        assert!(Projection::load_or_create(&path, 64).is_err());
        Ok(())
    }
}
