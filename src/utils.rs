use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use indicatif::ProgressStyle;
use regex::Regex;

/// 计算文件内容的 blake3 哈希，作为向量 ID 使用
///
/// 基于内容而非路径，重命名或移动文件不会改变 ID
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = std::fs::File::open(path.as_ref())?;
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// 由后缀列表构建大小写不敏感的匹配正则，多个后缀用逗号分隔
pub fn suffix_regex(suffix: &str) -> Regex {
    let re = format!("(?i)^({})$", suffix.replace(',', "|"));
    Regex::new(&re).expect("failed to build regex")
}

/// 把绝对路径转换为相对当前目录的路径，便于索引数据在机器间迁移
pub fn to_relative_path(path: &Path) -> String {
    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(rel) = path.strip_prefix(&cwd) {
            return rel.to_string_lossy().to_string();
        }
    }
    path.to_string_lossy().to_string()
}

/// 提取文件名主干，例如 `example_images/ed1_1.jpg` -> `ed1_1`
pub fn image_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// 清洗上传的文件名：丢弃目录部分，仅保留安全字符
pub fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

/// 判断路径是否位于指定目录内部，用于防御路径穿越
pub fn is_within_dir(path: &Path, dir: &Path) -> bool {
    let canonical_dir = match dir.canonicalize() {
        Ok(d) => d,
        Err(_) => return false,
    };
    match path.canonicalize() {
        Ok(p) => p.starts_with(&canonical_dir),
        Err(_) => false,
    }
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )
    .expect("failed to build progress style")
    .progress_chars("#>-")
}

pub fn read_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let v = std::io::stdin()
        .bytes()
        .take_while(|c| c.as_ref().ok() != Some(&b'\n'))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(String::from_utf8(v)?.trim().to_owned())
}

/// 在目录下查找所有匹配后缀的图片，按路径排序
pub fn list_images(dir: &Path, re: &Regex) -> Vec<PathBuf> {
    let mut files = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| re.is_match(&ext.to_string_lossy()))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect::<Vec<_>>();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_strips_dir_and_extension() {
        assert_eq!(image_stem("example_images/ed1_1.jpg"), "ed1_1");
        assert_eq!(image_stem("ed1_1.png"), "ed1_1");
        assert_eq!(image_stem(""), "");
    }

    #[test]
    fn sanitize_drops_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("my photo (1).jpg"), "my_photo__1_.jpg");
    }

    #[test]
    fn suffix_regex_case_insensitive() {
        let re = suffix_regex("jpg,jpeg,png");
        assert!(re.is_match("JPG"));
        assert!(re.is_match("jpeg"));
        assert!(!re.is_match("gif"));
        assert!(!re.is_match("jpgx"));
    }

    #[test]
    fn hash_is_stable_for_same_content() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"hello")?;
        std::fs::write(&b, b"hello")?;
        assert_eq!(hash_file(&a)?, hash_file(&b)?);
        assert_eq!(hash_file(&a)?, blake3::hash(b"hello").to_hex().to_string());
        Ok(())
    }
}
