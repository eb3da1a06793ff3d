// 归档目录解析
//
// 把标识符映射为 `<root>/<id>`，标识符只能是单个路径段

use std::path::{Path, PathBuf};

use super::error::{ArchiveError, ArchiveResult};

/// 目录解析器
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 标识符是否可以安全地拼接到根目录下
    ///
    /// 拒绝空串、`.`、`..`，以及包含路径分隔符或控制字符的标识符
    pub fn is_valid_identifier(id: &str) -> bool {
        if id.is_empty() || id == "." || id == ".." {
            return false;
        }
        !id.chars().any(|c| c == '/' || c == '\\' || c.is_control())
    }

    /// 解析标识符对应的目录
    ///
    /// 目录不存在或不是目录时返回 `NotFound`，否则原样返回拼接后的路径
    pub async fn resolve(&self, id: &str) -> ArchiveResult<PathBuf> {
        if !Self::is_valid_identifier(id) {
            tracing::warn!("拒绝非法的归档标识符: {:?}", id);
            return Err(ArchiveError::NotFound(id.to_string()));
        }

        let path = self.root.join(id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => {
                tracing::debug!("归档路径不是目录: {:?}", path);
                Err(ArchiveError::NotFound(id.to_string()))
            }
            Err(e) => {
                tracing::debug!("归档目录不存在: {:?}, 错误: {}", path, e);
                Err(ArchiveError::NotFound(id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_existing_directory() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("a1b2c3")).unwrap();

        let resolver = DirectoryResolver::new(root.path());
        let path = resolver.resolve("a1b2c3").await.unwrap();
        assert_eq!(path, root.path().join("a1b2c3"));
    }

    #[tokio::test]
    async fn test_resolve_missing_and_file() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("plain.txt"), b"x").unwrap();

        let resolver = DirectoryResolver::new(root.path());
        assert!(matches!(
            resolver.resolve("missing").await,
            Err(ArchiveError::NotFound(id)) if id == "missing"
        ));
        assert!(matches!(
            resolver.resolve("plain.txt").await,
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let root = TempDir::new().unwrap();
        let inner = root.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        std::fs::create_dir(inner.join("nested")).unwrap();

        // 根目录的上级目录一定存在，但不能通过 `..` 访问
        let resolver = DirectoryResolver::new(&inner);
        for id in ["..", ".", "", "../inner", "nested/..", "nested\\x"] {
            assert!(
                matches!(resolver.resolve(id).await, Err(ArchiveError::NotFound(_))),
                "identifier {:?} should be rejected",
                id
            );
        }
        assert!(resolver.resolve("nested").await.is_ok());
    }

    proptest! {
        #[test]
        fn prop_separator_never_valid(prefix in "[a-z0-9]{0,8}", suffix in "[a-z0-9]{0,8}", sep in prop::sample::select(vec!['/', '\\', '\0', '\n'])) {
            let id = format!("{}{}{}", prefix, sep, suffix);
            prop_assert!(!DirectoryResolver::is_valid_identifier(&id));
        }

        #[test]
        fn prop_hex_hash_valid(id in "[0-9a-f]{1,64}") {
            prop_assert!(DirectoryResolver::is_valid_identifier(&id));
        }
    }
}
