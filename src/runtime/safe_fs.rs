//! 沙箱文件系统
//!
//! SafeFs 绑定工作区根目录，所有路径经 resolve 校验必须落在根下（禁止 ../ 与绝对路径逃逸，
//! 也禁止经符号链接逃逸）；读写均为字节级。

use std::path::{Component, Path, PathBuf};

use crate::core::AgentError;

#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法规范化：去掉 `.`，`..` 不允许越过根，绝对路径直接拒绝
    fn normalize(&self, path: &str) -> Result<PathBuf, AgentError> {
        let mut out = PathBuf::new();
        for comp in Path::new(path.trim()).components() {
            match comp {
                Component::CurDir => {}
                Component::Normal(c) => out.push(c),
                Component::ParentDir => {
                    if !out.pop() {
                        return Err(AgentError::PathEscape(path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(AgentError::PathEscape(path.to_string()));
                }
            }
        }
        Ok(out)
    }

    fn check_inside(&self, canonical: &Path, original: &str) -> Result<(), AgentError> {
        let root_canon = self
            .root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone());
        if canonical.starts_with(&root_canon) {
            Ok(())
        } else {
            Err(AgentError::PathEscape(original.to_string())) // 如 ../../etc/passwd 或指向外部的链接
        }
    }

    /// 解析已存在的路径
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let rel = self.normalize(path)?;
        let full = self.root_dir.join(rel);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::RuntimeAction(format!("Path not found: {}", path)))?;
        self.check_inside(&canonical, path)?;
        Ok(canonical)
    }

    /// 解析写入目标（文件可以不存在，父目录按需创建）
    pub async fn resolve_for_write(&self, path: &str) -> Result<PathBuf, AgentError> {
        let rel = self.normalize(path)?;
        if rel.as_os_str().is_empty() {
            return Err(AgentError::RuntimeAction("empty file path".to_string()));
        }
        let full = self.root_dir.join(&rel);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::RuntimeAction(format!("Create dir failed: {}", e)))?;
            let parent_canon = parent
                .canonicalize()
                .map_err(|e| AgentError::RuntimeAction(e.to_string()))?;
            self.check_inside(&parent_canon, path)?;
        }
        Ok(full)
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>, AgentError> {
        let resolved = self.resolve(path)?;
        tokio::fs::read(&resolved)
            .await
            .map_err(|e| AgentError::RuntimeAction(format!("Read failed: {}", e)))
    }

    pub async fn write(&self, path: &str, content: &[u8]) -> Result<PathBuf, AgentError> {
        let target = self.resolve_for_write(path).await?;
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| AgentError::RuntimeAction(format!("Write failed: {}", e)))?;
        Ok(target)
    }
}
