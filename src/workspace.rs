//! 工作目录：与解释器共享的文件区
//!
//! 上传文件名清洗后写入根目录；读取产物（图片、csv 等）时按白名单给出 content type，
//! 所有路径都必须落在根目录内。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Path escapes workspace: {0}")]
    PathEscape(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 文件名中 `[A-Za-z0-9.-]` 以外的字符全部替换为 `_`
pub fn sanitize_filename(name: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9.-]").expect("static regex"));
    re.replace_all(name, "_").into_owned()
}

/// 按扩展名给出 content type；不在白名单内返回 None
pub fn content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "csv" => Some("text/csv"),
        "r" | "txt" => Some("text/plain"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// 根目录不存在时创建
    pub fn open(root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析已存在的相对路径，拒绝跳出根目录（如 ../../etc/passwd）
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, WorkspaceError> {
        let rel = rel.trim_start_matches("./");
        let canonical = self
            .root
            .join(rel)
            .canonicalize()
            .map_err(|_| WorkspaceError::NotFound(rel.to_string()))?;
        if canonical.starts_with(&self.root) {
            Ok(canonical)
        } else {
            Err(WorkspaceError::PathEscape(rel.to_string()))
        }
    }

    /// 读取产物，返回内容与 content type
    pub fn read_artifact(&self, rel: &str) -> Result<(Vec<u8>, &'static str), WorkspaceError> {
        let path = self.resolve(rel)?;
        let ctype =
            content_type(&path).ok_or_else(|| WorkspaceError::UnsupportedType(rel.to_string()))?;
        let bytes = std::fs::read(&path)?;
        Ok((bytes, ctype))
    }

    /// 写入上传文件，返回清洗后的文件名（同名覆盖）
    pub fn store_upload(&self, name: &str, bytes: &[u8]) -> Result<String, WorkspaceError> {
        let stored = sanitize_filename(name);
        if stored.is_empty() || stored.chars().all(|c| c == '.') {
            return Err(WorkspaceError::PathEscape(name.to_string()));
        }
        std::fs::write(self.root.join(&stored), bytes)?;
        tracing::info!(file = %stored, size = bytes.len(), "upload stored");
        Ok(stored)
    }
}
