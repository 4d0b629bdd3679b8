use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{AnalysisError, AnalysisResult};

/// 单次分析独占的临时目录，离开作用域时删除
///
/// 目录名带 uuid，同一视频的并发分析不会互相覆盖中间文件。
pub struct ScratchDir {
    dir: PathBuf,
}

impl ScratchDir {
    pub fn create(work_dir: &Path, prefix: &str) -> AnalysisResult<Self> {
        let dir = work_dir.join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).map_err(|e| AnalysisError::Workspace {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!("⚠️  [清理] 删除临时目录失败: {} - {}", self.dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_dirs_are_unique_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let first = ScratchDir::create(root.path(), "frames").unwrap();
        let second = ScratchDir::create(root.path(), "frames").unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().is_dir());

        std::fs::write(first.join("clip_frame0.jpg"), b"jpeg").unwrap();
        let kept = first.path().to_path_buf();
        drop(first);
        assert!(!kept.exists());
        assert!(second.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unwritable_work_dir_is_workspace_error() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();
        assert!(matches!(
            ScratchDir::create(&file, "frames"),
            Err(AnalysisError::Workspace { .. })
        ));
    }
}
