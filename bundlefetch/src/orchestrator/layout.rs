//! On-disk layout of the work directory.
//!
//! ```text
//! <tasks_dir>/<task-id>/chunks/<index>.part      promoted chunks
//! <tasks_dir>/<task-id>/tmp/<index>-<seq>.tmp    in-flight transfers
//! ```

use std::path::{Path, PathBuf};

use crate::model::TaskId;

/// Path helpers rooted at the tasks directory.
#[derive(Debug, Clone)]
pub(crate) struct WorkLayout {
    tasks_dir: PathBuf,
}

impl WorkLayout {
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub fn task_dir(&self, id: &TaskId) -> PathBuf {
        self.tasks_dir.join(id.as_str())
    }

    pub fn chunks_dir(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join("chunks")
    }

    pub fn chunk_path(&self, id: &TaskId, index: u32) -> PathBuf {
        self.chunks_dir(id).join(format!("{}.part", index))
    }

    pub fn tmp_dir(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join("tmp")
    }

    pub fn temp_path(&self, id: &TaskId, index: u32, seq: u64) -> PathBuf {
        self.tmp_dir(id).join(format!("{}-{}.tmp", index, seq))
    }
}

/// Staging path for an artifact being assembled.
pub(crate) fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = WorkLayout::new("/work/tasks");
        let id = TaskId::from("abc");
        assert_eq!(layout.chunk_path(&id, 3), Path::new("/work/tasks/abc/chunks/3.part"));
        assert_eq!(layout.temp_path(&id, 3, 17), Path::new("/work/tasks/abc/tmp/3-17.tmp"));
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/data/core.zim")),
            Path::new("/data/core.zim.partial")
        );
    }
}
