//! On-disk layout of a directory store.
//!
//! ```text
//! <root>/config.json
//! <root>/jobs/<job-id>/job.json
//! <root>/jobs/<job-id>/files/<uuid>/<basename>     job-owned files
//! <root>/files/no-job/<uuid>/<basename>            unowned files
//! <root>/shared/<name>
//! <root>/stats/<timestamp>-<uuid>.new|.read
//! ```
//!
//! A file ID is the path of the file relative to the root, so it always ends
//! with the file's base name.

use std::path::{Component, Path, PathBuf};

use jobvault_core::{FileId, JobId, StoreError, StoreResult};

pub(crate) const CONFIG_FILE: &str = "config.json";
pub(crate) const JOB_FILE: &str = "job.json";
pub(crate) const STREAM_NAME: &str = "stream";
pub(crate) const STATS_NEW: &str = "new";
pub(crate) const STATS_READ: &str = "read";

#[derive(Debug, Clone)]
pub(crate) struct Layout {
    root: PathBuf,
}

impl Layout {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub(crate) fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub(crate) fn job_dir(&self, id: &JobId) -> StoreResult<PathBuf> {
        let name = id.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(StoreError::NoSuchJob(name.to_string()));
        }
        Ok(self.jobs_dir().join(name))
    }

    pub(crate) fn job_record(&self, id: &JobId) -> StoreResult<PathBuf> {
        Ok(self.job_dir(id)?.join(JOB_FILE))
    }

    pub(crate) fn unowned_dir(&self) -> PathBuf {
        self.root.join("files").join("no-job")
    }

    pub(crate) fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    pub(crate) fn shared_path(&self, name: &str) -> PathBuf {
        self.shared_dir().join(name)
    }

    pub(crate) fn stats_dir(&self) -> PathBuf {
        self.root.join("stats")
    }

    /// Directories created by `initialize`.
    pub(crate) fn skeleton(&self) -> [PathBuf; 4] {
        [
            self.jobs_dir(),
            self.unowned_dir(),
            self.shared_dir(),
            self.stats_dir(),
        ]
    }

    /// Relative ID and absolute path for a new file.
    pub(crate) fn new_file(&self, owner: Option<&JobId>, basename: &str) -> StoreResult<(FileId, PathBuf)> {
        let unique = uuid::Uuid::new_v4().to_string();
        let relative = match owner {
            Some(job) => {
                self.job_dir(job)?;
                Path::new("jobs")
                    .join(job.as_str())
                    .join("files")
                    .join(unique)
                    .join(basename)
            }
            None => Path::new("files").join("no-job").join(unique).join(basename),
        };
        let id = FileId::new(relative.to_string_lossy());
        Ok((id, self.root.join(relative)))
    }

    /// Absolute path of a file ID. IDs that could escape the root, or that
    /// do not name a file location, are reported as missing files.
    pub(crate) fn file_path(&self, id: &FileId) -> StoreResult<PathBuf> {
        let relative = Path::new(id.as_str());
        let mut components = relative.components();
        let valid = matches!(
            components.next(),
            Some(Component::Normal(first)) if first == "jobs" || first == "files"
        ) && components.all(|c| matches!(c, Component::Normal(_)));
        if !valid || relative.components().count() < 4 {
            return Err(StoreError::NoSuchFile(id.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

/// Sanitized base name of a local file, used as the last ID component.
pub(crate) fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && !n.starts_with('.'))
        .unwrap_or_else(|| STREAM_NAME.to_string())
}

/// Temporary sibling used for atomic replacement of `target`.
pub(crate) fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.tmp-{}", uuid::Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new(PathBuf::from("/store"))
    }

    #[test]
    fn test_file_ids_end_with_basename() {
        let job = JobId::new("j-1");
        let (id, path) = layout().new_file(Some(&job), "input.txt").unwrap();
        assert!(id.as_str().starts_with("jobs/j-1/files/"));
        assert!(id.as_str().ends_with("/input.txt"));
        assert_eq!(path, Path::new("/store").join(id.as_str()));
        assert_eq!(layout().file_path(&id).unwrap(), path);

        let (id, _) = layout().new_file(None, STREAM_NAME).unwrap();
        assert!(id.as_str().starts_with("files/no-job/"));
    }

    #[test]
    fn test_escaping_ids_are_missing_files() {
        for bad in ["../etc/passwd", "/abs/path", "jobs/../../x/y", "shared/name", "jobs/a"] {
            assert!(
                matches!(layout().file_path(&FileId::new(bad)), Err(StoreError::NoSuchFile(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename(Path::new("/tmp/data.bin")), "data.bin");
        assert_eq!(basename(Path::new("/")), STREAM_NAME);
        assert_eq!(basename(Path::new("/tmp/.hidden")), STREAM_NAME);
    }

    #[test]
    fn test_temp_sibling_stays_in_directory() {
        let tmp = temp_sibling(Path::new("/store/jobs/j/job.json"));
        assert_eq!(tmp.parent(), Some(Path::new("/store/jobs/j")));
        assert!(tmp.file_name().unwrap().to_string_lossy().starts_with(".job.json.tmp-"));
    }
}
