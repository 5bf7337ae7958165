use std::path::{Path, PathBuf};

use jobhive_common::JobId;

pub const STAGING_DIR_NAME: &str = ".staging";
pub const META_FILE_NAME: &str = "metadata.json";
pub const LOG_FILE_NAME: &str = "job.log";
pub const OUTPUT_DIR_NAME: &str = "output";
pub const WORK_DIR_NAME: &str = "work";

/// On-disk footprint of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub dir: PathBuf,
    pub metadata: PathBuf,
    pub log: PathBuf,
    pub output: PathBuf,
    pub work: PathBuf,
}

impl JobPaths {
    pub fn new(root: &Path, id: &JobId) -> Self {
        Self::in_dir(root.join(id.as_str()))
    }

    pub(crate) fn staging(root: &Path, id: &JobId) -> Self {
        Self::in_dir(root.join(STAGING_DIR_NAME).join(id.as_str()))
    }

    fn in_dir(dir: PathBuf) -> Self {
        Self {
            metadata: dir.join(META_FILE_NAME),
            log: dir.join(LOG_FILE_NAME),
            output: dir.join(OUTPUT_DIR_NAME),
            work: dir.join(WORK_DIR_NAME),
            dir,
        }
    }

    pub fn metadata_tmp(&self) -> PathBuf {
        self.metadata.with_extension("json.tmp")
    }
}
