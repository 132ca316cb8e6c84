use crate::error::Result;
use crate::snapshot::{Snapshot, SnapshotView};
use std::path::{Path, PathBuf};

/// Backs up the live source as it is, without any snapshot.
pub struct NoSnapshot {
    source: PathBuf,
}

impl NoSnapshot {
    pub fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
        }
    }
}

impl Snapshot for NoSnapshot {
    fn describe(&self) -> String {
        format!("live source {}", self.source.display())
    }

    fn create(&mut self) -> Result<SnapshotView> {
        Ok(SnapshotView::Direct(self.source.clone()))
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}
