use std::path::PathBuf;

use slotpool::{create_segment, destroy_segment, Segment, SegmentConfig};
use tempfile::{tempdir, TempDir};

/// Segment path inside a private temp directory; the segment is destroyed
/// when the value drops.
pub struct Scratch {
    pub cfg: SegmentConfig,
    _dir: TempDir,
}

impl Scratch {
    pub fn new(capacity: u32) -> Scratch {
        let dir = tempdir().expect("temp dir");
        let cfg = SegmentConfig::builder()
            .path(dir.path().join("pool.seg"))
            .capacity(capacity)
            .build()
            .expect("config");
        Scratch { cfg, _dir: dir }
    }

    pub fn path(&self) -> PathBuf {
        self.cfg.path.clone()
    }

    pub fn create(&self) -> Segment {
        create_segment(&self.cfg).expect("create segment")
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = destroy_segment(&self.cfg.path);
    }
}
