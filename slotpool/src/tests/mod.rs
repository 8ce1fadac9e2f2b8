use std::sync::Arc;

use tempfile::{tempdir, TempDir};

use crate::core::{create_segment, destroy_segment, Segment, SegmentConfig};

mod torn_read_tests;

/// A freshly created segment in its own temp directory, destroyed on drop.
pub(crate) struct Fixture {
    pub cfg: SegmentConfig,
    pub segment: Arc<Segment>,
    _dir: TempDir,
}

impl Fixture {
    pub(crate) fn new(capacity: u32) -> Fixture {
        let dir = tempdir().expect("temp dir");
        let cfg = SegmentConfig::builder()
            .path(dir.path().join("pool.seg"))
            .capacity(capacity)
            .build()
            .expect("config");
        let segment = Arc::new(create_segment(&cfg).expect("create segment"));
        Fixture {
            cfg,
            segment,
            _dir: dir,
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = destroy_segment(&self.cfg.path);
    }
}
