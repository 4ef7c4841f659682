//! Progress-callback trait for batch events.
//!
//! Pass an [`Arc<dyn BatchProgressCallback>`] to the directory operations in
//! [`crate::batch`] to receive an event as each item starts and finishes.
//! The CLI forwards these to a terminal progress bar.
//!
//! # Example
//!
//! ```rust
//! use dataset_extract::{BatchProgressCallback, BatchStage};
//! use std::path::Path;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl BatchProgressCallback for Counter {
//!     fn on_item_complete(&self, _stage: BatchStage, _index: usize, _total: usize, _path: &Path, _status: &str) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::output::BatchStage;
use std::path::Path;
use std::sync::Arc;

/// Called by the batch driver as it works through a directory.
///
/// All methods default to no-ops. Items are processed sequentially, so
/// events for one stage arrive in order.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once per stage, before the first item.
    ///
    /// `total` counts every discovered item, including ones that will be
    /// skipped.
    fn on_batch_start(&self, stage: BatchStage, total: usize) {
        let _ = (stage, total);
    }

    /// Called before an item is processed. `index` is 1-based.
    fn on_item_start(&self, stage: BatchStage, index: usize, total: usize, path: &Path) {
        let _ = (stage, index, total, path);
    }

    /// Called after an item settles. `status` is `converted`, `extracted`,
    /// `skipped` or `error: …`.
    fn on_item_complete(&self, stage: BatchStage, index: usize, total: usize, path: &Path, status: &str) {
        let _ = (stage, index, total, path, status);
    }

    /// Called once per stage after the last item.
    fn on_batch_complete(&self, stage: BatchStage, succeeded: usize, failed: usize) {
        let _ = (stage, succeeded, failed);
    }
}

/// Does nothing. Used when the caller passes no callback.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl BatchProgressCallback for Recorder {
        fn on_batch_start(&self, stage: BatchStage, total: usize) {
            self.events.lock().unwrap().push(format!("start {stage} {total}"));
        }

        fn on_item_complete(&self, _stage: BatchStage, index: usize, total: usize, path: &Path, status: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{index}/{total} {} {status}", path.display()));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(BatchStage::Conversion, 2);
        cb.on_item_start(BatchStage::Conversion, 1, 2, Path::new("a.pdf"));
        cb.on_item_complete(BatchStage::Conversion, 1, 2, Path::new("a.pdf"), "converted");
        cb.on_batch_complete(BatchStage::Conversion, 1, 0);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Recorder::default();
        let cb: &dyn BatchProgressCallback = &rec;
        cb.on_batch_start(BatchStage::Extraction, 1);
        cb.on_item_start(BatchStage::Extraction, 1, 1, Path::new("a.md"));
        cb.on_item_complete(BatchStage::Extraction, 1, 1, Path::new("a.md"), "extracted");
        assert_eq!(
            *rec.events.lock().unwrap(),
            vec!["start extraction 1".to_string(), "1/1 a.md extracted".to_string()]
        );
    }
}
