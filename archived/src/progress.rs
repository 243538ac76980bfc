use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Shared, mutex-guarded status text for one transfer, mirrored into the
/// `.ps` progress file on every stage transition so operators (and the
/// dispatcher, via the status channel) can inspect a running worker.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<Inner>,
}

struct Inner {
    text: Mutex<String>,
    progress_file: Option<PathBuf>,
    pid: u32,
}

impl StatusHandle {
    pub fn new(progress_file: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                text: Mutex::new("initializing".to_string()),
                progress_file,
                pid: std::process::id(),
            }),
        }
    }

    pub fn set(&self, msg: impl Into<String>) {
        let msg = msg.into();
        debug!("status: {}", msg);
        *self.inner.text.lock() = msg.clone();

        // Overwritten in place on every transition; losing a progress
        // snapshot never fails the transfer.
        if let Some(path) = &self.inner.progress_file {
            let _ = std::fs::write(path, format!("pid={}\nstage={}\n", self.inner.pid, msg));
        }
    }

    pub fn get(&self) -> String {
        self.inner.text.lock().clone()
    }
}
