use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

pub struct Logger;

impl Logger {
    /// Install the fmt subscriber. `RUST_LOG` wins over the default filter;
    /// calling this more than once is harmless.
    pub fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiln=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }

    pub fn build_start(root: &Path, entries: usize) {
        info!("🔨 kiln build");
        info!("📁 Root: {}", root.display());
        info!("🎯 Entries: {}", entries);
    }

    pub fn graph_closed(files: usize, transformed: usize, cache_hits: usize, reused: usize) {
        info!(
            "📦 Graph closed: {} files ({} transformed, {} cached, {} reused)",
            files, transformed, cache_hits, reused
        );
    }

    pub fn chunks_built(chunks: usize, shared: usize) {
        info!("🧩 {} chunks ({} shared)", chunks, shared);
    }

    pub fn processing_file(path: &Path, format: &str) {
        debug!("⚡ Processing: {} ({})", path.display(), format);
    }

    pub fn build_complete(files: usize, chunks: usize, artifacts: usize, build_time: Duration) {
        info!(
            "✅ Build complete: {} files, {} chunks, {} artifacts in {:.2?}",
            files, chunks, artifacts, build_time
        );
    }

    pub fn rebuild_start(events: usize, invalidated: usize) {
        info!("🔄 Rebuilding... ({} events, {} files invalidated)", events, invalidated);
    }

    pub fn rebuild_complete(changed: usize, build_time: Duration) {
        info!("✅ Rebuild complete in {:.0}ms ({} files changed)", build_time.as_millis(), changed);
    }

    pub fn debug(msg: &str) {
        debug!("{}", msg);
    }

    pub fn info(msg: &str) {
        info!("{}", msg);
    }

    pub fn error(msg: &str) {
        error!("❌ {}", msg);
    }

    pub fn warn(msg: &str) {
        warn!("⚠️  {}", msg);
    }
}

pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    pub fn start(name: &str) -> Self {
        debug!("⏱️  Starting: {}", name);
        Self {
            start: Instant::now(),
            name: name.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!("⏱️  Completed: {} in {:.2?}", self.name, self.elapsed());
    }
}
