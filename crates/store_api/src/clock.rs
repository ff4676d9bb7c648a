use std::time::{
    Duration,
    SystemTime,
};

use async_trait::async_trait;

/// The three environment hooks the builder needs, trimmed from the much
/// larger `Runtime` trait this workspace's teacher repo passes everywhere:
/// sleeping for rate pacing and back-off, reading wall-clock time for
/// lease expiry and logging, and a source of randomness for jitter.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn wait(&self, duration: Duration);

    fn system_time(&self) -> SystemTime;

    /// A uniformly distributed `f64` in `[0, 1)`, used for back-off jitter.
    fn rand_f64(&self) -> f64;
}
