use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceAllocator, Stream};
use crate::status::StatusResult;
use crate::xla::hlo::HloModule;
use crate::xla::literal::Literal;
use crate::xla::shaped_buffer::{ScopedShapedBuffer, ShapedBuffer};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub compilation_cache_hit: bool,
    pub compile_time_ms: u64,
    pub compute_time_ns: u64,
    pub compute_and_transfer_time_ns: u64,
    pub executable_size_in_bytes: u64,
}

/// A module together with the arguments it ran on and the result it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HloSnapshot {
    pub hlo_module: HloModule,
    pub arguments: Vec<Literal>,
    pub result: Option<Literal>,
    pub execution_platform: String,
}

static SNAPSHOT_COUNTER: AtomicU64 = AtomicU64::new(0);

impl HloSnapshot {
    pub fn to_json_string(&self) -> StatusResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_str(json: &str) -> StatusResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_bincode_bytes(&self) -> StatusResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bincode_bytes(bytes: &[u8]) -> StatusResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Writes the snapshot under `dir` with a process-unique file name and returns the path.
    pub fn dump_to(&self, dir: &Path) -> StatusResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let seq = SNAPSHOT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "module_{}.snapshot.{}.json",
            self.hlo_module.name(),
            seq
        ));
        std::fs::write(&path, self.to_json_string()?)?;
        tracing::debug!(path = %path.display(), "dumped hlo snapshot");
        Ok(path)
    }
}

pub struct ServiceExecutableRunOptions<'a> {
    pub stream: &'a Stream,
    pub allocator: &'a Arc<DeviceAllocator>,
    pub device_ordinal: usize,
}

pub trait Executable: Send + Sync {
    fn module(&self) -> &HloModule;

    fn platform_name(&self) -> &str;

    /// Allocates the result and enqueues the computation on the run stream.
    ///
    /// The returned buffers are defined once the stream reaches the enqueued work.
    fn execute_async_on_stream(
        &self,
        run_options: &ServiceExecutableRunOptions<'_>,
        arguments: &[ShapedBuffer],
    ) -> StatusResult<ScopedShapedBuffer>;

    /// Runs to completion. On failure no result buffers survive.
    fn execute_on_stream(
        &self,
        run_options: &ServiceExecutableRunOptions<'_>,
        arguments: &[ShapedBuffer],
        profile: Option<&mut ExecutionProfile>,
    ) -> StatusResult<ScopedShapedBuffer> {
        let start = Instant::now();
        let result = self.execute_async_on_stream(run_options, arguments)?;
        run_options.stream.block_host_until_done()?;
        if let Some(profile) = profile {
            let elapsed = start.elapsed().as_nanos() as u64;
            profile.compute_time_ns = elapsed;
            profile.compute_and_transfer_time_ns = elapsed;
            profile.executable_size_in_bytes = self.size_in_bytes();
        }
        Ok(result)
    }

    fn size_in_bytes(&self) -> u64 {
        0
    }
}
