//! LRU cache of compiled kernels keyed by op signature.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;

use crate::hashing::Fingerprint;
use crate::jit::xla_compiler::{CompilationResult, XlaCompilerArgument, XlaGraph};
use crate::status::StatusResult;
use crate::xla::local_client::LocalExecutable;

pub struct CompiledKernel {
    pub result: CompilationResult,
    pub executable: LocalExecutable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct CompilationCache {
    entries: Mutex<LruCache<u64, Arc<CompiledKernel>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CompilationCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        CompilationCache {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fingerprint of everything that determines the compiled code.
    pub fn signature(device: &str, graph: &XlaGraph, args: &[XlaCompilerArgument]) -> StatusResult<u64> {
        let mut fingerprint = Fingerprint::new();
        fingerprint.write_str(device);
        fingerprint.write_serializable(graph)?;
        fingerprint.write_serializable(args)?;
        Ok(fingerprint.finish())
    }

    /// Returns the cached kernel for `key` or compiles and inserts it. The flag reports a hit.
    ///
    /// Compilation runs without holding the cache lock, so concurrent misses on the same key may
    /// both compile; the last insert wins.
    pub fn compile_if_needed<F>(&self, key: u64, compile: F) -> StatusResult<(Arc<CompiledKernel>, bool)>
    where
        F: FnOnce() -> StatusResult<CompiledKernel>,
    {
        if let Some(kernel) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((Arc::clone(kernel), true));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let kernel = Arc::new(compile()?);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, Arc::clone(&kernel));
        Ok((kernel, false))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
