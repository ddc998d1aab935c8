//! Byte-budgeted device allocator and reference-counted device memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use crate::status::{Status, StatusResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub bytes_in_use: usize,
    pub peak_bytes_in_use: usize,
    pub num_allocs: u64,
    pub bytes_limit: Option<usize>,
}

#[derive(Debug)]
pub struct DeviceAllocator {
    name: String,
    device_ordinal: usize,
    stats: Mutex<AllocatorStats>,
}

impl DeviceAllocator {
    pub fn new(name: impl Into<String>, device_ordinal: usize, limit: Option<usize>) -> Arc<Self> {
        Arc::new(DeviceAllocator {
            name: name.into(),
            device_ordinal,
            stats: Mutex::new(AllocatorStats {
                bytes_limit: limit,
                ..AllocatorStats::default()
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn stats(&self) -> AllocatorStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves `size` bytes. The returned memory is released when its last owner drops.
    pub fn allocate(self: &Arc<Self>, size: usize) -> StatusResult<DeviceMemory> {
        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(limit) = stats.bytes_limit {
                if stats.bytes_in_use.saturating_add(size) > limit {
                    return Err(Status::resource_exhausted(format!(
                        "Out of memory while trying to allocate {size} bytes."
                    )));
                }
            }
            stats.bytes_in_use += size;
            stats.peak_bytes_in_use = stats.peak_bytes_in_use.max(stats.bytes_in_use);
            stats.num_allocs += 1;
        }
        Ok(DeviceMemory {
            allocation: Arc::new(Allocation {
                id: NEXT_ALLOCATION_ID.fetch_add(1, Ordering::Relaxed),
                allocator: Arc::clone(self),
                size,
                contents: OnceLock::new(),
            }),
        })
    }

    /// Allocates and immediately defines the contents.
    pub fn allocate_with(self: &Arc<Self>, bytes: Arc<[u8]>) -> StatusResult<DeviceMemory> {
        let memory = self.allocate(bytes.len())?;
        memory.write(bytes)?;
        Ok(memory)
    }

    fn release(&self, size: usize) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.bytes_in_use = stats.bytes_in_use.saturating_sub(size);
    }
}

static NEXT_ALLOCATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Allocation {
    id: u64,
    allocator: Arc<DeviceAllocator>,
    size: usize,
    contents: OnceLock<Arc<[u8]>>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.allocator.release(self.size);
    }
}

/// Owning reference to a device allocation. Contents are written exactly once.
#[derive(Debug, Clone)]
pub struct DeviceMemory {
    allocation: Arc<Allocation>,
}

impl DeviceMemory {
    pub fn size(&self) -> usize {
        self.allocation.size
    }

    pub fn allocation_id(&self) -> u64 {
        self.allocation.id
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocation.allocator
    }

    pub fn is_defined(&self) -> bool {
        self.allocation.contents.get().is_some()
    }

    pub fn write(&self, bytes: Arc<[u8]>) -> StatusResult<()> {
        if bytes.len() != self.allocation.size {
            return Err(Status::internal(format!(
                "write of {} bytes into a {} byte allocation",
                bytes.len(),
                self.allocation.size
            )));
        }
        self.allocation
            .contents
            .set(bytes)
            .map_err(|_| Status::internal("device memory written twice"))
    }

    pub fn read(&self) -> StatusResult<Arc<[u8]>> {
        self.allocation
            .contents
            .get()
            .cloned()
            .ok_or_else(|| Status::internal("read of undefined device memory"))
    }

    /// True when both references point at the same allocation.
    pub fn same_allocation(&self, other: &DeviceMemory) -> bool {
        Arc::ptr_eq(&self.allocation, &other.allocation)
    }

    /// True when more than one owner currently holds the allocation.
    pub fn is_aliased(&self) -> bool {
        Arc::strong_count(&self.allocation) > 1
    }

    pub fn downgrade(&self) -> DeviceMemoryBase {
        DeviceMemoryBase {
            allocation: Arc::downgrade(&self.allocation),
            size: self.allocation.size,
        }
    }
}

/// Non-owning view of a device allocation.
#[derive(Debug, Clone)]
pub struct DeviceMemoryBase {
    allocation: Weak<Allocation>,
    size: usize,
}

impl DeviceMemoryBase {
    pub fn size(&self) -> usize {
        self.size
    }

    /// Recovers an owning reference while the allocation is still alive.
    pub fn upgrade(&self) -> StatusResult<DeviceMemory> {
        self.allocation
            .upgrade()
            .map(|allocation| DeviceMemory { allocation })
            .ok_or_else(|| Status::internal("use of device memory after it was freed"))
    }
}
