//! Devices: naming, command streams, memory and where a device physically lives.

pub mod allocator;
pub mod name;
pub mod stream;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use allocator::{AllocatorStats, DeviceAllocator, DeviceMemory, DeviceMemoryBase};
pub use name::ParsedName;
pub use stream::{DefinitionEvent, Event, Stream};

use crate::eager::remote::RemoteWorker;
use crate::status::{Status, StatusResult};
use crate::xla::local_client::LocalClient;

pub const CPU: &str = "CPU";
pub const XLA_CPU: &str = "XLA_CPU";

static NEXT_INCARNATION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_incarnation() -> u64 {
    NEXT_INCARNATION.fetch_add(1, Ordering::Relaxed)
}

/// Static description of a device as reported by device-list queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub name: String,
    pub device_type: String,
    pub memory_limit: u64,
    pub incarnation: u64,
}

/// State owned by a device living in this process.
pub struct LocalDevice {
    allocator: Arc<DeviceAllocator>,
    compute_stream: Stream,
    host_to_device_stream: Option<Stream>,
    client: Arc<LocalClient>,
}

impl LocalDevice {
    /// Devices with `use_multiple_streams` move host data on a dedicated transfer stream.
    pub fn new(
        name: &str,
        ordinal: usize,
        memory_limit: Option<usize>,
        use_multiple_streams: bool,
        client: Arc<LocalClient>,
    ) -> StatusResult<Self> {
        let allocator = DeviceAllocator::new(name, ordinal, memory_limit);
        let compute_stream = Stream::new(format!("{name}/compute"))?;
        let host_to_device_stream = if use_multiple_streams {
            Some(Stream::new(format!("{name}/h2d"))?)
        } else {
            None
        };
        Ok(LocalDevice {
            allocator,
            compute_stream,
            host_to_device_stream,
            client,
        })
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }

    pub fn compute_stream(&self) -> &Stream {
        &self.compute_stream
    }

    /// Stream used for host-to-device copies; the compute stream when there is no separate one.
    pub fn host_to_device_stream(&self) -> &Stream {
        self.host_to_device_stream
            .as_ref()
            .unwrap_or(&self.compute_stream)
    }

    pub fn use_multiple_streams(&self) -> bool {
        self.host_to_device_stream.is_some()
    }

    pub fn client(&self) -> &Arc<LocalClient> {
        &self.client
    }
}

pub enum DeviceKind {
    Local(LocalDevice),
    Remote(Arc<dyn RemoteWorker>),
}

pub struct Device {
    attributes: DeviceAttributes,
    parsed: ParsedName,
    ordinal: usize,
    kind: DeviceKind,
    retired: AtomicBool,
}

impl Device {
    pub fn new_local(
        parsed: ParsedName,
        device_type: &str,
        ordinal: usize,
        memory_limit: Option<usize>,
        use_multiple_streams: bool,
        client: Arc<LocalClient>,
    ) -> StatusResult<Arc<Self>> {
        let name = parsed.to_string();
        let local = LocalDevice::new(&name, ordinal, memory_limit, use_multiple_streams, client)?;
        Ok(Arc::new(Device {
            attributes: DeviceAttributes {
                name,
                device_type: device_type.to_string(),
                memory_limit: memory_limit.map_or(u64::MAX, |limit| limit as u64),
                incarnation: next_incarnation(),
            },
            parsed,
            ordinal,
            kind: DeviceKind::Local(local),
            retired: AtomicBool::new(false),
        }))
    }

    pub fn new_remote(
        attributes: DeviceAttributes,
        worker: Arc<dyn RemoteWorker>,
    ) -> StatusResult<Arc<Self>> {
        let parsed = ParsedName::parse_full(&attributes.name)
            .filter(ParsedName::is_fully_specified)
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "remote device name {} is not fully specified",
                    attributes.name
                ))
            })?;
        Ok(Arc::new(Device {
            attributes,
            parsed,
            ordinal: 0,
            kind: DeviceKind::Remote(worker),
            retired: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.attributes.name
    }

    pub fn parsed_name(&self) -> &ParsedName {
        &self.parsed
    }

    pub fn device_type(&self) -> &str {
        &self.attributes.device_type
    }

    pub fn attributes(&self) -> &DeviceAttributes {
        &self.attributes
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, DeviceKind::Local(_))
    }

    pub fn local(&self) -> StatusResult<&LocalDevice> {
        match &self.kind {
            DeviceKind::Local(local) => Ok(local),
            DeviceKind::Remote(_) => Err(Status::internal(format!(
                "device {} is not local to this process",
                self.name()
            ))),
        }
    }

    pub fn remote_worker(&self) -> Option<&Arc<dyn RemoteWorker>> {
        match &self.kind {
            DeviceKind::Remote(worker) => Some(worker),
            DeviceKind::Local(_) => None,
        }
    }

    /// Marks the device as dropped from the cluster topology.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Fails for devices that were dropped by a cluster rebinding.
    pub fn ensure_live(&self) -> StatusResult<()> {
        if self.is_retired() {
            return Err(Status::invalid_argument(format!(
                "device {} is not part of the current cluster topology",
                self.name()
            )));
        }
        Ok(())
    }

    pub fn same_device(&self, other: &Device) -> bool {
        self.attributes.incarnation == other.attributes.incarnation
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.attributes.name)
            .field("type", &self.attributes.device_type)
            .field("local", &self.is_local())
            .finish()
    }
}
