//! Cluster configuration and the worker interface used for remote devices.
//!
//! Remote devices are reached through a [`RemoteWorker`]. The default transport is an
//! in-process loopback worker that owns its own [`Context`]; real network transports plug in
//! through [`WorkerChannelFactory`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::device::name::ParsedName;
use crate::device::DeviceAttributes;
use crate::eager::attr::AttrMap;
use crate::eager::context::{Context, ContextOptions};
use crate::eager::copy::copy_to_device;
use crate::eager::execute::execute;
use crate::eager::op::Op;
use crate::eager::tensor_handle::TensorHandle;
use crate::status::{Status, StatusResult};
use crate::tensor::{DType, Tensor, TensorShape};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDef {
    pub name: String,
    /// Task index to network address.
    #[serde(default)]
    pub tasks: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDef {
    #[serde(default)]
    pub job: Vec<JobDef>,
}

/// Cluster membership of the local process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDef {
    pub cluster: ClusterDef,
    pub job_name: String,
    pub task_index: u32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "grpc".to_string()
}

impl ServerDef {
    pub fn from_json_slice(bytes: &[u8]) -> StatusResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json_string(&self) -> StatusResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> StatusResult<()> {
        let job = self
            .cluster
            .job
            .iter()
            .find(|job| job.name == self.job_name)
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "job {} is not defined in the cluster",
                    self.job_name
                ))
            })?;
        if !job.tasks.contains_key(&self.task_index) {
            return Err(Status::invalid_argument(format!(
                "task {} is not defined for job {}",
                self.task_index, self.job_name
            )));
        }
        Ok(())
    }

    /// Every (job, task, address) other than the local task.
    pub fn remote_tasks(&self) -> Vec<(String, u32, String)> {
        self.cluster
            .job
            .iter()
            .flat_map(|job| {
                job.tasks
                    .iter()
                    .map(move |(task, address)| (job.name.clone(), *task, address.clone()))
            })
            .filter(|(job, task, _)| !(job == &self.job_name && *task == self.task_index))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTensorInfo {
    pub id: u64,
    pub dtype: DType,
    pub shape: TensorShape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOpRequest {
    pub op: String,
    pub device: String,
    pub attrs: AttrMap,
    pub inputs: Vec<u64>,
}

/// Operations a remote task serves. Tensor ids are scoped to the worker.
pub trait RemoteWorker: Send + Sync {
    /// `/job:<job>/replica:0/task:<task>`
    fn task_name(&self) -> &str;

    fn address(&self) -> &str;

    fn list_devices(&self) -> StatusResult<Vec<DeviceAttributes>>;

    fn put_tensor(&self, device: &str, tensor: Tensor) -> StatusResult<RemoteTensorInfo>;

    fn fetch_tensor(&self, id: u64) -> StatusResult<Tensor>;

    /// Copies a tensor between two devices of this worker.
    fn copy_tensor(&self, id: u64, device: &str) -> StatusResult<RemoteTensorInfo>;

    fn execute(&self, request: &RemoteOpRequest) -> StatusResult<Vec<RemoteTensorInfo>>;

    fn release(&self, id: u64);
}

pub trait WorkerChannelFactory: Send + Sync {
    fn connect(&self, job: &str, task: u32, address: &str) -> StatusResult<Arc<dyn RemoteWorker>>;
}

/// A tensor held by a remote worker. The worker-side tensor is released on drop.
pub struct RemoteTensor {
    worker: Arc<dyn RemoteWorker>,
    info: RemoteTensorInfo,
    device: String,
}

impl RemoteTensor {
    pub fn new(worker: Arc<dyn RemoteWorker>, info: RemoteTensorInfo, device: impl Into<String>) -> Self {
        RemoteTensor {
            worker,
            info,
            device: device.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn dtype(&self) -> DType {
        self.info.dtype
    }

    pub fn shape(&self) -> &TensorShape {
        &self.info.shape
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn worker(&self) -> &Arc<dyn RemoteWorker> {
        &self.worker
    }

    pub fn fetch(&self) -> StatusResult<Tensor> {
        self.worker.fetch_tensor(self.info.id)
    }
}

impl fmt::Debug for RemoteTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTensor")
            .field("task", &self.worker.task_name())
            .field("id", &self.info.id)
            .field("device", &self.device)
            .finish()
    }
}

impl Drop for RemoteTensor {
    fn drop(&mut self) {
        self.worker.release(self.info.id);
    }
}

/// A worker served by a context in this process.
pub struct LoopbackWorker {
    task_name: String,
    address: String,
    context: Arc<Context>,
    tensors: Mutex<HashMap<u64, TensorHandle>>,
    next_id: AtomicU64,
}

impl LoopbackWorker {
    pub fn new(job: &str, task: u32, address: &str) -> StatusResult<Self> {
        let context = Context::new(ContextOptions {
            async_mode: Some(false),
            job_name: job.to_string(),
            task_index: task,
            ..ContextOptions::default()
        })?;
        Ok(LoopbackWorker {
            task_name: ParsedName {
                job: Some(job.to_string()),
                replica: Some(0),
                task: Some(task),
                device_type: None,
                id: None,
            }
            .to_string(),
            address: address.to_string(),
            context,
            tensors: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn live_tensors(&self) -> usize {
        self.tensors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn store(&self, handle: TensorHandle) -> StatusResult<RemoteTensorInfo> {
        let shape = if handle.dtype() == DType::Resource {
            TensorShape::scalar()
        } else {
            handle.shape()?
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = RemoteTensorInfo {
            id,
            dtype: handle.dtype(),
            shape,
        };
        self.tensors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
        Ok(info)
    }

    fn handle(&self, id: u64) -> StatusResult<TensorHandle> {
        self.tensors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "tensor {id} is not held by worker {}",
                    self.task_name
                ))
            })
    }
}

impl RemoteWorker for LoopbackWorker {
    fn task_name(&self) -> &str {
        &self.task_name
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn list_devices(&self) -> StatusResult<Vec<DeviceAttributes>> {
        Ok(self.context.list_devices())
    }

    fn put_tensor(&self, device: &str, tensor: Tensor) -> StatusResult<RemoteTensorInfo> {
        let host = TensorHandle::from_tensor(&self.context, tensor);
        let placed = copy_to_device(&host, &self.context, device)?;
        self.store(placed)
    }

    fn fetch_tensor(&self, id: u64) -> StatusResult<Tensor> {
        self.handle(id)?.resolve()
    }

    fn copy_tensor(&self, id: u64, device: &str) -> StatusResult<RemoteTensorInfo> {
        let copied = copy_to_device(&self.handle(id)?, &self.context, device)?;
        self.store(copied)
    }

    fn execute(&self, request: &RemoteOpRequest) -> StatusResult<Vec<RemoteTensorInfo>> {
        let mut op = Op::new(&self.context, &request.op)?;
        op.set_device(&request.device)?;
        for (name, value) in request.attrs.iter() {
            op.set_attr(name, value.clone());
        }
        for &id in &request.inputs {
            op.add_input(&self.handle(id)?)?;
        }
        execute(&op)?
            .into_iter()
            .map(|handle| self.store(handle))
            .collect()
    }

    fn release(&self, id: u64) {
        self.tensors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Connects to loopback workers, one per (job, task, address) for the factory's lifetime.
#[derive(Default)]
pub struct LoopbackChannelFactory {
    workers: Mutex<HashMap<(String, u32, String), Arc<LoopbackWorker>>>,
}

impl LoopbackChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker(&self, job: &str, task: u32, address: &str) -> Option<Arc<LoopbackWorker>> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(job.to_string(), task, address.to_string()))
            .cloned()
    }
}

impl WorkerChannelFactory for LoopbackChannelFactory {
    fn connect(&self, job: &str, task: u32, address: &str) -> StatusResult<Arc<dyn RemoteWorker>> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (job.to_string(), task, address.to_string());
        let worker = match workers.get(&key) {
            Some(worker) => Arc::clone(worker),
            None => {
                let worker = Arc::new(LoopbackWorker::new(job, task, address)?);
                tracing::debug!(job, task, address, "started loopback worker");
                workers.insert(key, Arc::clone(&worker));
                worker
            }
        };
        Ok(worker)
    }
}
