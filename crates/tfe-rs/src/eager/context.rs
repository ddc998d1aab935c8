//! Process-scoped eager runtime state.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::device::name::ParsedName;
use crate::device::{Device, DeviceAttributes, CPU, XLA_CPU};
use crate::eager::executor::ExecutionQueue;
use crate::eager::function::{FunctionBody, FunctionDef};
use crate::eager::kernels::{kernel_registry, Kernel};
use crate::eager::remote::{LoopbackChannelFactory, RemoteWorker, ServerDef, WorkerChannelFactory};
use crate::env;
use crate::jit::compilation_cache::CompilationCache;
use crate::jit::variable::ResourceMgr;
use crate::status::{Status, StatusResult};
use crate::xla::local_client::LocalClient;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Whether an op may consume inputs that live on another device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ContextDevicePlacementPolicy {
    /// Mismatched inputs are an error.
    Explicit = 0,
    /// Mismatched inputs are copied and a warning is logged.
    Warn = 1,
    /// Mismatched inputs are copied.
    Silent = 2,
    /// Only int32 inputs are copied silently; others are an error.
    SilentForInt32 = 3,
}

impl ContextDevicePlacementPolicy {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ContextDevicePlacementPolicy::Explicit),
            1 => Some(ContextDevicePlacementPolicy::Warn),
            2 => Some(ContextDevicePlacementPolicy::Silent),
            3 => Some(ContextDevicePlacementPolicy::SilentForInt32),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "explicit" => Some(ContextDevicePlacementPolicy::Explicit),
            "warn" => Some(ContextDevicePlacementPolicy::Warn),
            "silent" => Some(ContextDevicePlacementPolicy::Silent),
            "silent_for_int32" => Some(ContextDevicePlacementPolicy::SilentForInt32),
            _ => None,
        }
    }

    fn from_env() -> Self {
        match env::placement_policy_name() {
            Some(name) => Self::from_name(name).unwrap_or_else(|| {
                tracing::warn!(policy = name, "unknown TFE_PLACEMENT_POLICY, using silent");
                ContextDevicePlacementPolicy::Silent
            }),
            None => ContextDevicePlacementPolicy::Silent,
        }
    }
}

#[derive(Clone)]
pub struct ContextOptions {
    /// Defaults to `TFE_ASYNC`.
    pub async_mode: Option<bool>,
    /// Defaults to `TFE_PLACEMENT_POLICY`.
    pub placement_policy: Option<ContextDevicePlacementPolicy>,
    pub cpu_device_count: usize,
    pub xla_cpu_device_count: usize,
    /// Per-device memory limit in bytes; unlimited when unset.
    pub memory_limit: Option<usize>,
    /// Compiler platform backing every local device.
    pub platform: String,
    pub job_name: String,
    pub task_index: u32,
    /// Transport for remote tasks; an in-process loopback when unset.
    pub channel_factory: Option<Arc<dyn WorkerChannelFactory>>,
    /// Defaults to `TFE_COMPILE_CACHE_CAPACITY`.
    pub compile_cache_capacity: Option<usize>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            async_mode: None,
            placement_policy: None,
            cpu_device_count: 1,
            xla_cpu_device_count: 1,
            memory_limit: None,
            platform: "interpreter".to_string(),
            job_name: "localhost".to_string(),
            task_index: 0,
            channel_factory: None,
            compile_cache_capacity: None,
        }
    }
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("async_mode", &self.async_mode)
            .field("placement_policy", &self.placement_policy)
            .field("cpu_device_count", &self.cpu_device_count)
            .field("xla_cpu_device_count", &self.xla_cpu_device_count)
            .field("memory_limit", &self.memory_limit)
            .field("platform", &self.platform)
            .field("job_name", &self.job_name)
            .field("task_index", &self.task_index)
            .field("channel_factory", &self.channel_factory.is_some())
            .finish()
    }
}

thread_local! {
    static THREAD_ASYNC: RefCell<HashMap<u64, bool>> = RefCell::new(HashMap::new());
    static THREAD_POLICY: RefCell<HashMap<u64, ContextDevicePlacementPolicy>> = RefCell::new(HashMap::new());
}

struct RemoteTask {
    address: String,
    worker: Arc<dyn RemoteWorker>,
}

struct Topology {
    job_name: String,
    task_index: u32,
    /// Local devices first, then remote devices in cluster order.
    devices: Vec<Arc<Device>>,
    host_cpu: Arc<Device>,
    remote_tasks: BTreeMap<(String, u32), RemoteTask>,
    server_def: Option<ServerDef>,
    keep_alive_secs: i64,
}

impl Topology {
    fn local_devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.iter().filter(|device| device.is_local())
    }
}

pub struct Context {
    id: u64,
    options: ContextOptions,
    async_mode: AtomicBool,
    placement_policy: Mutex<ContextDevicePlacementPolicy>,
    topology: RwLock<Topology>,
    default_channels: Arc<LoopbackChannelFactory>,
    functions: RwLock<HashMap<String, Arc<FunctionBody>>>,
    resources: ResourceMgr,
    compilation_cache: CompilationCache,
    queues: Mutex<HashMap<String, Arc<ExecutionQueue>>>,
}

fn create_local_devices(options: &ContextOptions, job: &str, task: u32) -> StatusResult<Vec<Arc<Device>>> {
    let client = LocalClient::for_platform(&options.platform)?;
    let mut devices = Vec::new();
    for (device_type, count, multiple_streams) in [
        (CPU, options.cpu_device_count.max(1), false),
        (XLA_CPU, options.xla_cpu_device_count, true),
    ] {
        for id in 0..count {
            let parsed = ParsedName::full(job, 0, task, device_type, id as u32);
            let ordinal = devices.len();
            devices.push(Device::new_local(
                parsed,
                device_type,
                ordinal,
                options.memory_limit,
                multiple_streams,
                Arc::clone(&client),
            )?);
        }
    }
    Ok(devices)
}

fn host_cpu_of(devices: &[Arc<Device>]) -> StatusResult<Arc<Device>> {
    devices
        .iter()
        .find(|device| device.is_local() && device.device_type() == CPU)
        .cloned()
        .ok_or_else(|| Status::internal("context has no local CPU device"))
}

impl Context {
    pub fn new(options: ContextOptions) -> StatusResult<Arc<Self>> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let devices = create_local_devices(&options, &options.job_name, options.task_index)?;
        let host_cpu = host_cpu_of(&devices)?;
        let async_mode = options.async_mode.unwrap_or_else(env::async_default);
        let policy = options
            .placement_policy
            .unwrap_or_else(ContextDevicePlacementPolicy::from_env);
        let capacity = options
            .compile_cache_capacity
            .unwrap_or_else(env::compile_cache_capacity);
        tracing::debug!(
            context = id,
            devices = devices.len(),
            async_mode,
            ?policy,
            platform = %options.platform,
            "created eager context"
        );
        Ok(Arc::new(Context {
            id,
            async_mode: AtomicBool::new(async_mode),
            placement_policy: Mutex::new(policy),
            topology: RwLock::new(Topology {
                job_name: options.job_name.clone(),
                task_index: options.task_index,
                devices,
                host_cpu,
                remote_tasks: BTreeMap::new(),
                server_def: None,
                keep_alive_secs: 0,
            }),
            options,
            default_channels: Arc::new(LoopbackChannelFactory::new()),
            functions: RwLock::new(HashMap::new()),
            resources: ResourceMgr::new(),
            compilation_cache: CompilationCache::new(capacity),
            queues: Mutex::new(HashMap::new()),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .devices
            .clone()
    }

    pub fn list_devices(&self) -> Vec<DeviceAttributes> {
        self.topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .devices
            .iter()
            .map(|device| device.attributes().clone())
            .collect()
    }

    pub fn host_cpu(&self) -> Arc<Device> {
        Arc::clone(
            &self
                .topology
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .host_cpu,
        )
    }

    /// Resolves a (possibly partial) device name against the current topology.
    ///
    /// Names without job, replica or task only match devices of this process.
    pub fn find_device(&self, name: &str) -> StatusResult<Arc<Device>> {
        let unknown = || Status::invalid_argument(format!("{name} unknown device."));
        let parsed = ParsedName::parse(name).map_err(|_| unknown())?;
        let topology = self.topology.read().unwrap_or_else(PoisonError::into_inner);
        let local_only = parsed.job.is_none() && parsed.replica.is_none() && parsed.task.is_none();
        let found = if local_only {
            topology
                .local_devices()
                .find(|device| parsed.matches(device.parsed_name()))
        } else {
            topology
                .devices
                .iter()
                .find(|device| parsed.matches(device.parsed_name()))
        };
        found.cloned().ok_or_else(unknown)
    }

    pub fn is_async(&self) -> bool {
        THREAD_ASYNC
            .with(|overrides| overrides.borrow().get(&self.id).copied())
            .unwrap_or_else(|| self.async_mode.load(Ordering::Acquire))
    }

    pub fn set_async(&self, enabled: bool) {
        self.async_mode.store(enabled, Ordering::Release);
    }

    /// Overrides async mode for ops executed on the calling thread.
    pub fn set_async_for_thread(&self, enabled: bool) {
        THREAD_ASYNC.with(|overrides| {
            overrides.borrow_mut().insert(self.id, enabled);
        });
    }

    pub fn placement_policy(&self) -> ContextDevicePlacementPolicy {
        THREAD_POLICY
            .with(|overrides| overrides.borrow().get(&self.id).copied())
            .unwrap_or_else(|| *self.placement_policy.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_placement_policy(&self, policy: ContextDevicePlacementPolicy) {
        *self.placement_policy.lock().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    pub fn set_thread_local_placement_policy(&self, policy: ContextDevicePlacementPolicy) {
        THREAD_POLICY.with(|overrides| {
            overrides.borrow_mut().insert(self.id, policy);
        });
    }

    pub fn resource_mgr(&self) -> &ResourceMgr {
        &self.resources
    }

    pub fn compilation_cache(&self) -> &CompilationCache {
        &self.compilation_cache
    }

    /// Validates and registers a function so ops can invoke it by name.
    pub fn add_function_def(&self, def: FunctionDef) -> StatusResult<()> {
        let name = def.signature.name.clone();
        if let Some(existing) = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
        {
            if existing.def() == &def {
                return Ok(());
            }
            return Err(Status::invalid_argument(format!(
                "Cannot add function '{name}' because a different function with the same name already exists."
            )));
        }
        let body = Arc::new(FunctionBody::instantiate(def, self)?);
        tracing::debug!(context = self.id, function = %name, "registered function");
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, body);
        Ok(())
    }

    pub fn add_function_def_json(&self, bytes: &[u8]) -> StatusResult<()> {
        self.add_function_def(FunctionDef::from_json_slice(bytes)?)
    }

    pub fn function(&self, name: &str) -> Option<Arc<FunctionBody>> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// The function library is consulted before the kernel registry.
    pub fn find_kernel(&self, op: &str) -> Option<Kernel> {
        self.function(op)
            .map(Kernel::Function)
            .or_else(|| kernel_registry().kernel(op))
    }

    pub fn server_def(&self) -> Option<ServerDef> {
        self.topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .server_def
            .clone()
    }

    pub fn keep_alive_secs(&self) -> i64 {
        self.topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keep_alive_secs
    }

    /// Rebinds the cluster. Devices that are not part of the new topology are retired, so
    /// handles and names referring to them fail from now on.
    pub fn set_server_def(&self, keep_alive_secs: i64, server_def: ServerDef) -> StatusResult<()> {
        server_def.validate()?;
        let channels: Arc<dyn WorkerChannelFactory> = match &self.options.channel_factory {
            Some(factory) => Arc::clone(factory),
            None => Arc::clone(&self.default_channels) as Arc<dyn WorkerChannelFactory>,
        };

        let mut topology = self.topology.write().unwrap_or_else(PoisonError::into_inner);
        let local = if topology.job_name == server_def.job_name && topology.task_index == server_def.task_index {
            topology.local_devices().cloned().collect()
        } else {
            create_local_devices(&self.options, &server_def.job_name, server_def.task_index)?
        };

        let mut remote_tasks = BTreeMap::new();
        let mut remote_devices = Vec::new();
        for (job, task, address) in server_def.remote_tasks() {
            let key = (job.clone(), task);
            let reused = topology
                .remote_tasks
                .get(&key)
                .filter(|existing| existing.address == address)
                .map(|existing| Arc::clone(&existing.worker));
            let devices = match reused {
                Some(worker) => {
                    let devices: Vec<_> = topology
                        .devices
                        .iter()
                        .filter(|device| {
                            device.parsed_name().job.as_deref() == Some(job.as_str())
                                && device.parsed_name().task == Some(task)
                                && !device.is_local()
                        })
                        .cloned()
                        .collect();
                    remote_tasks.insert(key, RemoteTask { address, worker });
                    devices
                }
                None => {
                    let worker = channels.connect(&job, task, &address)?;
                    let devices = worker
                        .list_devices()?
                        .into_iter()
                        .map(|attributes| Device::new_remote(attributes, Arc::clone(&worker)))
                        .collect::<StatusResult<Vec<_>>>()?;
                    remote_tasks.insert(key, RemoteTask { address, worker });
                    devices
                }
            };
            remote_devices.extend(devices);
        }

        let devices: Vec<Arc<Device>> = local.into_iter().chain(remote_devices).collect();
        let host_cpu = host_cpu_of(&devices)?;
        let mut retired = Vec::new();
        for old in &topology.devices {
            if !devices.iter().any(|device| Arc::ptr_eq(device, old)) {
                old.retire();
                retired.push(old.name().to_string());
            }
        }
        tracing::debug!(
            context = self.id,
            job = %server_def.job_name,
            task = server_def.task_index,
            devices = devices.len(),
            retired = retired.len(),
            "rebound cluster"
        );
        *topology = Topology {
            job_name: server_def.job_name.clone(),
            task_index: server_def.task_index,
            devices,
            host_cpu,
            remote_tasks,
            server_def: Some(server_def),
            keep_alive_secs,
        };
        drop(topology);

        let dropped: Vec<_> = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            retired.iter().filter_map(|name| queues.remove(name)).collect()
        };
        drop(dropped);
        if !retired.is_empty() {
            self.compilation_cache.clear();
        }
        Ok(())
    }

    pub fn set_server_def_json(&self, keep_alive_secs: i64, bytes: &[u8]) -> StatusResult<()> {
        self.set_server_def(keep_alive_secs, ServerDef::from_json_slice(bytes)?)
    }

    /// The execution queue for `device`, created on first use.
    pub fn queue_for(&self, device: &Device) -> StatusResult<Arc<ExecutionQueue>> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = queues.get(device.name()) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(ExecutionQueue::new(device.name())?);
        queues.insert(device.name().to_string(), Arc::clone(&queue));
        Ok(queue)
    }

    fn all_queues(&self) -> Vec<Arc<ExecutionQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Blocks until every queued op has finished; returns the error of the queue that failed
    /// first.
    pub fn async_wait(&self) -> StatusResult<()> {
        let first_error = self
            .all_queues()
            .iter()
            .filter_map(|queue| queue.wait_for_failure())
            .min_by_key(|(failed_at, _)| *failed_at);
        match first_error {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }

    pub fn async_clear_error(&self) {
        for queue in self.all_queues() {
            queue.clear_error();
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("async", &self.async_mode.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(error) = self.async_wait() {
            tracing::debug!(context = self.id, error = %error, "context dropped with a pending async error");
        }
        let _ = THREAD_POLICY.try_with(|overrides| overrides.borrow_mut().remove(&self.id));
        let _ = THREAD_ASYNC.try_with(|overrides| overrides.borrow_mut().remove(&self.id));
    }
}
