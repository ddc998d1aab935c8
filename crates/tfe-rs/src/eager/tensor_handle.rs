//! Handles to eager tensor values that may still be in flight.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::device::Device;
use crate::eager::context::Context;
use crate::eager::remote::RemoteTensor;
use crate::jit::variable::ResourceHandle;
use crate::jit::xla_tensor::DeviceTensor;
use crate::status::{Status, StatusResult};
use crate::tensor::{DType, Tensor, TensorShape};

/// Error reported for every accessor given a missing handle.
pub fn null_handle_error() -> Status {
    Status::invalid_argument("The passed in handle is a nullptr")
}

/// Where and how a handle's value is stored once it is ready.
#[derive(Debug, Clone)]
pub enum TensorValue {
    Host(Tensor),
    Device(DeviceTensor),
    Resource(ResourceHandle),
    Remote(Arc<RemoteTensor>),
}

impl TensorValue {
    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::Host(tensor) => tensor.dtype(),
            TensorValue::Device(tensor) => tensor.dtype(),
            TensorValue::Resource(_) => DType::Resource,
            TensorValue::Remote(tensor) => tensor.dtype(),
        }
    }

    pub fn shape(&self) -> TensorShape {
        match self {
            TensorValue::Host(tensor) => tensor.shape().clone(),
            TensorValue::Device(tensor) => tensor.shape().clone(),
            TensorValue::Resource(_) => TensorShape::scalar(),
            TensorValue::Remote(tensor) => tensor.shape().clone(),
        }
    }
}

enum HandleState {
    Pending,
    Ready(TensorValue),
    Poisoned(Status),
}

struct HandleInner {
    context_id: u64,
    dtype: DType,
    device: Arc<Device>,
    backing_device: Arc<Device>,
    state: Mutex<HandleState>,
    changed: Condvar,
}

/// A reference-counted eager tensor.
///
/// `device` is where the producing op ran; `backing_device` holds the memory. Clones share the
/// value and its readiness state.
#[derive(Clone)]
pub struct TensorHandle {
    inner: Arc<HandleInner>,
}

impl TensorHandle {
    fn with_state(
        context_id: u64,
        dtype: DType,
        device: Arc<Device>,
        backing_device: Arc<Device>,
        state: HandleState,
    ) -> Self {
        TensorHandle {
            inner: Arc::new(HandleInner {
                context_id,
                dtype,
                device,
                backing_device,
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
        }
    }

    pub(crate) fn ready(
        context_id: u64,
        device: Arc<Device>,
        backing_device: Arc<Device>,
        value: TensorValue,
    ) -> Self {
        Self::with_state(
            context_id,
            value.dtype(),
            device,
            backing_device,
            HandleState::Ready(value),
        )
    }

    pub(crate) fn pending(
        context_id: u64,
        dtype: DType,
        device: Arc<Device>,
        backing_device: Arc<Device>,
    ) -> Self {
        Self::with_state(context_id, dtype, device, backing_device, HandleState::Pending)
    }

    /// Wraps a host tensor as a handle on the context's host CPU device.
    pub fn from_tensor(context: &Context, tensor: Tensor) -> Self {
        let host = context.host_cpu();
        Self::ready(context.id(), Arc::clone(&host), host, TensorValue::Host(tensor))
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills a pending handle. Handles that are already settled keep their first outcome.
    pub(crate) fn set_value(&self, value: TensorValue) {
        let mut state = self.lock();
        if matches!(*state, HandleState::Pending) {
            *state = HandleState::Ready(value);
            self.inner.changed.notify_all();
        }
    }

    pub(crate) fn poison(&self, status: Status) {
        let mut state = self.lock();
        if matches!(*state, HandleState::Pending) {
            *state = HandleState::Poisoned(status);
            self.inner.changed.notify_all();
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*self.lock(), HandleState::Pending)
    }

    /// Blocks until the producing op has finished; fails with its error if it failed.
    pub fn wait_value(&self) -> StatusResult<TensorValue> {
        let mut state = self.lock();
        loop {
            match &*state {
                HandleState::Ready(value) => return Ok(value.clone()),
                HandleState::Poisoned(status) => return Err(status.clone()),
                HandleState::Pending => {
                    state = self
                        .inner
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Waits until the value and any device work defining it are complete.
    pub fn wait_defined(&self) -> StatusResult<()> {
        match self.wait_value()? {
            TensorValue::Device(tensor) => tensor.wait_defined(),
            _ => Ok(()),
        }
    }

    /// Copies the value to host memory, blocking until it is available.
    pub fn resolve(&self) -> StatusResult<Tensor> {
        if !self.inner.backing_device.is_local() {
            return Err(Status::invalid_argument(
                "TFE_TensorHandleResolve may not be called on a remote tensor handle.",
            ));
        }
        match self.wait_value()? {
            TensorValue::Host(tensor) => Ok(tensor),
            TensorValue::Device(tensor) => tensor.to_host(),
            TensorValue::Resource(handle) => Err(Status::invalid_argument(format!(
                "cannot resolve resource handle {}/{} to a dense tensor",
                handle.container, handle.name
            ))),
            TensorValue::Remote(_) => Err(Status::invalid_argument(
                "TFE_TensorHandleResolve may not be called on a remote tensor handle.",
            )),
        }
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn shape(&self) -> StatusResult<TensorShape> {
        Ok(self.wait_value()?.shape())
    }

    pub fn num_dims(&self) -> StatusResult<usize> {
        Ok(self.shape()?.rank())
    }

    pub fn dim(&self, index: usize) -> StatusResult<usize> {
        let shape = self.shape()?;
        shape.dim(index).ok_or_else(|| {
            Status::invalid_argument(format!(
                "Expected a dimension index in [0, {}), got {index}",
                shape.rank()
            ))
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    pub fn backing_device(&self) -> &Arc<Device> {
        &self.inner.backing_device
    }

    pub fn device_name(&self) -> &str {
        self.inner.device.name()
    }

    pub fn backing_device_name(&self) -> &str {
        self.inner.backing_device.name()
    }

    pub fn context_id(&self) -> u64 {
        self.inner.context_id
    }

    /// A second handle aliasing the same storage and readiness state.
    pub fn copy_sharing_tensor(&self) -> TensorHandle {
        self.clone()
    }

    pub fn shares_state_with(&self, other: &TensorHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            HandleState::Pending => "pending",
            HandleState::Ready(_) => "ready",
            HandleState::Poisoned(_) => "poisoned",
        };
        f.debug_struct("TensorHandle")
            .field("dtype", &self.inner.dtype)
            .field("device", &self.inner.device.name())
            .field("backing_device", &self.inner.backing_device.name())
            .field("state", &state)
            .finish()
    }
}
