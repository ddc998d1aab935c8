//! Resource variables and the per-context resource manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::jit::xla_tensor::DeviceTensor;
use crate::status::{Status, StatusResult};
use crate::tensor::{DType, PartialShape};

static NEXT_VAR_KEY: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarMode {
    /// Reads alias the current buffer; writes install a new buffer.
    CopyOnWrite,
    /// Reads always receive a private copy.
    CopyOnRead,
}

#[derive(Debug, Default)]
struct LockState {
    exclusive: bool,
    shared: usize,
}

/// A mutable tensor slot shared by every handle naming the same resource.
///
/// The lock is explicit rather than guard based so that a set of variables can be locked in a
/// global order and released later by their [`VariableInfo`](super::variable_info::VariableInfo)s.
#[derive(Debug)]
pub struct Var {
    key: u64,
    dtype: DType,
    lock: Mutex<LockState>,
    released: Condvar,
    value: Mutex<Option<DeviceTensor>>,
    copy_on_read: AtomicBool,
}

impl Var {
    pub fn new(dtype: DType) -> Arc<Self> {
        Arc::new(Var {
            key: NEXT_VAR_KEY.fetch_add(1, Ordering::Relaxed),
            dtype,
            lock: Mutex::new(LockState::default()),
            released: Condvar::new(),
            value: Mutex::new(None),
            copy_on_read: AtomicBool::new(false),
        })
    }

    /// Creation-order key; every multi-variable lock acquires in ascending key order.
    pub fn lock_key(&self) -> u64 {
        self.key
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_exclusive(&self) {
        let mut state = self.lock_state();
        while state.exclusive || state.shared > 0 {
            state = self.released.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.exclusive = true;
    }

    pub fn try_lock_exclusive(&self) -> bool {
        let mut state = self.lock_state();
        if state.exclusive || state.shared > 0 {
            return false;
        }
        state.exclusive = true;
        true
    }

    pub fn unlock_exclusive(&self) {
        let mut state = self.lock_state();
        debug_assert!(state.exclusive, "unlock of a variable that is not exclusively locked");
        state.exclusive = false;
        self.released.notify_all();
    }

    pub fn lock_shared(&self) {
        let mut state = self.lock_state();
        while state.exclusive {
            state = self.released.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.shared += 1;
    }

    pub fn unlock_shared(&self) {
        let mut state = self.lock_state();
        state.shared = state.shared.saturating_sub(1);
        if state.shared == 0 {
            self.released.notify_all();
        }
    }

    pub fn is_locked(&self) -> bool {
        let state = self.lock_state();
        state.exclusive || state.shared > 0
    }

    pub fn mode(&self) -> VarMode {
        if self.copy_on_read.load(Ordering::Acquire) {
            VarMode::CopyOnRead
        } else {
            VarMode::CopyOnWrite
        }
    }

    /// Switches to copy-on-read. There is no way back.
    pub fn enable_copy_on_read(&self) {
        if !self.copy_on_read.swap(true, Ordering::AcqRel) {
            tracing::debug!(var = self.key, "variable switched to copy-on-read");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Current value as seen by a reader holding the lock.
    pub fn read_value(&self) -> StatusResult<Option<DeviceTensor>> {
        let current = self
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match (current, self.mode()) {
            (Some(value), VarMode::CopyOnRead) => Ok(Some(value.deep_copy()?)),
            (current, _) => Ok(current),
        }
    }

    /// Installs a new value. The caller must hold the exclusive lock.
    pub(crate) fn set_value(&self, value: DeviceTensor) -> StatusResult<()> {
        if value.dtype() != self.dtype {
            return Err(Status::invalid_argument(format!(
                "Trying to assign variable with wrong dtype. Expected {} got {}",
                self.dtype,
                value.dtype()
            )));
        }
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        Ok(())
    }
}

/// Names a variable in a context's resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub device: String,
    pub container: String,
    pub name: String,
    pub dtype: DType,
    pub shape: PartialShape,
}

impl ResourceHandle {
    fn key(&self) -> (String, String, String) {
        (self.device.clone(), self.container.clone(), self.name.clone())
    }
}

/// Variables keyed by device, container and name.
#[derive(Debug, Default)]
pub struct ResourceMgr {
    vars: Mutex<HashMap<(String, String, String), Arc<Var>>>,
}

impl ResourceMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, handle: &ResourceHandle) -> StatusResult<Arc<Var>> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.key())
            .cloned()
            .ok_or_else(|| {
                Status::not_found(format!(
                    "Resource {}/{} does not exist.",
                    handle.container, handle.name
                ))
            })
    }

    pub fn lookup_or_create(&self, handle: &ResourceHandle) -> StatusResult<Arc<Var>> {
        let mut vars = self.vars.lock().unwrap_or_else(PoisonError::into_inner);
        let var = vars.entry(handle.key()).or_insert_with(|| Var::new(handle.dtype));
        if var.dtype() != handle.dtype {
            return Err(Status::invalid_argument(format!(
                "Trying to access resource {} of type {} as type {}",
                handle.name,
                var.dtype(),
                handle.dtype
            )));
        }
        Ok(Arc::clone(var))
    }

    pub fn delete(&self, handle: &ResourceHandle) -> StatusResult<()> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.key())
            .map(|_| ())
            .ok_or_else(|| {
                Status::not_found(format!(
                    "Resource {}/{} does not exist.",
                    handle.container, handle.name
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.vars.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
