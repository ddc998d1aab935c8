//! Scoped variable locking for compiled kernels.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::jit::variable::Var;
use crate::jit::xla_tensor::DeviceTensor;
use crate::status::{Status, StatusResult};

/// One resource input of a kernel invocation and whether this invocation holds its lock.
///
/// Dropping a `VariableInfo` releases the lock if it is held and drops the reference to the
/// variable, whichever way the invocation exits.
#[derive(Debug)]
pub struct VariableInfo {
    index: usize,
    var: Option<Arc<Var>>,
    lock_held: bool,
}

impl VariableInfo {
    pub fn new(index: usize, var: Option<Arc<Var>>) -> Self {
        VariableInfo {
            index,
            var,
            lock_held: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn var(&self) -> Option<&Arc<Var>> {
        self.var.as_ref()
    }

    pub fn lock_held(&self) -> bool {
        self.lock_held
    }

    /// Replaces the variable's value. Only valid while this info holds the lock.
    pub fn write(&self, value: DeviceTensor) -> StatusResult<()> {
        let var = self
            .var
            .as_ref()
            .ok_or_else(|| Status::internal(format!("no variable at input {}", self.index)))?;
        if !self.lock_held {
            return Err(Status::internal(format!(
                "write to variable at input {} without holding its lock",
                self.index
            )));
        }
        var.set_value(value)
    }

    fn release(&mut self) {
        if self.lock_held {
            if let Some(var) = &self.var {
                var.unlock_exclusive();
            }
            self.lock_held = false;
        }
    }
}

impl Drop for VariableInfo {
    fn drop(&mut self) {
        self.release();
    }
}

/// Locks every variable in `variables` in ascending lock-key order. Entries without a
/// variable sort last and are skipped.
///
/// If the same variable appears twice nothing stays locked and an error is returned.
pub fn lock_variables(variables: &mut [VariableInfo]) -> StatusResult<()> {
    let mut order: Vec<usize> = (0..variables.len()).collect();
    order.sort_by_key(|&i| {
        variables[i]
            .var
            .as_ref()
            .map_or((true, 0), |var| (false, var.lock_key()))
    });

    let mut acquired: Vec<usize> = Vec::with_capacity(order.len());
    let mut previous: Option<u64> = None;
    for i in order {
        let Some(var) = variables[i].var.clone() else {
            break;
        };
        if previous == Some(var.lock_key()) {
            for &held in &acquired {
                variables[held].release();
            }
            return Err(Status::internal("Duplicate variable passed to XLA cluster"));
        }
        var.lock_exclusive();
        variables[i].lock_held = true;
        acquired.push(i);
        previous = Some(var.lock_key());
    }
    Ok(())
}

/// A possibly uninitialized variable value captured under lock.
#[derive(Debug, Clone, Default)]
pub struct OptionalTensor {
    pub value: Option<DeviceTensor>,
}

impl OptionalTensor {
    pub fn present(&self) -> bool {
        self.value.is_some()
    }
}

/// Locks the given variables, captures their current values and releases the locks.
pub fn snapshot_resource_variables(
    variables: &[(usize, Arc<Var>)],
) -> StatusResult<BTreeMap<usize, OptionalTensor>> {
    let mut infos: Vec<VariableInfo> = variables
        .iter()
        .map(|(index, var)| VariableInfo::new(*index, Some(Arc::clone(var))))
        .collect();
    lock_variables(&mut infos)?;
    let mut snapshot = BTreeMap::new();
    for info in &infos {
        let value = match info.var() {
            Some(var) => var.read_value()?,
            None => None,
        };
        snapshot.insert(info.index(), OptionalTensor { value });
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn empty_entries_are_skipped() {
        let var = Var::new(DType::F32);
        let mut infos = vec![
            VariableInfo::new(0, None),
            VariableInfo::new(1, Some(Arc::clone(&var))),
            VariableInfo::new(2, None),
        ];
        lock_variables(&mut infos).unwrap();
        assert!(!infos[0].lock_held());
        assert!(infos[1].lock_held());
        assert!(var.is_locked());
        drop(infos);
        assert!(!var.is_locked());
    }

    #[test]
    fn duplicate_after_other_locks_releases_everything() {
        let first = Var::new(DType::F32);
        let second = Var::new(DType::F32);
        let mut infos = vec![
            VariableInfo::new(0, Some(Arc::clone(&second))),
            VariableInfo::new(1, Some(Arc::clone(&first))),
            VariableInfo::new(2, Some(Arc::clone(&second))),
        ];
        let err = lock_variables(&mut infos).unwrap_err();
        assert_eq!(err.message(), "Duplicate variable passed to XLA cluster");
        assert!(infos.iter().all(|info| !info.lock_held()));
        assert!(!first.is_locked());
        assert!(!second.is_locked());
    }
}
