use crate::status::StatusResult;
use crate::xla::hlo::{HloModule, InstructionId};

use super::HloModulePass;

/// Removes instructions whose values are never used, then computations nothing calls.
///
/// Roots, parameters and instructions with side effects (directly or through a callee) are
/// always kept. Removing an instruction can make its operands dead; those are removed in the
/// same run.
#[derive(Debug, Default)]
pub struct HloDce;

impl HloDce {
    const NAME: &'static str = "dce";
}

impl HloModulePass for HloDce {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, module: &mut HloModule) -> StatusResult<bool> {
        let mut changed = false;

        for name in module.make_computation_post_order() {
            let Some(computation) = module.computation(&name) else {
                continue;
            };
            let mut user_counts = computation.user_counts();
            let root = computation.root_id();
            let removable = |id: InstructionId, counts: &std::collections::HashMap<InstructionId, usize>| {
                if id == root || counts.get(&id).copied().unwrap_or(0) > 0 {
                    return false;
                }
                let Some(inst) = computation.instruction(id) else {
                    return false;
                };
                !inst.is_parameter() && !module.has_side_effect(inst)
            };

            let mut dead: Vec<InstructionId> = Vec::new();
            let mut worklist: Vec<InstructionId> = computation
                .instructions()
                .iter()
                .rev()
                .map(|inst| inst.id)
                .filter(|&id| removable(id, &user_counts))
                .collect();
            while let Some(id) = worklist.pop() {
                if dead.contains(&id) {
                    continue;
                }
                dead.push(id);
                let Some(inst) = computation.instruction(id) else {
                    continue;
                };
                let mut operands = inst.operands.clone();
                operands.sort_unstable();
                operands.dedup();
                for operand in operands {
                    if let Some(count) = user_counts.get_mut(&operand) {
                        *count = count.saturating_sub(1);
                    }
                    if removable(operand, &user_counts) {
                        worklist.push(operand);
                    }
                }
            }

            if dead.is_empty() {
                continue;
            }
            tracing::trace!(computation = %name, removed = dead.len(), "dce removed instructions");
            if let Some(computation) = module.computation_mut(&name) {
                computation.instructions.retain(|inst| !dead.contains(&inst.id));
            }
            changed = true;
        }

        changed |= module.remove_unreachable_computations();
        Ok(changed)
    }
}
