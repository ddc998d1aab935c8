use std::collections::HashMap;

use crate::status::StatusResult;
use crate::xla::hlo::{HloModule, HloOpcode, InstructionId};

use super::HloModulePass;

/// Gives every call site its own callee, cloning computations called from more than one place.
#[derive(Debug, Default)]
pub struct FlattenCallGraph;

impl HloModulePass for FlattenCallGraph {
    fn name(&self) -> &'static str {
        "flatten-call-graph"
    }

    fn run(&self, module: &mut HloModule) -> StatusResult<bool> {
        let mut changed = false;
        let mut clone_counter: HashMap<String, usize> = HashMap::new();

        // Callers are visited before callees so clones of a caller get their own callees.
        let mut order = module.make_computation_post_order();
        order.reverse();
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut queue: std::collections::VecDeque<String> = order.into();

        while let Some(caller) = queue.pop_front() {
            let Some(computation) = module.computation(&caller) else {
                continue;
            };
            let sites: Vec<(InstructionId, String)> = computation
                .instructions()
                .iter()
                .filter_map(|inst| {
                    inst.opcode
                        .called_computation()
                        .map(|callee| (inst.id, callee.to_string()))
                })
                .collect();

            for (site, callee) in sites {
                let count = seen.entry(callee.clone()).or_default();
                *count += 1;
                if *count == 1 {
                    continue;
                }
                let Some(original) = module.computation(&callee) else {
                    continue;
                };
                let mut clone = original.clone();
                let n = clone_counter.entry(callee.clone()).or_default();
                loop {
                    *n += 1;
                    let candidate = format!("{callee}.clone{n}");
                    if module.computation(&candidate).is_none() {
                        clone.name = candidate;
                        break;
                    }
                }
                let clone_name = clone.name.clone();
                module.add_computation(clone)?;
                if let Some(inst) = module
                    .computation_mut(&caller)
                    .and_then(|c| c.instruction_mut(site))
                {
                    inst.opcode = HloOpcode::Call {
                        computation: clone_name.clone(),
                    };
                }
                seen.insert(clone_name.clone(), 1);
                // The clone's own call sites are new and must be flattened too.
                queue.push_back(clone_name);
                changed = true;
            }
        }
        Ok(changed)
    }
}
