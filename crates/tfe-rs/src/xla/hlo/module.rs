use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::computation::HloComputation;
use super::instruction::HloInstruction;
use crate::hashing;
use crate::status::{Status, StatusResult};
use crate::xla::shape::Shape;

/// Physical shapes of the entry computation's parameters and result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationLayout {
    pub parameter_shapes: Vec<Shape>,
    pub result_shape: Shape,
}

impl ComputationLayout {
    pub fn to_text(&self) -> String {
        let params: Vec<String> = self.parameter_shapes.iter().map(Shape::to_string).collect();
        format!("({})->{}", params.join(", "), self.result_shape)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HloModuleConfig {
    pub entry_computation_layout: Option<ComputationLayout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HloModule {
    name: String,
    entry: String,
    computations: Vec<HloComputation>,
    pub config: HloModuleConfig,
}

impl HloModule {
    pub fn new(name: impl Into<String>, entry: HloComputation) -> Self {
        HloModule {
            name: name.into(),
            entry: entry.name.clone(),
            computations: vec![entry],
            config: HloModuleConfig::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_computation_name(&self) -> &str {
        &self.entry
    }

    pub fn computations(&self) -> &[HloComputation] {
        &self.computations
    }

    pub fn computations_mut(&mut self) -> &mut [HloComputation] {
        &mut self.computations
    }

    /// Adds a computation; names are unique within a module.
    pub fn add_computation(&mut self, computation: HloComputation) -> StatusResult<()> {
        if self.computation(&computation.name).is_some() {
            return Err(Status::invalid_argument(format!(
                "module {} already has a computation named {}",
                self.name, computation.name
            )));
        }
        self.computations.push(computation);
        Ok(())
    }

    pub fn computation(&self, name: &str) -> Option<&HloComputation> {
        self.computations.iter().find(|c| c.name == name)
    }

    pub fn computation_mut(&mut self, name: &str) -> Option<&mut HloComputation> {
        self.computations.iter_mut().find(|c| c.name == name)
    }

    pub fn entry_computation(&self) -> StatusResult<&HloComputation> {
        self.computation(&self.entry).ok_or_else(|| {
            Status::internal(format!("module {} lost its entry computation", self.name))
        })
    }

    pub fn entry_computation_mut(&mut self) -> StatusResult<&mut HloComputation> {
        let entry = self.entry.clone();
        let name = self.name.clone();
        self.computation_mut(&entry)
            .ok_or_else(|| Status::internal(format!("module {name} lost its entry computation")))
    }

    /// Names of all computations, each listed after every computation it calls.
    pub fn make_computation_post_order(&self) -> Vec<String> {
        fn visit<'a>(
            module: &'a HloModule,
            name: &'a str,
            visited: &mut HashSet<&'a str>,
            order: &mut Vec<String>,
        ) {
            if !visited.insert(name) {
                return;
            }
            if let Some(computation) = module.computation(name) {
                for callee in computation.called_computations() {
                    visit(module, callee, visited, order);
                }
                order.push(name.to_string());
            }
        }
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.computations.len());
        for computation in &self.computations {
            visit(self, &computation.name, &mut visited, &mut order);
        }
        order
    }

    pub fn reachable_computations(&self) -> HashSet<String> {
        let mut reachable = HashSet::new();
        let mut worklist = vec![self.entry.clone()];
        while let Some(name) = worklist.pop() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            if let Some(computation) = self.computation(&name) {
                worklist.extend(computation.called_computations().into_iter().map(str::to_string));
            }
        }
        reachable
    }

    /// Drops computations not reachable from the entry. Returns whether anything was removed.
    pub fn remove_unreachable_computations(&mut self) -> bool {
        let reachable = self.reachable_computations();
        let before = self.computations.len();
        self.computations.retain(|c| reachable.contains(&c.name));
        before != self.computations.len()
    }

    /// Whether `instruction` or anything it calls, transitively, has a side effect.
    pub fn has_side_effect(&self, instruction: &HloInstruction) -> bool {
        let mut memo = HashMap::new();
        self.instruction_has_side_effect(instruction, &mut memo)
    }

    fn instruction_has_side_effect(
        &self,
        instruction: &HloInstruction,
        memo: &mut HashMap<String, bool>,
    ) -> bool {
        if instruction.opcode.has_side_effect_no_recurse() {
            return true;
        }
        let Some(callee) = instruction.opcode.called_computation() else {
            return false;
        };
        if let Some(&known) = memo.get(callee) {
            return known;
        }
        // Guards against malformed recursive call graphs.
        memo.insert(callee.to_string(), false);
        let result = self.computation(callee).is_some_and(|computation| {
            computation
                .instructions()
                .iter()
                .any(|inst| self.instruction_has_side_effect(inst, memo))
        });
        memo.insert(callee.to_string(), result);
        result
    }

    pub fn verify(&self) -> StatusResult<()> {
        self.entry_computation()?;
        let mut names = HashSet::new();
        for computation in &self.computations {
            if !names.insert(computation.name.as_str()) {
                return Err(Status::internal(format!(
                    "duplicate computation name {}",
                    computation.name
                )));
            }
            computation.verify()?;
            for callee in computation.called_computations() {
                if self.computation(callee).is_none() {
                    return Err(Status::internal(format!(
                        "computation {} calls unknown computation {callee}",
                        computation.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> StatusResult<u64> {
        hashing::hash_serializable(self)
    }

    pub fn to_text(&self) -> String {
        let mut out = format!("HloModule {}", self.name);
        if let Some(layout) = &self.config.entry_computation_layout {
            out.push_str(&format!(", entry_computation_layout={{{}}}", layout.to_text()));
        }
        out.push_str("\n\n");
        for name in self.make_computation_post_order() {
            if let Some(computation) = self.computation(&name) {
                out.push_str(&computation.to_text(name == self.entry));
                out.push('\n');
            }
        }
        out
    }

    pub fn to_json_string(&self) -> StatusResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> StatusResult<Self> {
        let module: HloModule = serde_json::from_str(json)?;
        module.verify()?;
        Ok(module)
    }

    pub fn to_bincode_bytes(&self) -> StatusResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bincode_bytes(bytes: &[u8]) -> StatusResult<Self> {
        let module: HloModule = bincode::deserialize(bytes)?;
        module.verify()?;
        Ok(module)
    }
}
