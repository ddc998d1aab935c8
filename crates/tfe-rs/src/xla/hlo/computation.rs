use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::instruction::{HloInstruction, InstructionId};
use crate::status::{ret_check, Status, StatusResult};

/// A sequence of instructions with a distinguished root.
///
/// Instructions are stored in definition order: every operand precedes its users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HloComputation {
    pub(crate) name: String,
    pub(crate) instructions: Vec<HloInstruction>,
    pub(crate) root: InstructionId,
}

impl HloComputation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[HloInstruction] {
        &self.instructions
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn root_id(&self) -> InstructionId {
        self.root
    }

    pub fn instruction(&self, id: InstructionId) -> Option<&HloInstruction> {
        self.instructions.iter().find(|inst| inst.id == id)
    }

    pub fn instruction_mut(&mut self, id: InstructionId) -> Option<&mut HloInstruction> {
        self.instructions.iter_mut().find(|inst| inst.id == id)
    }

    pub fn root_instruction(&self) -> StatusResult<&HloInstruction> {
        self.instruction(self.root).ok_or_else(|| {
            Status::internal(format!("computation {} has no root instruction", self.name))
        })
    }

    /// Parameters ordered by parameter number.
    pub fn parameter_instructions(&self) -> Vec<&HloInstruction> {
        let mut params: Vec<&HloInstruction> =
            self.instructions.iter().filter(|inst| inst.is_parameter()).collect();
        params.sort_by_key(|inst| inst.parameter_number());
        params
    }

    pub fn num_parameters(&self) -> usize {
        self.instructions.iter().filter(|inst| inst.is_parameter()).count()
    }

    pub fn user_counts(&self) -> HashMap<InstructionId, usize> {
        let mut counts: HashMap<InstructionId, usize> = HashMap::new();
        for inst in &self.instructions {
            let unique: HashSet<InstructionId> = inst.operands.iter().copied().collect();
            for operand in unique {
                *counts.entry(operand).or_default() += 1;
            }
        }
        counts
    }

    pub fn users(&self, id: InstructionId) -> Vec<InstructionId> {
        self.instructions
            .iter()
            .filter(|inst| inst.operands.contains(&id))
            .map(|inst| inst.id)
            .collect()
    }

    /// Names of computations invoked by instructions of this computation.
    pub fn called_computations(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.instructions
            .iter()
            .filter_map(|inst| inst.opcode.called_computation())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Removes an instruction that is neither the root nor used by another instruction.
    pub fn remove_instruction(&mut self, id: InstructionId) -> StatusResult<HloInstruction> {
        ret_check!(id != self.root, "cannot remove root instruction of computation {}", self.name);
        ret_check!(
            self.users(id).is_empty(),
            "cannot remove instruction {id} of computation {}: it still has users",
            self.name
        );
        let pos = self
            .instructions
            .iter()
            .position(|inst| inst.id == id)
            .ok_or_else(|| Status::internal(format!("no instruction {id} in {}", self.name)))?;
        Ok(self.instructions.remove(pos))
    }

    pub(crate) fn next_instruction_id(&self) -> InstructionId {
        InstructionId(
            self.instructions
                .iter()
                .map(|inst| inst.id.0 + 1)
                .max()
                .unwrap_or(0),
        )
    }

    /// Checks definition order, operand references and parameter numbering.
    pub fn verify(&self) -> StatusResult<()> {
        let mut defined = HashSet::new();
        for inst in &self.instructions {
            for operand in &inst.operands {
                ret_check!(
                    defined.contains(operand),
                    "instruction {} in {} uses {} before its definition",
                    inst.name,
                    self.name,
                    operand
                );
            }
            ret_check!(defined.insert(inst.id), "duplicate instruction id {} in {}", inst.id, self.name);
        }
        ret_check!(defined.contains(&self.root), "root of {} is not defined", self.name);
        for (expected, param) in self.parameter_instructions().iter().enumerate() {
            ret_check!(
                param.parameter_number() == Some(expected),
                "parameters of {} are not numbered densely from zero",
                self.name
            );
        }
        Ok(())
    }

    pub fn to_text(&self, is_entry: bool) -> String {
        let names: HashMap<InstructionId, &str> = self
            .instructions
            .iter()
            .map(|inst| (inst.id, inst.name.as_str()))
            .collect();
        let mut out = String::new();
        if is_entry {
            out.push_str("ENTRY ");
        }
        out.push_str(&self.name);
        out.push_str(" {\n");
        for inst in &self.instructions {
            let operand_names: Vec<&str> = inst
                .operands
                .iter()
                .map(|id| names.get(id).copied().unwrap_or("?"))
                .collect();
            out.push_str("  ");
            if inst.id == self.root {
                out.push_str("ROOT ");
            }
            out.push_str(&inst.to_text(&operand_names));
            out.push('\n');
        }
        out.push_str("}\n");
        out
    }
}
