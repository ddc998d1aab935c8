use crate::status::{Status, StatusResult};
use crate::xla::hlo::{ComputationLayout, HloModule};
use crate::xla::shape::Shape;

use super::HloModulePass;

/// Gives every array shape in the module a physical layout and fixes the entry layout.
///
/// Only descending (row-major) layouts are supported. Requested argument layouts must be
/// compatible with the entry parameters.
#[derive(Debug, Default)]
pub struct LayoutAssignment {
    argument_layouts: Option<Vec<Shape>>,
}

impl LayoutAssignment {
    pub fn new(argument_layouts: Option<Vec<Shape>>) -> Self {
        LayoutAssignment { argument_layouts }
    }
}

fn check_supported(shape: &Shape) -> StatusResult<()> {
    for (_, leaf) in shape.leaves() {
        if let Some(layout) = leaf.layout() {
            if !layout.is_descending() || layout.minor_to_major.len() != leaf.rank() {
                return Err(Status::invalid_argument(format!(
                    "layout of {leaf} is not supported; only descending layouts are"
                )));
            }
        }
    }
    Ok(())
}

impl HloModulePass for LayoutAssignment {
    fn name(&self) -> &'static str {
        "layout-assignment"
    }

    fn run(&self, module: &mut HloModule) -> StatusResult<bool> {
        let mut changed = false;
        for computation in module.computations_mut() {
            for inst in computation.instructions.iter_mut() {
                check_supported(&inst.shape)?;
                changed |= inst.shape.set_default_layout();
            }
        }

        let entry = module.entry_computation()?;
        let params = entry.parameter_instructions();
        let parameter_shapes = match &self.argument_layouts {
            Some(requested) => {
                if requested.len() != params.len() {
                    return Err(Status::invalid_argument(format!(
                        "entry computation has {} parameters, {} argument layouts given",
                        params.len(),
                        requested.len()
                    )));
                }
                requested
                    .iter()
                    .zip(&params)
                    .enumerate()
                    .map(|(i, (arg, param))| {
                        if !arg.compatible(&param.shape) {
                            return Err(Status::invalid_argument(format!(
                                "argument {i} shape {arg} is incompatible with parameter {}",
                                param.shape
                            )));
                        }
                        check_supported(arg)?;
                        let mut shape = arg.clone();
                        shape.set_default_layout();
                        Ok(shape)
                    })
                    .collect::<StatusResult<Vec<_>>>()?
            }
            None => params.iter().map(|param| param.shape.clone()).collect(),
        };
        let layout = ComputationLayout {
            parameter_shapes,
            result_shape: entry.root_instruction()?.shape.clone(),
        };
        if module.config.entry_computation_layout.as_ref() != Some(&layout) {
            module.config.entry_computation_layout = Some(layout);
            changed = true;
        }
        Ok(changed)
    }
}
