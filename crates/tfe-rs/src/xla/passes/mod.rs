//! Module-level HLO passes and the pipeline that sequences them.

mod dce;
mod flatten_call_graph;
mod layout_assignment;

use std::sync::Arc;

pub use dce::HloDce;
pub use flatten_call_graph::FlattenCallGraph;
pub use layout_assignment::LayoutAssignment;

use crate::status::StatusResult;
use crate::xla::hlo::HloModule;

pub trait HloModulePass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the pass, returning whether the module changed.
    fn run(&self, module: &mut HloModule) -> StatusResult<bool>;
}

pub enum Step {
    Pass(Arc<dyn HloModulePass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

/// Ordered pass sequence with optional bounded fixed-point groups.
pub struct HloPassPipeline {
    name: String,
    steps: Vec<Step>,
    log_stats: bool,
}

impl HloPassPipeline {
    pub fn new(name: impl Into<String>) -> Self {
        HloPassPipeline {
            name: name.into(),
            steps: Vec::new(),
            log_stats: crate::env::pass_stats_enabled(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_pass(&mut self, pass: impl HloModulePass + 'static) -> &mut Self {
        self.steps.push(Step::Pass(Arc::new(pass)));
        self
    }

    /// Repeats the passes added by `build` until none reports a change, at most `max_iters` times.
    pub fn add_fixed_point<F>(&mut self, max_iters: usize, build: F) -> &mut Self
    where
        F: FnOnce(&mut HloPassPipeline),
    {
        let mut inner = HloPassPipeline::new(format!("{}/fixed-point", self.name));
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
        self
    }

    pub fn run(&self, module: &mut HloModule) -> StatusResult<bool> {
        run_steps(&self.name, &self.steps, module, self.log_stats)
    }
}

fn run_steps(
    pipeline: &str,
    steps: &[Step],
    module: &mut HloModule,
    log_stats: bool,
) -> StatusResult<bool> {
    let mut changed = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let pass_changed = pass.run(module)?;
                if log_stats {
                    tracing::debug!(
                        pipeline,
                        pass = pass.name(),
                        changed = pass_changed,
                        module = module.name(),
                        "hlo pass finished"
                    );
                }
                if pass_changed {
                    tracing::trace!(pass = pass.name(), "module after pass:\n{}", module.to_text());
                }
                changed |= pass_changed;
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iteration = 0;
                loop {
                    let iteration_changed = run_steps(pipeline, steps, module, log_stats)?;
                    changed |= iteration_changed;
                    iteration += 1;
                    if !iteration_changed || iteration >= *max_iters {
                        break;
                    }
                }
            }
        }
    }
    module.verify()?;
    Ok(changed)
}
