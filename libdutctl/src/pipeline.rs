// Copyright 2026 The dutctl Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Drives one command's module chain with the generic FSM helper: one
//! state function runs the next module against the shared `Session`,
//! advancing to the next module on success and terminating on the first
//! module error.

use std::sync::Arc;

use crate::{
    context::RunContext,
    error::RunError,
    fsm::{self, State},
    module::Module,
    registry::{self, Command},
    session::Session,
};

/// One module bound to this run's already-expanded arguments.
pub struct ModuleStep {
    pub module: Arc<dyn Module>,
    pub args: Vec<String>,
}

/// Builds the ordered steps for one command invocation: each module's
/// config-arg templates are expanded against the command's declared args
/// and the caller-supplied runtime values, except a module named `main`
/// (case-insensitive), which is exempt and receives the raw runtime args
/// untouched. Fails if the caller supplied a different number of runtime
/// args than the command declares, before any module runs.
pub fn build_steps(command: &Command, runtime_args: &[String]) -> anyhow::Result<Vec<ModuleStep>> {
    registry::validate_arg_count(&command.args, runtime_args)?;

    command
        .modules
        .iter()
        .map(|binding| {
            let args = if binding.module.name().eq_ignore_ascii_case("main") {
                runtime_args.to_vec()
            } else {
                registry::expand_args(&binding.config_args, &command.args, runtime_args)?
            };
            Ok(ModuleStep { module: binding.module.clone(), args })
        })
        .collect()
}

struct PipelineState {
    remaining: Vec<ModuleStep>,
}

/// Threaded through every FSM step: the one piece of state a module step
/// needs besides its own args.
pub struct PipelineArgs {
    pub session: Arc<Session>,
}

impl State<PipelineArgs> for PipelineState {
    fn step(
        mut self: Box<Self>,
        ctx: &RunContext,
        args: PipelineArgs,
    ) -> anyhow::Result<(PipelineArgs, Option<Box<dyn State<PipelineArgs>>>)> {
        if self.remaining.is_empty() {
            return Ok((args, None));
        }
        let step = self.remaining.remove(0);
        step.module
            .run(ctx, &args.session, &step.args)
            .map_err(|e| RunError::Module(e))?;

        let next: Option<Box<dyn State<PipelineArgs>>> = if self.remaining.is_empty() {
            None
        } else {
            Some(Box::new(PipelineState { remaining: self.remaining }))
        };
        Ok((args, next))
    }
}

/// Runs every step of `steps` in order against `session`, stopping at the
/// first module error. No module runs after termination; no two modules
/// run concurrently.
pub fn run(ctx: &RunContext, session: Arc<Session>, steps: Vec<ModuleStep>) -> anyhow::Result<()> {
    let start = PipelineState { remaining: steps };
    fsm::run(ctx, PipelineArgs { session }, Box::new(start)).map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::module::PrintModule;

    #[test]
    fn runs_every_module_in_order_and_stops_on_first_error() {
        struct Failing;
        impl Module for Failing {
            fn name(&self) -> &str {
                "failing"
            }
            fn run(&self, _ctx: &RunContext, _session: &Session, _args: &[String]) -> anyhow::Result<()> {
                anyhow::bail!("nope")
            }
        }

        let session = Arc::new(Session::new());
        let ctx = RunContext::new();
        let steps = vec![
            ModuleStep {
                module: Arc::new(PrintModule { name: "one".into(), text: "a".into() }),
                args: vec![],
            },
            ModuleStep { module: Arc::new(Failing), args: vec![] },
            ModuleStep {
                module: Arc::new(PrintModule { name: "three".into(), text: "c".into() }),
                args: vec![],
            },
        ];

        let reader = std::thread::spawn({
            let rx = session.print_rx();
            move || rx.recv().unwrap()
        });

        let result = run(&ctx, session, steps);
        assert_eq!(reader.join().unwrap(), "a");
        assert!(result.is_err());
    }

    #[test]
    fn main_module_gets_raw_args_while_others_get_expansion() {
        let command = Command {
            name: "flash".into(),
            args: vec![registry::ArgDecl { name: "image".into(), desc: String::new() }],
            modules: vec![
                registry::ModuleBinding {
                    module: Arc::new(PrintModule { name: "main".into(), text: String::new() }),
                    config_args: vec!["should be ignored".into()],
                },
                registry::ModuleBinding {
                    module: Arc::new(PrintModule { name: "verify".into(), text: String::new() }),
                    config_args: vec!["${image}".into()],
                },
            ],
        };
        let steps = build_steps(&command, &["fw.bin".to_string()]).unwrap();
        assert_eq!(steps[0].args, vec!["fw.bin".to_string()]);
        assert_eq!(steps[1].args, vec!["fw.bin".to_string()]);
    }

    #[test]
    fn build_steps_rejects_wrong_runtime_arg_count() {
        let command = Command {
            name: "flash".into(),
            args: vec![registry::ArgDecl { name: "image".into(), desc: String::new() }],
            modules: vec![registry::ModuleBinding {
                module: Arc::new(PrintModule { name: "main".into(), text: String::new() }),
                config_args: vec![],
            }],
        };
        assert!(build_steps(&command, &[]).is_err());
        assert!(build_steps(&command, &["a".to_string(), "b".to_string()]).is_err());
    }
}
