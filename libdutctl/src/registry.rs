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

//! The device/command registry and `${name}` template expansion. Config-file
//! parsing that would populate a `Registry` in a real deployment lives in
//! `config.rs`; this module is the validated, in-memory result of that
//! process.

use std::{collections::HashMap, sync::Arc};

use crate::{
    error::{InitError, RunError},
    module::Module,
};

/// A named positional argument a command declares. Names match
/// `[A-Za-z0-9_-]+`.
#[derive(Debug, Clone)]
pub struct ArgDecl {
    pub name: String,
    pub desc: String,
}

/// One module's position in a command's pipeline, plus its config-arg
/// templates (each may contain `${name}` references into the owning
/// command's declared args).
pub struct ModuleBinding {
    pub module: Arc<dyn Module>,
    pub config_args: Vec<String>,
}

pub struct Command {
    pub name: String,
    pub args: Vec<ArgDecl>,
    pub modules: Vec<ModuleBinding>,
}

pub struct Device {
    pub name: String,
    pub commands: Vec<Command>,
}

/// A validated set of devices, ready to have commands looked up and run.
/// Construction fails closed: any module whose config templates reference
/// an undeclared arg aborts the whole build.
pub struct Registry {
    devices: HashMap<String, Device>,
}

fn is_valid_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Extracts every `${name}` reference appearing in `template`.
fn template_refs(template: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        if let Some(end) = after.find('}') {
            refs.push(&after[..end]);
            rest = &after[end + 1..];
        } else {
            break;
        }
    }
    refs
}

impl Registry {
    /// Builds a registry from a flat list of devices, validating every
    /// module's config-arg templates against its owning command's declared
    /// args. A single bad reference fails the whole build: every `${name}`
    /// reference must resolve to a declared arg, validated once here at
    /// registry construction.
    pub fn build(devices: Vec<Device>) -> Result<Registry, InitError> {
        let mut errors = HashMap::new();

        for device in &devices {
            for command in &device.commands {
                let declared: std::collections::HashSet<&str> =
                    command.args.iter().map(|a| a.name.as_str()).collect();
                for arg in &command.args {
                    if !is_valid_name(&arg.name) {
                        errors.insert(
                            format!("{}.{}.<args>", device.name, command.name),
                            anyhow::anyhow!("invalid arg name {:?}", arg.name),
                        );
                    }
                }
                for binding in &command.modules {
                    for template in &binding.config_args {
                        for reference in template_refs(template) {
                            if !declared.contains(reference) {
                                errors.insert(
                                    format!(
                                        "{}.{}.{}",
                                        device.name,
                                        command.name,
                                        binding.module.name()
                                    ),
                                    anyhow::anyhow!(
                                        "template reference ${{{reference}}} does not resolve to a declared arg"
                                    ),
                                );
                            }
                        }
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(InitError(errors));
        }

        Ok(Registry { devices: devices.into_iter().map(|d| (d.name.clone(), d)).collect() })
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    pub fn command<'a>(&'a self, device: &str, command: &str) -> Option<&'a Command> {
        self.device(device)?.commands.iter().find(|c| c.name == command)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }
}

/// Expands one module's config-arg templates against this run's arguments.
/// Binding is strictly positional: the k-th runtime value binds to the k-th
/// declared arg, by declaration order. Unknown `${name}` references expand
/// to the empty string. Fails if `runtime` doesn't have exactly one value
/// per declared arg; zipping mismatched lengths would silently drop or
/// starve bindings instead of catching a malformed run request.
pub fn expand_args(
    templates: &[String],
    declared: &[ArgDecl],
    runtime: &[String],
) -> Result<Vec<String>, RunError> {
    validate_arg_count(declared, runtime)?;

    let bindings: HashMap<&str, &str> = declared
        .iter()
        .zip(runtime.iter())
        .map(|(decl, value)| (decl.name.as_str(), value.as_str()))
        .collect();

    Ok(templates.iter().map(|t| expand_one(t, &bindings)).collect())
}

/// Checks that a command invocation supplied exactly as many runtime args
/// as the command declares, independent of which module's templates (if
/// any) end up consuming them.
pub fn validate_arg_count(declared: &[ArgDecl], runtime: &[String]) -> Result<(), RunError> {
    if runtime.len() != declared.len() {
        return Err(RunError::Protocol {
            transfer_id: None,
            message: format!(
                "command declares {} arg(s), got {} at runtime",
                declared.len(),
                runtime.len()
            ),
        });
    }
    Ok(())
}

fn expand_one(template: &str, bindings: &HashMap<&str, &str>) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(bindings.get(name).copied().unwrap_or(""));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::module::PrintModule;

    fn decl(name: &str) -> ArgDecl {
        ArgDecl { name: name.into(), desc: String::new() }
    }

    #[test]
    fn expand_args_binds_positionally_and_blanks_unknown_refs() {
        let declared = vec![decl("image"), decl("target")];
        let runtime = vec!["fw.bin".to_string(), "rpi4".to_string()];
        let templates =
            vec!["flash ${image} to ${target}".to_string(), "unknown ${nope}".to_string()];

        let got = expand_args(&templates, &declared, &runtime).unwrap();
        assert_eq!(got[0], "flash fw.bin to rpi4");
        assert_eq!(got[1], "unknown ");
    }

    #[test]
    fn expand_args_rejects_runtime_count_mismatch() {
        let declared = vec![decl("image"), decl("target")];
        let runtime = vec!["fw.bin".to_string()];
        let templates = vec!["${image}".to_string()];

        let err = expand_args(&templates, &declared, &runtime).unwrap_err();
        assert!(matches!(err, RunError::Protocol { .. }));
    }

    #[test]
    fn registry_build_fails_closed_on_unresolved_template() {
        let module = Arc::new(PrintModule { name: "flasher".into(), text: String::new() });
        let command = Command {
            name: "flash".into(),
            args: vec![decl("image")],
            modules: vec![ModuleBinding {
                module,
                config_args: vec!["${missing}".to_string()],
            }],
        };
        let device = Device { name: "rpi".into(), commands: vec![command] };

        let err = Registry::build(vec![device]).unwrap_err();
        assert_eq!(err.0.len(), 1);
        assert!(err.0.contains_key("rpi.flash.flasher"));
    }

    #[test]
    fn registry_build_succeeds_when_all_templates_resolve() {
        let module = Arc::new(PrintModule { name: "flasher".into(), text: String::new() });
        let command = Command {
            name: "flash".into(),
            args: vec![decl("image")],
            modules: vec![ModuleBinding {
                module,
                config_args: vec!["${image}".to_string()],
            }],
        };
        let device = Device { name: "rpi".into(), commands: vec![command] };

        let registry = Registry::build(vec![device]).unwrap();
        assert!(registry.command("rpi", "flash").is_some());
    }

    #[test]
    fn invalid_arg_name_fails_build() {
        let command =
            Command { name: "flash".into(), args: vec![decl("bad name!")], modules: vec![] };
        let device = Device { name: "rpi".into(), commands: vec![command] };
        assert!(Registry::build(vec![device]).is_err());
    }
}
