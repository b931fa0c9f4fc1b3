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

//! Parses `dutctld`'s on-disk TOML device registry into a `registry::Registry`.
//! Real module plug-ins are out of scope for this crate; `module::build_builtin`
//! resolves each declared module's `kind` against a small set of builtins
//! that exercise the print and file-transfer core end to end.

use std::path::Path;

use serde::Deserialize;

use crate::{
    error::InitError,
    module,
    registry::{ArgDecl, Command, Device, ModuleBinding, Registry},
};

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default, rename = "device")]
    devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
struct DeviceConfig {
    name: String,
    #[serde(default, rename = "command")]
    commands: Vec<CommandConfig>,
}

#[derive(Debug, Deserialize)]
struct CommandConfig {
    name: String,
    #[serde(default, rename = "arg")]
    args: Vec<ArgConfig>,
    #[serde(default, rename = "module")]
    modules: Vec<ModuleConfig>,
}

#[derive(Debug, Deserialize)]
struct ArgConfig {
    name: String,
    #[serde(default)]
    desc: String,
}

#[derive(Debug, Deserialize)]
struct ModuleConfig {
    /// Which builtin to instantiate: "echo", "upload", or "download".
    kind: String,
    /// This step's own name, distinct from `kind` so a command can use the
    /// same builtin kind twice (e.g. two `echo` steps logging different
    /// things).
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "arg")]
    config_args: Vec<String>,
}

/// Loads and validates a registry from a TOML file on disk.
pub fn load_file(path: &Path) -> anyhow::Result<Registry> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    load_str(&text)
}

/// Loads and validates a registry from TOML text, for tests and for callers
/// that already have the file contents in hand.
pub fn load_str(text: &str) -> anyhow::Result<Registry> {
    let parsed: ConfigFile = toml::from_str(text)?;

    let mut unknown_modules = std::collections::HashMap::new();
    let mut devices = Vec::with_capacity(parsed.devices.len());

    for device in parsed.devices {
        let mut commands = Vec::with_capacity(device.commands.len());
        for command in device.commands {
            let args = command
                .args
                .into_iter()
                .map(|a| ArgDecl { name: a.name, desc: a.desc })
                .collect();

            let mut modules = Vec::with_capacity(command.modules.len());
            for (i, m) in command.modules.into_iter().enumerate() {
                let step_name = m.name.unwrap_or_else(|| format!("{}-{i}", m.kind));
                match module::build_builtin(&m.kind, step_name.clone()) {
                    Some(module) => modules.push(ModuleBinding { module, config_args: m.config_args }),
                    None => {
                        unknown_modules.insert(
                            format!("{}.{}.{step_name}", device.name, command.name),
                            anyhow::anyhow!("unknown module kind {:?}", m.kind),
                        );
                    }
                }
            }

            commands.push(Command { name: command.name, args, modules });
        }
        devices.push(Device { name: device.name, commands });
    }

    if !unknown_modules.is_empty() {
        return Err(InitError(unknown_modules).into());
    }

    Ok(Registry::build(devices)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loads_a_device_with_an_echo_command() {
        let toml = r#"
            [[device]]
            name = "rpi"

            [[device.command]]
            name = "greet"

            [[device.command.arg]]
            name = "who"

            [[device.command.module]]
            kind = "echo"
            arg = ["hello ${who}"]
        "#;

        let registry = load_str(toml).unwrap();
        let command = registry.command("rpi", "greet").unwrap();
        assert_eq!(command.modules.len(), 1);
        assert_eq!(command.modules[0].config_args, vec!["hello ${who}".to_string()]);
    }

    #[test]
    fn unknown_module_kind_fails_to_load() {
        let toml = r#"
            [[device]]
            name = "rpi"

            [[device.command]]
            name = "greet"

            [[device.command.module]]
            kind = "nonexistent"
        "#;

        assert!(load_str(toml).is_err());
    }
}
