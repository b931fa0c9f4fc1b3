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

use std::path::Path;

#[test]
fn example_registry_loads_and_validates() {
    let registry = libdutctl::config::load_file(Path::new("devices.example.toml")).unwrap();

    let greet = registry.command("rpi4", "greet").expect("greet command");
    assert_eq!(greet.modules.len(), 1);

    let flash = registry.command("rpi4", "flash").expect("flash command");
    assert_eq!(flash.args[0].name, "image");

    assert!(registry.command("rpi4", "nonexistent").is_none());
}
