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

//! The plug-in unit a command's pipeline is built from. Real module business
//! logic is a concern for each plug-in author; this is just the seam the
//! core's Broker/Session hand off to.

use crate::{context::RunContext, session::Session};

/// One step of a command's pipeline. A Command binds an ordered
/// `Vec<Arc<dyn Module>>`; each runs in turn against the same `Session`
/// until one fails or all succeed.
pub trait Module: Send + Sync {
    /// Human-readable name used in initialization-error maps and logs.
    fn name(&self) -> &str;

    /// Runs this module's step of the command. `args` are the runtime
    /// arguments with this module's `${name}` templates already expanded.
    fn run(&self, ctx: &RunContext, session: &Session, args: &[String]) -> anyhow::Result<()>;
}

/// A module used only by tests: prints a fixed line and returns.
pub struct PrintModule {
    pub name: String,
    pub text: String,
}

impl Module for PrintModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _ctx: &RunContext, session: &Session, _args: &[String]) -> anyhow::Result<()> {
        session.print(self.text.clone())
    }
}

/// A config-driven builtin: prints its (already-expanded) args joined by a
/// space. `dutctld`'s demo registry uses this for commands that just need
/// to talk back to the client.
pub struct EchoModule {
    pub name: String,
}

impl Module for EchoModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _ctx: &RunContext, session: &Session, args: &[String]) -> anyhow::Result<()> {
        session.print(format!("{}\n", args.join(" ")))
    }
}

/// A config-driven builtin exercising the upload half of the file-transfer
/// core: requests the file named by its first arg from the client and
/// reports how many bytes arrived.
pub struct UploadModule {
    pub name: String,
}

impl Module for UploadModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _ctx: &RunContext, session: &Session, args: &[String]) -> anyhow::Result<()> {
        use std::io::Read as _;
        let file_name = args.first().cloned().unwrap_or_default();
        let mut reader = session.request_file(&file_name)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        session.print(format!("received {} bytes for {file_name}\n", buf.len()))
    }
}

/// A config-driven builtin exercising the download half of the
/// file-transfer core: sends a small synthetic payload to the client under
/// the name given by its first arg. Stands in for a module that would
/// otherwise stream a real on-disk artifact.
pub struct DownloadModule {
    pub name: String,
}

impl Module for DownloadModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _ctx: &RunContext, session: &Session, args: &[String]) -> anyhow::Result<()> {
        let file_name = args.first().cloned().unwrap_or_default();
        let content = format!("synthetic artifact for {file_name}\n").into_bytes();
        session.send_file(
            &file_name,
            content.len() as u64,
            Box::new(std::io::Cursor::new(content)),
            None,
        )?;
        session.wait_for_transfers();
        Ok(())
    }
}

/// Resolves a config-declared module `kind` into a runnable instance.
/// `dutctld`'s registry loader is the only caller; returns `None` for an
/// unrecognized kind so the caller can report an `InitError`.
pub fn build_builtin(kind: &str, name: String) -> Option<std::sync::Arc<dyn Module>> {
    match kind {
        "echo" => Some(std::sync::Arc::new(EchoModule { name })),
        "upload" => Some(std::sync::Arc::new(UploadModule { name })),
        "download" => Some(std::sync::Arc::new(DownloadModule { name })),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn print_module_enqueues_its_text() {
        let session = Session::new();
        let ctx = RunContext::new();
        let module = PrintModule { name: "greet".into(), text: "hello\n".into() };

        let printer = std::thread::spawn({
            let rx = session.print_rx();
            move || rx.recv().unwrap()
        });

        module.run(&ctx, &session, &[]).unwrap();
        assert_eq!(printer.join().unwrap(), "hello\n");
    }
}
