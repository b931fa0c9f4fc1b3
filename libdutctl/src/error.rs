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

//! The error taxonomy callers need to branch on. Everything else (plain
//! plumbing failures that only ever get logged or printed) stays as
//! `anyhow::Error`.

use std::collections::HashMap;

use dutctl_protocol::TransferId;
use thiserror::Error;

/// One of the kinds enumerated for the "run" subsystem. Transfer-scoped
/// errors are contained to their transfer; run-scoped errors abort the run;
/// `Init` aborts agent startup before any run begins.
#[derive(Debug, Error)]
pub enum RunError {
    /// Malformed or out-of-order protocol messages: unknown direction,
    /// chunk sequence violation, a file message with no prior request, an
    /// unrecognized transfer id.
    #[error("protocol error on transfer {transfer_id:?}: {message}")]
    Protocol { transfer_id: Option<TransferId>, message: String },

    /// A receiver refused a transfer because its local path did not match
    /// any of the command's declared arguments.
    #[error("authorization refused for transfer {transfer_id:?}: {message}")]
    Authorization { transfer_id: TransferId, message: String },

    /// A file-system read/write failure on either end of a transfer.
    #[error("I/O error on transfer {transfer_id:?}: {source}")]
    Io { transfer_id: TransferId, #[source] source: std::io::Error },

    /// `Stream::Send`/`Receive` failed; this always terminates the worker
    /// that hit it.
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// The module chain itself returned an error; kept distinct from
    /// transport/protocol errors so the FSM driver can report it as the
    /// module-execution result.
    #[error("module error: {0}")]
    Module(#[source] anyhow::Error),
}

/// Raised once at agent startup if any module's declared config-arg
/// templates failed to validate, or (separately) if any module's own
/// initialization hook failed. Non-empty map fails startup.
#[derive(Debug, Error)]
#[error("{} module(s) failed to initialize: {}", .0.len(), summarize(.0))]
pub struct InitError(pub HashMap<String, anyhow::Error>);

fn summarize(errors: &HashMap<String, anyhow::Error>) -> String {
    let mut keys: Vec<&String> = errors.keys().collect();
    keys.sort();
    keys.into_iter().map(|k| format!("{k}: {}", errors[k])).collect::<Vec<_>>().join("; ")
}
