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

//! The dutctl "run" subsystem: the per-run `Session` I/O contract modules
//! see, the `Broker` that owns it on the agent side, the worker pair that
//! drains it onto a `Stream`, the file-transfer state machine, and the
//! client-side mirror of all of the above.

pub mod broker;
pub mod chan_io;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod fsm;
pub mod module;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transfer;
pub mod transport;
pub mod worker;

pub use broker::Broker;
pub use context::RunContext;
pub use session::Session;
