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

//! The minimal surface the run subsystem needs from the underlying RPC
//! channel. Kept as a trait so the worker pair, Broker, and client run loop
//! can all be exercised against an in-memory double instead of a real
//! socket.

use dutctl_protocol::{RunRequest, RunResponse};

/// One side of a bidirectional run stream, as seen from the agent: sends
/// responses, receives requests.
///
/// Implementations must be safe to `send` from one thread while `receive`
/// is called from another, but need not support two concurrent `send`
/// calls (the worker pair never attempts that; see broker.rs).
pub trait AgentStream: Send + Sync {
    fn send(&self, response: RunResponse) -> anyhow::Result<()>;

    /// Blocks until a request arrives. Returns `Ok(None)` on a clean
    /// end-of-stream.
    fn receive(&self) -> anyhow::Result<Option<RunRequest>>;
}

/// The client's view of the same stream: sends requests, receives
/// responses.
pub trait ClientStream: Send + Sync {
    fn send(&self, request: RunRequest) -> anyhow::Result<()>;

    fn receive(&self) -> anyhow::Result<Option<RunResponse>>;
}

/// An in-memory `AgentStream`/`ClientStream` pair for tests, built from two
/// crossbeam channels run in opposite directions.
pub mod test_double {
    use crossbeam_channel::{Receiver, Sender};

    use super::*;

    pub struct ChannelAgentStream {
        tx: Sender<RunResponse>,
        rx: Receiver<RunRequest>,
    }

    pub struct ChannelClientStream {
        tx: Sender<RunRequest>,
        rx: Receiver<RunResponse>,
    }

    /// Builds a connected agent/client stream pair sharing no state but the
    /// two channels wired between them.
    pub fn channel_pair() -> (ChannelAgentStream, ChannelClientStream) {
        let (req_tx, req_rx) = crossbeam_channel::unbounded();
        let (resp_tx, resp_rx) = crossbeam_channel::unbounded();
        (
            ChannelAgentStream { tx: resp_tx, rx: req_rx },
            ChannelClientStream { tx: req_tx, rx: resp_rx },
        )
    }

    impl AgentStream for ChannelAgentStream {
        fn send(&self, response: RunResponse) -> anyhow::Result<()> {
            self.tx.send(response).map_err(|_| anyhow::anyhow!("peer hung up"))
        }

        fn receive(&self) -> anyhow::Result<Option<RunRequest>> {
            match self.rx.recv() {
                Ok(req) => Ok(Some(req)),
                Err(crossbeam_channel::RecvError) => Ok(None),
            }
        }
    }

    impl ClientStream for ChannelClientStream {
        fn send(&self, request: RunRequest) -> anyhow::Result<()> {
            self.tx.send(request).map_err(|_| anyhow::anyhow!("peer hung up"))
        }

        fn receive(&self) -> anyhow::Result<Option<RunResponse>> {
            match self.rx.recv() {
                Ok(resp) => Ok(Some(resp)),
                Err(crossbeam_channel::RecvError) => Ok(None),
            }
        }
    }
}
