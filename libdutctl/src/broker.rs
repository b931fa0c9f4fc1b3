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

//! `Broker` owns one `Session` and one worker pair for the lifetime of a
//! single run. It is the agent-side half of the run lifecycle; `client::run`
//! (client.rs) is its mirror on the client side.

use std::{
    sync::{Arc, Mutex},
    thread,
};

use tracing::{error, instrument, warn};

use crate::{context::RunContext, session::Session, stream::AgentStream, worker};

struct Started {
    session: Arc<Session>,
    errors: crossbeam_channel::Receiver<anyhow::Error>,
}

/// Lifecycle owner of a single run's `Session` + worker pair. `start` is
/// idempotent: later calls return the handles from the first call rather
/// than rebinding the stream.
pub struct Broker {
    ctx: RunContext,
    started: Mutex<Option<Started>>,
}

impl Broker {
    pub fn new(ctx: RunContext) -> Self {
        Broker { ctx, started: Mutex::new(None) }
    }

    /// Starts the Session and worker pair against `stream` the first time
    /// it's called; returns the same `(Session, error receiver)` pair on
    /// every subsequent call, ignoring `stream`.
    #[instrument(skip_all)]
    pub fn start(
        &self,
        stream: Arc<dyn AgentStream>,
    ) -> (Arc<Session>, crossbeam_channel::Receiver<anyhow::Error>) {
        let mut guard = self.started.lock().unwrap();
        if let Some(started) = guard.as_ref() {
            return (started.session.clone(), started.errors.clone());
        }

        let session = Arc::new(Session::new());
        // Bounded by worker count: both workers can report an error
        // without blocking on the Broker's client to drain it.
        let (err_tx, err_rx) = crossbeam_channel::bounded(2);

        let to_client = {
            let ctx = self.ctx.clone();
            let session = session.clone();
            let stream = stream.clone();
            let err_tx = err_tx.clone();
            thread::spawn(move || {
                if let Err(e) = worker::to_client_worker(&ctx, &session, stream.as_ref()) {
                    let _ = err_tx.send(e);
                }
                ctx.cancel();
            })
        };

        let from_client = {
            let ctx = self.ctx.clone();
            let session = session.clone();
            let stream = stream.clone();
            let err_tx = err_tx.clone();
            thread::spawn(move || {
                if let Err(e) = worker::from_client_worker(&ctx, &session, &stream) {
                    let _ = err_tx.send(e);
                }
                ctx.cancel();
            })
        };

        // Finalizer: closes the error channel (by dropping the last sender)
        // once both workers have returned, which is the sole completion
        // signal. No nil/placeholder is ever sent.
        thread::spawn(move || {
            if to_client.join().is_err() {
                warn!("to-client worker panicked");
            }
            if from_client.join().is_err() {
                warn!("from-client worker panicked");
            }
            drop(err_tx);
        });

        *guard = Some(Started { session: session.clone(), errors: err_rx.clone() });
        (session, err_rx)
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn shutdown(&self) {
        self.ctx.cancel();
        if let Some(started) = self.started.lock().unwrap().as_ref() {
            started.session.shutdown();
        }
    }
}

/// Drains `errors` to completion, logging everything seen; used by the
/// agent daemon once a run's module pipeline has finished and it's waiting
/// for the stream to tear down cleanly.
pub fn drain_errors(errors: &crossbeam_channel::Receiver<anyhow::Error>) {
    for err in errors.iter() {
        error!(error = %err, "run worker error");
    }
}

#[cfg(test)]
mod test {
    use std::io::Read as _;

    use ntest::timeout;

    use super::*;
    use crate::stream::test_double;

    #[test]
    fn start_is_idempotent_and_returns_same_session() {
        let ctx = RunContext::new();
        let broker = Broker::new(ctx.clone());
        let (agent_stream, _client_stream) = test_double::channel_pair();
        let agent_stream: Arc<dyn AgentStream> = Arc::new(agent_stream);

        let (session1, _errs1) = broker.start(agent_stream.clone());
        let (session2, _errs2) = broker.start(agent_stream);
        assert!(Arc::ptr_eq(&session1, &session2));
        broker.shutdown();
    }

    #[test]
    #[timeout(5000)]
    fn print_round_trips_to_client_stream() {
        let ctx = RunContext::new();
        let broker = Broker::new(ctx.clone());
        let (agent_stream, client_stream) = test_double::channel_pair();
        let (session, errors) = broker.start(Arc::new(agent_stream));

        session.print("hello\n").unwrap();

        let response = client_stream.receive().unwrap().unwrap();
        match response {
            dutctl_protocol::RunResponse::Print { text } => assert_eq!(text, b"hello\n"),
            other => panic!("unexpected response: {other:?}"),
        }

        broker.shutdown();
        drain_errors(&errors);
    }

    #[test]
    #[timeout(5000)]
    fn upload_end_to_end_through_broker() {
        let ctx = RunContext::new();
        let broker = Broker::new(ctx.clone());
        let (agent_stream, client_stream) = test_double::channel_pair();
        let (session, _errors) = broker.start(Arc::new(agent_stream));

        let mut reader = session.request_file("in.bin").unwrap();

        // Client observes the FileTransferRequest, accepts, then streams.
        let req = client_stream.receive().unwrap().unwrap();
        let transfer_id = match req {
            dutctl_protocol::RunResponse::FileTransferRequest(r) => r.transfer_id,
            other => panic!("unexpected response: {other:?}"),
        };
        client_stream
            .send(dutctl_protocol::RunRequest::FileTransferResponse(
                dutctl_protocol::FileTransferResponse {
                    transfer_id,
                    status: dutctl_protocol::TransferStatus::Accepted,
                    next_chunk_expected: None,
                    error_message: None,
                },
            ))
            .unwrap();
        client_stream
            .send(dutctl_protocol::RunRequest::FileChunk(dutctl_protocol::FileChunk {
                transfer_id,
                number: 0,
                offset: 0,
                data: b"hello".to_vec(),
                is_final: true,
            }))
            .unwrap();

        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"hello");

        broker.shutdown();
    }
}
