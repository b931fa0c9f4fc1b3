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

//! The two tasks that drain/drive a `Session` onto an `AgentStream` for the
//! duration of one run: the to-client worker (prints, console output,
//! outbound file chunks) and the from-client worker (stdin, inbound file
//! chunks, transfer acks). Neither holds a reference to the other; they
//! only ever touch the shared `Session` and the `Stream`.

use std::{sync::Arc, thread, time::Duration};

use dutctl_protocol::{
    ConsoleOutput, FileChunk, FileTransferRequest, FileTransferResponse, RunRequest, RunResponse,
    TransferDirection, TransferId, TransferStatus,
};
use tracing::{debug, instrument, trace, warn};

use crate::{context::RunContext, error::RunError, session::Session, stream::AgentStream};

/// How often the to-client worker wakes even with nothing signaled, so
/// pending download chunks keep flowing without a dedicated per-transfer
/// channel.
const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// `stream.send`, with a failure classified as a transport error rather than
/// a bare `anyhow::Error` so calling code can distinguish "the peer went
/// away" from a protocol or module failure.
fn send_response(stream: &dyn AgentStream, response: RunResponse) -> anyhow::Result<()> {
    stream.send(response).map_err(RunError::Transport)?;
    Ok(())
}

/// Drains `session`'s print/stdout/stderr queues onto `stream` and drives
/// every active download's chunking. Returns when the run context is
/// cancelled or a `Stream::send` fails.
#[instrument(skip_all)]
pub fn to_client_worker(
    ctx: &RunContext,
    session: &Arc<Session>,
    stream: &dyn AgentStream,
) -> anyhow::Result<()> {
    let cancel_rx = ctx.cancel_rx();
    let print_rx = session.print_rx();
    let stdout_rx = session.stdout_rx();
    let stderr_rx = session.stderr_rx();
    let activity_rx = session.transfer_activity_rx();

    loop {
        crossbeam_channel::select! {
            recv(cancel_rx) -> _ => return Ok(()),
            recv(print_rx) -> msg => {
                match msg {
                    Ok(text) => send_response(stream, RunResponse::Print { text: text.into_bytes() })?,
                    Err(_) => return Ok(()),
                }
            },
            recv(stdout_rx) -> msg => {
                match msg {
                    Ok(bytes) => send_response(stream, RunResponse::Console(ConsoleOutput::Stdout(bytes)))?,
                    Err(_) => return Ok(()),
                }
            },
            recv(stderr_rx) -> msg => {
                match msg {
                    Ok(bytes) => send_response(stream, RunResponse::Console(ConsoleOutput::Stderr(bytes)))?,
                    Err(_) => return Ok(()),
                }
            },
            recv(activity_rx) -> _ => {},
            default(DOWNLOAD_POLL_INTERVAL) => {},
        }

        drive_uploads_awaiting_request(session, stream)?;
        drive_downloads(session, stream)?;
    }
}

/// Emits the initial `FileTransferRequest` for any upload the module has
/// registered (via `Session::request_file`) that we haven't announced yet.
fn drive_uploads_awaiting_request(session: &Session, stream: &dyn AgentStream) -> anyhow::Result<()> {
    for id in session.active_uploads() {
        if let Some(metadata) = session.take_upload_request(id) {
            send_response(
                stream,
                RunResponse::FileTransferRequest(FileTransferRequest {
                    transfer_id: id,
                    direction: TransferDirection::Upload,
                    metadata,
                }),
            )?;
        }
    }
    Ok(())
}

/// For every active download: announces it if not yet requested, then once
/// accepted, emits chunks until the source is exhausted.
fn drive_downloads(session: &Session, stream: &dyn AgentStream) -> anyhow::Result<()> {
    for id in session.active_downloads() {
        if let Some(metadata) = session.take_download_request(id) {
            send_response(
                stream,
                RunResponse::FileTransferRequest(FileTransferRequest {
                    transfer_id: id,
                    direction: TransferDirection::Download,
                    metadata,
                }),
            )?;
            continue;
        }

        if !session.is_download_accepted(id) || session.is_download_awaiting_ack(id) {
            continue;
        }

        if let Some(chunk) = session.get_next_chunk(id)? {
            trace!(transfer_id = %id, number = chunk.number, is_final = chunk.is_final, "emitting download chunk");
            send_response(
                stream,
                RunResponse::FileChunk(FileChunk {
                    transfer_id: id,
                    number: chunk.number,
                    offset: chunk.offset,
                    data: chunk.data,
                    is_final: chunk.is_final,
                }),
            )?;
            if chunk.is_final {
                session.mark_download_awaiting_ack(id);
            }
        }
    }
    Ok(())
}

/// Reads requests from `stream` and deposits their payloads into `session`,
/// responding to file-transfer messages inline. The blocking `Stream::receive`
/// call runs on a dedicated inner thread so the outer loop can also watch the
/// run context; the inner thread is never explicitly cancelled, it unblocks
/// when the stream closes, which always happens shortly after the run
/// context is cancelled.
#[instrument(skip_all)]
pub fn from_client_worker(
    ctx: &RunContext,
    session: &Arc<Session>,
    stream: &Arc<dyn AgentStream>,
) -> anyhow::Result<()> {
    let (msg_tx, msg_rx) = crossbeam_channel::bounded::<anyhow::Result<Option<RunRequest>>>(1);
    {
        let stream = Arc::clone(stream);
        thread::spawn(move || loop {
            let result = stream.receive().map_err(|e| anyhow::Error::from(RunError::Transport(e)));
            let done = matches!(result, Ok(None) | Err(_));
            if msg_tx.send(result).is_err() || done {
                return;
            }
        });
    }

    let cancel_rx = ctx.cancel_rx();
    loop {
        crossbeam_channel::select! {
            recv(cancel_rx) -> _ => return Ok(()),
            recv(msg_rx) -> msg => {
                match msg {
                    Ok(Ok(Some(request))) => dispatch(ctx, session, stream.as_ref(), request)?,
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Ok(()),
                }
            },
        }
    }
}

fn dispatch(
    ctx: &RunContext,
    session: &Session,
    stream: &dyn AgentStream,
    request: RunRequest,
) -> anyhow::Result<()> {
    match request {
        RunRequest::Command { .. } => {
            warn!("ignoring stray Command request after run start");
            Ok(())
        }
        RunRequest::Console { stdin } => {
            // The Session's stdin channel is a rendezvous (bounded(0)): this
            // blocks until a module is reading stdin. If no module ever
            // calls `console()` for this run, nothing ever claims it, so the
            // send has to race the run context's cancellation instead of
            // blocking forever.
            let tx = session.stdin_tx();
            let cancel_rx = ctx.cancel_rx();
            crossbeam_channel::select! {
                send(tx, stdin) -> res => {
                    res.map_err(|_| anyhow::anyhow!("session stdin queue closed"))
                }
                recv(cancel_rx) -> _ => Ok(()),
            }
        }
        RunRequest::FileChunk(chunk) => handle_upload_chunk(session, stream, chunk),
        RunRequest::FileTransferResponse(response) => handle_transfer_response(session, stream, response),
    }
}

fn handle_upload_chunk(session: &Session, stream: &dyn AgentStream, chunk: FileChunk) -> anyhow::Result<()> {
    match session.register_upload_chunk(chunk.transfer_id, chunk.number, &chunk.data, chunk.is_final) {
        Ok(is_final) => {
            send_response(
                stream,
                RunResponse::FileTransferResponse(FileTransferResponse {
                    transfer_id: chunk.transfer_id,
                    status: TransferStatus::ChunkReceived,
                    next_chunk_expected: Some(chunk.number + 1),
                    error_message: None,
                }),
            )?;
            if is_final {
                send_response(
                    stream,
                    RunResponse::FileTransferResponse(FileTransferResponse {
                        transfer_id: chunk.transfer_id,
                        status: TransferStatus::TransferComplete,
                        next_chunk_expected: None,
                        error_message: None,
                    }),
                )?;
                session.remove_upload(chunk.transfer_id);
                debug!(transfer_id = %chunk.transfer_id, "upload complete");
            }
            Ok(())
        }
        Err(e) => {
            send_response(
                stream,
                RunResponse::FileTransferResponse(FileTransferResponse {
                    transfer_id: chunk.transfer_id,
                    status: TransferStatus::Error,
                    next_chunk_expected: None,
                    error_message: Some(e.to_string()),
                }),
            )?;
            session.remove_upload(chunk.transfer_id);
            Ok(())
        }
    }
}

fn handle_transfer_response(
    session: &Session,
    _stream: &dyn AgentStream,
    response: FileTransferResponse,
) -> anyhow::Result<()> {
    let id: TransferId = response.transfer_id;
    let is_download = session.download_metadata(id).is_some();
    let is_upload = session.upload_metadata(id).is_some();

    match response.status {
        TransferStatus::Accepted => {
            if is_download {
                session.mark_download_accepted(id);
            }
            // Uploads need no action: the client will simply start sending
            // FileChunk requests, handled above.
            Ok(())
        }
        TransferStatus::ChunkReceived => {
            trace!(transfer_id = %id, "client acked download chunk");
            Ok(())
        }
        TransferStatus::TransferComplete => {
            if is_download {
                session.remove_download(id);
                debug!(transfer_id = %id, "download complete");
            } else {
                warn!(transfer_id = %id, "unexpected TransferComplete for unknown download");
            }
            Ok(())
        }
        TransferStatus::TransferRejected | TransferStatus::Error => {
            if is_download {
                session.remove_download(id);
            } else if is_upload {
                session.remove_upload(id);
            }
            warn!(
                transfer_id = %id,
                message = response.error_message.as_deref().unwrap_or(""),
                "transfer terminated by client"
            );
            Ok(())
        }
    }
}
