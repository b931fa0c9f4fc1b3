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

//! The client's mirror of `Broker`: sends the initial `Command` request,
//! forwards stdin, prints responses, and plays both the initiator's
//! counterpart and the sender role of the file-transfer state machine
//! depending on which direction the agent proposed.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader, Read, Write},
    path::PathBuf,
    sync::Arc,
    thread,
};

use dutctl_protocol::{
    ConsoleOutput, FileChunk, FileTransferRequest, FileTransferResponse, RunRequest, RunResponse,
    TransferDirection, TransferId, TransferStatus, CHUNK_SIZE,
};
use tracing::{instrument, warn};

use crate::{error::RunError, stream::ClientStream, transfer};

/// `stream.send`, classifying a failure as a transport error so the run
/// loop's caller can tell "the agent went away" apart from a protocol or
/// authorization failure.
fn send_request(stream: &dyn ClientStream, request: RunRequest) -> anyhow::Result<()> {
    stream.send(request).map_err(RunError::Transport)?;
    Ok(())
}

enum ClientTransferState {
    /// The client is the sender: it read `req.metadata.path` locally and is
    /// streaming it to the agent (the agent had called `RequestFile`).
    Upload { file: BufReader<File>, next_number: u64, final_sent: bool },
    /// The client is the receiver: the agent is streaming a file
    /// (`SendFile`) that the client is writing to `path`.
    Download { path: PathBuf, expected_number: u64 },
}

/// Runs one command end to end against an already-connected `stream`:
/// sends the `Command` request, forwards `stdin` lines as they arrive,
/// prints `Print`/`Console` responses to `stdout`/`stderr`, and drives both
/// directions of file transfer until the agent closes the stream.
#[instrument(skip_all, fields(device, command))]
pub fn run(
    stream: Arc<dyn ClientStream>,
    device: &str,
    command: &str,
    args: &[String],
    mut stdout: Box<dyn Write + Send>,
    mut stderr: Box<dyn Write + Send>,
    stdin: Box<dyn Read + Send>,
) -> anyhow::Result<()> {
    send_request(
        stream.as_ref(),
        RunRequest::Command {
            device: device.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
        },
    )?;

    // Forwards stdin lines for the life of the process; not joined, since a
    // user who never sends EOF would otherwise hang process exit. This
    // mirrors the same accepted "blocking receive never explicitly
    // cancelled" leak as the agent's from-client worker inner task.
    {
        let stream = stream.clone();
        thread::spawn(move || forward_stdin(stream, stdin));
    }

    let mut transfers: HashMap<TransferId, ClientTransferState> = HashMap::new();
    loop {
        match stream.receive().map_err(RunError::Transport)? {
            None => return Ok(()),
            Some(response) => {
                handle_response(&stream, &mut transfers, args, stdout.as_mut(), stderr.as_mut(), response)?
            }
        }
    }
}

fn forward_stdin(stream: Arc<dyn ClientStream>, stdin: Box<dyn Read + Send>) {
    let mut reader = BufReader::new(stdin);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => return,
            Ok(_) => {
                if stream.send(RunRequest::Console { stdin: line.clone() }).is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

fn handle_response(
    stream: &Arc<dyn ClientStream>,
    transfers: &mut HashMap<TransferId, ClientTransferState>,
    command_args: &[String],
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
    response: RunResponse,
) -> anyhow::Result<()> {
    match response {
        RunResponse::Print { text } => {
            stdout.write_all(&text)?;
            stdout.flush()?;
            Ok(())
        }
        RunResponse::Console(ConsoleOutput::Stdout(bytes)) => {
            stdout.write_all(&bytes)?;
            stdout.flush()?;
            Ok(())
        }
        RunResponse::Console(ConsoleOutput::Stderr(bytes)) => {
            stderr.write_all(&bytes)?;
            stderr.flush()?;
            Ok(())
        }
        RunResponse::FileTransferRequest(req) => {
            handle_transfer_request(stream, transfers, command_args, req)
        }
        RunResponse::FileChunk(chunk) => handle_download_chunk(stream, transfers, chunk),
        RunResponse::FileTransferResponse(resp) => handle_upload_ack(stream, transfers, resp),
    }
}

fn reject(stream: &Arc<dyn ClientStream>, transfer_id: TransferId, message: String) -> anyhow::Result<()> {
    send_request(
        stream.as_ref(),
        RunRequest::FileTransferResponse(FileTransferResponse {
            transfer_id,
            status: TransferStatus::TransferRejected,
            next_chunk_expected: None,
            error_message: Some(message),
        }),
    )
}

fn error_out(stream: &Arc<dyn ClientStream>, transfer_id: TransferId, message: String) -> anyhow::Result<()> {
    send_request(
        stream.as_ref(),
        RunRequest::FileTransferResponse(FileTransferResponse {
            transfer_id,
            status: TransferStatus::Error,
            next_chunk_expected: None,
            error_message: Some(message),
        }),
    )
}

fn handle_transfer_request(
    stream: &Arc<dyn ClientStream>,
    transfers: &mut HashMap<TransferId, ClientTransferState>,
    command_args: &[String],
    req: FileTransferRequest,
) -> anyhow::Result<()> {
    if let Err(e) = transfer::authorize(&req.metadata.path, command_args, req.transfer_id) {
        return reject(stream, req.transfer_id, e.to_string());
    }

    match req.direction {
        TransferDirection::Upload => match File::open(&req.metadata.path) {
            Ok(file) => {
                transfers.insert(
                    req.transfer_id,
                    ClientTransferState::Upload {
                        file: BufReader::new(file),
                        next_number: 0,
                        final_sent: false,
                    },
                );
                send_request(
                    stream.as_ref(),
                    RunRequest::FileTransferResponse(FileTransferResponse {
                        transfer_id: req.transfer_id,
                        status: TransferStatus::Accepted,
                        next_chunk_expected: None,
                        error_message: None,
                    }),
                )?;
                send_next_upload_chunk(stream, transfers, req.transfer_id)
            }
            Err(e) => error_out(stream, req.transfer_id, e.to_string()),
        },
        TransferDirection::Download => {
            transfers.insert(
                req.transfer_id,
                ClientTransferState::Download {
                    path: PathBuf::from(&req.metadata.path),
                    expected_number: 0,
                },
            );
            send_request(
                stream.as_ref(),
                RunRequest::FileTransferResponse(FileTransferResponse {
                    transfer_id: req.transfer_id,
                    status: TransferStatus::Accepted,
                    next_chunk_expected: None,
                    error_message: None,
                }),
            )
        }
    }
}

fn send_next_upload_chunk(
    stream: &Arc<dyn ClientStream>,
    transfers: &mut HashMap<TransferId, ClientTransferState>,
    id: TransferId,
) -> anyhow::Result<()> {
    let (data, number, is_final) = match transfers.get_mut(&id) {
        Some(ClientTransferState::Upload { file, next_number, final_sent }) => {
            if *final_sent {
                return Ok(());
            }
            let number = *next_number;
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            let is_final = filled < CHUNK_SIZE;
            *next_number += 1;
            *final_sent = is_final;
            (buf, number, is_final)
        }
        _ => return Ok(()),
    };

    send_request(
        stream.as_ref(),
        RunRequest::FileChunk(FileChunk {
            transfer_id: id,
            number,
            offset: number * CHUNK_SIZE as u64,
            data,
            is_final,
        }),
    )
}

fn handle_download_chunk(
    stream: &Arc<dyn ClientStream>,
    transfers: &mut HashMap<TransferId, ClientTransferState>,
    chunk: FileChunk,
) -> anyhow::Result<()> {
    let path = match transfers.get(&chunk.transfer_id) {
        Some(ClientTransferState::Download { path, expected_number }) => {
            if chunk.number != *expected_number {
                let err = RunError::Protocol {
                    transfer_id: Some(chunk.transfer_id),
                    message: format!(
                        "chunk sequence violation: got {}, expected {}",
                        chunk.number, expected_number
                    ),
                };
                transfers.remove(&chunk.transfer_id);
                return error_out(stream, chunk.transfer_id, err.to_string());
            }
            path.clone()
        }
        _ => {
            let err = RunError::Protocol {
                transfer_id: Some(chunk.transfer_id),
                message: "unknown download transfer".into(),
            };
            return error_out(stream, chunk.transfer_id, err.to_string());
        }
    };

    transfer::write_chunk_to_file(&path, chunk.offset, &chunk.data, chunk.number == 0, chunk.transfer_id)?;

    if let Some(ClientTransferState::Download { expected_number, .. }) =
        transfers.get_mut(&chunk.transfer_id)
    {
        *expected_number += 1;
    }

    send_request(
        stream.as_ref(),
        RunRequest::FileTransferResponse(FileTransferResponse {
            transfer_id: chunk.transfer_id,
            status: TransferStatus::ChunkReceived,
            next_chunk_expected: Some(chunk.number + 1),
            error_message: None,
        }),
    )?;

    if chunk.is_final {
        send_request(
            stream.as_ref(),
            RunRequest::FileTransferResponse(FileTransferResponse {
                transfer_id: chunk.transfer_id,
                status: TransferStatus::TransferComplete,
                next_chunk_expected: None,
                error_message: None,
            }),
        )?;
        transfers.remove(&chunk.transfer_id);
    }
    Ok(())
}

fn handle_upload_ack(
    stream: &Arc<dyn ClientStream>,
    transfers: &mut HashMap<TransferId, ClientTransferState>,
    response: FileTransferResponse,
) -> anyhow::Result<()> {
    match response.status {
        TransferStatus::ChunkReceived => send_next_upload_chunk(stream, transfers, response.transfer_id),
        TransferStatus::TransferComplete
        | TransferStatus::TransferRejected
        | TransferStatus::Error => {
            transfers.remove(&response.transfer_id);
            Ok(())
        }
        TransferStatus::Accepted => {
            warn!(transfer_id = %response.transfer_id, "unexpected Accepted from agent");
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;
    use crate::stream::test_double;

    #[test]
    fn print_is_written_to_stdout() {
        let (agent_stream, client_stream) = test_double::channel_pair();
        let client_stream: Arc<dyn ClientStream> = Arc::new(client_stream);

        agent_stream.receive().unwrap(); // the Command request
        agent_stream.send(dutctl_protocol::RunResponse::Print { text: b"hi\n".to_vec() }).unwrap();
        drop(agent_stream);

        let stdout = Vec::new();
        let stdout_holder = Arc::new(std::sync::Mutex::new(stdout));
        struct SharedWriter(Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().write(buf)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        run(
            client_stream,
            "rpi",
            "flash",
            &["fw.bin".to_string()],
            Box::new(SharedWriter(stdout_holder.clone())),
            Box::new(Vec::new()),
            Box::new(Cursor::new(Vec::new())),
        )
        .unwrap();

        assert_eq!(&*stdout_holder.lock().unwrap(), b"hi\n");
    }

    #[test]
    fn download_request_for_unauthorized_path_is_rejected_without_io() {
        let (agent_stream, client_stream) = test_double::channel_pair();
        let client_stream: Arc<dyn ClientStream> = Arc::new(client_stream);

        agent_stream.receive().unwrap();
        let transfer_id = dutctl_protocol::TransferId::generate();
        agent_stream
            .send(dutctl_protocol::RunResponse::FileTransferRequest(FileTransferRequest {
                transfer_id,
                direction: TransferDirection::Download,
                metadata: dutctl_protocol::FileMetadata {
                    path: "/etc/shadow".into(),
                    name: "shadow".into(),
                    size: 0,
                },
            }))
            .unwrap();

        let reply_thread = std::thread::spawn(move || {
            run(
                client_stream,
                "rpi",
                "flash",
                &["in.bin".to_string()],
                Box::new(Vec::new()),
                Box::new(Vec::new()),
                Box::new(Cursor::new(Vec::new())),
            )
        });

        let reply = agent_stream.receive().unwrap().unwrap();
        match reply {
            RunRequest::FileTransferResponse(r) => {
                assert_eq!(r.status, TransferStatus::TransferRejected);
                assert!(r.error_message.unwrap().contains("/etc/shadow"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
        drop(agent_stream);
        reply_thread.join().unwrap().unwrap();
    }
}
