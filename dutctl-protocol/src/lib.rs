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

//! Wire messages carried on a single dutctl run stream, plus the framing
//! used to put them on the wire. Kept free of any business logic so that
//! both the client and the agent can depend on it without pulling in
//! either side's run-time machinery.

use std::{
    fmt,
    io::{self, Read, Write},
};

use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use serde::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Chunk payloads are capped at this size; the file-transfer state machine
/// never emits a chunk larger than this, and receivers refuse larger frames.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// A message larger than this is refused outright rather than deserialized,
/// so a corrupt length prefix can't make us allocate an unbounded buffer.
pub const MAX_FRAME_SIZE: u32 = (CHUNK_SIZE as u32) + 4096;

/// Opaque, sender-chosen identifier for one file transfer. Unique within the
/// lifetime of a single run; two concurrent transfers in the same run must
/// not share an id even if they share a direction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u128);

impl TransferId {
    /// Generates a fresh id. Not a cryptographic identifier, just wide
    /// enough that two transfers colliding in one run is not a concern.
    pub fn generate() -> Self {
        TransferId(uuid::Uuid::new_v4().as_u128())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Which way file bytes flow for a given transfer, from the initiator's
/// point of view.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Client sends bytes to the agent (agent called `RequestFile`).
    Upload,
    /// Agent sends bytes to the client (agent called `SendFile`).
    Download,
}

/// Advisory metadata describing a transfer's file, sent with the initial
/// FileTransferRequest.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileMetadata {
    /// The path as named by the command's arguments; used for client-side
    /// path authorization.
    pub path: String,
    pub name: String,
    /// Advisory; 0 is legal for an upload from an unknown-length source.
    pub size: u64,
}

/// Acknowledgement / terminal status carried by FileTransferResponse.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Accepted,
    ChunkReceived,
    TransferComplete,
    TransferRejected,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileTransferRequest {
    pub transfer_id: TransferId,
    pub direction: TransferDirection,
    pub metadata: FileMetadata,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileChunk {
    pub transfer_id: TransferId,
    /// Strictly monotonic starting at 0 within one transfer.
    pub number: u64,
    /// `number * CHUNK_SIZE`; authoritative for writers that seek.
    pub offset: u64,
    pub data: Vec<u8>,
    pub is_final: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileTransferResponse {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    /// Present on ChunkReceived: the chunk number the sender should emit
    /// next.
    pub next_chunk_expected: Option<u64>,
    /// Present on TransferRejected / Error.
    pub error_message: Option<String>,
}

/// Console byte stream selector for agent->client Console responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ConsoleOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Request variants the client may send on a run stream. `Command` must be
/// the first message of the stream; every other variant may appear any
/// number of times after it in any order dictated by the protocol in
/// transfer.rs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RunRequest {
    /// Must be the first message sent on a fresh stream.
    Command { device: String, command: String, args: Vec<String> },
    Console { stdin: Vec<u8> },
    FileChunk(FileChunk),
    FileTransferResponse(FileTransferResponse),
}

/// Response variants the agent may send on a run stream.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RunResponse {
    Print { text: Vec<u8> },
    Console(ConsoleOutput),
    FileTransferRequest(FileTransferRequest),
    FileChunk(FileChunk),
    FileTransferResponse(FileTransferResponse),
}

/// The header the agent writes to every fresh stream before anything else,
/// so the client can warn about a protocol-version mismatch without it
/// being fatal.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VersionHeader {
    pub version: String,
}

/// Summary info for the `List` unary RPC (informative; out of core scope).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeviceSummary {
    pub name: String,
    pub commands: Vec<String>,
}

/// The centralized encoding function that should be used for every message
/// written to a run stream: msgpack payload, little-endian u32 length
/// prefix. Centralizing this avoids two call sites drifting out of sync on
/// framing.
pub fn encode_to<T, W>(msg: &T, mut w: W) -> anyhow::Result<()>
where
    T: Serialize,
    W: Write,
{
    let payload = rmp_serde::to_vec_named(msg)?;
    w.write_u32::<LittleEndian>(payload.len() as u32)?;
    w.write_all(&payload)?;
    Ok(())
}

/// The centralized decoding function matching `encode_to`. Returns
/// `Ok(None)` on a clean end-of-stream (no bytes at all read for the length
/// prefix); any other truncation is an error.
pub fn decode_from<T, R>(mut r: R) -> anyhow::Result<Option<T>>
where
    for<'de> T: Deserialize<'de>,
    R: Read,
{
    let len = match r.read_u32::<LittleEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame of size {} exceeds max frame size {}", len, MAX_FRAME_SIZE);
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    let msg = rmp_serde::from_slice(&buf)?;
    Ok(Some(msg))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_request_round_trip() {
        let reqs = vec![
            RunRequest::Command {
                device: "rpi".into(),
                command: "flash".into(),
                args: vec!["a.bin".into()],
            },
            RunRequest::Console { stdin: b"hello\n".to_vec() },
            RunRequest::FileChunk(FileChunk {
                transfer_id: TransferId::generate(),
                number: 0,
                offset: 0,
                data: vec![1, 2, 3],
                is_final: true,
            }),
            RunRequest::FileTransferResponse(FileTransferResponse {
                transfer_id: TransferId::generate(),
                status: TransferStatus::Accepted,
                next_chunk_expected: Some(1),
                error_message: None,
            }),
        ];

        for req in reqs {
            let mut buf = Vec::new();
            encode_to(&req, &mut buf).expect("encode");
            let got: RunRequest = decode_from(buf.as_slice()).expect("decode").expect("some");
            assert_eq!(format!("{:?}", req), format!("{:?}", got));
        }
    }

    #[test]
    fn decode_from_empty_is_clean_eof() {
        let got: Option<RunRequest> = decode_from(&[][..]).expect("decode");
        assert!(got.is_none());
    }

    #[test]
    fn decode_from_oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(MAX_FRAME_SIZE + 1).unwrap();
        let got: anyhow::Result<Option<RunRequest>> = decode_from(buf.as_slice());
        assert!(got.is_err());
    }

    #[test]
    fn transfer_id_display_is_stable_width() {
        let id = TransferId(1);
        assert_eq!(format!("{}", id), "00000000000000000000000000000001");
    }
}
