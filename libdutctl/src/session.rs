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

//! `Session` is the per-run I/O contract a module sees: `print`, a
//! `console()` triple of stdin/stdout/stderr streams, and `request_file` /
//! `send_file` for the two directions of file transfer. It is also the
//! shared state the worker pair drains and drives; the two sides only ever
//! touch it through this API and the `pub(crate)` helpers below, never
//! through a back-pointer into each other.

use std::{
    collections::HashMap,
    io::{self, Read},
    sync::{Arc, Condvar, Mutex, RwLock},
};

use dutctl_protocol::{FileMetadata, TransferId};
use tracing::{debug, trace};

use crate::{
    chan_io::{ChanReader, ChanWriter},
    error::RunError,
};

/// Wraps a `ChanReader` so that a forced removal (module teardown racing
/// ahead of transfer completion) surfaces as a read error instead of a
/// clean EOF indistinguishable from a successful transfer.
pub struct UploadReader {
    inner: ChanReader,
    poison: Arc<Mutex<Option<String>>>,
}

impl Read for UploadReader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(dst)?;
        if n == 0 {
            if let Some(msg) = self.poison.lock().unwrap().clone() {
                return Err(io::Error::new(io::ErrorKind::Other, msg));
            }
        }
        Ok(n)
    }
}

/// Client->agent transfer state, one per outstanding `RequestFile` call.
/// The pipe writer is fed by `register_upload_chunk` as chunks arrive off
/// the wire; the module reads the paired `ChanReader` returned by
/// `request_file`.
pub struct UploadState {
    pub transfer_id: TransferId,
    pub metadata: FileMetadata,
    last_chunk: Option<u64>,
    complete: bool,
    writer: Option<ChanWriter>,
    poison: Arc<Mutex<Option<String>>>,
    /// Set once the to-client worker has emitted the initial
    /// `FileTransferRequest` for this upload, so it isn't sent twice.
    requested: bool,
}

/// Agent->client transfer state, one per outstanding `SendFile` call. Owns
/// the source reader's close lifecycle when the source is closeable.
pub struct DownloadState {
    pub transfer_id: TransferId,
    pub metadata: FileMetadata,
    source: Box<dyn Read + Send>,
    closer: Option<Box<dyn FnOnce() + Send>>,
    next_chunk_number: u64,
    awaiting_final_ack: bool,
    /// Set once the to-client worker has emitted the initial
    /// `FileTransferRequest` for this download.
    requested: bool,
    /// Set once the client has responded ACCEPTED; the to-client worker
    /// must not emit chunks before this is true.
    accepted: bool,
}

/// One read-up-to-a-chunk result from a `DownloadState`'s source.
pub struct NextChunk {
    pub number: u64,
    pub offset: u64,
    pub data: Vec<u8>,
    pub is_final: bool,
}

pub struct Session {
    print_tx: crossbeam_channel::Sender<String>,
    print_rx: crossbeam_channel::Receiver<String>,
    stdin_tx: crossbeam_channel::Sender<Vec<u8>>,
    stdin_rx: crossbeam_channel::Receiver<Vec<u8>>,
    stdout_tx: crossbeam_channel::Sender<Vec<u8>>,
    stdout_rx: crossbeam_channel::Receiver<Vec<u8>>,
    stderr_tx: crossbeam_channel::Sender<Vec<u8>>,
    stderr_rx: crossbeam_channel::Receiver<Vec<u8>>,

    uploads: RwLock<HashMap<TransferId, Mutex<UploadState>>>,
    downloads: RwLock<HashMap<TransferId, Mutex<DownloadState>>>,

    transfer_activity_tx: crossbeam_channel::Sender<()>,
    transfer_activity_rx: crossbeam_channel::Receiver<()>,

    shutdown_tx: Mutex<Option<crossbeam_channel::Sender<()>>>,
    shutdown_rx: crossbeam_channel::Receiver<()>,

    transfer_count: Mutex<usize>,
    transfer_count_cond: Condvar,
}

impl Session {
    pub fn new() -> Self {
        // Unbuffered by default: a send only succeeds once a worker is
        // actively receiving, which is what makes `print` block only when
        // the to-client worker isn't currently draining.
        let (print_tx, print_rx) = crossbeam_channel::bounded(0);
        let (stdin_tx, stdin_rx) = crossbeam_channel::bounded(0);
        let (stdout_tx, stdout_rx) = crossbeam_channel::bounded(0);
        let (stderr_tx, stderr_rx) = crossbeam_channel::bounded(0);
        let (transfer_activity_tx, transfer_activity_rx) = crossbeam_channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::unbounded();

        Session {
            print_tx,
            print_rx,
            stdin_tx,
            stdin_rx,
            stdout_tx,
            stdout_rx,
            stderr_tx,
            stderr_rx,
            uploads: RwLock::new(HashMap::new()),
            downloads: RwLock::new(HashMap::new()),
            transfer_activity_tx,
            transfer_activity_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            transfer_count: Mutex::new(0),
            transfer_count_cond: Condvar::new(),
        }
    }

    // ---- module-facing API ----

    /// Enqueues a line for the client to print. Blocks until the to-client
    /// worker is actively draining the print queue.
    pub fn print(&self, s: impl Into<String>) -> anyhow::Result<()> {
        self.print_tx.send(s.into()).map_err(|_| anyhow::anyhow!("session is shut down"))
    }

    /// Returns the stdin reader plus stdout/stderr writers bound to this
    /// run's console queues.
    pub fn console(&self) -> anyhow::Result<(ChanReader, ChanWriter, ChanWriter)> {
        Ok((
            ChanReader::new(Some(self.stdin_rx.clone()))?,
            ChanWriter::new(Some(self.stdout_tx.clone()))?,
            ChanWriter::new(Some(self.stderr_tx.clone()))?,
        ))
    }

    /// Requests a file from the client. Returns a reader that yields bytes
    /// as chunks arrive; the first read blocks until the first chunk is
    /// received (or the transfer is rejected/errored).
    pub fn request_file(&self, name: &str) -> anyhow::Result<UploadReader> {
        let transfer_id = TransferId::generate();
        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = ChanWriter::new(Some(tx))?;
        let poison = Arc::new(Mutex::new(None));
        let state = UploadState {
            transfer_id,
            metadata: FileMetadata { path: name.to_string(), name: name.to_string(), size: 0 },
            last_chunk: None,
            complete: false,
            writer: Some(writer),
            poison: poison.clone(),
            requested: false,
        };
        self.register_upload(transfer_id, state);
        self.signal_transfer_activity();
        Ok(UploadReader { inner: ChanReader::new(Some(rx))?, poison })
    }

    /// Pushes a file to the client. Returns immediately; the worker pair
    /// drives the actual chunking.
    pub fn send_file(
        &self,
        name: &str,
        size: u64,
        source: Box<dyn Read + Send>,
        closer: Option<Box<dyn FnOnce() + Send>>,
    ) -> anyhow::Result<TransferId> {
        let transfer_id = TransferId::generate();
        let state = DownloadState {
            transfer_id,
            metadata: FileMetadata { path: name.to_string(), name: name.to_string(), size },
            source,
            closer,
            next_chunk_number: 0,
            awaiting_final_ack: false,
            requested: false,
            accepted: false,
        };
        self.register_download(transfer_id, state);
        self.signal_transfer_activity();
        Ok(transfer_id)
    }

    /// Idempotent: closes the shutdown signal if it isn't already closed.
    pub fn shutdown(&self) {
        let mut guard = self.shutdown_tx.lock().unwrap();
        guard.take();
    }

    /// Blocks until every in-flight transfer has reached a terminal state.
    pub fn wait_for_transfers(&self) {
        let guard = self.transfer_count.lock().unwrap();
        let _ = self.transfer_count_cond.wait_while(guard, |n| *n > 0).unwrap();
    }

    // ---- worker-facing accessors (pub(crate)) ----

    pub(crate) fn print_rx(&self) -> crossbeam_channel::Receiver<String> {
        self.print_rx.clone()
    }

    pub(crate) fn stdout_rx(&self) -> crossbeam_channel::Receiver<Vec<u8>> {
        self.stdout_rx.clone()
    }

    pub(crate) fn stderr_rx(&self) -> crossbeam_channel::Receiver<Vec<u8>> {
        self.stderr_rx.clone()
    }

    pub(crate) fn stdin_tx(&self) -> crossbeam_channel::Sender<Vec<u8>> {
        self.stdin_tx.clone()
    }

    pub(crate) fn transfer_activity_rx(&self) -> crossbeam_channel::Receiver<()> {
        self.transfer_activity_rx.clone()
    }

    pub(crate) fn shutdown_rx(&self) -> crossbeam_channel::Receiver<()> {
        self.shutdown_rx.clone()
    }

    pub(crate) fn signal_transfer_activity(&self) {
        // Single-slot, never blocks the producer; a stale wakeup just
        // causes one extra no-op pass through the to-client worker's loop.
        let _ = self.transfer_activity_tx.try_send(());
    }

    fn register_upload(&self, id: TransferId, state: UploadState) {
        self.uploads.write().unwrap().insert(id, Mutex::new(state));
        *self.transfer_count.lock().unwrap() += 1;
    }

    fn register_download(&self, id: TransferId, state: DownloadState) {
        self.downloads.write().unwrap().insert(id, Mutex::new(state));
        *self.transfer_count.lock().unwrap() += 1;
    }

    pub(crate) fn upload_metadata(&self, id: TransferId) -> Option<FileMetadata> {
        let uploads = self.uploads.read().unwrap();
        uploads.get(&id).map(|s| s.lock().unwrap().metadata.clone())
    }

    pub(crate) fn download_metadata(&self, id: TransferId) -> Option<FileMetadata> {
        let downloads = self.downloads.read().unwrap();
        downloads.get(&id).map(|s| s.lock().unwrap().metadata.clone())
    }

    pub(crate) fn active_uploads(&self) -> Vec<TransferId> {
        self.uploads.read().unwrap().keys().copied().collect()
    }

    pub(crate) fn active_downloads(&self) -> Vec<TransferId> {
        self.downloads.read().unwrap().keys().copied().collect()
    }

    /// Validates and writes one upload chunk. Returns `Ok(true)` if this
    /// was the final chunk (the pipe is now closed and the state should be
    /// treated as complete by the caller, which still owns removal).
    pub(crate) fn register_upload_chunk(
        &self,
        id: TransferId,
        number: u64,
        data: &[u8],
        is_final: bool,
    ) -> anyhow::Result<bool> {
        let uploads = self.uploads.read().unwrap();
        let entry = uploads.get(&id).ok_or_else(|| RunError::Protocol {
            transfer_id: Some(id),
            message: "unknown upload transfer".into(),
        })?;
        let mut state = entry.lock().unwrap();

        let expected = state.last_chunk.map(|n| n + 1).unwrap_or(0);
        if number != expected {
            return Err(RunError::Protocol {
                transfer_id: Some(id),
                message: format!("chunk sequence violation: got {number}, expected {expected}"),
            }
            .into());
        }

        if !data.is_empty() {
            use std::io::Write as _;
            if let Some(w) = state.writer.as_mut() {
                w.write_all(data).map_err(|source| RunError::Io { transfer_id: id, source })?;
            }
        }
        state.last_chunk = Some(number);

        if is_final {
            state.complete = true;
            state.writer.take(); // drop the writer, closing the pipe
        }
        trace!(transfer_id = %id, number, is_final, "registered upload chunk");
        Ok(is_final)
    }

    /// Reads the next chunk for a download from its source. Returns `None`
    /// if the transfer is no longer tracked (already removed).
    pub(crate) fn get_next_chunk(&self, id: TransferId) -> anyhow::Result<Option<NextChunk>> {
        let downloads = self.downloads.read().unwrap();
        let entry = match downloads.get(&id) {
            Some(e) => e,
            None => return Ok(None),
        };
        let mut state = entry.lock().unwrap();

        let number = state.next_chunk_number;
        let offset = number * dutctl_protocol::CHUNK_SIZE as u64;

        let mut buf = vec![0u8; dutctl_protocol::CHUNK_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            let n = state
                .source
                .read(&mut buf[filled..])
                .map_err(|source| RunError::Io { transfer_id: id, source })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        let is_final = filled < dutctl_protocol::CHUNK_SIZE;

        state.next_chunk_number += 1;
        debug!(transfer_id = %id, number, len = filled, is_final, "read download chunk");
        Ok(Some(NextChunk { number, offset, data: buf, is_final }))
    }

    /// Returns this upload's metadata exactly once, on the first call for a
    /// given transfer, so the to-client worker knows to emit the initial
    /// `FileTransferRequest` precisely once.
    pub(crate) fn take_upload_request(&self, id: TransferId) -> Option<FileMetadata> {
        let uploads = self.uploads.read().unwrap();
        let entry = uploads.get(&id)?;
        let mut state = entry.lock().unwrap();
        if state.requested {
            return None;
        }
        state.requested = true;
        Some(state.metadata.clone())
    }

    /// Same as `take_upload_request`, for downloads.
    pub(crate) fn take_download_request(&self, id: TransferId) -> Option<FileMetadata> {
        let downloads = self.downloads.read().unwrap();
        let entry = downloads.get(&id)?;
        let mut state = entry.lock().unwrap();
        if state.requested {
            return None;
        }
        state.requested = true;
        Some(state.metadata.clone())
    }

    pub(crate) fn mark_download_accepted(&self, id: TransferId) {
        let downloads = self.downloads.read().unwrap();
        if let Some(s) = downloads.get(&id) {
            s.lock().unwrap().accepted = true;
        }
    }

    pub(crate) fn is_download_accepted(&self, id: TransferId) -> bool {
        let downloads = self.downloads.read().unwrap();
        downloads.get(&id).map(|s| s.lock().unwrap().accepted).unwrap_or(false)
    }

    pub(crate) fn is_download_awaiting_ack(&self, id: TransferId) -> bool {
        let downloads = self.downloads.read().unwrap();
        downloads.get(&id).map(|s| s.lock().unwrap().awaiting_final_ack).unwrap_or(false)
    }

    pub(crate) fn mark_download_awaiting_ack(&self, id: TransferId) {
        let downloads = self.downloads.read().unwrap();
        if let Some(s) = downloads.get(&id) {
            s.lock().unwrap().awaiting_final_ack = true;
        }
    }

    /// Idempotent: closing an already-removed upload is a no-op.
    pub(crate) fn remove_upload(&self, id: TransferId) {
        let removed = self.uploads.write().unwrap().remove(&id);
        if let Some(state) = removed {
            let mut state = state.into_inner().unwrap();
            if !state.complete {
                // Forced removal before completion: poison the pipe so the
                // module's reader observes an error rather than a silent
                // truncation indistinguishable from a clean transfer.
                *state.poison.lock().unwrap() = Some("upload removed before completion".into());
            }
            state.writer.take(); // drop the writer, unblocking the reader
            self.dec_transfer_count();
        }
    }

    /// Idempotent: closing an already-removed download is a no-op.
    pub(crate) fn remove_download(&self, id: TransferId) {
        let removed = self.downloads.write().unwrap().remove(&id);
        if let Some(state) = removed {
            let mut state = state.into_inner().unwrap();
            if let Some(closer) = state.closer.take() {
                closer();
            }
            self.dec_transfer_count();
        }
    }

    fn dec_transfer_count(&self) {
        let mut n = self.transfer_count.lock().unwrap();
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.transfer_count_cond.notify_all();
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::io::Read as _;

    use ntest::timeout;

    use super::*;

    #[test]
    fn request_file_reader_blocks_until_first_chunk() {
        let session = Session::new();
        let mut reader = session.request_file("in.bin").unwrap();
        let ids = session.active_uploads();
        assert_eq!(ids.len(), 1);
        let id = ids[0];

        session.register_upload_chunk(id, 0, b"hello", true).unwrap();

        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn upload_chunk_sequence_violation_is_rejected() {
        let session = Session::new();
        let _reader = session.request_file("in.bin").unwrap();
        let id = session.active_uploads()[0];

        session.register_upload_chunk(id, 0, b"a", false).unwrap();
        assert!(session.register_upload_chunk(id, 2, b"c", false).is_err());
    }

    #[test]
    fn zero_length_non_final_chunk_is_a_noop_write() {
        let session = Session::new();
        let mut reader = session.request_file("in.bin").unwrap();
        let id = session.active_uploads()[0];

        session.register_upload_chunk(id, 0, b"", false).unwrap();
        session.register_upload_chunk(id, 1, b"ok", true).unwrap();

        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"ok");
    }

    #[test]
    fn download_chunks_cover_source_exactly_with_short_final() {
        let session = Session::new();
        let data = vec![7u8; dutctl_protocol::CHUNK_SIZE + 10];
        let id = session.send_file("out.bin", data.len() as u64, Box::new(std::io::Cursor::new(data.clone())), None).unwrap();

        let first = session.get_next_chunk(id).unwrap().unwrap();
        assert_eq!(first.number, 0);
        assert_eq!(first.data.len(), dutctl_protocol::CHUNK_SIZE);
        assert!(!first.is_final);

        let second = session.get_next_chunk(id).unwrap().unwrap();
        assert_eq!(second.number, 1);
        assert_eq!(second.data.len(), 10);
        assert!(second.is_final);
    }

    #[test]
    fn download_of_exact_multiple_ends_with_zero_length_final_chunk() {
        let session = Session::new();
        let data = vec![1u8; dutctl_protocol::CHUNK_SIZE];
        let id = session.send_file("out.bin", data.len() as u64, Box::new(std::io::Cursor::new(data)), None).unwrap();

        let first = session.get_next_chunk(id).unwrap().unwrap();
        assert!(!first.is_final);
        let second = session.get_next_chunk(id).unwrap().unwrap();
        assert!(second.data.is_empty());
        assert!(second.is_final);
    }

    #[test]
    #[timeout(5000)]
    fn wait_for_transfers_unblocks_after_removal() {
        let session = std::sync::Arc::new(Session::new());
        let _reader = session.request_file("in.bin").unwrap();
        let id = session.active_uploads()[0];

        let waiter = {
            let session = session.clone();
            std::thread::spawn(move || session.wait_for_transfers())
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        session.remove_upload(id);
        waiter.join().unwrap();
    }

    #[test]
    fn remove_is_idempotent() {
        let session = Session::new();
        let _reader = session.request_file("in.bin").unwrap();
        let id = session.active_uploads()[0];
        session.remove_upload(id);
        session.remove_upload(id); // must not panic or double-decrement
        session.wait_for_transfers();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let session = Session::new();
        session.shutdown();
        session.shutdown();
    }
}
