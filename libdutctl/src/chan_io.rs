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

//! Adapters that turn a channel of framed byte batches into the plain
//! `Read`/`Write` byte-stream surface modules expect. The RPC layer hands
//! us whole frames at a time; modules want ordinary short-read semantics,
//! so `ChanReader` keeps an overflow buffer for whatever didn't fit in the
//! caller's slice.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
};

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};

/// Reads bytes out of a channel of framed batches, preserving short-read
/// semantics via an internal overflow buffer.
pub struct ChanReader {
    rx: Receiver<Vec<u8>>,
    overflow: VecDeque<u8>,
    closed: bool,
}

impl ChanReader {
    pub fn new(rx: Option<Receiver<Vec<u8>>>) -> Result<Self> {
        let rx = rx.ok_or_else(|| anyhow!("ChanReader::new: missing channel"))?;
        Ok(ChanReader { rx, overflow: VecDeque::new(), closed: false })
    }
}

impl Read for ChanReader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }

        let mut n = 0;
        while n < dst.len() {
            if let Some(byte) = self.overflow.pop_front() {
                dst[n] = byte;
                n += 1;
                continue;
            }
            break;
        }
        if n > 0 {
            // We have data to return this call; don't touch the channel so
            // the next call can observe end-of-stream cleanly instead of
            // this call blocking on a closed channel after already having
            // bytes to hand back.
            return Ok(n);
        }

        if self.closed {
            return Ok(0);
        }

        match self.rx.recv() {
            Ok(batch) => {
                let copy_len = batch.len().min(dst.len());
                dst[..copy_len].copy_from_slice(&batch[..copy_len]);
                self.overflow.extend(batch[copy_len..].iter().copied());
                Ok(copy_len)
            }
            Err(crossbeam_channel::RecvError) => {
                self.closed = true;
                Ok(0)
            }
        }
    }
}

/// Writes bytes into a channel of framed batches. Each `write` call sends
/// exactly one batch containing a defensive copy of the caller's slice,
/// since the caller is free to reuse its buffer once `write` returns.
pub struct ChanWriter {
    tx: Sender<Vec<u8>>,
}

impl ChanWriter {
    pub fn new(tx: Option<Sender<Vec<u8>>>) -> Result<Self> {
        let tx = tx.ok_or_else(|| anyhow!("ChanWriter::new: missing channel"))?;
        Ok(ChanWriter { tx })
    }
}

impl Write for ChanWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ChanWriter: channel closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_preserves_bytes_across_short_reads() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut writer = ChanWriter::new(Some(tx)).unwrap();
        let mut reader = ChanReader::new(Some(rx)).unwrap();

        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        drop(writer);

        let mut got = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"hello world");
    }

    #[test]
    fn reader_returns_buffered_data_then_eof_on_next_call() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(b"ab".to_vec()).unwrap();
        drop(tx);

        let mut reader = ChanReader::new(Some(rx)).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"a");
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"b");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_channel_is_rejected() {
        assert!(ChanReader::new(None).is_err());
        assert!(ChanWriter::new(None).is_err());
    }

    #[test]
    fn empty_write_is_noop() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut writer = ChanWriter::new(Some(tx)).unwrap();
        assert_eq!(writer.write(&[]).unwrap(), 0);
        drop(writer);
        let mut reader = ChanReader::new(Some(rx)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
