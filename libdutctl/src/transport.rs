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

//! A concrete `AgentStream`/`ClientStream` pair over a length-framed TCP
//! connection, standing in for an HTTP/2-based transport so the two
//! binaries can talk to each other over a real socket without the
//! protocol itself depending on HTTP/2 framing. TLS wrapping is left for a
//! transport swap at the call site: anywhere a `TcpStream` is
//! accepted/dialed below, a `rustls` stream implementing the same
//! `Read + Write` bound could be substituted.
//!
//! `send` takes the writer lock for exactly one `encode_to` call; two
//! concurrent sends are not supported, but both workers on the agent side
//! call `send`, so the lock is what actually serializes them.

use std::{
    io::BufReader,
    net::TcpStream,
    sync::Mutex,
};

use dutctl_protocol::{decode_from, encode_to, RunRequest, RunResponse};

use crate::stream::{AgentStream, ClientStream};

/// The agent's end of a TCP run connection: sends `RunResponse`, receives
/// `RunRequest`.
pub struct TcpAgentStream {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
}

impl TcpAgentStream {
    pub fn new(conn: TcpStream) -> anyhow::Result<Self> {
        let writer = conn.try_clone()?;
        Ok(TcpAgentStream { reader: Mutex::new(BufReader::new(conn)), writer: Mutex::new(writer) })
    }
}

impl AgentStream for TcpAgentStream {
    fn send(&self, response: RunResponse) -> anyhow::Result<()> {
        let mut w = self.writer.lock().unwrap();
        encode_to(&response, &mut *w)
    }

    fn receive(&self) -> anyhow::Result<Option<RunRequest>> {
        let mut r = self.reader.lock().unwrap();
        decode_from(&mut *r)
    }
}

/// The client's end of the same connection: sends `RunRequest`, receives
/// `RunResponse`.
pub struct TcpClientStream {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
}

impl TcpClientStream {
    pub fn new(conn: TcpStream) -> anyhow::Result<Self> {
        let writer = conn.try_clone()?;
        Ok(TcpClientStream { reader: Mutex::new(BufReader::new(conn)), writer: Mutex::new(writer) })
    }

    pub fn connect(addr: &str) -> anyhow::Result<Self> {
        let conn = TcpStream::connect(addr)?;
        Self::new(conn)
    }
}

impl ClientStream for TcpClientStream {
    fn send(&self, request: RunRequest) -> anyhow::Result<()> {
        let mut w = self.writer.lock().unwrap();
        encode_to(&request, &mut *w)
    }

    fn receive(&self) -> anyhow::Result<Option<RunResponse>> {
        let mut r = self.reader.lock().unwrap();
        decode_from(&mut *r)
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn agent_and_client_round_trip_a_command_and_a_print() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let agent = TcpAgentStream::new(conn).unwrap();
            let req = agent.receive().unwrap().unwrap();
            let device = match req {
                RunRequest::Command { device, .. } => device,
                other => panic!("unexpected request: {other:?}"),
            };
            agent.send(RunResponse::Print { text: format!("hi {device}\n").into_bytes() }).unwrap();
        });

        let client = TcpClientStream::connect(&addr.to_string()).unwrap();
        client
            .send(RunRequest::Command {
                device: "rpi".into(),
                command: "flash".into(),
                args: vec![],
            })
            .unwrap();
        let resp = client.receive().unwrap().unwrap();
        match resp {
            RunResponse::Print { text } => assert_eq!(text, b"hi rpi\n"),
            other => panic!("unexpected response: {other:?}"),
        }
        server.join().unwrap();
    }
}
