//! NUL-delimited message framing.
//!
//! Both the daemon socket and the eviction pipe speak the same trivial
//! protocol: JSON blobs separated by NUL bytes. The parser accumulates
//! partial reads across calls and yields only whole messages, so slow or
//! fragmented writers never confuse a reader.

use std::io::Read;

#[derive(Debug, PartialEq, Eq)]
pub enum ParserState {
    /// More may follow.
    Continue,
    /// Clean end of stream.
    StopSuccess,
    /// Read error.
    StopFail,
}

pub struct MessageParser<R> {
    source: R,
    buffer: Vec<u8>,
}

impl<R: Read> MessageParser<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            buffer: Vec::new(),
        }
    }

    /// Read whatever is available, appending complete messages to `out`.
    /// Blocks until at least one read completes.
    pub fn read_messages(&mut self, out: &mut Vec<String>) -> ParserState {
        loop {
            let mut chunk = [0u8; 4096];
            let count = match self.source.read(&mut chunk) {
                Ok(0) => return ParserState::StopSuccess,
                Ok(n) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return ParserState::StopFail,
            };

            for &byte in &chunk[..count] {
                if byte == 0 {
                    let msg = String::from_utf8_lossy(&self.buffer).into_owned();
                    out.push(msg);
                    self.buffer.clear();
                } else {
                    self.buffer.push(byte);
                }
            }

            if count < chunk.len() {
                return ParserState::Continue;
            }
        }
    }

    /// Block until one whole message arrives (or the stream ends).
    pub fn read_one(&mut self) -> Result<Option<String>, std::io::Error> {
        let mut msgs = Vec::new();
        loop {
            match self.read_messages(&mut msgs) {
                ParserState::Continue => {
                    if let Some(first) = msgs.drain(..).next() {
                        return Ok(Some(first));
                    }
                }
                ParserState::StopSuccess => return Ok(msgs.drain(..).next()),
                ParserState::StopFail => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "message stream failed",
                    ))
                }
            }
        }
    }
}

/// Frame and send one message.
pub fn send_message(mut sink: impl std::io::Write, body: &str) -> std::io::Result<()> {
    sink.write_all(body.as_bytes())?;
    sink.write_all(&[0])?;
    sink.flush()
}
