//! Incremental decoding of `data:`-framed chat streams.
//!
//! Bytes go through a [`FrameDecoder`], which keeps incomplete UTF-8
//! sequences and partial lines across reads, and come out as [`Frame`]s.
//! [`StreamConsumer`] drives a decoder over a response body on a background
//! task and reports to a sink until the terminal frame, an error, or
//! cancellation.

use futures::StreamExt;
use parking_lot::ReentrantMutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::ByteStream;

pub const DATA_PREFIX: &str = "data:";
pub const DONE_MARKER: &str = "[DONE]";
/// Longest unterminated line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Delta(String),
    Done,
}

#[derive(Debug)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(Error),
}

#[derive(Deserialize)]
struct DeltaPayload {
    content: String,
}

/// Parses one line. `Ok(None)` for lines that carry no frame.
pub fn parse_frame(line: &str) -> Result<Option<Frame>> {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == DONE_MARKER {
        return Ok(Some(Frame::Done));
    }
    let delta: DeltaPayload = serde_json::from_str(payload)
        .map_err(|err| Error::StreamDecode(format!("{err}: {payload}")))?;
    Ok(Some(Frame::Delta(delta.content)))
}

/// Byte buffer plus incremental UTF-8 decoding plus line framing.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    bytes: Vec<u8>,
    line: String,
    // Dropping the rest of an oversized line until its newline.
    skipping: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the frames completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.bytes.extend_from_slice(chunk);
        self.decode_available();
        self.take_lines()
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<Frame> {
        if !self.bytes.is_empty() {
            warn!(bytes = self.bytes.len(), "stream ended inside a UTF-8 sequence");
            self.line.push_str(&String::from_utf8_lossy(&self.bytes));
            self.bytes.clear();
        }
        let mut frames = self.take_lines();
        let rest = std::mem::take(&mut self.line);
        if !std::mem::take(&mut self.skipping) {
            frames.extend(accept(&rest));
        }
        frames
    }

    fn decode_available(&mut self) {
        loop {
            match std::str::from_utf8(&self.bytes) {
                Ok(text) => {
                    self.line.push_str(text);
                    self.bytes.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.line
                        .push_str(&String::from_utf8_lossy(&self.bytes[..valid]));
                    match err.error_len() {
                        // Incomplete sequence at the end: wait for the next chunk.
                        None => {
                            self.bytes.drain(..valid);
                            return;
                        }
                        Some(len) => {
                            warn!(offset = valid, "invalid UTF-8 in stream, substituting");
                            self.line.push(char::REPLACEMENT_CHARACTER);
                            self.bytes.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn take_lines(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.line[start..].find('\n') {
            let end = start + pos + 1;
            if self.skipping {
                self.skipping = false;
            } else {
                frames.extend(accept(&self.line[start..end]));
            }
            start = end;
        }
        self.line.drain(..start);
        if self.line.len() > MAX_LINE_BYTES {
            warn!(bytes = self.line.len(), "dropping oversized stream line");
            self.line.clear();
            self.skipping = true;
        }
        frames
    }
}

fn accept(line: &str) -> Option<Frame> {
    let line = line.trim_end_matches(['\n', '\r']);
    match parse_frame(line) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "skipping malformed stream frame");
            None
        }
    }
}

/// Stops a running consumer. Clones control the same stream.
///
/// Once `cancel` returns, the sink is never called again, even if a read had
/// already completed. Cancelling is idempotent.
#[derive(Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    gate: Arc<ReentrantMutex<()>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
        // Wait out a sink call that is running on another thread.
        drop(self.gate.lock());
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct Dispatch<S> {
    handle: CancelHandle,
    sink: S,
}

impl<S: FnMut(StreamEvent)> Dispatch<S> {
    /// Returns false once the handle is cancelled.
    fn emit(&mut self, event: StreamEvent) -> bool {
        let _guard = self.handle.gate.lock();
        if self.handle.is_cancelled() {
            return false;
        }
        (self.sink)(event);
        true
    }

    /// Returns false when the stream is over.
    fn frames(&mut self, frames: Vec<Frame>) -> bool {
        for frame in frames {
            match frame {
                Frame::Delta(text) => {
                    if !self.emit(StreamEvent::Delta(text)) {
                        return false;
                    }
                }
                Frame::Done => {
                    self.emit(StreamEvent::Done);
                    return false;
                }
            }
        }
        true
    }
}

pub struct StreamConsumer;

impl StreamConsumer {
    /// Starts consuming `body` on a background task.
    pub fn open<S>(body: ByteStream, sink: S) -> CancelHandle
    where
        S: FnMut(StreamEvent) + Send + 'static,
    {
        Self::open_with(CancelHandle::new(), body, sink)
    }

    /// Like [`StreamConsumer::open`] with a handle the caller created earlier.
    /// If it is already cancelled nothing is read.
    pub fn open_with<S>(handle: CancelHandle, mut body: ByteStream, sink: S) -> CancelHandle
    where
        S: FnMut(StreamEvent) + Send + 'static,
    {
        let mut dispatch = Dispatch {
            handle: handle.clone(),
            sink,
        };
        let token = handle.token.clone();
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("stream cancelled");
                        return;
                    }
                    next = body.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => {
                        if !dispatch.frames(decoder.feed(&chunk)) {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let err = match err {
                            Error::StreamTransport(message) => Error::StreamTransport(message),
                            other => Error::StreamTransport(other.to_string()),
                        };
                        warn!(error = %err, "stream read failed");
                        dispatch.emit(StreamEvent::Error(err));
                        return;
                    }
                    None => {
                        if dispatch.frames(decoder.finish()) {
                            debug!("stream ended without terminal frame");
                            dispatch.emit(StreamEvent::Done);
                        }
                        return;
                    }
                }
            }
        });
        handle
    }
}
