//! Background reader that turns a byte stream into frames on a bounded queue.

use futures_util::{Stream, StreamExt};
use log::{debug, warn};
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{StreamFrame, parse_line};

/// Default queue capacity between the reader task and the consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Longest line accepted from an event stream, in bytes.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// A line grew past the decoder's limit without a terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTooLong {
    pub limit: usize,
}

impl Display for LineTooLong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event stream line exceeds {} bytes", self.limit)
    }
}

impl std::error::Error for LineTooLong {}

/// Splits arbitrary byte chunks into text lines.
///
/// Bytes are held until a `\n` arrives, so multi-byte characters split
/// across chunks decode intact. Bytes already searched for a terminator are
/// not searched again.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    scanned: usize,
    max_line: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_LENGTH)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator (`\n` or `\r\n`).
    ///
    /// Fails once a line is longer than the limit, terminated or not.
    pub fn next_line(&mut self) -> Result<Option<String>, LineTooLong> {
        let limit = LineTooLong {
            limit: self.max_line,
        };
        match self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let pos = self.scanned + offset;
                self.scanned = 0;
                if pos > self.max_line {
                    return Err(limit);
                }
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None => {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_line {
                    Err(limit)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Whatever is left once the source has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Consumer side of an event stream.
///
/// Frames arrive in order; the sequence ends after a terminal frame
/// (`done` or `error`), when the source closes, or after [`FrameStream::cancel`].
/// Dropping the stream cancels the reader task, which drops the underlying
/// connection.
pub struct FrameStream {
    rx: mpsc::Receiver<StreamFrame>,
    cancel: CancellationToken,
}

impl FrameStream {
    /// Spawns the reader task over `source`.
    ///
    /// `cancel` is typically a child of the caller's token; `capacity` bounds
    /// how many frames may wait for a slow consumer before the reader stalls.
    pub fn spawn<S, B, E>(source: S, capacity: usize, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(read_frames(source, tx, cancel.clone()));
        Self { rx, cancel }
    }

    /// Next frame, or `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        self.rx.recv().await
    }

    /// Stops the reader; frames already queued can still be drained.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream, concatenating content until a terminal frame.
    ///
    /// Returns an error if the stream ends with an error frame.
    pub async fn collect_text(mut self) -> anyhow::Result<String> {
        let mut text = String::new();
        while let Some(frame) = self.next_frame().await {
            text.push_str(&frame.content);
            if let Some(error) = frame.error {
                anyhow::bail!("Stream failed: {}", error);
            }
        }
        Ok(text)
    }
}

impl Stream for FrameStream {
    type Item = StreamFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_frames<S, B, E>(source: S, tx: mpsc::Sender<StreamFrame>, cancel: CancellationToken)
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let mut source = Box::pin(source);
    let mut decoder = LineDecoder::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Event stream cancelled");
                return;
            }
            chunk = source.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                decoder.push(bytes.as_ref());
                loop {
                    match decoder.next_line() {
                        Ok(Some(line)) => {
                            if !emit(&line, &tx, &cancel).await {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("{}", e);
                            deliver(StreamFrame::failed(e.to_string()), &tx, &cancel).await;
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                warn!("Event stream read failed: {}", e);
                deliver(StreamFrame::failed(e.to_string()), &tx, &cancel).await;
                return;
            }
            None => {
                if let Some(line) = decoder.finish() {
                    emit(&line, &tx, &cancel).await;
                }
                debug!("Event stream closed by server");
                return;
            }
        }
    }
}

/// Parses and delivers one line. Returns false when reading should stop.
async fn emit(line: &str, tx: &mpsc::Sender<StreamFrame>, cancel: &CancellationToken) -> bool {
    match parse_line(line) {
        Some(frame) => {
            let terminal = frame.is_terminal();
            deliver(frame, tx, cancel).await && !terminal
        }
        None => true,
    }
}

/// Enqueues a frame unless cancelled first. Returns false if it was not delivered.
async fn deliver(
    frame: StreamFrame,
    tx: &mpsc::Sender<StreamFrame>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(frame) => sent.is_ok(),
    }
}
