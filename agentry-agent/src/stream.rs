// ABOUTME: Cancellable single-consumer chunk stream and its producer-side sink.
// ABOUTME: Bounded channel gives backpressure; dropping the stream cancels the producer.

use crate::chunk::{AgentStreamChunk, ChunkBody, ErrorCode};
use crate::response::AgentOutput;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default number of chunks buffered between producer and consumer
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Returned by [`ChunkSink`] once the consumer is gone or the stream is finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("chunk stream closed")]
pub struct StreamClosed;

/// Create a connected sink/stream pair
pub fn chunk_channel(
    backend_id: impl Into<String>,
    capacity: usize,
    cancel: CancellationToken,
) -> (ChunkSink, ChunkStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChunkSink::new(backend_id, tx), ChunkStream::new(rx, cancel))
}

/// Producer side of a chunk stream.
///
/// Stamps every chunk with the producing backend id and a strictly increasing
/// sequence number. The runtime may retarget a sink to another backend when it
/// falls back; the sequence keeps counting across attempts.
pub struct ChunkSink {
    backend_id: String,
    tx: mpsc::Sender<AgentStreamChunk>,
    next_sequence: u64,
    sent_this_attempt: u64,
    transcript: String,
    finished: bool,
}

impl ChunkSink {
    pub fn new(backend_id: impl Into<String>, tx: mpsc::Sender<AgentStreamChunk>) -> Self {
        Self {
            backend_id: backend_id.into(),
            tx,
            next_sequence: 0,
            sent_this_attempt: 0,
            transcript: String::new(),
            finished: false,
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Send one chunk, waiting for buffer space
    pub async fn send(&mut self, body: ChunkBody) -> Result<(), StreamClosed> {
        if self.finished {
            return Err(StreamClosed);
        }

        let terminal = matches!(body, ChunkBody::Completion { .. } | ChunkBody::Error { .. });
        if let ChunkBody::Text { text } = &body {
            self.transcript.push_str(text);
        }

        let chunk = AgentStreamChunk {
            backend_id: self.backend_id.clone(),
            sequence: self.next_sequence,
            body,
        };
        self.tx.send(chunk).await.map_err(|_| StreamClosed)?;

        self.next_sequence += 1;
        self.sent_this_attempt += 1;
        if terminal {
            self.finished = true;
        }
        Ok(())
    }

    pub async fn text(&mut self, text: impl Into<String>) -> Result<(), StreamClosed> {
        self.send(ChunkBody::text(text)).await
    }

    pub async fn thought(&mut self, text: impl Into<String>) -> Result<(), StreamClosed> {
        self.send(ChunkBody::thought(text)).await
    }

    pub async fn tool_call(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
    ) -> Result<(), StreamClosed> {
        self.send(ChunkBody::ToolCall {
            id: id.into(),
            name: name.into(),
            input,
        })
        .await
    }

    /// Emit the terminal completion chunk for a finished output
    pub async fn complete(&mut self, output: AgentOutput) -> Result<(), StreamClosed> {
        self.send(ChunkBody::Completion {
            answer: output.answer,
            citations: output.citations,
            usage: output.usage,
        })
        .await
    }

    /// Emit a completion built from the text streamed so far
    pub async fn complete_with_transcript(&mut self) -> Result<(), StreamClosed> {
        let answer = self.transcript.clone();
        self.send(ChunkBody::completion(answer)).await
    }

    /// Emit a terminal error chunk
    pub async fn fail(&mut self, code: ErrorCode, message: impl Into<String>) -> Result<(), StreamClosed> {
        self.send(ChunkBody::error(code, message)).await
    }

    /// Text accumulated from `Text` chunks in the current attempt
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// True once a completion or error chunk has been sent
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True once the consumer has dropped or cancelled the stream
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Chunks delivered since the sink was created or last retargeted
    pub fn sent_this_attempt(&self) -> u64 {
        self.sent_this_attempt
    }

    /// Point the sink at another backend for a fallback attempt
    pub fn retarget(&mut self, backend_id: impl Into<String>) {
        self.backend_id = backend_id.into();
        self.sent_this_attempt = 0;
        self.transcript.clear();
    }
}

/// Consumer side of a chunk stream.
///
/// Finite and single-consumer; it is not restartable. Calling [`cancel`] or
/// dropping the stream signals the producer to stop.
///
/// [`cancel`]: ChunkStream::cancel
pub struct ChunkStream {
    rx: mpsc::Receiver<AgentStreamChunk>,
    cancel: CancellationToken,
}

impl ChunkStream {
    pub fn new(rx: mpsc::Receiver<AgentStreamChunk>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Receive the next chunk, or None once the stream is finished or cancelled
    pub async fn recv(&mut self) -> Option<AgentStreamChunk> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            chunk = self.rx.recv() => chunk,
        }
    }

    /// Try to receive a chunk without waiting
    pub fn try_recv(&mut self) -> Option<AgentStreamChunk> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Stop delivery immediately; buffered chunks are discarded
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token shared with the producer, for cancelling from another task
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the stream to completion
    pub async fn collect_all(mut self) -> Vec<AgentStreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.recv().await {
            chunks.push(chunk);
        }
        chunks
    }
}

impl Stream for ChunkStream {
    type Item = AgentStreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
