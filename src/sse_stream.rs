//! Server-Sent Events framing for job status streams.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::{Stream, StreamExt};
use memchr::memmem;

use crate::Error;

/// Largest event accepted before the stream is treated as broken.
const MAX_PENDING_BYTES: usize = 1 << 20;

/// One decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental decoder: feed it bytes, take out complete events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, Error> {
        if chunk.contains(&b'\r') {
            self.pending
                .extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        } else {
            self.pending.extend_from_slice(chunk);
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            self.pending.clear();
            return Err(Error::transient("status stream", "event exceeded maximum size"));
        }

        let finder = memmem::Finder::new(b"\n\n");
        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = finder.find(&self.pending[consumed..]) {
            let block = &self.pending[consumed..consumed + pos];
            let text = std::str::from_utf8(block).map_err(|e| {
                Error::transient("status stream", format!("invalid UTF-8 in event: {e}"))
            })?;
            events.extend(parse_block(text));
            consumed += pos + 2;
        }
        self.pending.drain(..consumed);
        Ok(events)
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.pending);
        std::str::from_utf8(&rest).ok().and_then(parse_block)
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut id = None;
    let mut data: Option<String> = None;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "id" => id = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    data.map(|data| SseEvent { event, data, id })
}

/// Byte stream adapter yielding decoded events.
pub struct SseStream<S> {
    inner: S,
    decoder: SseDecoder,
    ready: VecDeque<SseEvent>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, B, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    type Item = Result<SseEvent, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    let events = self.decoder.push(chunk.as_ref())?;
                    self.ready.extend(events);
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(Error::transient(
                        "status stream",
                        format!("connection dropped: {e}"),
                    ))));
                }
                None => {
                    self.done = true;
                    if let Some(event) = self.decoder.finish() {
                        self.ready.push_back(event);
                    }
                }
            }
        }
    }
}

/// Adds `.sse_events()` to byte streams.
pub trait SseStreamExt: Stream + Sized {
    fn sse_events(self) -> SseStream<Self> {
        SseStream::new(self)
    }
}

impl<S: Stream> SseStreamExt for S {}
