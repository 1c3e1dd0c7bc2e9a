//! Line-oriented response streaming shared by the HTTP providers.
//!
//! Anthropic streams server-sent events and Ollama streams newline-delimited
//! JSON; both arrive as arbitrary byte chunks that have to be re-split on
//! newlines before a line can be parsed.
//!
//! Both protocols end with an explicit completion marker. A body that closes
//! before the marker is a truncated answer and ends the stream with an error.

use super::types::{ProviderError, Result, TextStream};
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;

/// What a single complete line contributed to the stream.
#[derive(Debug, PartialEq)]
pub(crate) enum LineEvent {
    Text(String),
    /// Final fragment, carried on the completion line itself
    Last(String),
    Skip,
    Done,
    Error(String),
}

pub(crate) const TRUNCATED_STREAM: &str = "response stream ended before completion";

struct LineState<S, F> {
    body: S,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String>>,
    body_finished: bool,
    stopped: bool,
    parse: F,
}

/// Turns a byte stream into ordered text fragments using `parse` per line.
pub(crate) fn line_stream<S, E, F>(body: S, parse: F) -> TextStream
where
    S: Stream<Item = std::result::Result<Vec<u8>, E>> + Send + Unpin + 'static,
    E: Into<ProviderError> + Send + 'static,
    F: FnMut(&str) -> LineEvent + Send + 'static,
{
    let state = LineState {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        body_finished: false,
        stopped: false,
        parse,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.stopped || state.body_finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.stopped = true;
                    state.pending.push_back(Err(e.into()));
                }
                None => {
                    state.body_finished = true;
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                        state.drain_lines();
                    }
                    if !state.stopped {
                        state.stopped = true;
                        state
                            .pending
                            .push_back(Err(ProviderError::Other(TRUNCATED_STREAM.to_string())));
                    }
                }
            }
        }
    })
    .boxed()
}

impl<S, F> LineState<S, F>
where
    F: FnMut(&str) -> LineEvent,
{
    fn drain_lines(&mut self) {
        while !self.stopped {
            let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = self.buffer.drain(..=newline_pos).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            match (self.parse)(line) {
                LineEvent::Text(text) => {
                    if !text.is_empty() {
                        self.pending.push_back(Ok(text));
                    }
                }
                LineEvent::Last(text) => {
                    if !text.is_empty() {
                        self.pending.push_back(Ok(text));
                    }
                    self.stopped = true;
                }
                LineEvent::Skip => {}
                LineEvent::Done => self.stopped = true,
                LineEvent::Error(message) => {
                    self.stopped = true;
                    self.pending.push_back(Err(ProviderError::Other(message)));
                }
            }
        }
    }
}
