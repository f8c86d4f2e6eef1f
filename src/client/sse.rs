//! Minimal server-sent events reader.
//!
//! Only `data:` fields matter here. Comment lines (keep-alives) and other
//! fields are skipped; multi-line data is joined with `\n`.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt::Display;

use super::transport::TransportError;

struct ReaderState<E> {
    bytes: BoxStream<'static, Result<Bytes, E>>,
    buffer: BytesMut,
    data: Vec<String>,
    /// The event being collected had a line that is not UTF-8
    corrupt: bool,
    done: bool,
}

/// Turn a byte stream into one item per complete SSE event.
///
/// A read error yields a single [`TransportError::StreamLost`] and ends the
/// stream. An event with a line that is not valid UTF-8 yields one
/// [`TransportError::Malformed`] in its place. An event cut off by end of
/// stream is discarded.
pub fn data_events<S, E>(byte_stream: S) -> impl Stream<Item = Result<String, TransportError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = ReaderState {
        bytes: byte_stream.boxed(),
        buffer: BytesMut::with_capacity(4096),
        data: Vec::new(),
        corrupt: false,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            if let Some(pos) = state.buffer.iter().position(|&b| b == b'\n') {
                let raw = state.buffer.split_to(pos + 1);
                let Ok(line) = std::str::from_utf8(&raw) else {
                    state.corrupt = true;
                    continue;
                };
                let line = line.trim_end_matches('\n').trim_end_matches('\r');

                if line.is_empty() {
                    if std::mem::take(&mut state.corrupt) {
                        state.data.clear();
                        let err = TransportError::Malformed("event is not valid UTF-8".to_string());
                        return Some((Err(err), state));
                    }
                    if !state.data.is_empty() {
                        let event = state.data.join("\n");
                        state.data.clear();
                        return Some((Ok(event), state));
                    }
                    continue;
                }

                if let Some(value) = extract_sse_data(line) {
                    state.data.push(value.to_string());
                }
                continue;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(TransportError::StreamLost(e.to_string())), state));
                }
                None => return None,
            }
        }
    })
}

/// Value of a `data:` line, or `None` for comments and other fields
fn extract_sse_data(line: &str) -> Option<&str> {
    if line.starts_with(':') {
        return None;
    }
    let value = line.strip_prefix("data:")?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}
