//! Event-stream parsing for the fallback transport.
//!
//! Turns the chunked body of a `text/event-stream` response into one
//! string per event:
//! - bytes are buffered until a full line is available (`\n` or `\r\n`)
//! - `data:` lines accumulate, joined with `\n`, until a blank line ends the event
//! - comment lines (`:` prefix, used for keep-alives) and other fields are skipped
//! - an event left incomplete when the stream ends is dropped

use std::fmt::Display;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::warn;

/// Yield the data payload of every complete event in `byte_stream`.
pub fn parse_sse_events<S, E>(byte_stream: S) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), Vec::<String>::new()),
        |(mut stream, mut buffer, mut data)| async move {
            loop {
                if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line = buffer.split_to(newline + 1);
                    line.truncate(newline);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    let Ok(text) = std::str::from_utf8(&line) else {
                        continue;
                    };

                    if text.is_empty() {
                        if data.is_empty() {
                            continue;
                        }
                        let event = data.join("\n");
                        data.clear();
                        return Some((event, (stream, buffer, data)));
                    }
                    if let Some(value) = data_field(text) {
                        data.push(value.to_owned());
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        warn!(error = %e, "event stream read error");
                        return None;
                    }
                    None => return None,
                }
            }
        },
    )
}

/// Value of a `data` field line, or `None` for comments and other fields.
fn data_field(line: &str) -> Option<&str> {
    if line == "data" {
        return Some("");
    }
    let value = line.strip_prefix("data:")?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}
