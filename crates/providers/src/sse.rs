//! SSE streaming infrastructure for provider adapters.
//!
//! - [`drain_data_lines`] pulls complete `data:` payloads from a byte buffer
//! - [`sse_response_stream`] turns a response plus a parser into a `BoxStream`

use crate::util::from_reqwest;
use cf_domain::error::Result;
use cf_domain::stream::{BoxStream, StreamEvent};

/// Extract complete `data:` payloads from an SSE byte buffer.
///
/// Events are delimited by a blank line (`\n\n` or `\r\n\r\n`). Only
/// `data:` lines are kept. Bytes are buffered rather than text so a
/// multi-byte character split across network chunks is decoded intact.
///
/// The buffer is drained in-place; a trailing partial event stays for the
/// next call.
pub(crate) fn drain_data_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some((pos, delim_len)) = find_event_boundary(buffer) {
        let block: Vec<u8> = buffer.drain(..pos + delim_len).take(pos).collect();
        let block = String::from_utf8_lossy(&block);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Build a [`BoxStream`] from an SSE `reqwest::Response` and a parser
/// closure.
///
/// The closure receives each `data:` payload and returns zero or more
/// stream events. The remaining buffer is flushed when the body closes,
/// and a fallback `Done` is emitted if the parser never produced one.
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer: Vec<u8> = Vec::new();
        let mut done_emitted = false;

        loop {
            let data_lines = match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    drain_data_lines(&mut buffer)
                }
                Ok(None) => {
                    if buffer.iter().any(|b| !b.is_ascii_whitespace()) {
                        buffer.extend_from_slice(b"\n\n");
                    }
                    let lines = drain_data_lines(&mut buffer);
                    for data in lines {
                        for event in parse_data(&data) {
                            done_emitted |= matches!(&event, Ok(StreamEvent::Done { .. }));
                            yield event;
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    // A transport error ends the stream; no synthetic Done.
                    return;
                }
            };

            for data in data_lines {
                for event in parse_data(&data) {
                    done_emitted |= matches!(&event, Ok(StreamEvent::Done { .. }));
                    yield event;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
