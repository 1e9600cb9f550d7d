//! Server-sent event framing for the text stream.
//!
//! Lines are evaluated in this order:
//! - blank line: keep-alive, ignored
//! - `:` prefix: comment, ignored
//! - anything not starting with `data:`: unknown field, ignored
//! - `data: [DONE]`: end of stream, nothing after it is looked at
//! - other `data:` lines: JSON payload; unparseable payloads are skipped,
//!   otherwise every non-empty `candidates[].content.parts[].text` is yielded
//!
//! Input arrives in arbitrary byte chunks, so partial lines are buffered until
//! their newline shows up (or the stream ends).

use bytes::BytesMut;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, warn};

const DATA_PREFIX: &str = "data:";
const DONE_TOKEN: &str = "[DONE]";
/// A partial line longer than this is dropped and counted as malformed
const MAX_LINE: usize = 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<TextPart>,
}

#[derive(Debug, Default, Deserialize)]
struct TextPart {
    /// Kept loose: a non-string `text` is ignored instead of failing the payload
    #[serde(default)]
    text: Option<serde_json::Value>,
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Ignored,
    Malformed,
    Done,
    Chunks(Vec<String>),
}

fn classify(line: &str) -> Line {
    if line.is_empty() || line.starts_with(':') {
        return Line::Ignored;
    }
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return Line::Ignored;
    };
    let data = data.trim();
    if data == DONE_TOKEN {
        return Line::Done;
    }
    match serde_json::from_str::<StreamPayload>(data) {
        Ok(payload) => Line::Chunks(
            payload
                .candidates
                .into_iter()
                .flat_map(|c| c.content.parts)
                .filter_map(|part| match part.text {
                    Some(serde_json::Value::String(text)) if !text.is_empty() => Some(text),
                    _ => None,
                })
                .collect(),
        ),
        Err(e) => {
            debug!("skipping malformed event payload: {}", e);
            Line::Malformed
        }
    }
}

/// Incremental decoder: feed it bytes, get text chunks back
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    pending: BytesMut,
    /// Bytes of `pending` already known to hold no newline
    scanned: usize,
    /// Discarding the rest of an oversized line
    skipping: bool,
    finished: bool,
    malformed: u64,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the terminator line has been seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Payloads skipped because they were not valid JSON
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Consume a chunk of bytes and return the text chunks completed by it
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.pending.extend_from_slice(bytes);

        while let Some(offset) = self.pending[self.scanned..].iter().position(|&b| b == b'\n') {
            let newline = self.scanned + offset;
            let line = self.pending.split_to(newline + 1);
            self.scanned = 0;
            if std::mem::take(&mut self.skipping) {
                continue;
            }
            self.process(&line[..newline], &mut out);
            if self.finished {
                self.pending.clear();
                return out;
            }
        }
        self.scanned = self.pending.len();

        if self.pending.len() > MAX_LINE {
            warn!("dropping event stream line longer than {} bytes", MAX_LINE);
            self.pending.clear();
            self.scanned = 0;
            if !self.skipping {
                self.skipping = true;
                self.malformed += 1;
            }
        }
        out
    }

    /// The byte stream closed: whatever is left is the last line
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.finished && !self.skipping && !self.pending.is_empty() {
            let line = self.pending.split();
            self.process(&line, &mut out);
        }
        self.finished = true;
        out
    }

    fn process(&mut self, raw: &[u8], out: &mut Vec<String>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        match classify(&line) {
            Line::Ignored => {}
            Line::Malformed => self.malformed += 1,
            Line::Done => self.finished = true,
            Line::Chunks(chunks) => out.extend(chunks),
        }
    }
}

struct DecodeState<S> {
    bytes: Pin<Box<S>>,
    decoder: EventStreamDecoder,
    ready: VecDeque<String>,
    exhausted: bool,
}

/// Turn a byte stream (e.g. an HTTP response body) into a lazy stream of text
/// chunks. It ends at the terminator or when the byte stream closes; a
/// transport error is passed through once and ends the stream.
pub fn text_deltas<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: EventStreamDecoder::new(),
        ready: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.ready.pop_front() {
                return Some((Ok(chunk), state));
            }
            if state.exhausted || state.decoder.is_finished() {
                if state.decoder.malformed() > 0 {
                    debug!("skipped {} malformed event(s)", state.decoder.malformed());
                }
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    let chunks = state.decoder.feed(bytes.as_ref());
                    state.ready.extend(chunks);
                }
                Some(Err(e)) => {
                    state.exhausted = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.exhausted = true;
                    let chunks = state.decoder.finish();
                    state.ready.extend(chunks);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_line(text: &str) -> String {
        format!(
            "data: {{\"candidates\":[{{\"content\":{{\"parts\":[{{\"text\":\"{}\"}}]}}}}]}}\n",
            text
        )
    }

    async fn collect(parts: Vec<&'static str>) -> Vec<String> {
        let source = stream::iter(parts.into_iter().map(|p| Ok::<_, std::io::Error>(p.as_bytes())));
        text_deltas(source)
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
            .await
    }

    #[test]
    fn test_single_chunk_then_done() {
        let mut decoder = EventStreamDecoder::new();
        let out = decoder.feed(
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"A\"}]}}]}\n\ndata: [DONE]\n",
        );
        assert_eq!(out, vec!["A".to_string()]);
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_comment_does_not_terminate() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.feed(b":keep-alive\n").is_empty());
        assert!(!decoder.is_finished());
        assert_eq!(decoder.feed(chunk_line("still here").as_bytes()), vec!["still here"]);
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut decoder = EventStreamDecoder::new();
        let mut input = b"data: {\"candidates\": [oops\n".to_vec();
        input.extend_from_slice(chunk_line("ok").as_bytes());
        assert_eq!(decoder.feed(&input), vec!["ok"]);
        assert_eq!(decoder.malformed(), 1);
    }

    #[test]
    fn test_ignores_unknown_fields_and_empty_text() {
        let mut decoder = EventStreamDecoder::new();
        let input = concat!(
            "event: message\n",
            "id: 7\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"\"},{\"text\":5},{\"text\":\"x\"}]}},{\"content\":{\"parts\":[{\"text\":\"y\"}]}}]}\r\n",
            "data: {\"usageMetadata\":{}}\n",
        );
        assert_eq!(decoder.feed(input.as_bytes()), vec!["x", "y"]);
    }

    #[test]
    fn test_nothing_after_done() {
        let mut decoder = EventStreamDecoder::new();
        let mut input = b"data: [DONE]\n".to_vec();
        input.extend_from_slice(chunk_line("late").as_bytes());
        assert!(decoder.feed(&input).is_empty());
        assert!(decoder.feed(chunk_line("later").as_bytes()).is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_line_split_into_many_chunks() {
        let mut decoder = EventStreamDecoder::new();
        let line = chunk_line("split");
        let (head, tail) = line.as_bytes().split_at(line.len() - 1);
        for byte in head.chunks(3) {
            assert!(decoder.feed(byte).is_empty());
        }
        assert_eq!(decoder.feed(tail), vec!["split"]);
    }

    #[test]
    fn test_oversized_line_is_dropped() {
        let mut decoder = EventStreamDecoder::new();
        let filler = vec![b'x'; 64 * 1024];
        assert!(decoder.feed(b"data: ").is_empty());
        for _ in 0..(MAX_LINE / filler.len() + 1) {
            assert!(decoder.feed(&filler).is_empty());
        }
        assert_eq!(decoder.malformed(), 1);

        // The tail of the dropped line is discarded, the next line decodes
        let mut rest = b"yyy\n".to_vec();
        rest.extend_from_slice(chunk_line("after").as_bytes());
        assert_eq!(decoder.feed(&rest), vec!["after"]);
        assert_eq!(decoder.malformed(), 1);
    }

    #[tokio::test]
    async fn test_partial_lines_across_chunks() {
        let chunks = collect(vec![
            "data: {\"candidates\":[{\"content\":{\"par",
            "ts\":[{\"text\":\"Hel\"}]}}]}\n",
            "\n: ping\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}]}",
        ])
        .await;
        // The last line has no newline; it is flushed when the stream closes
        assert_eq!(chunks, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_stream_stops_at_done() {
        let chunks = collect(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"A\"}]}}]}\n\ndata: [DONE]\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"B\"}]}}]}\n",
        ])
        .await;
        assert_eq!(chunks, vec!["A"]);
    }

    #[tokio::test]
    async fn test_transport_error_is_passed_through() {
        let source = stream::iter(vec![
            Ok(chunk_line("first").into_bytes()),
            Err("connection reset"),
            Ok(chunk_line("never").into_bytes()),
        ]);
        let results: Vec<Result<String, &str>> = text_deltas(source).collect().await;
        assert_eq!(results, vec![Ok("first".to_string()), Err("connection reset")]);
    }
}
