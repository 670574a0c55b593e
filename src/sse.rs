//! Frames of the chat-completions event stream.
//!
//! The response body is a sequence of newline-delimited lines. Only lines
//! starting with `data:` carry anything; everything else (blank separators,
//! `event:` lines, `:` comments) is ignored.

use bytes::Bytes;
use serde::Deserialize;

use crate::error::ParseError;

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug)]
pub enum Frame {
    /// Incremental text; `content` may be empty (role-only or usage chunks).
    Delta {
        content: String,
        finish_reason: Option<String>,
    },
    Done,
    Ignored,
    Malformed(ParseError),
}

impl Frame {
    pub fn parse(line: &str) -> Frame {
        let line = line.trim_end_matches('\r');
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return Frame::Ignored;
        };
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            return Frame::Done;
        }

        match serde_json::from_str::<StreamChunk>(payload) {
            Ok(chunk) => {
                let first = chunk.choices.into_iter().next();
                let (content, finish_reason) = match first {
                    Some(choice) => (
                        choice.delta.and_then(|d| d.content).unwrap_or_default(),
                        choice.finish_reason,
                    ),
                    None => (String::new(), None),
                };
                Frame::Delta { content, finish_reason }
            }
            Err(e) => Frame::Malformed(ParseError::Json(e)),
        }
    }
}

/// Cuts a chunked byte stream into lines.
///
/// Bytes are held until a full line is available, so a UTF-8 sequence split
/// across two network chunks is decoded intact.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, without the
    /// trailing `\n`.
    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            lines.push(String::from_utf8_lossy(&line[..newline_pos]).into_owned());
        }
        lines
    }

    /// Returns whatever is left once the body is closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        match Frame::parse(r#"data: {"choices":[{"delta":{"content":"He"}}]}"#) {
            Frame::Delta { content, finish_reason } => {
                assert_eq!(content, "He");
                assert!(finish_reason.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn parses_finish_reason_with_empty_delta() {
        let frame = Frame::parse(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        match frame {
            Frame::Delta { content, finish_reason } => {
                assert!(content.is_empty());
                assert_eq!(finish_reason.as_deref(), Some("stop"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn zero_choices_is_an_empty_delta() {
        let frame = Frame::parse(r#"data: {"choices":[],"usage":{"total_tokens":3}}"#);
        assert!(matches!(frame, Frame::Delta { ref content, .. } if content.is_empty()));
    }

    #[test]
    fn recognizes_done_sentinel() {
        assert!(matches!(Frame::parse("data: [DONE]"), Frame::Done));
        assert!(matches!(Frame::parse("data:[DONE]\r"), Frame::Done));
    }

    #[test]
    fn non_data_lines_are_ignored() {
        assert!(matches!(Frame::parse(""), Frame::Ignored));
        assert!(matches!(Frame::parse(": keep-alive"), Frame::Ignored));
        assert!(matches!(Frame::parse("event: message"), Frame::Ignored));
    }

    #[test]
    fn bad_payload_is_malformed() {
        assert!(matches!(Frame::parse("data: {not json"), Frame::Malformed(_)));
    }

    #[test]
    fn splitter_holds_partial_lines() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&Bytes::from_static(b"data: one")).is_empty());
        let lines = splitter.push(&Bytes::from_static(b"\ndata: two\n\ndata: thr"));
        assert_eq!(lines, vec!["data: one", "data: two", ""]);
        assert_eq!(splitter.finish().as_deref(), Some("data: thr"));
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn splitter_keeps_multibyte_characters_across_chunks() {
        let text = "data: 内容\n".as_bytes();
        // split inside the first CJK character
        let (head, tail) = text.split_at(7);
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&Bytes::copy_from_slice(head)).is_empty());
        let lines = splitter.push(&Bytes::copy_from_slice(tail));
        assert_eq!(lines, vec!["data: 内容"]);
    }
}
