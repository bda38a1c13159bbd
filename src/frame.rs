//! Line-delimited JSON protocol frames for streamed query responses.
//!
//! A streamed response body is a sequence of newline-terminated JSON
//! documents ("frames"). Network chunks do not respect line boundaries, so
//! the decoder keeps the trailing partial line buffered between chunks.

use serde::Deserialize;

use crate::error::{Error, Result, ServerError};
use crate::types::Column;

/// One self-contained frame of a streamed response.
///
/// Exactly one `Start` precedes any `Data`; exactly one of the finish frames
/// terminates the stream; no frame follows a finish.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "message_type")]
pub enum Frame {
    /// Column metadata, sent once before any data.
    #[serde(rename = "START")]
    Start {
        /// Columns in declaration order.
        result_columns: Vec<Column>,
    },

    /// A batch of raw positional rows.
    #[serde(rename = "DATA")]
    Data {
        /// Raw rows; each aligns to the `START` column order.
        data: Vec<Vec<serde_json::Value>>,
    },

    /// Successful logical end of the result.
    #[serde(rename = "FINISH_SUCCESSFULLY")]
    FinishOk,

    /// The query failed; carries one or more structured errors.
    #[serde(rename = "FINISH_WITH_ERRORS")]
    FinishError {
        /// Backend errors in report order.
        errors: Vec<ServerError>,
    },
}

/// Reassembles frames from arbitrary byte chunks.
///
/// Any JSON parse failure or unrecognized `message_type` fails the whole
/// stream; there is no skip-and-continue path.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let line = &self.buf[start..start + pos];
            if !line.trim_ascii().is_empty() {
                frames.push(parse_frame(line)?);
            }
            start += pos + 1;
        }
        self.buf.drain(..start);
        Ok(frames)
    }

    /// Signal end-of-input; parses a remaining unterminated line, if any.
    pub fn finish(&mut self) -> Result<Option<Frame>> {
        let rest = std::mem::take(&mut self.buf);
        if rest.trim_ascii().is_empty() {
            return Ok(None);
        }
        parse_frame(&rest).map(Some)
    }
}

fn parse_frame(line: &[u8]) -> Result<Frame> {
    serde_json::from_slice(line).map_err(|e| Error::Parse {
        message: format!(
            "invalid protocol frame: {} in {:?}",
            e,
            String::from_utf8_lossy(line)
        ),
    })
}
