//! Per-query result handles: buffered [`Statement`] and streaming
//! [`StreamStatement`], plus the options accepted by `execute`.

use std::collections::BTreeMap;

use async_stream::stream;
use futures::StreamExt;
use serde::Deserialize;

use crate::channel::{FlowState, RowStream, DEFAULT_HIGH_WATERMARK};
use crate::error::{CompositeError, Error, Result, ServerError};
use crate::frame::{Frame, FrameDecoder};
use crate::hydrate::RowHydrator;
use crate::types::{Column, QueryResult, Statistics};

/// Options for one query execution.
///
/// # Example
///
/// ```ignore
/// let options = ExecuteOptions::default()
///     .with_parameter("42")
///     .with_setting("query_label", "nightly")
///     .normalize_data(true);
/// let statement = connection.execute("SELECT ?", options).await?;
/// ```
#[derive(Clone, Debug)]
pub struct ExecuteOptions {
    /// Positional parameters spliced for `?` placeholders, in order. Each
    /// value is pre-rendered SQL literal text; escaping is the caller's
    /// concern.
    pub parameters: Vec<String>,
    /// Named parameters spliced for `:name` placeholders.
    pub named_parameters: BTreeMap<String, String>,
    /// Per-query settings overlaid onto the session parameters for this
    /// request only (e.g. `output_format`).
    pub settings: BTreeMap<String, String>,
    /// Reshape rows into name-to-value mappings instead of positional rows.
    pub normalize_data: bool,
    /// Render arbitrary-precision decimals as text.
    pub big_number_as_string: bool,
    /// Pending-row count above which the streamed source is paused.
    pub high_watermark: usize,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            parameters: Vec::new(),
            named_parameters: BTreeMap::new(),
            settings: BTreeMap::new(),
            normalize_data: false,
            big_number_as_string: false,
            high_watermark: DEFAULT_HIGH_WATERMARK,
        }
    }
}

impl ExecuteOptions {
    /// Append one positional parameter.
    pub fn with_parameter(mut self, value: impl Into<String>) -> Self {
        self.parameters.push(value.into());
        self
    }

    /// Set one named parameter.
    pub fn with_named_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.named_parameters.insert(name.into(), value.into());
        self
    }

    /// Set one per-query setting.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Select mapped rows instead of positional rows.
    pub fn normalize_data(mut self, normalize: bool) -> Self {
        self.normalize_data = normalize;
        self
    }

    /// Render decimals as text instead of `Value::Decimal`.
    pub fn big_number_as_string(mut self, as_string: bool) -> Self {
        self.big_number_as_string = as_string;
        self
    }

    /// Override the streaming high watermark.
    pub fn high_watermark(mut self, rows: usize) -> Self {
        self.high_watermark = rows;
        self
    }
}

/// Splice positional and named parameters into the query text.
///
/// Placeholders inside single-quoted literals are left alone. Values are
/// inserted verbatim as pre-rendered SQL text.
pub(crate) fn expand_query(sql: &str, options: &ExecuteOptions) -> Result<String> {
    if options.parameters.is_empty() && options.named_parameters.is_empty() {
        return Ok(sql.to_string());
    }

    let mut out = String::with_capacity(sql.len());
    let mut positional = options.parameters.iter();
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;

    while let Some((_, c)) = chars.next() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '?' if !in_literal => {
                let value = positional.next().ok_or_else(|| {
                    Error::Configuration(
                        "query has more '?' placeholders than parameters".to_string(),
                    )
                })?;
                out.push_str(value);
            }
            ':' if !in_literal => {
                // `::` casts are not placeholders.
                if matches!(chars.peek(), Some(&(_, ':'))) {
                    chars.next();
                    out.push_str("::");
                    continue;
                }
                let mut name = String::new();
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match options.named_parameters.get(&name) {
                    Some(value) => out.push_str(value),
                    None if name.is_empty() => out.push(':'),
                    None => {
                        return Err(Error::Configuration(format!(
                            "no value provided for named parameter ':{}'",
                            name
                        )));
                    }
                }
            }
            _ => out.push(c),
        }
    }

    if positional.next().is_some() {
        return Err(Error::Configuration(
            "more parameters than '?' placeholders in the query".to_string(),
        ));
    }
    Ok(out)
}

/// Raw shape of a complete buffered response document.
#[derive(Debug, Deserialize)]
struct BufferedDocument {
    #[serde(default)]
    meta: Vec<Column>,
    #[serde(default)]
    data: Vec<Vec<serde_json::Value>>,
    statistics: Option<Statistics>,
    #[serde(default)]
    errors: Vec<ServerError>,
}

/// Result handle for a buffered query. Owns exactly one decoded result.
#[derive(Debug)]
pub struct Statement {
    result: QueryResult,
}

impl Statement {
    /// Decode one complete response document into hydrated rows.
    pub(crate) fn decode(body: &str, options: &ExecuteOptions) -> Result<Self> {
        // Side-effect statements answer with an empty body.
        if body.trim().is_empty() {
            return Ok(Self {
                result: QueryResult::default(),
            });
        }

        let doc: BufferedDocument = serde_json::from_str(body)?;
        if !doc.errors.is_empty() {
            return Err(CompositeError::new(doc.errors).into());
        }

        let hydrator =
            RowHydrator::new(&doc.meta, options.normalize_data, options.big_number_as_string);
        let mut data = Vec::with_capacity(doc.data.len());
        for raw in &doc.data {
            data.push(hydrator.decode(raw)?);
        }
        Ok(Self {
            result: QueryResult {
                meta: doc.meta,
                data,
                statistics: doc.statistics,
            },
        })
    }

    /// Take the complete result: metadata, hydrated rows, statistics.
    pub fn fetch_result(self) -> QueryResult {
        self.result
    }
}

/// Result handle for a streamed query. Owns the live response body; rows are
/// consumed once and cannot be replayed.
pub struct StreamStatement {
    response: reqwest::Response,
    options: ExecuteOptions,
}

impl StreamStatement {
    pub(crate) fn new(response: reqwest::Response, options: ExecuteOptions) -> Self {
        Self { response, options }
    }

    /// Read frames until the column metadata arrives, then return it together
    /// with the lazy row sequence.
    ///
    /// The sequence is finite and one-shot; dropping it releases the
    /// transport (after resuming a paused source).
    pub async fn stream_result(self) -> Result<(Vec<Column>, RowStream)> {
        let options = self.options;
        let mut body = self.response.bytes_stream().fuse();
        let mut decoder = FrameDecoder::new();

        // Pump until START so the caller gets metadata up front. Frames that
        // arrived in the same chunk are replayed into the row stream below.
        let mut buffered = Vec::new();
        let hydrator = loop {
            let frames = match body.next().await {
                Some(Ok(chunk)) => decoder.feed(&chunk)?,
                Some(Err(e)) => return Err(e.into()),
                None => match decoder.finish()? {
                    Some(frame) => vec![frame],
                    None => {
                        return Err(Error::Parse {
                            message: "stream ended before any protocol frame".to_string(),
                        });
                    }
                },
            };
            let mut frames = frames.into_iter();
            match frames.next() {
                Some(Frame::Start { result_columns }) => {
                    buffered.extend(frames);
                    break RowHydrator::new(
                        &result_columns,
                        options.normalize_data,
                        options.big_number_as_string,
                    );
                }
                Some(Frame::FinishOk) => {
                    // A result-less statement: empty column set, empty stream.
                    return Ok((Vec::new(), Box::pin(futures::stream::empty())));
                }
                Some(Frame::FinishError { errors }) => {
                    return Err(CompositeError::new(errors).into());
                }
                Some(Frame::Data { .. }) => {
                    return Err(Error::Parse {
                        message: "DATA frame received before START".to_string(),
                    });
                }
                None => continue,
            }
        };

        let columns = hydrator.columns().to_vec();
        let mut flow = FlowState::new(options.high_watermark);

        let rows = stream! {
            for frame in buffered {
                if let Err(e) = apply_frame(frame, &hydrator, &mut flow) {
                    flow.resume_for_teardown();
                    yield Err(e);
                    return;
                }
            }

            loop {
                // Deliver every queued row before touching the network
                // again: a ready consumer is never starved behind a slow
                // source, and the source is only read once the queue is
                // drained, which clears any pause along the way.
                while let (Some(row), _action) = flow.pop() {
                    yield Ok(row);
                }
                if flow.is_complete() {
                    return;
                }

                match body.next().await {
                    Some(Ok(chunk)) => {
                        let frames = match decoder.feed(&chunk) {
                            Ok(frames) => frames,
                            Err(e) => {
                                flow.resume_for_teardown();
                                yield Err(e);
                                return;
                            }
                        };
                        for frame in frames {
                            if let Err(e) = apply_frame(frame, &hydrator, &mut flow) {
                                flow.resume_for_teardown();
                                yield Err(e);
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        flow.resume_for_teardown();
                        yield Err(e.into());
                        return;
                    }
                    None => {
                        match decoder.finish() {
                            Ok(Some(frame)) => {
                                if let Err(e) = apply_frame(frame, &hydrator, &mut flow) {
                                    yield Err(e);
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                        if !flow.is_finished() {
                            yield Err(Error::Parse {
                                message: "stream ended before a finish frame".to_string(),
                            });
                            return;
                        }
                    }
                }
            }
        };

        Ok((columns, Box::pin(rows)))
    }
}

/// Fold one frame into the flow state.
fn apply_frame(frame: Frame, hydrator: &RowHydrator, flow: &mut FlowState) -> Result<()> {
    if flow.is_finished() {
        return Err(Error::Parse {
            message: "protocol frame received after the finish frame".to_string(),
        });
    }
    match frame {
        Frame::Start { .. } => Err(Error::Parse {
            message: "second START frame in one stream".to_string(),
        }),
        Frame::Data { data } => {
            let mut rows = Vec::with_capacity(data.len());
            for raw in &data {
                rows.push(hydrator.decode(raw)?);
            }
            flow.push_rows(rows);
            Ok(())
        }
        Frame::FinishOk => {
            flow.finish();
            Ok(())
        }
        Frame::FinishError { errors } => Err(CompositeError::new(errors).into()),
    }
}
