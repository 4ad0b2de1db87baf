//! Shared scaffolding for language-specific parser handlers.
//!
//! A handler turns one file into a normalized result of symbols and chunks.
//! Handlers never raise for per-file problems: read failures, non-UTF-8
//! input, and empty files all produce a result whose `errors` field carries
//! the explanation. Token counts are set by the handler, not deferred.

pub mod css;
pub mod html;
pub mod javascript;
pub mod markdown;
pub mod python;
pub mod text;

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::core::config::ParserSettings;
use crate::modules::hashing::sha256_hex;
use crate::modules::tokenizer::TokenEncoder;

/// Execution context shared with handlers during parsing.
pub struct ParseContext<'a> {
    pub source: &'a str,
    pub root: &'a Path,
    pub settings: &'a ParserSettings,
    pub encoder: &'a TokenEncoder,
}

impl ParseContext<'_> {
    /// Effective token cap for `handler`. `None` disables splitting.
    pub fn max_tokens(&self, handler: &str) -> Option<usize> {
        self.settings.handler_max_tokens(handler)
    }
}

/// Metadata describing the file a handler parsed.
#[derive(Debug, Clone)]
pub struct HandlerFile {
    pub path: PathBuf,
    pub language: String,
    pub encoding: String,
    pub checksum: Option<String>,
    pub metadata: Map<String, Value>,
}

impl HandlerFile {
    pub fn new(path: &Path, language: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            language: language.to_string(),
            encoding: "utf-8".to_string(),
            checksum: None,
            metadata: Map::new(),
        }
    }
}

/// Symbol extracted by a handler (function, class, heading, element).
#[derive(Debug, Clone)]
pub struct HandlerSymbol {
    pub symbol_id: String,
    pub name: String,
    pub kind: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub docstring: Option<String>,
    pub parent_id: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Chunk emitted by a handler, ready for persistence.
#[derive(Debug, Clone)]
pub struct HandlerChunk {
    pub chunk_id: String,
    pub text: String,
    pub token_count: Option<usize>,
    pub start_offset: usize,
    pub end_offset: usize,
    pub part_index: usize,
    pub parent_symbol_id: Option<String>,
    pub delegate: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Normalized structure returned by handlers after parsing.
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub file: HandlerFile,
    pub symbols: Vec<HandlerSymbol>,
    pub chunks: Vec<HandlerChunk>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl HandlerResult {
    pub fn new(file: HandlerFile) -> Self {
        Self {
            file,
            symbols: Vec::new(),
            chunks: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn empty(file: HandlerFile, errors: Vec<String>) -> Self {
        Self {
            file,
            symbols: Vec::new(),
            chunks: Vec::new(),
            warnings: Vec::new(),
            errors,
        }
    }
}

/// Contract implemented by concrete parser handlers.
pub trait ParserHandler: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn parse(&self, path: &Path, context: &ParseContext) -> HandlerResult;
}

/// Instantiate the handler registered under `name`.
pub fn handler_by_name(name: &str) -> Option<Box<dyn ParserHandler>> {
    match name {
        "text" => Some(Box::new(text::TextHandler)),
        "markdown" => Some(Box::new(markdown::MarkdownHandler)),
        "python" => Some(Box::new(python::PythonHandler)),
        "javascript" => Some(Box::new(javascript::JavaScriptHandler::javascript())),
        "typescript" => Some(Box::new(javascript::JavaScriptHandler::typescript())),
        "html" => Some(Box::new(html::HtmlHandler)),
        "css" => Some(Box::new(css::CssHandler)),
        _ => None,
    }
}

/// Read and decode a file for a handler. Failures yield a ready-made
/// empty result; callers return it as-is.
pub fn load_utf8(path: &Path, language: &str) -> Result<(String, HandlerFile), HandlerResult> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) => {
            let file = HandlerFile::new(path, language);
            return Err(HandlerResult::empty(
                file,
                vec![format!("Failed to read file: {err}")],
            ));
        }
    };

    let mut file = HandlerFile::new(path, language);
    file.checksum = Some(sha256_hex(&raw));
    file.metadata
        .insert("size_bytes".to_string(), Value::Number(raw.len().into()));

    match String::from_utf8(raw) {
        Ok(text) => {
            file.metadata.insert(
                "line_count".to_string(),
                Value::Number((text.matches('\n').count() + 1).into()),
            );
            Ok((text, file))
        }
        Err(_) => Err(HandlerResult::empty(
            file,
            vec![
                "File is not valid UTF-8; install a specialized handler or re-encode".to_string(),
            ],
        )),
    }
}

/// Byte offsets of line starts, for 1-based line lookups.
#[derive(Debug)]
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut starts = vec![0usize];
        for (index, byte) in text.bytes().enumerate() {
            if byte == b'\n' {
                starts.push(index + 1);
            }
        }
        Self { starts }
    }

    /// 1-based line containing the byte `offset`.
    pub fn line_for(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(index) => index + 1,
            Err(index) => index.max(1),
        }
    }
}

/// A logical span a handler wants persisted, before token-cap splitting.
pub struct SpanChunk {
    pub chunk_id: String,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub parent_symbol_id: Option<String>,
    pub delegate: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Split `span` against the effective token cap.
///
/// Under the cap, one part with `part_index = 0` and `part_total = 1` is
/// emitted. Over the cap, the text splits along line boundaries into parts
/// that each fit when possible; a single line that alone exceeds the cap is
/// emitted oversized. Every split part carries `overflow = true` and
/// `overflow_reason = "max_tokens"`.
pub fn split_chunk(span: SpanChunk, cap: Option<usize>, encoder: &TokenEncoder) -> Vec<HandlerChunk> {
    let total_tokens = encoder.count(&span.text);
    let within_cap = match cap {
        Some(cap) => total_tokens <= cap,
        None => true,
    };

    if within_cap {
        let mut metadata = span.metadata;
        metadata.insert("part_total".to_string(), Value::Number(1.into()));
        return vec![HandlerChunk {
            chunk_id: span.chunk_id,
            text: span.text,
            token_count: Some(total_tokens),
            start_offset: span.start_offset,
            end_offset: span.end_offset,
            part_index: 0,
            parent_symbol_id: span.parent_symbol_id,
            delegate: span.delegate,
            metadata,
        }];
    }

    let cap = cap.expect("cap is finite when splitting");
    let base_line = span
        .metadata
        .get("start_line")
        .and_then(Value::as_u64)
        .unwrap_or(1) as usize;

    // Greedy fill along line boundaries.
    let mut parts: Vec<(usize, usize)> = Vec::new();
    let mut segment_start = 0usize;
    let mut segment_tokens = 0usize;
    let mut cursor = 0usize;
    for line in split_lines_keepends(&span.text) {
        let line_tokens = encoder.count(line);
        if cursor > segment_start && segment_tokens + line_tokens > cap {
            parts.push((segment_start, cursor));
            segment_start = cursor;
            segment_tokens = 0;
        }
        segment_tokens += line_tokens;
        cursor += line.len();
    }
    if cursor > segment_start {
        parts.push((segment_start, cursor));
    }

    let part_total = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(part_index, (start, end))| {
            let part_text = span.text[start..end].to_string();
            let part_start_line = base_line + span.text[..start].matches('\n').count();
            let last_offset = part_text.len().saturating_sub(1);
            let part_end_line = part_start_line + part_text[..last_offset].matches('\n').count();

            let mut metadata = span.metadata.clone();
            metadata.insert(
                "start_line".to_string(),
                Value::Number(part_start_line.into()),
            );
            metadata.insert("end_line".to_string(), Value::Number(part_end_line.into()));
            metadata.insert("part_total".to_string(), Value::Number(part_total.into()));
            metadata.insert("overflow".to_string(), Value::Bool(true));
            metadata.insert(
                "overflow_reason".to_string(),
                Value::String("max_tokens".to_string()),
            );

            HandlerChunk {
                chunk_id: span.chunk_id.clone(),
                text: part_text.clone(),
                token_count: Some(encoder.count(&part_text)),
                start_offset: span.start_offset + start,
                end_offset: span.start_offset + end,
                part_index,
                parent_symbol_id: span.parent_symbol_id.clone(),
                delegate: span.delegate.clone(),
                metadata,
            }
        })
        .collect()
}

/// Lines of `text` including their terminators.
pub fn split_lines_keepends(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0usize;
    for (index, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            lines.push(&text[start..=index]);
            start = index + 1;
        }
    }
    if start < text.len() {
        lines.push(&text[start..]);
    }
    lines
}

/// Deterministic chunk identifier for delegated content:
/// `<delegate>:delegate:<parent_handler>:<component>:<start>:<end>[:marker]`.
pub fn delegated_chunk_id(
    delegate: &str,
    parent_handler: &str,
    component: &str,
    start_offset: usize,
    end_offset: usize,
    marker: Option<&str>,
) -> String {
    let mut parts = vec![
        delegate.trim().to_string(),
        "delegate".to_string(),
        parent_handler.trim().to_string(),
    ];
    let component = component.trim().replace(':', "-");
    if !component.is_empty() {
        parts.push(component);
    }
    parts.push(start_offset.to_string());
    parts.push(end_offset.to_string());
    if let Some(marker) = marker {
        parts.push(marker.to_string());
    }
    parts.join(":")
}

/// Metadata payload linking a delegated chunk back to its parent.
pub fn delegated_metadata(
    delegate: &str,
    parent_handler: &str,
    parent_symbol_id: &str,
    parent_chunk_id: Option<&str>,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(
        "delegate".to_string(),
        Value::String(delegate.to_string()),
    );
    payload.insert(
        "delegate_parent_handler".to_string(),
        Value::String(parent_handler.to_string()),
    );
    payload.insert(
        "delegate_parent_symbol".to_string(),
        Value::String(parent_symbol_id.to_string()),
    );
    if let Some(parent_chunk_id) = parent_chunk_id {
        payload.insert(
            "delegate_parent_chunk".to_string(),
            Value::String(parent_chunk_id.to_string()),
        );
    }
    payload
}

/// Span metadata common to every handler: line and char bounds.
pub fn span_metadata(
    text: &str,
    start_offset: usize,
    end_offset: usize,
    index: &LineIndex,
) -> Map<String, Value> {
    let mut metadata = Map::new();
    let start_line = index.line_for(start_offset);
    let end_line = index.line_for(end_offset.saturating_sub(1).max(start_offset));
    metadata.insert("start_line".to_string(), Value::Number(start_line.into()));
    metadata.insert("end_line".to_string(), Value::Number(end_line.into()));
    metadata.insert(
        "char_start".to_string(),
        Value::Number(text[..start_offset].chars().count().into()),
    );
    metadata.insert(
        "char_end".to_string(),
        Value::Number(text[..end_offset].chars().count().into()),
    );
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::tokenizer::TokenEncoderFactory;

    #[test]
    fn test_split_lines_keepends() {
        assert_eq!(split_lines_keepends("a\nb\n"), vec!["a\n", "b\n"]);
        assert_eq!(split_lines_keepends("a\nb"), vec!["a\n", "b"]);
        assert!(split_lines_keepends("").is_empty());
    }

    #[test]
    fn test_split_chunk_under_cap_is_single_part() {
        let factory = TokenEncoderFactory::new();
        let encoder = factory.fallback("cl100k_base");
        let span = SpanChunk {
            chunk_id: "text:0:4".to_string(),
            text: "body".to_string(),
            start_offset: 0,
            end_offset: 4,
            parent_symbol_id: None,
            delegate: None,
            metadata: Map::new(),
        };
        let chunks = split_chunk(span, Some(100), &encoder);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].part_index, 0);
        assert_eq!(chunks[0].metadata["part_total"], 1);
        assert!(chunks[0].metadata.get("overflow").is_none());
    }

    #[test]
    fn test_split_chunk_splits_on_line_boundaries() {
        let factory = TokenEncoderFactory::new();
        let encoder = factory.fallback("cl100k_base");
        // 8 lines of 8 chars -> 2 fallback tokens per line.
        let text = (0..8).map(|_| "abcdefg\n").collect::<String>();
        let span = SpanChunk {
            chunk_id: "text:0:64".to_string(),
            text,
            start_offset: 0,
            end_offset: 64,
            parent_symbol_id: None,
            delegate: None,
            metadata: Map::new(),
        };
        let chunks = split_chunk(span, Some(4), &encoder);
        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.text.len()).sum();
        assert_eq!(total, 64);
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.part_index, index);
            assert_eq!(chunk.metadata["part_total"], chunks.len());
            assert_eq!(chunk.metadata["overflow"], true);
            assert_eq!(chunk.metadata["overflow_reason"], "max_tokens");
            assert!(chunk.token_count.unwrap() <= 4);
        }
    }

    #[test]
    fn test_oversized_single_line_still_emits() {
        let factory = TokenEncoderFactory::new();
        let encoder = factory.fallback("cl100k_base");
        let text = "x".repeat(400);
        let span = SpanChunk {
            chunk_id: "text:0:400".to_string(),
            text,
            start_offset: 0,
            end_offset: 400,
            parent_symbol_id: None,
            delegate: None,
            metadata: Map::new(),
        };
        let chunks = split_chunk(span, Some(10), &encoder);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata["overflow"], true);
        assert!(chunks[0].token_count.unwrap() > 10);
    }

    #[test]
    fn test_delegated_chunk_id_shape() {
        let id = delegated_chunk_id("javascript", "html", "script", 10, 90, Some("2"));
        assert_eq!(id, "javascript:delegate:html:script:10:90:2");
    }
}
