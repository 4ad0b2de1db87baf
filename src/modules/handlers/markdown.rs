//! Markdown handler: heading sections with fenced-code delegation.
//!
//! The document splits into sections at ATX headings. Fenced code blocks
//! whose info string names a recognized language are additionally emitted
//! as delegate chunks owned by that language's handler, linked back to the
//! enclosing section chunk and symbol.

use std::path::Path;

use serde_json::Value;

use super::{
    delegated_chunk_id, delegated_metadata, load_utf8, split_chunk, HandlerResult, HandlerSymbol,
    LineIndex, ParseContext, ParserHandler, SpanChunk,
};

pub struct MarkdownHandler;

const NAME: &str = "markdown";
const VERSION: &str = "1.0.0";

struct Section {
    title: String,
    level: usize,
    start: usize,
    end: usize,
}

struct Fence {
    language: String,
    body_start: usize,
    body_end: usize,
}

impl ParserHandler for MarkdownHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn parse(&self, path: &Path, context: &ParseContext) -> HandlerResult {
        let (text, file) = match load_utf8(path, NAME) {
            Ok(loaded) => loaded,
            Err(failed) => return failed,
        };
        let mut result = HandlerResult::new(file);
        if text.is_empty() {
            return result;
        }

        let index = LineIndex::new(&text);
        let cap = context.max_tokens(NAME);
        let sections = collect_sections(&text);
        let fences = collect_fences(&text);

        for (ordinal, section) in sections.iter().enumerate() {
            let symbol_id = format!("{NAME}:heading:{}", section.start);
            let mut symbol_metadata = super::span_metadata(&text, section.start, section.end, &index);
            symbol_metadata.insert("level".to_string(), Value::Number(section.level.into()));
            result.symbols.push(HandlerSymbol {
                symbol_id: symbol_id.clone(),
                name: section.title.clone(),
                kind: "heading".to_string(),
                start_offset: section.start,
                end_offset: section.end,
                docstring: None,
                parent_id: None,
                metadata: symbol_metadata,
            });

            let segment = &text[section.start..section.end];
            if segment.trim().is_empty() {
                continue;
            }
            let section_chunk_id = format!("{NAME}:section:{}:{}", section.start, section.end);
            let mut metadata = super::span_metadata(&text, section.start, section.end, &index);
            metadata.insert("title".to_string(), Value::String(section.title.clone()));
            metadata.insert("ordinal".to_string(), Value::Number(ordinal.into()));
            let span = SpanChunk {
                chunk_id: section_chunk_id.clone(),
                text: segment.to_string(),
                start_offset: section.start,
                end_offset: section.end,
                parent_symbol_id: Some(symbol_id.clone()),
                delegate: None,
                metadata,
            };
            result.chunks.extend(split_chunk(span, cap, context.encoder));

            for fence in fences
                .iter()
                .filter(|f| f.body_start >= section.start && f.body_end <= section.end)
            {
                let Some(delegate) = delegate_for_language(&fence.language) else {
                    continue;
                };
                let body = &text[fence.body_start..fence.body_end];
                if body.trim().is_empty() {
                    continue;
                }
                let chunk_id = delegated_chunk_id(
                    delegate,
                    NAME,
                    "fence",
                    fence.body_start,
                    fence.body_end,
                    None,
                );
                let mut metadata =
                    super::span_metadata(&text, fence.body_start, fence.body_end, &index);
                for (key, value) in
                    delegated_metadata(delegate, NAME, &symbol_id, Some(&section_chunk_id))
                {
                    metadata.insert(key, value);
                }
                metadata.insert(
                    "fence_language".to_string(),
                    Value::String(fence.language.clone()),
                );
                let span = SpanChunk {
                    chunk_id,
                    text: body.to_string(),
                    start_offset: fence.body_start,
                    end_offset: fence.body_end,
                    parent_symbol_id: Some(symbol_id.clone()),
                    delegate: Some(delegate.to_string()),
                    metadata,
                };
                result
                    .chunks
                    .extend(split_chunk(span, context.max_tokens(delegate), context.encoder));
            }
        }

        result
    }
}

/// Sections bounded by ATX headings. Content before the first heading
/// becomes a synthetic "preamble" section.
fn collect_sections(text: &str) -> Vec<Section> {
    let mut headings: Vec<(usize, usize, String)> = Vec::new();
    let mut offset = 0usize;
    let mut in_fence = false;
    for line in super::split_lines_keepends(text) {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence && trimmed.starts_with('#') {
            let level = trimmed.bytes().take_while(|b| *b == b'#').count();
            if level <= 6 && trimmed[level..].starts_with([' ', '\t']) {
                let title = trimmed[level..].trim().trim_end_matches('#').trim();
                headings.push((offset, level, title.to_string()));
            }
        }
        offset += line.len();
    }

    let mut sections = Vec::new();
    if headings.is_empty() {
        sections.push(Section {
            title: "preamble".to_string(),
            level: 0,
            start: 0,
            end: text.len(),
        });
        return sections;
    }

    if headings[0].0 > 0 && !text[..headings[0].0].trim().is_empty() {
        sections.push(Section {
            title: "preamble".to_string(),
            level: 0,
            start: 0,
            end: headings[0].0,
        });
    }
    for (position, (start, level, title)) in headings.iter().enumerate() {
        let end = headings
            .get(position + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(text.len());
        sections.push(Section {
            title: title.clone(),
            level: *level,
            start: *start,
            end,
        });
    }
    sections
}

/// Fenced code blocks with their info-string language and body bounds.
fn collect_fences(text: &str) -> Vec<Fence> {
    let mut fences = Vec::new();
    let mut offset = 0usize;
    let mut open: Option<(String, usize)> = None;
    for line in super::split_lines_keepends(text) {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            match open.take() {
                None => {
                    let language = trimmed
                        .trim_start_matches('`')
                        .trim()
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_lowercase();
                    open = Some((language, offset + line.len()));
                }
                Some((language, body_start)) => {
                    fences.push(Fence {
                        language,
                        body_start,
                        body_end: offset,
                    });
                }
            }
        }
        offset += line.len();
    }
    fences
}

fn delegate_for_language(language: &str) -> Option<&'static str> {
    match language {
        "python" | "py" => Some("python"),
        "javascript" | "js" | "jsx" => Some("javascript"),
        "typescript" | "ts" | "tsx" => Some("typescript"),
        "css" => Some("css"),
        "html" => Some("html"),
        _ => None,
    }
}
