//! Python handler: indentation-scanned defs and classes with docstrings.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::{
    load_utf8, split_chunk, HandlerResult, HandlerSymbol, LineIndex, ParseContext, ParserHandler,
    SpanChunk,
};

pub struct PythonHandler;

const NAME: &str = "python";
const VERSION: &str = "1.0.0";

fn def_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\s*)(?:async\s+)?(def|class)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
    })
}

#[derive(Debug)]
struct Block {
    kind: String,
    name: String,
    indent: usize,
    start: usize,
    end: usize,
    parent: Option<usize>,
    docstring: Option<String>,
}

impl ParserHandler for PythonHandler {
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
        let blocks = collect_blocks(&text);

        // Dotted symbol paths built through parent links.
        let mut paths: Vec<String> = Vec::with_capacity(blocks.len());
        for block in blocks.iter() {
            let symbol_path = match block.parent {
                Some(parent) => format!("{}.{}", paths[parent], block.name),
                None => block.name.clone(),
            };
            paths.push(symbol_path.clone());

            let symbol_id = format!("{NAME}:{symbol_path}");
            let mut metadata = super::span_metadata(&text, block.start, block.end, &index);
            metadata.insert("indent".to_string(), Value::Number(block.indent.into()));
            result.symbols.push(HandlerSymbol {
                symbol_id: symbol_id.clone(),
                name: block.name.clone(),
                kind: if block.kind == "class" {
                    "class".to_string()
                } else {
                    "function".to_string()
                },
                start_offset: block.start,
                end_offset: block.end,
                docstring: block.docstring.clone(),
                parent_id: block
                    .parent
                    .map(|parent| format!("{NAME}:{}", paths[parent])),
                metadata,
            });

            // Only top-level blocks become chunks; nested defs stay inside
            // their parent's text.
            if block.parent.is_none() {
                let segment = &text[block.start..block.end];
                let mut metadata = super::span_metadata(&text, block.start, block.end, &index);
                metadata.insert(
                    "symbol_path".to_string(),
                    Value::String(symbol_path.clone()),
                );
                let span = SpanChunk {
                    chunk_id: format!("{NAME}:{symbol_path}:{}:{}", block.start, block.end),
                    text: segment.to_string(),
                    start_offset: block.start,
                    end_offset: block.end,
                    parent_symbol_id: Some(symbol_id),
                    delegate: None,
                    metadata,
                };
                result.chunks.extend(split_chunk(span, cap, context.encoder));
            }
        }

        // Module-level preamble (imports, constants) ahead of the first
        // top-level block.
        let first_block_start = blocks
            .iter()
            .filter(|block| block.parent.is_none())
            .map(|block| block.start)
            .min()
            .unwrap_or(text.len());
        if first_block_start > 0 && !text[..first_block_start].trim().is_empty() {
            let mut metadata = super::span_metadata(&text, 0, first_block_start, &index);
            metadata.insert(
                "symbol_path".to_string(),
                Value::String("<module>".to_string()),
            );
            let span = SpanChunk {
                chunk_id: format!("{NAME}:<module>:0:{first_block_start}"),
                text: text[..first_block_start].to_string(),
                start_offset: 0,
                end_offset: first_block_start,
                parent_symbol_id: None,
                delegate: None,
                metadata,
            };
            result.chunks.extend(split_chunk(span, cap, context.encoder));
        }

        // A file with no defs at all still produces one module chunk.
        if result.chunks.is_empty() && !text.trim().is_empty() {
            let mut metadata = super::span_metadata(&text, 0, text.len(), &index);
            metadata.insert(
                "symbol_path".to_string(),
                Value::String("<module>".to_string()),
            );
            let span = SpanChunk {
                chunk_id: format!("{NAME}:<module>:0:{}", text.len()),
                text: text.clone(),
                start_offset: 0,
                end_offset: text.len(),
                parent_symbol_id: None,
                delegate: None,
                metadata,
            };
            result.chunks.extend(split_chunk(span, cap, context.encoder));
        }

        result
    }
}

/// Scan for `def`/`class` blocks, tracking nesting by indentation. Block
/// extent runs to the first subsequent non-blank line at the same or lower
/// indent; leading decorators attach to the block.
fn collect_blocks(text: &str) -> Vec<Block> {
    let lines = super::split_lines_keepends(text);
    let mut offsets = Vec::with_capacity(lines.len() + 1);
    let mut total = 0usize;
    for line in &lines {
        offsets.push(total);
        total += line.len();
    }
    offsets.push(total);

    let mut blocks: Vec<Block> = Vec::new();
    let mut open: Vec<usize> = Vec::new();

    for (line_no, line) in lines.iter().enumerate() {
        let Some(captures) = def_pattern().captures(line) else {
            continue;
        };
        let indent = captures[1].len();
        let kind = captures[2].to_string();
        let name = captures[3].to_string();

        // Pop open blocks this definition does not nest inside.
        while let Some(&candidate) = open.last() {
            if blocks[candidate].indent >= indent {
                open.pop();
            } else {
                break;
            }
        }
        let parent = open.last().copied();

        let mut start_line = line_no;
        while start_line > 0 {
            let previous = lines[start_line - 1].trim_start();
            if previous.starts_with('@') {
                start_line -= 1;
            } else {
                break;
            }
        }

        let mut end_line = line_no + 1;
        while end_line < lines.len() {
            let candidate = lines[end_line];
            if candidate.trim().is_empty() {
                end_line += 1;
                continue;
            }
            let candidate_indent =
                candidate.len() - candidate.trim_start_matches([' ', '\t']).len();
            if candidate_indent <= indent {
                break;
            }
            end_line += 1;
        }
        // Trim trailing blank lines out of the block.
        let mut effective_end = end_line;
        while effective_end > line_no + 1 && lines[effective_end - 1].trim().is_empty() {
            effective_end -= 1;
        }

        let docstring = extract_docstring(&lines, line_no + 1, effective_end);

        blocks.push(Block {
            kind,
            name,
            indent,
            start: offsets[start_line],
            end: offsets[effective_end],
            parent,
            docstring,
        });
        open.push(blocks.len() - 1);
    }

    blocks
}

fn extract_docstring(lines: &[&str], body_start: usize, body_end: usize) -> Option<String> {
    let (first_index, first) = lines[body_start..body_end]
        .iter()
        .enumerate()
        .find(|(_, line)| !line.trim().is_empty())?;
    let trimmed = first.trim();
    for quote in ["\"\"\"", "'''"] {
        if let Some(rest) = trimmed.strip_prefix(quote) {
            if rest.len() >= quote.len() {
                if let Some(inner) = rest.strip_suffix(quote) {
                    return Some(inner.trim().to_string());
                }
            }
            let mut collected = vec![rest.trim_end().to_string()];
            for line in &lines[body_start + first_index + 1..body_end] {
                if let Some(closing) = line.trim_end().strip_suffix(quote) {
                    collected.push(closing.trim().to_string());
                    return Some(collected.join("\n").trim().to_string());
                }
                collected.push(line.trim_end().to_string());
            }
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
import os

CONSTANT = 1


def top(value):
    \"\"\"Top-level helper.\"\"\"
    return value


class Widget:
    \"\"\"A widget.\"\"\"

    def method(self):
        return CONSTANT
";

    #[test]
    fn test_collect_blocks_finds_nested_defs() {
        let blocks = collect_blocks(SAMPLE);
        let names: Vec<&str> = blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["top", "Widget", "method"]);
        assert_eq!(blocks[2].parent, Some(1));
        assert_eq!(blocks[0].docstring.as_deref(), Some("Top-level helper."));
    }

    #[test]
    fn test_method_block_is_nested_inside_class() {
        let blocks = collect_blocks(SAMPLE);
        let class_block = &blocks[1];
        let method_block = &blocks[2];
        assert!(method_block.start >= class_block.start);
        assert!(method_block.end <= class_block.end);
    }
}
