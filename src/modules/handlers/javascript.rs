//! JavaScript/TypeScript handler with JSX delegation to the HTML handler.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::{
    delegated_chunk_id, delegated_metadata, load_utf8, split_chunk, HandlerResult, HandlerSymbol,
    LineIndex, ParseContext, ParserHandler, SpanChunk,
};

pub struct JavaScriptHandler {
    name: &'static str,
}

const VERSION: &str = "1.0.0";

impl JavaScriptHandler {
    pub fn javascript() -> Self {
        Self { name: "javascript" }
    }

    pub fn typescript() -> Self {
        Self { name: "typescript" }
    }
}

fn declaration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?m)^(?:export\s+)?(?:default\s+)?(?:async\s+)?(function\s+([A-Za-z_$][\w$]*)|class\s+([A-Za-z_$][\w$]*)|(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=)",
        )
        .unwrap()
    })
}

fn jsx_return_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"return\s*\(\s*<").unwrap())
}

#[derive(Debug)]
struct Declaration {
    name: String,
    kind: &'static str,
    start: usize,
    end: usize,
}

impl ParserHandler for JavaScriptHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn parse(&self, path: &Path, context: &ParseContext) -> HandlerResult {
        let (text, file) = match load_utf8(path, self.name) {
            Ok(loaded) => loaded,
            Err(failed) => return failed,
        };
        let mut result = HandlerResult::new(file);
        if text.is_empty() {
            return result;
        }

        let index = LineIndex::new(&text);
        let cap = context.max_tokens(self.name);
        let declarations = collect_declarations(&text);

        for declaration in &declarations {
            let symbol_id = format!("{}:{}", self.name, declaration.name);
            let mut symbol_metadata =
                super::span_metadata(&text, declaration.start, declaration.end, &index);
            symbol_metadata.insert(
                "declaration".to_string(),
                Value::String(declaration.kind.to_string()),
            );
            result.symbols.push(HandlerSymbol {
                symbol_id: symbol_id.clone(),
                name: declaration.name.clone(),
                kind: declaration.kind.to_string(),
                start_offset: declaration.start,
                end_offset: declaration.end,
                docstring: None,
                parent_id: None,
                metadata: symbol_metadata,
            });

            let segment = &text[declaration.start..declaration.end];
            let chunk_id = format!(
                "{}:{}:{}:{}",
                self.name, declaration.name, declaration.start, declaration.end
            );
            let metadata = super::span_metadata(&text, declaration.start, declaration.end, &index);
            let span = SpanChunk {
                chunk_id: chunk_id.clone(),
                text: segment.to_string(),
                start_offset: declaration.start,
                end_offset: declaration.end,
                parent_symbol_id: Some(symbol_id.clone()),
                delegate: None,
                metadata,
            };
            result.chunks.extend(split_chunk(span, cap, context.encoder));

            // JSX subtrees are handed to the HTML handler as delegates.
            if let Some((jsx_start, jsx_end)) = find_jsx_region(&text, declaration) {
                let body = &text[jsx_start..jsx_end];
                if !body.trim().is_empty() {
                    let delegate_id =
                        delegated_chunk_id("html", self.name, "jsx", jsx_start, jsx_end, None);
                    let mut metadata = super::span_metadata(&text, jsx_start, jsx_end, &index);
                    for (key, value) in
                        delegated_metadata("html", self.name, &symbol_id, Some(&chunk_id))
                    {
                        metadata.insert(key, value);
                    }
                    let span = SpanChunk {
                        chunk_id: delegate_id,
                        text: body.to_string(),
                        start_offset: jsx_start,
                        end_offset: jsx_end,
                        parent_symbol_id: Some(symbol_id),
                        delegate: Some("html".to_string()),
                        metadata,
                    };
                    result
                        .chunks
                        .extend(split_chunk(span, context.max_tokens("html"), context.encoder));
                }
            }
        }

        // Imports and loose statements ahead of the first declaration.
        let first_start = declarations
            .iter()
            .map(|declaration| declaration.start)
            .min()
            .unwrap_or(text.len());
        if first_start > 0 && !text[..first_start].trim().is_empty() {
            let metadata = super::span_metadata(&text, 0, first_start, &index);
            let span = SpanChunk {
                chunk_id: format!("{}:<module>:0:{first_start}", self.name),
                text: text[..first_start].to_string(),
                start_offset: 0,
                end_offset: first_start,
                parent_symbol_id: None,
                delegate: None,
                metadata,
            };
            result.chunks.extend(split_chunk(span, cap, context.encoder));
        }

        if result.chunks.is_empty() && !text.trim().is_empty() {
            let metadata = super::span_metadata(&text, 0, text.len(), &index);
            let span = SpanChunk {
                chunk_id: format!("{}:<module>:0:{}", self.name, text.len()),
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

/// Top-level declarations with brace-matched extents.
fn collect_declarations(text: &str) -> Vec<Declaration> {
    let mut declarations = Vec::new();
    for captures in declaration_pattern().captures_iter(text) {
        let full = captures.get(0).expect("match always has group 0");
        let (name, kind): (String, &'static str) = if let Some(name) = captures.get(2) {
            (name.as_str().to_string(), "function")
        } else if let Some(name) = captures.get(3) {
            (name.as_str().to_string(), "class")
        } else if let Some(name) = captures.get(4) {
            (name.as_str().to_string(), "binding")
        } else {
            continue;
        };

        let end = declaration_end(text, full.start());
        declarations.push(Declaration {
            name,
            kind,
            start: full.start(),
            end,
        });
    }

    // Drop declarations nested inside an earlier declaration's extent.
    let mut top_level: Vec<Declaration> = Vec::new();
    for declaration in declarations {
        let nested = top_level
            .iter()
            .any(|outer| declaration.start > outer.start && declaration.start < outer.end);
        if !nested {
            top_level.push(declaration);
        }
    }
    top_level
}

/// Extent of a declaration starting at `start`: the matching close brace of
/// its first block, or the end of the statement when no block opens.
fn declaration_end(text: &str, start: usize) -> usize {
    let bytes = text.as_bytes();
    let mut cursor = start;
    let mut depth = 0usize;
    let mut seen_brace = false;
    let mut in_string: Option<u8> = None;

    while cursor < bytes.len() {
        let byte = bytes[cursor];
        if let Some(quote) = in_string {
            if byte == b'\\' {
                cursor += 2;
                continue;
            }
            if byte == quote {
                in_string = None;
            }
            cursor += 1;
            continue;
        }
        match byte {
            b'"' | b'\'' | b'`' => in_string = Some(byte),
            b'{' => {
                depth += 1;
                seen_brace = true;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if seen_brace && depth == 0 {
                    // Consume a trailing semicolon/newline.
                    let mut end = cursor + 1;
                    while end < bytes.len() && (bytes[end] == b';' || bytes[end] == b'\r') {
                        end += 1;
                    }
                    if end < bytes.len() && bytes[end] == b'\n' {
                        end += 1;
                    }
                    return end;
                }
            }
            b'\n' if !seen_brace => {
                // Statement without a block (e.g. `const x = 1;`).
                let line_end = cursor + 1;
                let line = &text[start..cursor];
                if line.trim_end().ends_with(';') || !line.trim_end().ends_with(['=', ',', '(']) {
                    return line_end;
                }
            }
            _ => {}
        }
        cursor += 1;
    }
    text.len()
}

/// JSX region inside a declaration: from `return (<` to the matching close
/// paren.
fn find_jsx_region(text: &str, declaration: &Declaration) -> Option<(usize, usize)> {
    let body = &text[declaration.start..declaration.end];
    let matched = jsx_return_pattern().find(body)?;
    let open_paren = declaration.start + matched.start() + body[matched.start()..].find('(')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut cursor = open_paren;
    while cursor < declaration.end {
        match bytes[cursor] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    let start = open_paren + 1;
                    return Some((start, cursor));
                }
            }
            _ => {}
        }
        cursor += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
import { thing } from './thing';

export function renderBadge(props) {
    return (
        <div className=\"badge\">{props.label}</div>
    );
}

const helper = (value) => {
    return value * 2;
};
";

    #[test]
    fn test_collect_declarations() {
        let declarations = collect_declarations(SAMPLE);
        let names: Vec<&str> = declarations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["renderBadge", "helper"]);
    }

    #[test]
    fn test_jsx_region_detected() {
        let declarations = collect_declarations(SAMPLE);
        let region = find_jsx_region(SAMPLE, &declarations[0]).unwrap();
        assert!(SAMPLE[region.0..region.1].contains("className"));
    }

    #[test]
    fn test_declaration_extent_covers_body() {
        let declarations = collect_declarations(SAMPLE);
        let body = &SAMPLE[declarations[1].start..declarations[1].end];
        assert!(body.contains("value * 2"));
        assert!(body.trim_end().ends_with(';') || body.trim_end().ends_with('}'));
    }
}
