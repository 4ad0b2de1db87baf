//! HTML handler: document shell with inline script/style delegation.
//!
//! The document itself persists as the shell chunk. Every inline
//! `<script>` body is additionally emitted as a delegate chunk owned by the
//! JavaScript handler, and every `<style>` body by the CSS handler, each
//! linked back to the shell chunk and its element symbol.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::{
    delegated_chunk_id, delegated_metadata, load_utf8, split_chunk, HandlerResult, HandlerSymbol,
    LineIndex, ParseContext, ParserHandler, SpanChunk,
};

pub struct HtmlHandler;

const NAME: &str = "html";
const VERSION: &str = "1.0.0";

fn script_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is)<script(\s[^>]*)?>(.*?)</script\s*>").unwrap()
    })
}

fn style_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)<style(\s[^>]*)?>(.*?)</style\s*>").unwrap())
}

fn src_attr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"(?i)\bsrc\s*="#).unwrap())
}

impl ParserHandler for HtmlHandler {
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
        let document_symbol_id = format!("{NAME}:document");
        result.symbols.push(HandlerSymbol {
            symbol_id: document_symbol_id.clone(),
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "document".to_string()),
            kind: "document".to_string(),
            start_offset: 0,
            end_offset: text.len(),
            docstring: None,
            parent_id: None,
            metadata: super::span_metadata(&text, 0, text.len(), &index),
        });

        let shell_chunk_id = format!("{NAME}:document:0:{}", text.len());
        let span = SpanChunk {
            chunk_id: shell_chunk_id.clone(),
            text: text.clone(),
            start_offset: 0,
            end_offset: text.len(),
            parent_symbol_id: Some(document_symbol_id.clone()),
            delegate: None,
            metadata: super::span_metadata(&text, 0, text.len(), &index),
        };
        result
            .chunks
            .extend(split_chunk(span, context.max_tokens(NAME), context.encoder));

        for (ordinal, captures) in script_pattern().captures_iter(&text).enumerate() {
            let attrs = captures.get(1).map(|m| m.as_str()).unwrap_or("");
            // External scripts have no inline body to delegate.
            if src_attr_pattern().is_match(attrs) {
                continue;
            }
            let Some(body) = captures.get(2) else {
                continue;
            };
            if body.as_str().trim().is_empty() {
                continue;
            }
            self.emit_delegate(
                &mut result,
                &text,
                &index,
                context,
                "javascript",
                "script",
                ordinal,
                body.start(),
                body.end(),
                &document_symbol_id,
                &shell_chunk_id,
            );
        }

        for (ordinal, captures) in style_pattern().captures_iter(&text).enumerate() {
            let Some(body) = captures.get(2) else {
                continue;
            };
            if body.as_str().trim().is_empty() {
                continue;
            }
            self.emit_delegate(
                &mut result,
                &text,
                &index,
                context,
                "css",
                "style",
                ordinal,
                body.start(),
                body.end(),
                &document_symbol_id,
                &shell_chunk_id,
            );
        }

        result
    }
}

impl HtmlHandler {
    #[allow(clippy::too_many_arguments)]
    fn emit_delegate(
        &self,
        result: &mut HandlerResult,
        text: &str,
        index: &LineIndex,
        context: &ParseContext,
        delegate: &str,
        element: &str,
        ordinal: usize,
        start: usize,
        end: usize,
        document_symbol_id: &str,
        shell_chunk_id: &str,
    ) {
        let element_symbol_id = format!("{NAME}:{element}:{ordinal}");
        let mut symbol_metadata = super::span_metadata(text, start, end, index);
        symbol_metadata.insert("ordinal".to_string(), Value::Number(ordinal.into()));
        result.symbols.push(HandlerSymbol {
            symbol_id: element_symbol_id.clone(),
            name: format!("{element}[{ordinal}]"),
            kind: element.to_string(),
            start_offset: start,
            end_offset: end,
            docstring: None,
            parent_id: Some(document_symbol_id.to_string()),
            metadata: symbol_metadata,
        });

        let chunk_id = delegated_chunk_id(
            delegate,
            NAME,
            element,
            start,
            end,
            Some(&ordinal.to_string()),
        );
        let mut metadata = super::span_metadata(text, start, end, index);
        for (key, value) in
            delegated_metadata(delegate, NAME, &element_symbol_id, Some(shell_chunk_id))
        {
            metadata.insert(key, value);
        }
        let span = SpanChunk {
            chunk_id,
            text: text[start..end].to_string(),
            start_offset: start,
            end_offset: end,
            parent_symbol_id: Some(element_symbol_id),
            delegate: Some(delegate.to_string()),
            metadata,
        };
        result
            .chunks
            .extend(split_chunk(span, context.max_tokens(delegate), context.encoder));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_pattern_captures_body() {
        let text = "<html><script>\nconsole.log(1);\n</script></html>";
        let captures = script_pattern().captures(text).unwrap();
        assert!(captures.get(2).unwrap().as_str().contains("console.log"));
    }

    #[test]
    fn test_external_script_is_skipped() {
        let text = r#"<script src="app.js"></script>"#;
        let captures = script_pattern().captures(text).unwrap();
        let attrs = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        assert!(src_attr_pattern().is_match(attrs));
    }

    #[test]
    fn test_style_pattern_captures_body() {
        let text = "<style>\nbody { color: red; }\n</style>";
        let captures = style_pattern().captures(text).unwrap();
        assert!(captures.get(2).unwrap().as_str().contains("color"));
    }
}
