//! CSS handler: brace-matched rules and at-rule blocks.

use std::path::Path;

use serde_json::Value;

use super::{
    load_utf8, split_chunk, HandlerResult, HandlerSymbol, LineIndex, ParseContext, ParserHandler,
    SpanChunk,
};

pub struct CssHandler;

const NAME: &str = "css";
const VERSION: &str = "1.0.0";

#[derive(Debug)]
struct Rule {
    selector: String,
    start: usize,
    end: usize,
}

impl ParserHandler for CssHandler {
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
        let rules = collect_rules(&text);

        for (ordinal, rule) in rules.iter().enumerate() {
            let symbol_id = format!("{NAME}:rule:{ordinal}");
            let mut symbol_metadata = super::span_metadata(&text, rule.start, rule.end, &index);
            symbol_metadata.insert(
                "selector".to_string(),
                Value::String(rule.selector.clone()),
            );
            result.symbols.push(HandlerSymbol {
                symbol_id: symbol_id.clone(),
                name: rule.selector.clone(),
                kind: if rule.selector.starts_with('@') {
                    "at-rule".to_string()
                } else {
                    "rule".to_string()
                },
                start_offset: rule.start,
                end_offset: rule.end,
                docstring: None,
                parent_id: None,
                metadata: symbol_metadata,
            });

            let mut metadata = super::span_metadata(&text, rule.start, rule.end, &index);
            metadata.insert(
                "selector".to_string(),
                Value::String(rule.selector.clone()),
            );
            let span = SpanChunk {
                chunk_id: format!("{NAME}:rule:{}:{}", rule.start, rule.end),
                text: text[rule.start..rule.end].to_string(),
                start_offset: rule.start,
                end_offset: rule.end,
                parent_symbol_id: Some(symbol_id),
                delegate: None,
                metadata,
            };
            result.chunks.extend(split_chunk(span, cap, context.encoder));
        }

        // Loose content (comments, @import lines) outside any rule block.
        if result.chunks.is_empty() && !text.trim().is_empty() {
            let metadata = super::span_metadata(&text, 0, text.len(), &index);
            let span = SpanChunk {
                chunk_id: format!("{NAME}:sheet:0:{}", text.len()),
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

/// Top-level rules: selector text up to `{`, body to the matching `}`.
/// At-rules with blocks (`@media`, `@supports`) span their whole block;
/// statement at-rules (`@import ...;`) end at the semicolon.
fn collect_rules(text: &str) -> Vec<Rule> {
    let bytes = text.as_bytes();
    let mut rules = Vec::new();
    let mut cursor = 0usize;
    let mut segment_start = 0usize;

    while cursor < bytes.len() {
        match bytes[cursor] {
            b'/' if cursor + 1 < bytes.len() && bytes[cursor + 1] == b'*' => {
                // Skip comments.
                if let Some(close) = text[cursor + 2..].find("*/") {
                    cursor += close + 4;
                } else {
                    cursor = bytes.len();
                }
            }
            b';' => {
                let selector = text[segment_start..cursor].trim();
                if selector.starts_with('@') {
                    rules.push(Rule {
                        selector: collapse_ws(selector),
                        start: segment_start + leading_ws(&text[segment_start..]),
                        end: cursor + 1,
                    });
                }
                segment_start = cursor + 1;
                cursor += 1;
            }
            b'{' => {
                let selector = collapse_ws(text[segment_start..cursor].trim());
                let mut depth = 1usize;
                let mut probe = cursor + 1;
                while probe < bytes.len() && depth > 0 {
                    match bytes[probe] {
                        b'{' => depth += 1,
                        b'}' => depth -= 1,
                        _ => {}
                    }
                    probe += 1;
                }
                if !selector.is_empty() {
                    rules.push(Rule {
                        selector,
                        start: segment_start + leading_ws(&text[segment_start..]),
                        end: probe,
                    });
                }
                segment_start = probe;
                cursor = probe;
            }
            _ => cursor += 1,
        }
    }
    rules
}

fn collapse_ws(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn leading_ws(value: &str) -> usize {
    value.len() - value.trim_start().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_rules_finds_selectors() {
        let text = ".badge { color: red; }\n\n#main > p { margin: 0; }\n";
        let rules = collect_rules(text);
        let selectors: Vec<&str> = rules.iter().map(|r| r.selector.as_str()).collect();
        assert_eq!(selectors, [".badge", "#main > p"]);
    }

    #[test]
    fn test_at_rule_block_spans_nested_braces() {
        let text = "@media (max-width: 600px) { .badge { display: none; } }\n";
        let rules = collect_rules(text);
        assert_eq!(rules.len(), 1);
        assert!(text[rules[0].start..rules[0].end].contains("display: none"));
    }

    #[test]
    fn test_import_statement_is_a_rule() {
        let text = "@import url(\"base.css\");\n.badge { color: red; }\n";
        let rules = collect_rules(text);
        assert_eq!(rules.len(), 2);
        assert!(rules[0].selector.starts_with("@import"));
    }
}
