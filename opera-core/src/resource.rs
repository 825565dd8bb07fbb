// ABOUTME: Parser for code-resource messages: an optional @key header followed by a code body.
// ABOUTME: Supports `---` terminated headers, `/** */` comment headers and bare code.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A header value, split into a list when it contained commas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Text(String),
    List(Vec<String>),
}

impl MetaValue {
    fn from_raw(raw: &str) -> Self {
        let cleaned = raw.trim_matches(|c| matches!(c, '"' | '\'' | '[' | ']'));
        if cleaned.contains(',') {
            Self::List(cleaned.split(',').map(|s| s.trim().to_string()).collect())
        } else {
            Self::Text(cleaned.to_string())
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::List(_) => None,
        }
    }

    /// Single values become a one-element list
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Self::Text(s) if s.is_empty() => Vec::new(),
            Self::Text(s) => vec![s.clone()],
            Self::List(items) => items.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceBlock {
    pub metadata: BTreeMap<String, MetaValue>,
    pub code: String,
}

impl ResourceBlock {
    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    pub fn file_path(&self) -> Option<&str> {
        self.get("file")
            .and_then(MetaValue::as_text)
            .filter(|s| !s.is_empty())
    }

    pub fn description(&self) -> Option<String> {
        self.get("description").map(|v| match v {
            MetaValue::Text(s) => s.clone(),
            // a description with commas was split; put it back together
            MetaValue::List(items) => items.join(", "),
        })
    }

    pub fn tags(&self) -> Vec<String> {
        self.get("tags").map(MetaValue::to_list).unwrap_or_default()
    }
}

fn is_header_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Default)]
struct HeaderBuilder {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderBuilder {
    /// Feed one stripped header line. Returns false for a line that cannot belong to a header.
    fn feed(&mut self, line: &str) -> bool {
        if let Some(rest) = line.strip_prefix('@') {
            // decorators like `@Component({selector: 'x'})` are code, not metadata
            return match rest.split_once(':') {
                Some((key, value)) if is_header_key(key.trim()) => {
                    self.entries
                        .push((key.trim().to_string(), vec![value.trim().to_string()]));
                    true
                }
                _ => false,
            };
        }
        if line.is_empty() {
            return true;
        }
        match self.entries.last_mut() {
            Some((_, parts)) => {
                parts.push(line.to_string());
                true
            }
            None => false,
        }
    }

    fn finish(self) -> BTreeMap<String, MetaValue> {
        self.entries
            .into_iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, parts)| (key, MetaValue::from_raw(&parts.join(" "))))
            .collect()
    }
}

/// Parse a resource message into its header metadata and code body.
///
/// A header without its terminator is not a header: the whole text is code.
pub fn parse_resource_block(text: &str) -> ResourceBlock {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut start = 0;
    if lines.first().is_some_and(|l| l.trim().starts_with("```")) {
        start = 1;
    }

    let mut metadata = BTreeMap::new();
    let mut code_start = start;

    if lines.get(start).is_some_and(|l| l.trim().starts_with("/**")) {
        let mut header = HeaderBuilder::default();
        for (i, raw) in lines.iter().enumerate().skip(start + 1) {
            let line = raw.trim();
            if line.starts_with("*/") {
                metadata = header.finish();
                code_start = i + 1;
                break;
            }
            header.feed(line.trim_start_matches(['*', ' ']));
        }
    } else {
        let mut header = HeaderBuilder::default();
        for (i, raw) in lines.iter().enumerate().skip(start) {
            let line = raw.trim();
            if line == "---" {
                metadata = header.finish();
                code_start = i + 1;
                break;
            }
            if !header.feed(line) {
                break;
            }
        }
    }

    let code_end = lines
        .iter()
        .enumerate()
        .skip(code_start)
        .find(|(_, l)| l.trim() == "```")
        .map(|(i, _)| i)
        .unwrap_or(lines.len());

    let code = if code_start < code_end {
        lines[code_start..code_end].join("\n").trim().to_string()
    } else {
        String::new()
    };

    ResourceBlock { metadata, code }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(block: &ResourceBlock, key: &str) -> String {
        block
            .get(key)
            .and_then(MetaValue::as_text)
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn test_simple_header() {
        let block = parse_resource_block("@file: a.py\n@description: d\n---\nprint(1)");
        assert_eq!(block.metadata.len(), 2);
        assert_eq!(text(&block, "file"), "a.py");
        assert_eq!(text(&block, "description"), "d");
        assert_eq!(block.code, "print(1)");
    }

    #[test]
    fn test_fenced_header_with_lists() {
        let block = parse_resource_block(
            "```javascript\n@file: src/js/app.js\n@tags: framework_react, ui_component\n@version: 1.0.0\n---\nimport React from 'react';\n\nexport default App;\n```",
        );
        assert_eq!(block.file_path(), Some("src/js/app.js"));
        assert_eq!(block.tags(), vec!["framework_react", "ui_component"]);
        assert_eq!(text(&block, "version"), "1.0.0");
        assert!(block.code.starts_with("import React"));
        assert!(block.code.ends_with("export default App;"));
    }

    #[test]
    fn test_bracketed_list() {
        let block = parse_resource_block(
            "@file: g.tsx\n@dependencies: [@material-ui/core, @material-ui/icons]\n---\nx",
        );
        assert_eq!(
            block.get("dependencies"),
            Some(&MetaValue::List(vec![
                "@material-ui/core".to_string(),
                "@material-ui/icons".to_string()
            ]))
        );
    }

    #[test]
    fn test_comment_header_multiline() {
        let block = parse_resource_block(
            "```javascript\n/**\n * @file: src/js/complex.js\n * @description: This is a complex component\n *              that spans multiple lines\n * @tags: [complex, multiline]\n */\nclass ComplexComponent {}\n```",
        );
        assert_eq!(block.file_path(), Some("src/js/complex.js"));
        assert_eq!(
            block.description().unwrap_or_default(),
            "This is a complex component that spans multiple lines"
        );
        assert_eq!(block.tags(), vec!["complex", "multiline"]);
        assert_eq!(block.code, "class ComplexComponent {}");
    }

    #[test]
    fn test_no_header() {
        let block = parse_resource_block("```python\ndef hello():\n    print(\"hi\")\n```");
        assert!(block.metadata.is_empty());
        assert_eq!(block.code, "def hello():\n    print(\"hi\")");
    }

    #[test]
    fn test_unterminated_header_is_code() {
        let raw = "@file: a.py\nprint(1)";
        let block = parse_resource_block(raw);
        assert!(block.metadata.is_empty());
        assert_eq!(block.code, raw);
    }

    #[test]
    fn test_trailing_prose_dropped() {
        let block = parse_resource_block(
            "```js\n@file: c.js\n---\nexport class C {}\n```\n\nThis component does things",
        );
        assert_eq!(block.code, "export class C {}");
    }

    #[test]
    fn test_empty_inputs() {
        let block = parse_resource_block("");
        assert!(block.metadata.is_empty());
        assert_eq!(block.code, "");

        let block = parse_resource_block("```\n@file: src/empty.js\n---\n```");
        assert_eq!(block.file_path(), Some("src/empty.js"));
        assert_eq!(block.code, "");
    }

    #[test]
    fn test_blank_lines_in_body_kept() {
        let block = parse_resource_block("@file: h.py\n\n---\n\ndef a():\n    pass\n\n\ndef b():\n    pass");
        assert!(block.code.contains("\n\n"));
        assert!(block.code.starts_with("def a()"));
    }

    #[test]
    fn test_decorator_body_is_not_a_header() {
        let source = "@Component({selector: 'app-root'})\nexport class App {}\n---\nfooter";
        let block = parse_resource_block(source);
        assert!(block.metadata.is_empty());
        assert_eq!(block.code, source);
    }

    #[test]
    fn test_bare_decorator_ends_header_scan() {
        let block = parse_resource_block("@Injectable()\nclass Svc {}\n---");
        assert!(block.metadata.is_empty());
        assert!(block.code.starts_with("@Injectable()"));
    }
}
