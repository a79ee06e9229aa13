//! Builder for SPIRE's nested-block configuration syntax:
//!
//! ```text
//! plugins {
//!     NodeAttestor "k8s_psat" {
//!         plugin_data {
//!             clusters = {
//!                 "demo-cluster" = {
//!                     service_account_allow_list = [ "spire:spire-agent" ]
//!                 }
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! Every string is escaped on output, so values taken from a spec cannot
//! break out of their quotes or open a template sequence.

use std::fmt::{self, Write};

const INDENT: &str = "    ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Bool(bool),
    List(Vec<String>),
    Map(Vec<(String, Value)>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::List(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Attr(&'static str, Value),
    Block(Block),
}

/// A `kind "label" { ... }` block. Entries render in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    kind: &'static str,
    label: Option<String>,
    entries: Vec<Entry>,
}

impl Block {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            label: None,
            entries: Vec::new(),
        }
    }

    pub fn labeled(kind: &'static str, label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::new(kind)
        }
    }

    pub fn attr(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.entries.push(Entry::Attr(key, value.into()));
        self
    }

    pub fn attr_opt(self, key: &'static str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.attr(key, value),
            None => self,
        }
    }

    pub fn block(mut self, block: Block) -> Self {
        self.entries.push(Entry::Block(block));
        self
    }

    pub fn blocks(mut self, blocks: impl IntoIterator<Item = Block>) -> Self {
        self.entries.extend(blocks.into_iter().map(Entry::Block));
        self
    }

    fn write_to(&self, out: &mut String, depth: usize) -> fmt::Result {
        indent(out, depth);
        out.push_str(self.kind);
        if let Some(label) = &self.label {
            write!(out, " \"{}\"", escape(label))?;
        }

        if self.entries.is_empty() {
            out.push_str(" {}\n");
            return Ok(());
        }

        out.push_str(" {\n");
        for entry in &self.entries {
            match entry {
                Entry::Attr(key, value) => {
                    indent(out, depth + 1);
                    write!(out, "{key} = ")?;
                    write_value(out, value, depth + 1)?;
                    out.push('\n');
                }
                Entry::Block(block) => block.write_to(out, depth + 1)?,
            }
        }
        indent(out, depth);
        out.push_str("}\n");
        Ok(())
    }
}

/// Top-level blocks separated by blank lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    blocks: Vec<Block>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for (i, block) in self.blocks.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            block.write_to(&mut out, 0)?;
        }
        f.write_str(&out)
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

fn write_value(out: &mut String, value: &Value, depth: usize) -> fmt::Result {
    match value {
        Value::Str(s) => write!(out, "\"{}\"", escape(s)),
        Value::Bool(b) => write!(out, "{b}"),
        Value::List(items) if items.is_empty() => {
            out.push_str("[]");
            Ok(())
        }
        Value::List(items) => {
            out.push_str("[ ");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write!(out, "\"{}\"", escape(item))?;
            }
            out.push_str(" ]");
            Ok(())
        }
        Value::Map(entries) if entries.is_empty() => {
            out.push_str("{}");
            Ok(())
        }
        Value::Map(entries) => {
            out.push_str("{\n");
            for (key, value) in entries {
                indent(out, depth + 1);
                if is_identifier(key) {
                    out.push_str(key);
                } else {
                    write!(out, "\"{}\"", escape(key))?;
                }
                out.push_str(" = ");
                write_value(out, value, depth + 1)?;
                out.push('\n');
            }
            indent(out, depth);
            out.push('}');
            Ok(())
        }
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escapes a string for use between double quotes.
pub fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                escaped.push(c);
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_nested_blocks() {
        let doc = Document::new()
            .block(Block::new("agent").attr("trust_domain", "example.org"))
            .block(
                Block::new("plugins").block(
                    Block::labeled("NodeAttestor", "k8s_psat").block(
                        Block::new("plugin_data").attr(
                            "clusters",
                            Value::Map(vec![(
                                "demo-cluster".to_string(),
                                Value::Map(vec![(
                                    "service_account_allow_list".to_string(),
                                    vec!["spire:spire-agent".to_string()].into(),
                                )]),
                            )]),
                        ),
                    ),
                ),
            );

        let expected = r#"agent {
    trust_domain = "example.org"
}

plugins {
    NodeAttestor "k8s_psat" {
        plugin_data {
            clusters = {
                "demo-cluster" = {
                    service_account_allow_list = [ "spire:spire-agent" ]
                }
            }
        }
    }
}
"#;
        assert_eq!(doc.to_string(), expected);
    }

    #[test]
    fn empty_collections_render_inline() {
        let doc = Document::new().block(
            Block::labeled("WorkloadAttestor", "unix")
                .block(Block::new("plugin_data"))
                .attr("list", Vec::<String>::new())
                .attr("map", Value::Map(vec![])),
        );
        assert_eq!(
            doc.to_string(),
            "WorkloadAttestor \"unix\" {\n    plugin_data {}\n    list = []\n    map = {}\n}\n"
        );
    }

    #[test]
    fn escapes_quotes_and_templates() {
        assert_eq!(escape(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(escape("line\nbreak"), "line\\nbreak");
        assert_eq!(escape("${env} %{if} $5"), "$${env} %%{if} $5");
    }

    #[test]
    fn injected_braces_stay_inside_the_string() {
        let doc = Document::new()
            .block(Block::new("server").attr("trust_domain", "x\" }\nplugins { evil = \"1"));
        assert_eq!(
            doc.to_string(),
            "server {\n    trust_domain = \"x\\\" }\\nplugins { evil = \\\"1\"\n}\n"
        );
    }
}
