//! Query template compiler.
//!
//! A template is a backend-specific query fragment with `{{name}}`
//! placeholders resolved from a flat argument map at execution time:
//!
//! - document stores: `{"id": "{{id}}"}` renders to a JSON filter
//! - relational stores: `name = '{{name}}'` renders to a WHERE fragment
//!
//! Templates come from trusted static configuration. Searchers bind the
//! temporal bound and credential parameters through the driver; only the
//! configured fragment is spliced. A template that fails to compile or
//! render is a configuration bug and always propagates as
//! `MalformedTemplate`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::envelope::Payload;
use crate::error::{TesseraError, TesseraResult};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A compiled query template.
#[derive(Debug, Clone)]
pub struct QueryTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl QueryTemplate {
    /// Compile a template string into substitutable segments.
    pub fn compile(source: &str) -> TesseraResult<Self> {
        if source.trim().is_empty() {
            return Err(TesseraError::template("empty template"));
        }

        let mut segments = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(source) {
            let whole = caps.get(0).expect("capture 0");
            if whole.start() > last {
                segments.push(Segment::Literal(source[last..whole.start()].to_string()));
            }
            segments.push(Segment::Placeholder(caps[1].to_string()));
            last = whole.end();
        }
        if last < source.len() {
            segments.push(Segment::Literal(source[last..].to_string()));
        }

        // A stray brace pair that didn't parse as a placeholder means the
        // template was mistyped, not that the author wanted literal braces.
        for segment in &segments {
            if let Segment::Literal(text) = segment {
                if text.contains("{{") || text.contains("}}") {
                    return Err(TesseraError::template(format!(
                        "unparseable placeholder in template: {source}"
                    )));
                }
            }
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Substitute placeholders from the argument map. Every placeholder must
    /// resolve; a missing argument is a `MalformedTemplate` error.
    pub fn render(&self, args: &Payload) -> TesseraResult<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = args.get(name).ok_or_else(|| {
                        TesseraError::template(format!(
                            "unresolved placeholder '{name}' in template: {}",
                            self.source
                        ))
                    })?;
                    out.push_str(&render_value(value));
                }
            }
        }
        Ok(out)
    }

    /// The placeholder names this template needs.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// The original template string.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Strings substitute bare (the template supplies its own quoting);
/// everything else renders as JSON.
fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
