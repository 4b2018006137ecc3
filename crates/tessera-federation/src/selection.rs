//! Caller field-selection model.
//!
//! A `SelectionSet` is the tree of fields the caller asked for on a remote
//! record. The federation client serializes it into the body of every
//! sub-query it sends, so a sibling service returns exactly the shape the
//! caller selected.

/// One requested field, possibly with a nested selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionField {
    name: String,
    children: Vec<SelectionField>,
}

impl SelectionField {
    /// A scalar field.
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    /// An object field with its own selection.
    pub fn node(name: impl Into<String>, children: Vec<SelectionField>) -> Self {
        Self {
            name: name.into(),
            children,
        }
    }

    fn render(&self, out: &mut String) {
        out.push_str(&self.name);
        if !self.children.is_empty() {
            out.push_str(" { ");
            for child in &self.children {
                child.render(out);
            }
            out.push_str("} ");
            return;
        }
        out.push(' ');
    }
}

/// The full selection a caller made on a remote query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectionSet {
    fields: Vec<SelectionField>,
}

impl SelectionSet {
    pub fn new(fields: Vec<SelectionField>) -> Self {
        Self { fields }
    }

    /// A flat selection of scalar fields.
    pub fn leaves<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: names.into_iter().map(SelectionField::leaf).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize to query-body text, the part between the braces of a
    /// sub-query.
    pub fn to_query_body(&self) -> String {
        let mut out = String::new();
        for field in &self.fields {
            field.render(&mut out);
        }
        out.trim_end().to_string()
    }
}
