//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "01-harness"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Configuration template rendering."
//! dbt_version: "v0.1.0"
//! dbt_owner: "tbd"
//! ---
//! Minimal `{{ name }}` placeholder rendering for beat configuration
//! templates.
//!
//! A placeholder may carry a `default(...)` filter, e.g.
//! `{{ period | default("100ms") }}`, which is used when the context has no
//! entry for the name. Values are inserted verbatim and are not re-rendered.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::error::{HarnessError, Result};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("placeholder `{0}` has no value in the template context")]
    MissingValue(String),
    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),
    #[error("empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),
    #[error("unsupported filter `{0}`")]
    UnsupportedFilter(String),
}

/// Named values substituted into a configuration template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    values: IndexMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TemplateContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut context = Self::new();
        for (name, value) in iter {
            context.insert(name, value);
        }
        context
    }
}

impl From<IndexMap<String, String>> for TemplateContext {
    fn from(values: IndexMap<String, String>) -> Self {
        Self { values }
    }
}

/// Substitute every placeholder in `template`.
pub fn render(template: &str, context: &TemplateContext) -> std::result::Result<String, TemplateError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        rendered.push_str(&rest[..start]);
        let inner_start = start + OPEN.len();
        let Some(len) = rest[inner_start..].find(CLOSE) else {
            return Err(TemplateError::Unterminated(offset + start));
        };
        let expression = &rest[inner_start..inner_start + len];
        rendered.push_str(&evaluate(expression, context, offset + start)?);

        let consumed = inner_start + len + CLOSE.len();
        offset += consumed;
        rest = &rest[consumed..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

fn evaluate(
    expression: &str,
    context: &TemplateContext,
    position: usize,
) -> std::result::Result<String, TemplateError> {
    let (name, filter) = match expression.split_once('|') {
        Some((name, filter)) => (name.trim(), Some(filter.trim())),
        None => (expression.trim(), None),
    };
    if name.is_empty() {
        return Err(TemplateError::EmptyPlaceholder(position));
    }

    let fallback = filter.map(parse_default).transpose()?;
    match (context.get(name), fallback) {
        (Some(value), _) => Ok(value.to_owned()),
        (None, Some(fallback)) => Ok(fallback.to_owned()),
        (None, None) => Err(TemplateError::MissingValue(name.to_owned())),
    }
}

fn parse_default(filter: &str) -> std::result::Result<&str, TemplateError> {
    let argument = filter
        .strip_prefix("default(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| TemplateError::UnsupportedFilter(filter.to_owned()))?
        .trim();
    Ok(unquote(argument))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Render the template at `template_path` into `output_path`, replacing any
/// previous file.
pub fn render_file(
    template_path: &Path,
    output_path: &Path,
    context: &TemplateContext,
) -> Result<()> {
    let template = fs::read_to_string(template_path)?;
    let rendered = render(&template, context).map_err(|source| HarnessError::Template {
        template: template_path.to_path_buf(),
        source,
    })?;
    fs::write(output_path, rendered)?;
    debug!(
        template = %template_path.display(),
        output = %output_path.display(),
        values = context.len(),
        "configuration template rendered"
    );
    Ok(())
}
