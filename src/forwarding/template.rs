//! Message templates
//!
//! Templates are plain text with `{subject}`, `{from}` and `{body}`
//! placeholders. Rendering is a single left-to-right scan: substituted
//! values are never rescanned, so an email body that happens to contain
//! `{subject}` is forwarded literally.

use thiserror::Error;

/// Body characters kept when rendering (bounds outbound message size)
pub const DEFAULT_MAX_BODY_CHARS: usize = 500;

/// Template used when a rule is created without one
pub const DEFAULT_MESSAGE_TEMPLATE: &str =
    "New email received:\n\nSubject: {subject}\nFrom: {from}\nBody: {body}";

/// Values substituted into a template. Missing fields render as "".
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateFields<'a> {
    pub subject: &'a str,
    pub from: &'a str,
    pub body: &'a str,
}

/// Template syntax errors, with byte offsets into the template
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unclosed '{{' at position {0}")]
    UnclosedBrace(usize),
    #[error("unexpected '}}' at position {0}")]
    UnexpectedClosingBrace(usize),
    #[error("empty placeholder at position {0}")]
    EmptyPlaceholder(usize),
    #[error("invalid placeholder name '{name}' at position {position}")]
    InvalidPlaceholder { name: String, position: usize },
}

/// Render a template with the default body limit.
pub fn render(template: &str, fields: &TemplateFields<'_>) -> String {
    render_with_limit(template, fields, DEFAULT_MAX_BODY_CHARS)
}

/// Render a template, truncating `body` to `max_body_chars` characters.
///
/// Unknown placeholders and stray braces are copied through unchanged.
pub fn render_with_limit(
    template: &str,
    fields: &TemplateFields<'_>,
    max_body_chars: usize,
) -> String {
    let body = truncate_chars(fields.body, max_body_chars);
    let mut out = String::with_capacity(
        template.len() + fields.subject.len() + fields.from.len() + body.len(),
    );
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let token = &rest[open..];

        // Next brace after the opening one decides whether this is a token.
        match token[1..].find(['{', '}']).map(|idx| idx + 1) {
            Some(close) if token.as_bytes()[close] == b'}' => {
                let name = &token[1..close];
                match placeholder_value(name, fields, body) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&token[..=close]),
                }
                rest = &token[close + 1..];
            }
            _ => {
                out.push('{');
                rest = &token[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn placeholder_value<'a>(
    name: &str,
    fields: &TemplateFields<'a>,
    body: &'a str,
) -> Option<&'a str> {
    match name {
        "subject" => Some(fields.subject),
        "from" => Some(fields.from),
        "body" => Some(body),
        _ => None,
    }
}

/// Longest prefix of `value` with at most `max_chars` characters
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &value[..byte_idx],
        None => value,
    }
}

/// Check that every brace in `template` belongs to a well-formed placeholder.
pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    let mut open: Option<usize> = None;

    for (position, ch) in template.char_indices() {
        match (ch, open) {
            ('{', Some(start)) => return Err(TemplateError::UnclosedBrace(start)),
            ('{', None) => open = Some(position),
            ('}', None) => return Err(TemplateError::UnexpectedClosingBrace(position)),
            ('}', Some(start)) => {
                let name = &template[start + 1..position];
                if name.is_empty() {
                    return Err(TemplateError::EmptyPlaceholder(start));
                }
                if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(TemplateError::InvalidPlaceholder {
                        name: name.to_string(),
                        position: start,
                    });
                }
                open = None;
            }
            _ => {}
        }
    }

    match open {
        Some(start) => Err(TemplateError::UnclosedBrace(start)),
        None => Ok(()),
    }
}
