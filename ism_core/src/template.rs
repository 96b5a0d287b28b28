use crate::Record;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

/// Placeholders whose name contains this marker render as empty text when unbound.
pub const OPTIONAL_MARKER: &str = "_optional";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateOptions {
    /// Collapse real and escaped newlines of interpolated values into spaces.
    pub normalize_newlines: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            normalize_newlines: true,
        }
    }
}

pub fn build_template_text(template: &str, record: &Record) -> String {
    build_template_text_with(template, record, TemplateOptions::default())
}

/// Resolves `{identifier}` placeholders against `record`.
///
/// Unbound placeholders are left in place verbatim, except optional ones
/// which render as empty text.
pub fn build_template_text_with(template: &str, record: &Record, options: TemplateOptions) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match record.get(name) {
                Some(value) => {
                    let text = render_value(value);
                    if options.normalize_newlines {
                        normalize_newlines(&text)
                    } else {
                        text
                    }
                }
                None if name.contains(OPTIONAL_MARKER) => String::new(),
                None => caps[0].to_owned(),
            }
        })
        .into_owned()
}

/// Names of every placeholder still present in `text`.
pub fn placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(text)
        .map(|caps| caps[1].to_owned())
        .collect()
}

pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\\r\\n", " ")
        .replace("\\n", " ")
        .replace("\r\n", " ")
        .replace(['\n', '\r'], " ")
}
