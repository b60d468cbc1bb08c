//! Route patterns and `{{.name}}` templates driven by path variables

use percent_encoding::percent_decode_str;
use regex::Regex;
use std::collections::HashMap;

/// Variables captured from the request path by a route pattern
pub type PathVars = HashMap<String, String>;

/// Template errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template: unclosed action starting at byte {0}")]
    Unclosed(usize),

    #[error("template: invalid action {0:?}, expected {{{{.name}}}}")]
    InvalidAction(String),

    #[error("template: no path variable {0:?}")]
    MissingVariable(String),

    #[error("route: invalid pattern {pattern:?}: {reason}")]
    InvalidRoute { pattern: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A string with `{{.name}}` placeholders
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after_open = &rest[start + 2..];
            let end = after_open
                .find("}}")
                .ok_or(TemplateError::Unclosed(offset + start))?;

            let action = after_open[..end].trim();
            let name = action
                .strip_prefix('.')
                .filter(|name| is_identifier(name))
                .ok_or_else(|| TemplateError::InvalidAction(action.to_string()))?;
            segments.push(Segment::Variable(name.to_string()));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Whether rendering depends on the request
    pub fn has_variables(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Variable(_)))
    }

    pub fn render(&self, vars: &PathVars) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => {
                    let value = vars
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingVariable(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A configured URL such as `/users/{id}` or `/files/{name:[a-z]+\.json}`
#[derive(Debug, Clone)]
pub struct RoutePattern {
    regex: Regex,
    names: Vec<String>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, TemplateError> {
        let invalid = |reason: &str| TemplateError::InvalidRoute {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut source = String::from("^");
        let mut names = Vec::new();
        let mut chars = pattern.char_indices();
        let mut literal_start = 0;

        while let Some((index, c)) = chars.next() {
            if c != '{' {
                continue;
            }
            source.push_str(&regex::escape(&pattern[literal_start..index]));

            // Variable regexes may contain their own braces, e.g. `{id:[0-9]{4}}`.
            let mut depth = 1;
            let mut close = None;
            for (inner_index, inner) in chars.by_ref() {
                match inner {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            close = Some(inner_index);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let close = close.ok_or_else(|| invalid("unbalanced braces"))?;

            let variable = &pattern[index + 1..close];
            let (name, expr) = match variable.split_once(':') {
                Some((name, expr)) => (name.trim(), expr.trim()),
                None => (variable.trim(), "[^/]+"),
            };
            if !is_identifier(name) {
                return Err(invalid("variable names must be alphanumeric"));
            }
            if names.iter().any(|existing| existing == name) {
                return Err(invalid("duplicate variable name"));
            }
            if expr.is_empty() {
                return Err(invalid("empty variable pattern"));
            }

            source.push_str(&format!("(?P<{}>{})", name, expr));
            names.push(name.to_string());
            literal_start = close + 1;
        }
        source.push_str(&regex::escape(&pattern[literal_start..]));
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self { regex, names })
    }

    /// Path variables of `path`, or `None` if it does not match. The path is
    /// percent-decoded before matching, so a decoded `/` separates segments.
    pub fn matches(&self, path: &str) -> Option<PathVars> {
        let path = percent_decode_str(path).decode_utf8_lossy();
        let captures = self.regex.captures(&path)?;
        Some(
            self.names
                .iter()
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|value| (name.clone(), value.as_str().to_string()))
                })
                .collect(),
        )
    }
}
