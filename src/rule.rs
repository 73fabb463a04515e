//! URL rule parsing and parameter binding.
//!
//! Routes are declared with URL rules in the usual angle-bracket style:
//!
//! - `"/"` → no parameters
//! - `"/<argument>/"` → one parameter named `argument`
//! - `"/page/<int:number>.html"` → converter `int`, parameter `number`
//! - `"/files/<path:rest>"` → converter `path`, may span `/`
//!
//! A rule is never matched against incoming requests here; the only job is
//! to enumerate a route's parameters and substitute concrete values so every
//! route instance gets its own shelf key.

use crate::types::BoundArgs;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RuleError {
    #[error("rule '{0}' must start with '/'")]
    NotAbsolute(String),
    #[error("rule '{0}' has an unterminated '<'")]
    Unterminated(String),
    #[error("rule '{rule}' has an invalid parameter name '{name}'")]
    InvalidName { rule: String, name: String },
    #[error("rule '{rule}' uses unknown converter '{converter}'")]
    UnknownConverter { rule: String, converter: String },
    #[error("rule '{rule}' declares parameter '{name}' twice")]
    DuplicateParameter { rule: String, name: String },
    #[error("rule '{rule}' needs a value for parameter '{name}'")]
    MissingValue { rule: String, name: String },
    #[error("value '{value}' is not valid for <{converter}:{name}> in rule '{rule}'")]
    InvalidValue {
        rule: String,
        name: String,
        converter: Converter,
        value: String,
    },
}

/// Value converter of a rule parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    String,
    Int,
    Float,
    Path,
}

impl Converter {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "path" => Some(Self::Path),
            _ => None,
        }
    }

    fn accepts(self, value: &str) -> bool {
        match self {
            Self::String => !value.is_empty() && !value.contains('/'),
            Self::Int => value.parse::<i64>().is_ok(),
            Self::Float => value.parse::<f64>().is_ok(),
            Self::Path => !value.is_empty(),
        }
    }
}

impl fmt::Display for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Path => "path",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param { name: String, converter: Converter },
}

/// A parsed URL rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pattern: String,
    segments: Vec<Segment>,
}

impl Rule {
    pub fn parse(pattern: &str) -> Result<Self, RuleError> {
        if !pattern.starts_with('/') {
            return Err(RuleError::NotAbsolute(pattern.to_string()));
        }

        let mut segments = Vec::new();
        let mut rest = pattern;
        while let Some(open) = rest.find('<') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..]
                .find('>')
                .map(|i| open + i)
                .ok_or_else(|| RuleError::Unterminated(pattern.to_string()))?;
            let inner = &rest[open + 1..close];
            let (converter, name) = match inner.split_once(':') {
                Some((conv, name)) => {
                    let converter =
                        Converter::parse(conv).ok_or_else(|| RuleError::UnknownConverter {
                            rule: pattern.to_string(),
                            converter: conv.to_string(),
                        })?;
                    (converter, name)
                }
                None => (Converter::String, inner),
            };
            if !is_identifier(name) {
                return Err(RuleError::InvalidName {
                    rule: pattern.to_string(),
                    name: name.to_string(),
                });
            }
            let duplicate = segments
                .iter()
                .any(|s| matches!(s, Segment::Param { name: n, .. } if n == name));
            if duplicate {
                return Err(RuleError::DuplicateParameter {
                    rule: pattern.to_string(),
                    name: name.to_string(),
                });
            }
            segments.push(Segment::Param {
                name: name.to_string(),
                converter,
            });
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Parameter names in the order they appear in the rule.
    pub fn params(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param { name, .. } => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Substitute bound values into the rule, producing a concrete URL path.
    pub fn bind(&self, args: &BoundArgs) -> Result<String, RuleError> {
        let mut path = String::with_capacity(self.pattern.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => path.push_str(text),
                Segment::Param { name, converter } => {
                    let value = args.get(name).ok_or_else(|| RuleError::MissingValue {
                        rule: self.pattern.clone(),
                        name: name.clone(),
                    })?;
                    if !converter.accepts(value) {
                        return Err(RuleError::InvalidValue {
                            rule: self.pattern.clone(),
                            name: name.clone(),
                            converter: *converter,
                            value: value.to_string(),
                        });
                    }
                    path.push_str(value);
                }
            }
        }
        Ok(path)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
