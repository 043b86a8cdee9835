//! LDAP-style property filters
//!
//! Filters select services and endpoints by their property maps using
//! the classic LDAP grammar: `(&(a=1)(b=2))`, `(|(..)(..))`, `(!(..))`,
//! presence checks `(key=*)` and `*` wildcards inside values. Keys are
//! case-sensitive; a multi-valued property matches when any element
//! matches.

use crate::endpoint::{EndpointDescription, PropertyValue};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("unexpected end of filter at position {0}")]
    UnexpectedEnd(usize),

    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("empty attribute key at position {0}")]
    EmptyKey(usize),

    #[error("empty composite filter at position {0}")]
    EmptyComposite(usize),

    #[error("trailing characters after filter at position {0}")]
    Trailing(usize),
}

/// A match pattern for a single attribute value.
///
/// Stored as the literal segments between `*` wildcards; a value without
/// wildcards has exactly one segment, the presence pattern `*` has two
/// empty ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    parts: Vec<String>,
}

impl Pattern {
    fn is_presence(&self) -> bool {
        self.parts.iter().all(|p| p.is_empty()) && self.parts.len() > 1
    }

    fn matches(&self, text: &str) -> bool {
        if self.parts.len() == 1 {
            return self.parts[0] == text;
        }
        let first = &self.parts[0];
        let last = &self.parts[self.parts.len() - 1];
        if !text.starts_with(first.as_str()) || !text.ends_with(last.as_str()) {
            return false;
        }
        if text.len() < first.len() + last.len() {
            return false;
        }
        // Middle segments must appear in order within the remainder.
        let mut remainder = &text[first.len()..text.len() - last.len()];
        for part in &self.parts[1..self.parts.len() - 1] {
            match remainder.find(part.as_str()) {
                Some(at) => remainder = &remainder[at + part.len()..],
                None => return false,
            }
        }
        true
    }
}

/// A parsed property filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equals { key: String, pattern: Pattern },
}

impl Filter {
    /// Parse an LDAP filter expression.
    pub fn parse(input: &str) -> Result<Filter, FilterError> {
        let chars: Vec<char> = input.chars().collect();
        let mut parser = Parser { chars: &chars, pos: 0 };
        parser.skip_whitespace();
        let filter = parser.parse_filter()?;
        parser.skip_whitespace();
        if parser.pos < parser.chars.len() {
            return Err(FilterError::Trailing(parser.pos));
        }
        Ok(filter)
    }

    /// Evaluate this filter against a property map.
    pub fn matches(&self, properties: &BTreeMap<String, PropertyValue>) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|f| f.matches(properties)),
            Filter::Or(children) => children.iter().any(|f| f.matches(properties)),
            Filter::Not(child) => !child.matches(properties),
            Filter::Present(key) => properties.contains_key(key),
            Filter::Equals { key, pattern } => match properties.get(key) {
                Some(PropertyValue::List(values)) => values
                    .iter()
                    .filter_map(|v| v.as_comparable())
                    .any(|s| pattern.matches(&s)),
                Some(value) => value
                    .as_comparable()
                    .map(|s| pattern.matches(&s))
                    .unwrap_or(false),
                None => false,
            },
        }
    }

    /// Evaluate this filter against an endpoint's properties.
    pub fn matches_endpoint(&self, endpoint: &EndpointDescription) -> bool {
        self.matches(endpoint.properties())
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                write!(f, "(&")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Filter::Or(children) => {
                write!(f, "(|")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Filter::Not(child) => write!(f, "(!{})", child),
            Filter::Present(key) => write!(f, "({}=*)", key),
            Filter::Equals { key, pattern } => {
                write!(f, "({}=", key)?;
                for (i, part) in pattern.parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, "*")?;
                    }
                    for ch in part.chars() {
                        if matches!(ch, '(' | ')' | '*' | '\\') {
                            write!(f, "\\")?;
                        }
                        write!(f, "{}", ch)?;
                    }
                }
                write!(f, ")")
            }
        }
    }
}

struct Parser<'a> {
    chars: &'a [char],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), FilterError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(FilterError::UnexpectedChar { ch: c, pos: self.pos }),
            None => Err(FilterError::UnexpectedEnd(self.pos)),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, FilterError> {
        self.expect('(')?;
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.parse_filter_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.parse_filter_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(FilterError::UnexpectedEnd(self.pos)),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn parse_filter_list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let start = self.pos;
        let mut children = Vec::new();
        while self.peek() == Some('(') {
            children.push(self.parse_filter()?);
        }
        if children.is_empty() {
            return Err(FilterError::EmptyComposite(start));
        }
        Ok(children)
    }

    fn parse_item(&mut self) -> Result<Filter, FilterError> {
        let key_start = self.pos;
        let mut key = String::new();
        loop {
            match self.peek() {
                Some('=') => {
                    self.pos += 1;
                    break;
                }
                Some(c @ ('(' | ')')) => {
                    return Err(FilterError::UnexpectedChar { ch: c, pos: self.pos })
                }
                Some(c) => {
                    key.push(c);
                    self.pos += 1;
                }
                None => return Err(FilterError::UnexpectedEnd(self.pos)),
            }
        }
        if key.is_empty() {
            return Err(FilterError::EmptyKey(key_start));
        }

        let mut parts = Vec::new();
        let mut current = String::new();
        loop {
            match self.peek() {
                Some(')') => break,
                Some('(') => {
                    return Err(FilterError::UnexpectedChar { ch: '(', pos: self.pos })
                }
                Some('*') => {
                    parts.push(std::mem::take(&mut current));
                    self.pos += 1;
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => {
                            current.push(c);
                            self.pos += 1;
                        }
                        None => return Err(FilterError::UnexpectedEnd(self.pos)),
                    }
                }
                Some(c) => {
                    current.push(c);
                    self.pos += 1;
                }
                None => return Err(FilterError::UnexpectedEnd(self.pos)),
            }
        }
        parts.push(current);

        let pattern = Pattern { parts };
        if pattern.is_presence() && pattern.parts.len() == 2 {
            Ok(Filter::Present(key))
        } else {
            Ok(Filter::Equals { key, pattern })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, PropertyValue)]) -> BTreeMap<String, PropertyValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_simple_equality() {
        let filter = Filter::parse("(region=eu-west)").unwrap();
        assert!(filter.matches(&props(&[("region", PropertyValue::from("eu-west"))])));
        assert!(!filter.matches(&props(&[("region", PropertyValue::from("us-east"))])));
        assert!(!filter.matches(&props(&[])));
    }

    #[test]
    fn test_and_or_not() {
        let filter = Filter::parse("(&(a=1)(|(b=2)(b=3))(!(c=4)))").unwrap();
        let base = [
            ("a", PropertyValue::Int(1)),
            ("b", PropertyValue::Int(3)),
        ];
        assert!(filter.matches(&props(&base)));

        let mut with_c = base.to_vec();
        with_c.push(("c", PropertyValue::Int(4)));
        assert!(!filter.matches(&props(&with_c)));
    }

    #[test]
    fn test_presence() {
        let filter = Filter::parse("(service.exported.interfaces=*)").unwrap();
        assert!(filter.matches(&props(&[(
            "service.exported.interfaces",
            PropertyValue::from("org.example.Echo"),
        )])));
        assert!(!filter.matches(&props(&[("other", PropertyValue::from("x"))])));
    }

    #[test]
    fn test_wildcard_substring() {
        let filter = Filter::parse("(name=ser*ce*01)").unwrap();
        assert!(filter.matches(&props(&[("name", PropertyValue::from("service-01"))])));
        assert!(filter.matches(&props(&[("name", PropertyValue::from("serce01"))])));
        assert!(!filter.matches(&props(&[("name", PropertyValue::from("service-02"))])));
    }

    #[test]
    fn test_multi_valued_property_matches_any_element() {
        let filter = Filter::parse("(objectClass=org.example.Echo)").unwrap();
        let properties = props(&[(
            "objectClass",
            PropertyValue::from(vec![
                "org.example.Other".to_string(),
                "org.example.Echo".to_string(),
            ]),
        )]);
        assert!(filter.matches(&properties));
    }

    #[test]
    fn test_numbers_and_bools_compare_by_string_form() {
        let filter = Filter::parse("(&(port=8080)(secure=true))").unwrap();
        let properties = props(&[
            ("port", PropertyValue::Int(8080)),
            ("secure", PropertyValue::Bool(true)),
        ]);
        assert!(filter.matches(&properties));

        let filter = Filter::parse("(ratio=0.75)").unwrap();
        assert!(filter.matches(&props(&[("ratio", PropertyValue::Float(0.75))])));
    }

    #[test]
    fn test_escaped_special_characters() {
        let filter = Filter::parse(r"(path=\(root\)\*)").unwrap();
        assert!(filter.matches(&props(&[("path", PropertyValue::from("(root)*"))])));
    }

    #[test]
    fn test_parse_errors_carry_position() {
        assert_eq!(Filter::parse("(a=1"), Err(FilterError::UnexpectedEnd(4)));
        assert_eq!(
            Filter::parse("(a=1))"),
            Err(FilterError::Trailing(5))
        );
        assert_eq!(Filter::parse("(=1)"), Err(FilterError::EmptyKey(1)));
        assert_eq!(Filter::parse("(&)"), Err(FilterError::EmptyComposite(2)));
    }

    #[test]
    fn test_display_round_trips() {
        for input in ["(&(a=1)(b=ser*01))", "(!(c=*))", r"(path=\(x\))"] {
            let filter = Filter::parse(input).unwrap();
            let reparsed = Filter::parse(&filter.to_string()).unwrap();
            assert_eq!(filter, reparsed);
        }
    }
}
