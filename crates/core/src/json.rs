//! JSON text codec for `Value`.
//!
//! The wire format of the engine (diffs, error envelopes, adapter payloads)
//! is JSON text. This module provides the renderer and a recursive-descent
//! parser between `Value` and JSON per RFC 8259.
//!
//! `Value::Error` renders as the error envelope `{"error": <message>}`;
//! parsing never produces an `Error` variant (the envelope parses back as a
//! plain object), since error values only originate inside the engine.

use crate::value::{Value, ValueObject};
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Error type for JSON parsing.
#[derive(Clone, Debug, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "JSON parse error at {}: {}", self.position, self.message)
    }
}

/// Renders a value as JSON text.
pub fn render(value: &Value) -> String {
    let mut out = String::new();
    render_into(value, &mut out);
    out
}

fn render_into(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => render_float(*f, out),
        Value::String(s) => render_string(s, out),
        Value::Array(vs) => {
            out.push('[');
            for (i, v) in vs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_into(v, out);
            }
            out.push(']');
        }
        Value::Object(o) => {
            out.push('{');
            for (i, (k, v)) in o.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_string(k, out);
                out.push(':');
                render_into(v, out);
            }
            out.push('}');
        }
        Value::Error(m) => {
            out.push_str("{\"error\":");
            render_string(m, out);
            out.push('}');
        }
    }
}

fn render_float(f: f64, out: &mut String) {
    if f.is_nan() || f.is_infinite() {
        // JSON has no representation for these
        out.push_str("null");
    } else if f == libm::trunc(f) && f.abs() < 1e15 {
        // keep a decimal point so the value parses back as a Float
        out.push_str(&format!("{:.1}", f));
    } else {
        out.push_str(&format!("{}", f));
    }
}

fn render_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Parses JSON text into a value.
pub fn parse(input: &str) -> Result<Value, ParseError> {
    let mut parser = Parser::new(input);
    parser.skip_whitespace();
    let value = parser.parse_value()?;
    parser.skip_whitespace();
    if parser.peek().is_some() {
        return Err(ParseError::new("trailing characters", parser.pos));
    }
    Ok(value)
}

/// Parser state.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(c) if c == expected => {
                self.advance();
                Ok(())
            }
            Some(c) => Err(ParseError::new(
                format!("expected '{}', found '{}'", expected, c),
                self.pos,
            )),
            None => Err(ParseError::new(
                format!("expected '{}', found end of input", expected),
                self.pos,
            )),
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.input[self.pos..].starts_with(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some('n') => {
                if self.eat_keyword("null") {
                    Ok(Value::Null)
                } else {
                    Err(ParseError::new("invalid literal", self.pos))
                }
            }
            Some('t') => {
                if self.eat_keyword("true") {
                    Ok(Value::Bool(true))
                } else {
                    Err(ParseError::new("invalid literal", self.pos))
                }
            }
            Some('f') => {
                if self.eat_keyword("false") {
                    Ok(Value::Bool(false))
                } else {
                    Err(ParseError::new("invalid literal", self.pos))
                }
            }
            Some('"') => self.parse_string().map(Value::String),
            Some('[') => self.parse_array(),
            Some('{') => self.parse_object(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(),
            Some(c) => Err(ParseError::new(
                format!("unexpected character '{}'", c),
                self.pos,
            )),
            None => Err(ParseError::new("unexpected end of input", self.pos)),
        }
    }

    fn parse_array(&mut self) -> Result<Value, ParseError> {
        self.expect('[')?;
        let mut elements = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(']') {
            self.advance();
            return Ok(Value::Array(elements));
        }
        loop {
            elements.push(self.parse_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.advance(),
                Some(']') => {
                    self.advance();
                    return Ok(Value::Array(elements));
                }
                _ => return Err(ParseError::new("expected ',' or ']'", self.pos)),
            }
        }
    }

    fn parse_object(&mut self) -> Result<Value, ParseError> {
        self.expect('{')?;
        let mut object = ValueObject::new();
        self.skip_whitespace();
        if self.peek() == Some('}') {
            self.advance();
            return Ok(Value::Object(object));
        }
        loop {
            self.skip_whitespace();
            let key = self.parse_string()?;
            self.expect(':')?;
            let value = self.parse_value()?;
            object.insert(key, value);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.advance(),
                Some('}') => {
                    self.advance();
                    return Ok(Value::Object(object));
                }
                _ => return Err(ParseError::new("expected ',' or '}'", self.pos)),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String, ParseError> {
        self.expect('"')?;
        let mut result = String::new();
        loop {
            match self.peek() {
                None => return Err(ParseError::new("unterminated string", self.pos)),
                Some('"') => {
                    self.advance();
                    return Ok(result);
                }
                Some('\\') => {
                    self.advance();
                    match self.peek() {
                        Some('"') => result.push('"'),
                        Some('\\') => result.push('\\'),
                        Some('/') => result.push('/'),
                        Some('n') => result.push('\n'),
                        Some('r') => result.push('\r'),
                        Some('t') => result.push('\t'),
                        Some('b') => result.push('\u{08}'),
                        Some('f') => result.push('\u{0C}'),
                        Some('u') => {
                            self.advance();
                            let code = self.parse_hex4()?;
                            let c = char::from_u32(code).ok_or_else(|| {
                                ParseError::new("invalid unicode escape", self.pos)
                            })?;
                            result.push(c);
                            continue;
                        }
                        _ => return Err(ParseError::new("invalid escape", self.pos)),
                    }
                    self.advance();
                }
                Some(c) => {
                    result.push(c);
                    self.advance();
                }
            }
        }
    }

    fn parse_hex4(&mut self) -> Result<u32, ParseError> {
        let mut code = 0u32;
        for _ in 0..4 {
            let c = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| ParseError::new("invalid hex digit", self.pos))?;
            code = code * 16 + c;
            self.advance();
        }
        Ok(code)
    }

    fn parse_number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.advance();
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        let mut is_float = false;
        if self.peek() == Some('.') {
            is_float = true;
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            self.advance();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.advance();
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }

        let text = &self.input[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| ParseError::new("invalid number", start))
        } else {
            // integers outside the i64 range fall back to Float
            match text.parse::<i64>() {
                Ok(i) => Ok(Value::Int(i)),
                Err(_) => text
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| ParseError::new("invalid number", start)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn roundtrip(v: &Value) -> Value {
        parse(&render(v)).unwrap()
    }

    #[test]
    fn test_render_scalars() {
        assert_eq!(render(&Value::Null), "null");
        assert_eq!(render(&Value::Bool(true)), "true");
        assert_eq!(render(&Value::Int(-42)), "-42");
        assert_eq!(render(&Value::Float(1.5)), "1.5");
        assert_eq!(render(&Value::Float(2.0)), "2.0");
        assert_eq!(render(&Value::from("hi")), "\"hi\"");
    }

    #[test]
    fn test_render_escapes() {
        assert_eq!(render(&Value::from("a\"b\\c\n")), "\"a\\\"b\\\\c\\n\"");
    }

    #[test]
    fn test_render_compound() {
        let mut obj = ValueObject::new();
        obj.insert("b".into(), Value::Int(2));
        obj.insert("a".into(), Value::Array(vec![Value::Null, Value::Int(1)]));
        let v = Value::Object(obj);
        assert_eq!(render(&v), "{\"a\":[null,1],\"b\":2}");
    }

    #[test]
    fn test_render_error_envelope() {
        let v = Value::Error("boom".into());
        assert_eq!(render(&v), "{\"error\":\"boom\"}");
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(parse("null").unwrap(), Value::Null);
        assert_eq!(parse(" true ").unwrap(), Value::Bool(true));
        assert_eq!(parse("-7").unwrap(), Value::Int(-7));
        assert_eq!(parse("2.25").unwrap(), Value::Float(2.25));
        assert_eq!(parse("1e3").unwrap(), Value::Float(1000.0));
        assert_eq!(parse("\"x\"").unwrap(), Value::from("x"));
    }

    #[test]
    fn test_parse_string_escapes() {
        assert_eq!(parse("\"a\\nb\"").unwrap(), Value::from("a\nb"));
        assert_eq!(parse("\"\\u0041\"").unwrap(), Value::from("A"));
    }

    #[test]
    fn test_parse_nested() {
        let v = parse("{\"xs\": [1, {\"y\": null}], \"z\": false}").unwrap();
        let obj = v.as_object().unwrap();
        let xs = obj.field("xs").unwrap().as_array().unwrap();
        assert_eq!(xs[0], Value::Int(1));
        assert!(xs[1].as_object().unwrap().field("y").unwrap().is_null());
        assert_eq!(obj.field("z"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("nul").is_err());
        assert!(parse("[1,]").is_err());
        assert!(parse("{\"a\" 1}").is_err());
        assert!(parse("1 2").is_err());
        assert!(parse("\"open").is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut obj = ValueObject::new();
        obj.insert("k".into(), Value::Array(vec![Value::Int(1), Value::from("s")]));
        let values = [
            Value::Null,
            Value::Int(i64::MAX),
            Value::Float(-0.5),
            Value::from("héllo\tworld"),
            Value::Array(vec![]),
            Value::Object(obj),
        ];
        for v in &values {
            assert_eq!(&roundtrip(v), v);
        }
    }
}
