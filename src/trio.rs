//! Line-oriented textual codec for record dicts.
//!
//! One tag per line: a bare name encodes a marker, `name:value` encodes
//! everything else. Nested dicts and lists are written inline. The engine
//! treats the encoding as opaque bytes in the `trio` field of a record hash;
//! the only contract is `decode(encode(d)) == d` for every supported value
//! kind.
//!
//! ## Scalar grammar
//!
//! ```text
//! marker        site              (bare tag name, no value)
//! remove        R                 (diff sentinel)
//! bool          T | F
//! number        72.5°F  -15  1.2e3  INF  -INF  NaN   (unit appended)
//! string        "chilled water\n2nd floor"
//! uri           `http://example.org/a b`
//! ref           @p:demo:r:1
//! date          2024-01-15
//! time          09:30:00  09:30:00.250
//! datetime      2024-01-15T09:30:00-05:00 New_York
//! coord         C(37.55,-77.45)
//! bytes         Bin(aGVsbG8=)
//! dict          {dis:"A" site}
//! list          [1,2,"x"]
//! ```
//!
//! Tag names start with a lowercase letter, so the timezone word after a
//! datetime (always uppercase-initial) never collides with a following tag
//! inside an inline dict.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveTime};

use crate::error::{Error, Result};
use crate::types::{is_tag_name, tz_by_name, tz_short_name, Coord, Dict, Number, Ref, TagVal};

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a dict, one tag per line.
pub fn encode(dict: &Dict) -> String {
    let mut out = String::new();
    write(dict, &mut out);
    out
}

/// Encodes a dict into an existing buffer.
pub fn write(dict: &Dict, out: &mut String) {
    for (name, val) in dict.iter() {
        out.push_str(name);
        if !val.is_marker() {
            out.push(':');
            write_val(val, out);
        }
        out.push('\n');
    }
}

fn write_val(val: &TagVal, out: &mut String) {
    match val {
        TagVal::Marker => out.push('M'),
        TagVal::Remove => out.push('R'),
        TagVal::Bool(true) => out.push('T'),
        TagVal::Bool(false) => out.push('F'),
        TagVal::Num(n) => write_num(n, out),
        TagVal::Str(s) => write_str(s, out),
        TagVal::Uri(u) => write_uri(u, out),
        TagVal::Ref(r) => {
            out.push('@');
            out.push_str(r.id());
        }
        TagVal::Date(d) => out.push_str(&d.format("%Y-%m-%d").to_string()),
        TagVal::Time(t) => write_time(*t, out),
        TagVal::DateTime(dt) => {
            let fixed = dt.fixed_offset();
            out.push_str(&fixed.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
            out.push(' ');
            out.push_str(tz_short_name(dt.timezone()));
        }
        TagVal::Coord(c) => {
            out.push_str(&format!("C({},{})", c.lat, c.lng));
        }
        TagVal::Bytes(b) => {
            out.push_str("Bin(");
            out.push_str(&B64.encode(b));
            out.push(')');
        }
        TagVal::Dict(d) => write_inline_dict(d, out),
        TagVal::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_val(item, out);
            }
            out.push(']');
        }
    }
}

fn write_num(n: &Number, out: &mut String) {
    if n.val.is_nan() {
        out.push_str("NaN");
    } else if n.val.is_infinite() {
        out.push_str(if n.val > 0.0 { "INF" } else { "-INF" });
    } else {
        out.push_str(&format!("{}", n.val));
    }
    if let Some(unit) = &n.unit {
        out.push_str(unit);
    }
}

fn write_str(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_uri(u: &str, out: &mut String) {
    out.push('`');
    for c in u.chars() {
        match c {
            '`' => out.push_str("\\`"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('`');
}

fn write_time(t: NaiveTime, out: &mut String) {
    use chrono::Timelike;
    if t.nanosecond() == 0 {
        out.push_str(&t.format("%H:%M:%S").to_string());
    } else {
        out.push_str(&t.format("%H:%M:%S%.3f").to_string());
    }
}

fn write_inline_dict(d: &Dict, out: &mut String) {
    out.push('{');
    let mut first = true;
    for (name, val) in d.iter() {
        if !first {
            out.push(' ');
        }
        first = false;
        out.push_str(name);
        if !val.is_marker() {
            out.push(':');
            write_val(val, out);
        }
    }
    out.push('}');
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes a dict from its textual form.
pub fn decode(text: &str) -> Result<Dict> {
    let mut dict = Dict::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        let line_num = lineno + 1;
        match line.find(':') {
            None => {
                let name = line.trim();
                if !is_tag_name(name) {
                    return Err(err(line_num, format!("invalid tag name '{}'", name)));
                }
                dict.insert(name, TagVal::Marker);
            }
            Some(colon) => {
                let name = line[..colon].trim();
                if !is_tag_name(name) {
                    return Err(err(line_num, format!("invalid tag name '{}'", name)));
                }
                let mut p = Parser::new(&line[colon + 1..], line_num);
                let val = p.parse_val("")?;
                p.expect_end()?;
                dict.insert(name, val);
            }
        }
    }
    Ok(dict)
}

fn err(line: usize, msg: impl Into<String>) -> Error {
    Error::Encoding {
        line,
        msg: msg.into(),
    }
}

/// Character cursor over a single value expression.
struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, line: usize) -> Self {
        Parser {
            chars: src.chars().collect(),
            pos: 0,
            line,
            src,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.chars.len() {
            Ok(())
        } else {
            Err(err(
                self.line,
                format!("trailing characters in value '{}'", self.src),
            ))
        }
    }

    fn fail(&self, msg: impl Into<String>) -> Error {
        err(self.line, msg)
    }

    /// Parses one value. `stops` holds the delimiter characters of the
    /// enclosing context (empty at top level, `" }"` inside a dict,
    /// `",]"` inside a list).
    fn parse_val(&mut self, stops: &str) -> Result<TagVal> {
        match self.peek() {
            None => Err(self.fail("empty value")),
            Some('"') => self.parse_str(),
            Some('`') => self.parse_uri(),
            Some('@') => self.parse_ref(),
            Some('{') => self.parse_dict(),
            Some('[') => self.parse_list(),
            Some(_) => self.parse_scalar(stops),
        }
    }

    fn parse_str(&mut self) -> Result<TagVal> {
        self.next(); // opening quote
        let mut s = String::new();
        loop {
            match self.next() {
                None => return Err(self.fail("unterminated string")),
                Some('"') => return Ok(TagVal::Str(s)),
                Some('\\') => match self.next() {
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some('n') => s.push('\n'),
                    Some('r') => s.push('\r'),
                    Some('t') => s.push('\t'),
                    Some('u') => {
                        let mut code = 0u32;
                        for _ in 0..4 {
                            let d = self
                                .next()
                                .and_then(|c| c.to_digit(16))
                                .ok_or_else(|| self.fail("invalid \\u escape"))?;
                            code = code * 16 + d;
                        }
                        s.push(
                            char::from_u32(code)
                                .ok_or_else(|| self.fail("invalid \\u escape"))?,
                        );
                    }
                    _ => return Err(self.fail("invalid string escape")),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn parse_uri(&mut self) -> Result<TagVal> {
        self.next(); // opening backtick
        let mut s = String::new();
        loop {
            match self.next() {
                None => return Err(self.fail("unterminated uri")),
                Some('`') => return Ok(TagVal::Uri(s)),
                Some('\\') => match self.next() {
                    Some('`') => s.push('`'),
                    Some('\\') => s.push('\\'),
                    Some('n') => s.push('\n'),
                    _ => return Err(self.fail("invalid uri escape")),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn parse_ref(&mut self) -> Result<TagVal> {
        self.next(); // '@'
        let mut id = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-' | '.' | '~') {
                id.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if id.is_empty() {
            return Err(self.fail("empty ref id"));
        }
        Ok(TagVal::Ref(Ref::new(id)))
    }

    fn parse_dict(&mut self) -> Result<TagVal> {
        self.next(); // '{'
        let mut dict = Dict::new();
        loop {
            while self.peek() == Some(' ') {
                self.pos += 1;
            }
            match self.peek() {
                None => return Err(self.fail("unterminated dict")),
                Some('}') => {
                    self.pos += 1;
                    return Ok(TagVal::Dict(dict));
                }
                Some(_) => {
                    let name = self.parse_tag_name()?;
                    if self.peek() == Some(':') {
                        self.pos += 1;
                        let val = self.parse_val(" }")?;
                        dict.insert(name, val);
                    } else {
                        dict.insert(name, TagVal::Marker);
                    }
                }
            }
        }
    }

    fn parse_tag_name(&mut self) -> Result<String> {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if !is_tag_name(&name) {
            return Err(self.fail(format!("invalid tag name '{}'", name)));
        }
        Ok(name)
    }

    fn parse_list(&mut self) -> Result<TagVal> {
        self.next(); // '['
        let mut items = Vec::new();
        loop {
            while self.peek() == Some(' ') {
                self.pos += 1;
            }
            match self.peek() {
                None => return Err(self.fail("unterminated list")),
                Some(']') => {
                    self.pos += 1;
                    return Ok(TagVal::List(items));
                }
                Some(',') => {
                    self.pos += 1;
                }
                Some(_) => items.push(self.parse_val(",]")?),
            }
        }
    }

    /// Parses an unquoted scalar token: bool, remove, number, coord, bytes,
    /// date, time, or datetime.
    fn parse_scalar(&mut self, stops: &str) -> Result<TagVal> {
        // Coord and Bin have an explicit parenthesized form.
        if self.lookahead("C(") {
            return self.parse_coord();
        }
        if self.lookahead("Bin(") {
            return self.parse_bin();
        }

        // Scalars never contain spaces; a datetime's timezone word is
        // consumed separately after the token.
        let mut scalar_stops = String::from(stops);
        scalar_stops.push(' ');
        let token = self.take_token(&scalar_stops);
        match token.as_str() {
            "M" => return Ok(TagVal::Marker),
            "R" => return Ok(TagVal::Remove),
            "T" => return Ok(TagVal::Bool(true)),
            "F" => return Ok(TagVal::Bool(false)),
            "NaN" => return Ok(TagVal::Num(Number::new(f64::NAN))),
            "INF" => return Ok(TagVal::Num(Number::new(f64::INFINITY))),
            "-INF" => return Ok(TagVal::Num(Number::new(f64::NEG_INFINITY))),
            _ => {}
        }

        // Datetime: date shape plus a 'T' separator; the timezone word
        // follows after a space.
        if token.len() > 10 && token.as_bytes().get(10) == Some(&b'T') {
            return self.parse_datetime(&token);
        }
        // Date: YYYY-MM-DD
        if token.len() == 10 && token.as_bytes()[4] == b'-' {
            let date = NaiveDate::parse_from_str(&token, "%Y-%m-%d")
                .map_err(|e| self.fail(format!("invalid date '{}': {}", token, e)))?;
            return Ok(TagVal::Date(date));
        }
        // Time: HH:MM:SS[.fff]
        if token.len() >= 8 && token.as_bytes()[2] == b':' {
            let fmt = if token.contains('.') { "%H:%M:%S%.f" } else { "%H:%M:%S" };
            let time = NaiveTime::parse_from_str(&token, fmt)
                .map_err(|e| self.fail(format!("invalid time '{}': {}", token, e)))?;
            return Ok(TagVal::Time(time));
        }

        self.parse_number(&token)
    }

    fn lookahead(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.chars.get(self.pos + i) == Some(&c))
    }

    /// Consumes characters up to (not including) the first stop character.
    fn take_token(&mut self, stops: &str) -> String {
        let mut token = String::new();
        while let Some(c) = self.peek() {
            if stops.contains(c) {
                break;
            }
            token.push(c);
            self.pos += 1;
        }
        token
    }

    fn parse_datetime(&mut self, token: &str) -> Result<TagVal> {
        let fixed = DateTime::parse_from_rfc3339(token)
            .map_err(|e| self.fail(format!("invalid datetime '{}': {}", token, e)))?;

        // The timezone word follows after one space. Inside an inline dict
        // the space doubles as the tag separator; tag names start lowercase,
        // so an uppercase-initial word here is unambiguously the zone.
        if self.peek() == Some(' ') {
            let mark = self.pos;
            self.pos += 1;
            let word = self.take_token(" ,]}");
            if let Some(tz) = tz_by_name(&word) {
                return Ok(TagVal::DateTime(fixed.with_timezone(&tz)));
            }
            self.pos = mark;
        }
        Err(self.fail(format!("datetime '{}' missing timezone name", token)))
    }

    fn parse_coord(&mut self) -> Result<TagVal> {
        self.pos += 2; // "C("
        let body = self.take_token(")");
        if self.next() != Some(')') {
            return Err(self.fail("unterminated coord"));
        }
        let (lat, lng) = body
            .split_once(',')
            .ok_or_else(|| self.fail("coord missing comma"))?;
        let lat = lat
            .parse::<f64>()
            .map_err(|_| self.fail(format!("invalid coord lat '{}'", lat)))?;
        let lng = lng
            .parse::<f64>()
            .map_err(|_| self.fail(format!("invalid coord lng '{}'", lng)))?;
        Ok(TagVal::Coord(Coord { lat, lng }))
    }

    fn parse_bin(&mut self) -> Result<TagVal> {
        self.pos += 4; // "Bin("
        let body = self.take_token(")");
        if self.next() != Some(')') {
            return Err(self.fail("unterminated bin"));
        }
        let bytes = B64
            .decode(body.as_bytes())
            .map_err(|e| self.fail(format!("invalid base64: {}", e)))?;
        Ok(TagVal::Bytes(bytes))
    }

    fn parse_number(&mut self, token: &str) -> Result<TagVal> {
        // Split the numeric prefix from a trailing unit symbol.
        let bytes = token.as_bytes();
        let mut end = 0;
        while end < bytes.len() {
            let b = bytes[end];
            let exp_follows = |i: usize| match bytes.get(i + 1) {
                Some(d) if d.is_ascii_digit() => true,
                Some(b'-') | Some(b'+') => bytes.get(i + 2).is_some_and(u8::is_ascii_digit),
                _ => false,
            };
            let numeric = b.is_ascii_digit()
                || b == b'.'
                || ((b == b'-' || b == b'+') && (end == 0 || matches!(bytes[end - 1], b'e' | b'E')))
                || ((b == b'e' || b == b'E')
                    && end > 0
                    && bytes[..end].iter().any(|c| c.is_ascii_digit())
                    && exp_follows(end));
            if numeric {
                end += 1;
            } else {
                break;
            }
        }
        if end == 0 {
            return Err(self.fail(format!("invalid value '{}'", token)));
        }
        let val = token[..end]
            .parse::<f64>()
            .map_err(|_| self.fail(format!("invalid number '{}'", token)))?;
        let unit = &token[end..];
        if unit.is_empty() {
            Ok(TagVal::Num(Number::new(val)))
        } else {
            Ok(TagVal::Num(Number::with_unit(val, unit)))
        }
    }
}
