//! Value codec for the command-station wire format.
//!
//! Values are integers, bare tokens or quoted literals (`""` escapes a quote).
//! Options are `name` or `name[value,value,...]`, and commands are
//! `name(id,option,option,...)`.

use super::error::{ArgumentError, CodecResult, FormatError};
use super::value::{ObjectId, ObjectOption, Value};

/// Read position within a single protocol line.
pub struct Cursor<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Cursor<'a> {
    /// Start reading `src` at its beginning.
    pub fn new(src: &'a str) -> Self {
        Self::at(src, 0)
    }

    /// Start reading `src` at byte offset `index`.
    pub fn at(src: &'a str, index: usize) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index: index.min(src.len()),
        }
    }

    /// Current byte offset.
    pub fn position(&self) -> usize {
        self.index
    }

    /// Unread remainder of the line.
    pub fn rest(&self) -> &'a str {
        &self.src[self.index..]
    }

    /// True once every byte has been consumed.
    pub fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    /// Next byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    /// Consume one byte.
    pub fn advance(&mut self) {
        if self.index < self.bytes.len() {
            self.index += 1;
        }
    }

    /// Skip whitespace; returns true if input remains.
    pub fn skip_ws(&mut self) -> bool {
        while let Some(ch) = self.peek() {
            if ch.is_ascii_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
        !self.eof()
    }

    /// Consume `expected` if it is next.
    pub fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Build a format error at the current position.
    pub fn error(&self, message: &str) -> FormatError {
        FormatError::new(message, self.src, self.index)
    }

    fn quoted(&mut self) -> String {
        // consume opening quote
        self.advance();
        let mut buf = String::new();
        let mut chars = self.rest().char_indices().peekable();
        let mut consumed = self.rest().len();
        while let Some((offset, ch)) = chars.next() {
            match ch {
                '"' => {
                    if let Some((_, '"')) = chars.peek() {
                        chars.next();
                        buf.push('"');
                    } else {
                        consumed = offset + 1;
                        break;
                    }
                }
                '\n' => buf.push(' '),
                '\r' => {}
                other => buf.push(other),
            }
        }
        self.index += consumed;
        buf
    }

    fn token(&mut self) -> &'a str {
        let start = self.index;
        while let Some(ch) = self.peek() {
            if is_delimiter(ch) {
                break;
            }
            self.advance();
        }
        &self.src[start..self.index]
    }
}

fn is_delimiter(ch: u8) -> bool {
    matches!(ch, b'{' | b',' | b'[' | b']' | b')' | b'}') || ch.is_ascii_whitespace()
}

/// Parse one value at the cursor.
pub fn parse_value(cursor: &mut Cursor<'_>) -> CodecResult<Value> {
    if !cursor.skip_ws() {
        return Err(cursor.error("unexpected end of line, value expected"));
    }

    if cursor.peek() == Some(b'"') {
        return Ok(Value::Text(cursor.quoted()));
    }

    let token = cursor.token();
    if token.is_empty() {
        return Err(cursor.error("value expected"));
    }
    match token.parse::<i32>() {
        Ok(value) => Ok(Value::Int(value)),
        Err(_) => Ok(Value::Symbol(token.to_string())),
    }
}

/// Parse one `name` or `name[value,...]` option at the cursor.
pub fn parse_option(cursor: &mut Cursor<'_>) -> CodecResult<ObjectOption> {
    let name = match parse_value(cursor)? {
        Value::Symbol(name) | Value::Text(name) => name,
        Value::Int(_) => return Err(cursor.error("option name missing")),
    };

    let mut values = Vec::new();
    cursor.skip_ws();
    if cursor.eat(b'[') {
        cursor.skip_ws();
        if cursor.eat(b']') {
            return Ok(ObjectOption::new(name, values));
        }
        loop {
            if cursor.eof() {
                return Err(cursor.error("unterminated option value list"));
            }
            values.push(parse_value(cursor)?);
            cursor.skip_ws();
            match cursor.peek() {
                Some(b']') => {
                    cursor.advance();
                    break;
                }
                Some(b',') => cursor.advance(),
                None => return Err(cursor.error("unterminated option value list")),
                Some(_) => return Err(cursor.error("option value expected")),
            }
        }
    }

    Ok(ObjectOption::new(name, values))
}

/// Quote `text` as a wire literal.
pub fn quote(text: &str) -> String {
    let mut buf = String::with_capacity(text.len() + 2);
    buf.push('"');
    for ch in text.chars() {
        match ch {
            '"' => buf.push_str("\"\""),
            '\n' => buf.push(' '),
            '\r' => {}
            other => buf.push(other),
        }
    }
    buf.push('"');
    buf
}

fn check_bare(token: &str, what: &str) -> Result<(), ArgumentError> {
    if token.is_empty() {
        return Err(ArgumentError(format!("empty {what}")));
    }
    if token.starts_with('"') || token.bytes().any(|ch| is_delimiter(ch) || ch == b'(') {
        return Err(ArgumentError(format!("{what} `{token}` must be quoted")));
    }
    if token.parse::<i32>().is_ok() {
        return Err(ArgumentError(format!("{what} `{token}` would read back as an integer")));
    }
    Ok(())
}

/// Append the wire form of `option` to `buf`.
pub fn write_option_into(buf: &mut String, option: &ObjectOption) -> Result<(), ArgumentError> {
    check_bare(&option.name, "option name")?;
    buf.push_str(&option.name);

    if !option.values.is_empty() {
        buf.push('[');
        for (index, value) in option.values.iter().enumerate() {
            if index > 0 {
                buf.push(',');
            }
            match value {
                Value::Int(value) => buf.push_str(&value.to_string()),
                Value::Text(text) => buf.push_str(&quote(text)),
                Value::Symbol(token) => {
                    check_bare(token, "bare value")?;
                    buf.push_str(token);
                }
            }
        }
        buf.push(']');
    }
    Ok(())
}

/// Serialize one option.
pub fn write_option(option: &ObjectOption) -> Result<String, ArgumentError> {
    let mut buf = String::new();
    write_option_into(&mut buf, option)?;
    Ok(buf)
}

/// Serialize a `name(id,option,...)` command.
pub fn write_command(
    name: &str,
    id: ObjectId,
    options: &[ObjectOption],
) -> Result<String, ArgumentError> {
    check_bare(name, "command name")?;
    let mut buf = format!("{name}({id}");
    for option in options {
        buf.push(',');
        write_option_into(&mut buf, option)?;
    }
    buf.push(')');
    Ok(buf)
}

/// A parsed `name(id,option,...)` command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name (`get`, `set`, `request`, ...)
    pub name: String,
    /// Target object id
    pub id: ObjectId,
    /// Options in wire order
    pub options: Vec<ObjectOption>,
}

/// Parse a command line as written by [`write_command`].
pub fn parse_command(text: &str) -> CodecResult<Command> {
    let text = text.trim();
    let open = text
        .find('(')
        .ok_or_else(|| FormatError::new("`(` expected after command name", text, text.len()))?;
    let name = text[..open].trim();
    if name.is_empty() {
        return Err(FormatError::new("command name missing", text, 0));
    }

    let mut cursor = Cursor::at(text, open + 1);
    let id = parse_value(&mut cursor)?
        .as_int()
        .ok_or_else(|| cursor.error("object id expected"))?;

    let mut options = Vec::new();
    loop {
        cursor.skip_ws();
        match cursor.peek() {
            Some(b')') => {
                cursor.advance();
                break;
            }
            Some(b',') => {
                cursor.advance();
                options.push(parse_option(&mut cursor)?);
            }
            None => return Err(cursor.error("unterminated command")),
            Some(_) => return Err(cursor.error("`,` or `)` expected")),
        }
    }
    if cursor.skip_ws() {
        return Err(cursor.error("trailing input after command"));
    }

    Ok(Command {
        name: name.to_string(),
        id,
        options,
    })
}
