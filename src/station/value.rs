//! Protocol data model: values, named options and per-object result rows.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric id of an object on the command station.
pub type ObjectId = i32;

/// A single protocol value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Base-10 signed integer
    Int(i32),
    /// Bare token without whitespace or delimiters
    Symbol(String),
    /// Quoted literal; may carry whitespace and quotes
    Text(String),
}

impl Value {
    /// Quoted text value.
    pub fn text(text: impl Into<String>) -> Self {
        Value::Text(text.into())
    }

    /// Bare token value.
    pub fn symbol(token: impl Into<String>) -> Self {
        Value::Symbol(token.into())
    }

    /// Integer content, if any.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Text content of either a bare token or a quoted literal.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Symbol(text) | Value::Text(text) => Some(text),
            Value::Int(_) => None,
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::Int(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Int(value.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Symbol(token) => f.write_str(token),
            Value::Text(text) => f.write_str(&super::codec::quote(text)),
        }
    }
}

/// A named, ordered tuple of values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectOption {
    /// Option name
    pub name: String,
    /// Option values in wire order
    pub values: Vec<Value>,
}

impl ObjectOption {
    /// Option with values.
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Option without values (`name`).
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Append a value.
    pub fn with(mut self, value: impl Into<Value>) -> Self {
        self.values.push(value.into());
        self
    }

    /// Value at `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Integer value at `index`.
    pub fn int(&self, index: usize) -> Option<i32> {
        self.value(index).and_then(Value::as_int)
    }

    /// Text value at `index`.
    pub fn text(&self, index: usize) -> Option<&str> {
        self.value(index).and_then(Value::as_str)
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for ObjectOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.values.is_empty() {
            f.write_str("[")?;
            for (index, value) in self.values.iter().enumerate() {
                if index > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{value}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

/// The options reported for one object within a single message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionResult {
    /// Object id
    pub id: ObjectId,
    /// Options in wire order
    pub options: Vec<ObjectOption>,
}

impl OptionResult {
    /// Create a result row.
    pub fn new(id: ObjectId, options: Vec<ObjectOption>) -> Self {
        Self { id, options }
    }

    /// First option with the given name (case-insensitive).
    pub fn option(&self, name: &str) -> Option<&ObjectOption> {
        self.options.iter().find(|option| option.is(name))
    }

    /// First value of the named option as text.
    pub fn text_of(&self, name: &str) -> Option<&str> {
        self.option(name).and_then(|option| option.text(0))
    }

    /// First value of the named option as integer.
    pub fn int_of(&self, name: &str) -> Option<i32> {
        self.option(name).and_then(|option| option.int(0))
    }
}

impl fmt::Display for OptionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        for option in &self.options {
            write!(f, " {option}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_wire_form() {
        let option = ObjectOption::named("name").with(Value::text("BR \"218\""));
        let result = OptionResult::new(1002, vec![option, ObjectOption::named("stop")]);
        assert_eq!(result.to_string(), "1002 name[\"BR \"\"218\"\"\"] stop");
    }

    #[test]
    fn lookups_ignore_case() {
        let result = OptionResult::new(
            1,
            vec![
                ObjectOption::named("Status").with(Value::symbol("GO")),
                ObjectOption::named("addr").with(3),
            ],
        );
        assert_eq!(result.text_of("status"), Some("GO"));
        assert_eq!(result.int_of("ADDR"), Some(3));
        assert_eq!(result.int_of("status"), None);
        assert!(result.option("missing").is_none());
    }
}
