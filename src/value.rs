//! Tagged value union carried by the AST interpreter and the wire codec (C1).

use std::fmt;

use crate::error::Error;

pub const TAG_FLOAT: u8 = 1;
pub const TAG_CATEGORY: u8 = 2;
pub const TAG_INT: u8 = 3;
pub const TAG_BOOL: u8 = 4;
pub const TAG_MISSING: u8 = 5;
pub const TAG_ARRAY: u8 = 6;
pub const TAG_STRING: u8 = 7;

/// A single value flowing through the interpreter: one of a float, an integer,
/// a boolean, a category label, a missing marker, an owned string, or an
/// owned array of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f32),
    Int(i32),
    Bool(bool),
    Category(u32),
    Missing,
    String(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn tag(&self) -> u8 {
        match self {
            Value::Float(_) => TAG_FLOAT,
            Value::Category(_) => TAG_CATEGORY,
            Value::Int(_) => TAG_INT,
            Value::Bool(_) => TAG_BOOL,
            Value::Missing => TAG_MISSING,
            Value::Array(_) => TAG_ARRAY,
            Value::String(_) => TAG_STRING,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Float(_) => "float",
            Value::Category(_) => "category",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Missing => "missing",
            Value::Array(_) => "array",
            Value::String(_) => "string",
        }
    }

    fn type_name_of_tag(tag: u8) -> &'static str {
        match tag {
            TAG_FLOAT => "float",
            TAG_CATEGORY => "category",
            TAG_INT => "int",
            TAG_BOOL => "bool",
            TAG_MISSING => "missing",
            TAG_ARRAY => "array",
            TAG_STRING => "string",
            _ => "<bad value>",
        }
    }

    /// Fails with a category-mismatch error enumerating expected vs. actual tag.
    pub fn check_type(&self, expected: u8) -> Result<(), Error> {
        if self.tag() != expected {
            return Err(Error::TypeMismatch {
                expected: Self::type_name_of_tag(expected),
                actual: self.type_name(),
            });
        }
        Ok(())
    }

    pub fn as_bool(&self) -> Result<bool, Error> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(Error::TypeMismatch {
                expected: "bool",
                actual: self.type_name(),
            }),
        }
    }

    /// Tag-aware equality: values of different tags are never equal, except
    /// that comparisons never participate in codec-level equality contracts
    /// for floats (see §3) -- used only by `in`, not the codec round-trip law.
    pub fn values_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Category(a), Value::Category(b)) => a == b,
            (Value::Missing, Value::Missing) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.values_equal(y))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{:.2}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Category(c) => write!(f, "C{}", c),
            Value::Missing => write!(f, "<missing>"),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_stable_form() {
        assert_eq!(Value::Category(2).to_string(), "C2");
        assert_eq!(Value::Missing.to_string(), "<missing>");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::String("hi".into()).to_string(), "\"hi\"");
        assert_eq!(
            Value::Array(vec![Value::Category(1), Value::Category(2)]).to_string(),
            "[C1,C2]"
        );
    }

    #[test]
    fn check_type_reports_both_tags() {
        let err = Value::Int(3).check_type(TAG_FLOAT).unwrap_err();
        assert_eq!(
            err.to_string(),
            "type mismatch: expected float, got int"
        );
    }

    #[test]
    fn values_equal_is_tag_aware() {
        assert!(!Value::Int(1).values_equal(&Value::Float(1.0)));
        assert!(Value::Category(3).values_equal(&Value::Category(3)));
    }
}
