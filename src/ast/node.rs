//! AST node, row environment, and the recursive evaluator (C2).

use crate::error::Error;
use crate::value::Value;

use super::opcode::Opcode;

/// A single input column's state for one row.
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Categorical(u32),
    Continuous(f32),
    Missing,
}

impl Variable {
    /// `value_of`: category as f64, continuous value as-is, NaN for missing.
    pub fn value_of(&self) -> f64 {
        match self {
            Variable::Categorical(c) => *c as f64,
            Variable::Continuous(v) => *v as f64,
            Variable::Missing => f64::NAN,
        }
    }
}

/// A row: a fixed-length sequence of input variables.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub row: Vec<Variable>,
}

impl Environment {
    pub fn new(row: Vec<Variable>) -> Self {
        Self { row }
    }
}

/// Either a branch node's children, or a leaf node's embedded constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Children(Vec<Node>),
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub opcode: Opcode,
    pub payload: Payload,
}

impl Node {
    pub fn leaf(opcode: Opcode, value: Value) -> Self {
        Self {
            opcode,
            payload: Payload::Value(value),
        }
    }

    pub fn branch(opcode: Opcode, children: Vec<Node>) -> Self {
        Self {
            opcode,
            payload: Payload::Children(children),
        }
    }

    pub fn children(&self) -> &[Node] {
        match &self.payload {
            Payload::Children(c) => c,
            Payload::Value(_) => &[],
        }
    }

    /// Recursively verifies that every node's child count lies within its
    /// opcode's `[min_args, max_args]` bounds. Called after deserialization
    /// and available standalone for any hand-built tree.
    pub fn sanitycheck(&self) -> Result<(), Error> {
        let info = self.opcode.info();
        match &self.payload {
            Payload::Children(children) => {
                if !info.has_children {
                    return Err(Error::ArityViolation(info.name, 0, 0, children.len()));
                }
                if children.len() < info.min_args || children.len() > info.max_args {
                    return Err(Error::ArityViolation(
                        info.name,
                        info.min_args,
                        info.max_args,
                        children.len(),
                    ));
                }
                for child in children {
                    child.sanitycheck()?;
                }
            }
            Payload::Value(_) => {
                if !info.has_value {
                    return Err(Error::ArityViolation(info.name, 0, 0, 0));
                }
            }
        }
        Ok(())
    }
}

fn numeric_eval(v: &Value) -> Result<Option<f64>, Error> {
    match v {
        Value::Float(f) => Ok(Some(*f as f64)),
        Value::Int(i) => Ok(Some(*i as f64)),
        Value::Category(c) => Ok(Some(*c as f64)),
        Value::Missing => Ok(None),
        other => Err(Error::TypeMismatch {
            expected: "numeric",
            actual: other.type_name(),
        }),
    }
}

fn is_float(v: &Value) -> bool {
    matches!(v, Value::Float(_))
}

/// `eval(node, env) -> Value`, recursive, dispatched per opcode (§4.2).
pub fn eval(node: &Node, env: &Environment) -> Result<Value, Error> {
    match node.opcode {
        Opcode::Root => eval(&node.children()[0], env),
        Opcode::If => {
            let children = node.children();
            let cond = eval(&children[0], env)?.as_bool()?;
            if cond {
                eval(&children[1], env)
            } else {
                eval(&children[2], env)
            }
        }
        Opcode::Add => {
            let children = node.children();
            let a = eval(&children[0], env)?;
            let b = eval(&children[1], env)?;
            let (a_num, b_num) = (numeric_eval(&a)?, numeric_eval(&b)?);
            match (a_num, b_num) {
                (Some(a_num), Some(b_num)) => {
                    if is_float(&a) || is_float(&b) {
                        Ok(Value::Float((a_num + b_num) as f32))
                    } else {
                        Ok(Value::Int((a_num as i64 + b_num as i64) as i32))
                    }
                }
                _ => Ok(Value::Missing),
            }
        }
        Opcode::Lt => numeric_compare(node, env, |a, b| a < b),
        Opcode::Gt => numeric_compare(node, env, |a, b| a > b),
        Opcode::In => {
            let children = node.children();
            let needle = eval(&children[0], env)?;
            let haystack = eval(&children[1], env)?;
            match haystack {
                Value::Array(items) => Ok(Value::Bool(
                    items.iter().any(|item| item.values_equal(&needle)),
                )),
                other => Err(Error::TypeMismatch {
                    expected: "array",
                    actual: other.type_name(),
                }),
            }
        }
        Opcode::Var => {
            let idx = match &node.payload {
                Payload::Value(Value::Int(i)) => *i as usize,
                _ => unreachable!("var node always carries an Int index"),
            };
            let var = env
                .row
                .get(idx)
                .ok_or(Error::VarOutOfRange(idx, env.row.len()))?;
            Ok(match var {
                Variable::Categorical(c) => Value::Category(*c),
                Variable::Continuous(f) => Value::Float(*f),
                Variable::Missing => Value::Missing,
            })
        }
        Opcode::Category
        | Opcode::Float
        | Opcode::Int
        | Opcode::Bool
        | Opcode::String
        | Opcode::Array
        | Opcode::Constant => match &node.payload {
            Payload::Value(v) => Ok(v.clone()),
            Payload::Children(_) => unreachable!("leaf opcode carries children"),
        },
        Opcode::SetLocal | Opcode::GetLocal => {
            Err(Error::UnsupportedOpcode(node.opcode.info().name))
        }
    }
}

fn numeric_compare(
    node: &Node,
    env: &Environment,
    cmp: impl Fn(f64, f64) -> bool,
) -> Result<Value, Error> {
    let children = node.children();
    let a = eval(&children[0], env)?;
    let b = eval(&children[1], env)?;
    let (a_num, b_num) = (numeric_eval(&a)?, numeric_eval(&b)?);
    match (a_num, b_num) {
        (Some(a), Some(b)) => Ok(Value::Bool(cmp(a, b))),
        _ => Ok(Value::Bool(false)),
    }
}
