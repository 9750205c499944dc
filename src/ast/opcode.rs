//! The closed opcode enumeration (C2). Opcode numbers are a wire contract: never
//! renumber an existing variant, only append new ones.
//!
//! This replaces the original's `nodetype_t { name, flags, min, max, eval }`
//! vtable-style struct with a closed enum plus a `const fn` dispatch table, the
//! same "enum + match instead of vtable" shape the teacher uses for its worker
//! request dispatch (`ampc::Worker::handle`).

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Root = 0,
    If = 1,
    Add = 2,
    Lt = 3,
    Gt = 4,
    In = 5,
    Var = 6,
    Category = 7,
    Float = 8,
    Int = 9,
    Bool = 10,
    String = 11,
    Array = 12,
    Constant = 13,
    SetLocal = 14,
    GetLocal = 15,
}

/// Static shape of an opcode: argument bounds and which payload kind it carries.
pub struct OpcodeInfo {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub has_children: bool,
    pub has_value: bool,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Result<Opcode, Error> {
        use Opcode::*;
        Ok(match b {
            0 => Root,
            1 => If,
            2 => Add,
            3 => Lt,
            4 => Gt,
            5 => In,
            6 => Var,
            7 => Category,
            8 => Float,
            9 => Int,
            10 => Bool,
            11 => String,
            12 => Array,
            13 => Constant,
            14 => SetLocal,
            15 => GetLocal,
            other => return Err(Error::UnknownOpcode(other)),
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn info(self) -> OpcodeInfo {
        use Opcode::*;
        match self {
            Root => OpcodeInfo {
                name: "root",
                min_args: 1,
                max_args: 1,
                has_children: true,
                has_value: false,
            },
            If => OpcodeInfo {
                name: "if",
                min_args: 3,
                max_args: 3,
                has_children: true,
                has_value: false,
            },
            Add => OpcodeInfo {
                name: "add",
                min_args: 2,
                max_args: 2,
                has_children: true,
                has_value: false,
            },
            Lt => OpcodeInfo {
                name: "lt",
                min_args: 2,
                max_args: 2,
                has_children: true,
                has_value: false,
            },
            Gt => OpcodeInfo {
                name: "gt",
                min_args: 2,
                max_args: 2,
                has_children: true,
                has_value: false,
            },
            In => OpcodeInfo {
                name: "in",
                min_args: 2,
                max_args: 2,
                has_children: true,
                has_value: false,
            },
            Var => OpcodeInfo {
                name: "var",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
            Category => OpcodeInfo {
                name: "category",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
            Float => OpcodeInfo {
                name: "float",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
            Int => OpcodeInfo {
                name: "int",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
            Bool => OpcodeInfo {
                name: "bool",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
            String => OpcodeInfo {
                name: "string",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
            Array => OpcodeInfo {
                name: "array",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
            Constant => OpcodeInfo {
                name: "constant",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
            SetLocal => OpcodeInfo {
                name: "setlocal",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
            GetLocal => OpcodeInfo {
                name: "getlocal",
                min_args: 0,
                max_args: 0,
                has_children: false,
                has_value: true,
            },
        }
    }
}
