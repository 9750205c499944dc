//! AST node & evaluator (C2).

pub mod builder;
pub mod node;
pub mod opcode;

pub use builder::{root, NodeBuilder};
pub use node::{eval, Environment, Node, Payload, Variable};
pub use opcode::{Opcode, OpcodeInfo};
