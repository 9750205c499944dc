//! Scope-guard tree builder replacing the original's `START_CODE`/`IF`/`THEN`/
//! `ELSE`/`END` parent-pointer macros (see SPEC_FULL.md §9 / REDESIGN FLAGS).
//!
//! A `NodeBuilder` pushes a frame per branch opcode; closing the frame with
//! `end()` validates the argument count against the opcode's bounds instead of
//! relying on an `assert!` inside a macro.

use crate::error::Error;
use crate::value::Value;

use super::node::Node;
use super::opcode::Opcode;

struct Frame {
    opcode: Opcode,
    children: Vec<Node>,
}

pub struct NodeBuilder {
    stack: Vec<Frame>,
    finished: Vec<Node>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            finished: Vec::new(),
        }
    }

    fn push_complete(&mut self, node: Node) {
        if let Some(top) = self.stack.last_mut() {
            top.children.push(node);
        } else {
            self.finished.push(node);
        }
    }

    /// Opens a branch frame (e.g. `if`, `add`); subsequent `leaf`/`branch`
    /// calls append children to it until a matching `end()`.
    pub fn begin(&mut self, opcode: Opcode) -> &mut Self {
        self.stack.push(Frame {
            opcode,
            children: Vec::new(),
        });
        self
    }

    /// Closes the innermost open frame, validating its child count.
    pub fn end(&mut self) -> Result<&mut Self, Error> {
        let frame = self.stack.pop().expect("end() with no open frame");
        let info = frame.opcode.info();
        let n = frame.children.len();
        if n < info.min_args || n > info.max_args {
            return Err(Error::ArityViolation(info.name, info.min_args, info.max_args, n));
        }
        self.push_complete(Node::branch(frame.opcode, frame.children));
        Ok(self)
    }

    /// Appends a leaf node carrying an embedded value.
    pub fn leaf(&mut self, opcode: Opcode, value: Value) -> &mut Self {
        self.push_complete(Node::leaf(opcode, value));
        self
    }

    /// Finishes the build. Fails if any frame was left open.
    pub fn finish(mut self) -> Result<Node, Error> {
        if !self.stack.is_empty() {
            return Err(Error::ArityViolation("<unclosed>", 0, 0, self.stack.len()));
        }
        self.finished
            .pop()
            .ok_or(Error::ArityViolation("<empty>", 1, 1, 0))
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience: wraps a single expression in a `root` node, matching
/// `START_CODE`'s implicit top-level `node_root`.
pub fn root(expr: Node) -> Node {
    Node::branch(Opcode::Root, vec![expr])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::node::{eval, Environment, Variable};

    // Builds: if(gt(add(var0,var1), var2), category(1), category(2))
    fn if_gt_add_tree() -> Node {
        root(Node::branch(
            Opcode::If,
            vec![
                Node::branch(
                    Opcode::Gt,
                    vec![
                        Node::branch(
                            Opcode::Add,
                            vec![
                                Node::leaf(Opcode::Var, Value::Int(0)),
                                Node::leaf(Opcode::Var, Value::Int(1)),
                            ],
                        ),
                        Node::leaf(Opcode::Var, Value::Int(2)),
                    ],
                ),
                Node::leaf(Opcode::Category, Value::Category(1)),
                Node::leaf(Opcode::Category, Value::Category(2)),
            ],
        ))
    }

    #[test]
    fn builder_validates_arity_and_rejects_stray_open_frame() {
        let mut b = NodeBuilder::new();
        b.begin(Opcode::If);
        b.leaf(Opcode::Bool, Value::Bool(true));
        assert!(b.end().is_err());
    }

    #[test]
    fn s1_if_gt_add() {
        let tree = if_gt_add_tree();
        tree.sanitycheck().unwrap();

        let mut env = Environment::new(vec![
            Variable::Continuous(1.0),
            Variable::Continuous(2.0),
            Variable::Continuous(4.0),
            Variable::Categorical(5),
        ]);

        assert_eq!(eval(&tree, &env).unwrap(), Value::Category(2));

        env.row[2] = Variable::Continuous(2.5);
        assert_eq!(eval(&tree, &env).unwrap(), Value::Category(1));
    }

    #[test]
    fn s2_in_array() {
        let tree = root(Node::branch(
            Opcode::If,
            vec![
                Node::branch(
                    Opcode::In,
                    vec![
                        Node::leaf(Opcode::Var, Value::Int(3)),
                        Node::leaf(
                            Opcode::Array,
                            Value::Array(vec![
                                Value::Category(1),
                                Value::Category(2),
                                Value::Category(3),
                            ]),
                        ),
                    ],
                ),
                Node::leaf(Opcode::Category, Value::Category(1)),
                Node::leaf(Opcode::Category, Value::Category(2)),
            ],
        ));
        tree.sanitycheck().unwrap();

        let mut env = Environment::new(vec![
            Variable::Continuous(1.0),
            Variable::Continuous(2.0),
            Variable::Continuous(4.0),
            Variable::Categorical(5),
        ]);

        assert_eq!(eval(&tree, &env).unwrap(), Value::Category(2));

        env.row[3] = Variable::Categorical(3);
        assert_eq!(eval(&tree, &env).unwrap(), Value::Category(1));
    }

    #[test]
    fn missing_propagation() {
        let add = Node::branch(
            Opcode::Add,
            vec![
                Node::leaf(Opcode::Constant, Value::Missing),
                Node::leaf(Opcode::Int, Value::Int(4)),
            ],
        );
        assert_eq!(eval(&add, &Environment::default()).unwrap(), Value::Missing);

        let lt = Node::branch(
            Opcode::Lt,
            vec![
                Node::leaf(Opcode::Constant, Value::Missing),
                Node::leaf(Opcode::Int, Value::Int(4)),
            ],
        );
        assert_eq!(eval(&lt, &Environment::default()).unwrap(), Value::Bool(false));

        let gt = Node::branch(
            Opcode::Gt,
            vec![
                Node::leaf(Opcode::Constant, Value::Missing),
                Node::leaf(Opcode::Int, Value::Int(4)),
            ],
        );
        assert_eq!(eval(&gt, &Environment::default()).unwrap(), Value::Bool(false));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let tree = if_gt_add_tree();
        let env = Environment::new(vec![
            Variable::Continuous(1.0),
            Variable::Continuous(2.0),
            Variable::Continuous(4.0),
            Variable::Categorical(5),
        ]);
        let a = eval(&tree, &env).unwrap();
        let b = eval(&tree, &env).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sanitycheck_rejects_bad_arity() {
        let bad = Node::branch(Opcode::Add, vec![Node::leaf(Opcode::Int, Value::Int(1))]);
        assert!(bad.sanitycheck().is_err());
    }
}
