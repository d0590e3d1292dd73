//! Readable text rendering of functions for logs and test failures.

use std::fmt;

use crate::backend::spec::Operation;

use super::function::{Function, Node};

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    f.write_str(line)?;
    f.write_str("\n")
}

fn format_op(op: &Operation) -> String {
    match op {
        Operation::Parameter => "parameter".to_string(),
        Operation::Result => "result".to_string(),
        Operation::Constant(literal) => format!("constant {}", literal.spec),
        Operation::ElementwiseUnary(op) => format!("unary.{op:?}").to_lowercase(),
        Operation::ElementwiseBinary(op) => format!("binary.{op:?}").to_lowercase(),
        Operation::Reshape(spec) => format!("reshape [{}]", spec.shape),
        Operation::Transpose(spec) => format!("transpose {:?}", spec.perm),
        Operation::MatMul => "matmul".to_string(),
        Operation::Split(spec) => format!("split axis={} sizes={:?}", spec.axis, spec.sizes),
        Operation::Concat(spec) => format!("concat axis={}", spec.axis),
        Operation::Cast(spec) => format!("cast {}", spec.dtype),
    }
}

fn fmt_node(node: &Node, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let operands = node
        .inputs()
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let outputs = node
        .outputs()
        .iter()
        .map(|spec| spec.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let mut line = format!("{} = {}", node.id(), format_op(node.op()));
    if !operands.is_empty() {
        line.push(' ');
        line.push_str(&operands);
    }
    if !outputs.is_empty() {
        line.push_str(" : ");
        line.push_str(&outputs);
    }
    if let Some(placement) = node.placement() {
        line.push_str(&format!(" @{placement}"));
    }
    if let Some(origin) = node.origin() {
        line.push_str(&format!(" (from {origin})"));
    }
    write_line(f, indent, &line)
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, &format!("func @{} [{}] {{", self.name(), self.id()))?;
        for node in self.nodes() {
            fmt_node(node, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}
