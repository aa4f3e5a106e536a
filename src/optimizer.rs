// File: src/optimizer.rs
//
// Constant folding over AST expressions.
// Invoked by the compiler on every expression; returns a replacement node
// when an infix or prefix expression reduces to a literal, or None to keep
// the original. Short-circuit operators, ternaries, calls and assignments
// are never folded.

use crate::ast::{Expr, ExprKind, Operator};

pub fn optimize_expression(expr: &Expr) -> Option<Expr> {
    match &expr.kind {
        ExprKind::Infix { op, left, right } => optimize_infix(expr, *op, left, right),
        ExprKind::Prefix { op, right } => optimize_prefix(expr, *op, right),
        _ => None,
    }
}

fn optimize_infix(expr: &Expr, op: Operator, left: &Expr, right: &Expr) -> Option<Expr> {
    let left_optimized = optimize_expression(left);
    let left = left_optimized.as_ref().unwrap_or(left);
    let right_optimized = optimize_expression(right);
    let right = right_optimized.as_ref().unwrap_or(right);

    let kind = match (&left.kind, &right.kind) {
        (ExprKind::NumberLiteral(a), ExprKind::NumberLiteral(b)) => {
            fold_numbers(op, *a, *b)?
        }
        (ExprKind::StringLiteral(a), ExprKind::StringLiteral(b)) if op == Operator::Plus => {
            ExprKind::StringLiteral(format!("{}{}", a, b))
        }
        _ => return None,
    };
    Some(Expr::new(kind, expr.position.clone()))
}

fn fold_numbers(op: Operator, a: f64, b: f64) -> Option<ExprKind> {
    // `%`, bitwise ops and shifts operate on the truncated integer parts,
    // matching the VM
    let ai = a as i64;
    let bi = b as i64;
    let kind = match op {
        Operator::Plus => ExprKind::NumberLiteral(a + b),
        Operator::Minus => ExprKind::NumberLiteral(a - b),
        Operator::Asterisk => ExprKind::NumberLiteral(a * b),
        Operator::Slash => ExprKind::NumberLiteral(a / b),
        Operator::Percent => {
            if bi == 0 {
                return None;
            }
            ExprKind::NumberLiteral((ai % bi) as f64)
        }
        Operator::BitAnd => ExprKind::NumberLiteral((ai & bi) as f64),
        Operator::BitOr => ExprKind::NumberLiteral((ai | bi) as f64),
        Operator::BitXor => ExprKind::NumberLiteral((ai ^ bi) as f64),
        Operator::Lshift => ExprKind::NumberLiteral(ai.wrapping_shl(bi as u32 & 63) as f64),
        Operator::Rshift => ExprKind::NumberLiteral(ai.wrapping_shr(bi as u32 & 63) as f64),
        Operator::Lt => ExprKind::BoolLiteral(a < b),
        Operator::Lte => ExprKind::BoolLiteral(a <= b),
        Operator::Gt => ExprKind::BoolLiteral(a > b),
        Operator::Gte => ExprKind::BoolLiteral(a >= b),
        Operator::Eq => ExprKind::BoolLiteral(a == b),
        Operator::NotEq => ExprKind::BoolLiteral(a != b),
        _ => return None,
    };
    Some(kind)
}

fn optimize_prefix(expr: &Expr, op: Operator, right: &Expr) -> Option<Expr> {
    let right_optimized = optimize_expression(right);
    let right = right_optimized.as_ref().unwrap_or(right);
    let kind = match (op, &right.kind) {
        (Operator::Minus, ExprKind::NumberLiteral(n)) => ExprKind::NumberLiteral(-n),
        (Operator::Bang, ExprKind::BoolLiteral(b)) => ExprKind::BoolLiteral(!b),
        _ => return None,
    };
    Some(Expr::new(kind, expr.position.clone()))
}
