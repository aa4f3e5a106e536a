// File: src/ast.rs
//
// AST node definitions for the Ape scripting language.
// Expressions and statements carry the source position of the token that
// introduced them; the compiler threads those positions into the bytecode.

use crate::errors::Position;

/// Operators appearing in prefix and infix expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Assign,
    Plus,
    Minus,
    Bang,
    Asterisk,
    Slash,
    Percent,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    NotEq,
    LogicalAnd,
    LogicalOr,
    BitAnd,
    BitOr,
    BitXor,
    Lshift,
    Rshift,
}

#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub position: Position,
}

impl Ident {
    pub fn new(name: impl Into<String>, position: Position) -> Self {
        Ident { name: name.into(), position }
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub position: Position,
}

impl Expr {
    pub fn new(kind: ExprKind, position: Position) -> Self {
        Expr { kind, position }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Ident(Ident),
    NumberLiteral(f64),
    BoolLiteral(bool),
    StringLiteral(String),
    NullLiteral,
    ArrayLiteral(Vec<Expr>),
    /// Keys are restricted by the parser to identifier, string, number and
    /// bool literals.
    MapLiteral(Vec<(Expr, Expr)>),
    Prefix {
        op: Operator,
        right: Box<Expr>,
    },
    Infix {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    FnLiteral {
        name: Option<String>,
        params: Vec<Ident>,
        body: CodeBlock,
    },
    Call {
        function: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        left: Box<Expr>,
        index: Box<Expr>,
    },
    Assign {
        dest: Box<Expr>,
        source: Box<Expr>,
        /// Postfix `++`/`--` desugar to an assignment that leaves the old
        /// value on the stack.
        is_postfix: bool,
    },
    Logical {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
}

#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct IfCase {
    pub test: Expr,
    pub consequence: CodeBlock,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub position: Position,
}

impl Stmt {
    pub fn new(kind: StmtKind, position: Position) -> Self {
        Stmt { kind, position }
    }
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Define {
        name: Ident,
        value: Box<Expr>,
        assignable: bool,
    },
    If {
        cases: Vec<IfCase>,
        alternative: Option<CodeBlock>,
    },
    Return(Option<Box<Expr>>),
    Expression(Box<Expr>),
    While {
        test: Box<Expr>,
        body: CodeBlock,
    },
    Break,
    Continue,
    ForEach {
        iterator: Ident,
        source: Box<Expr>,
        body: CodeBlock,
    },
    For {
        init: Option<Box<Stmt>>,
        test: Option<Box<Expr>>,
        update: Option<Box<Expr>>,
        body: CodeBlock,
    },
    Block(CodeBlock),
    Import {
        path: String,
    },
    Recover {
        error_ident: Ident,
        body: CodeBlock,
    },
}
