// File: src/parser.rs
//
// Pratt-style expression parser and statement parser for Ape.
// Consumes the lexer's token stream and produces AST statements, pushing
// parse errors with positions into the shared error list.

use crate::ast::{CodeBlock, Expr, ExprKind, Ident, IfCase, Operator, Stmt, StmtKind};
use crate::errors::{ErrorKind, FileRef, Position, SharedErrors};
use crate::lexer::{Lexer, Token, TokenKind};

/// Binding powers, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Assign,
    Ternary,
    LogicalOr,
    LogicalAnd,
    BitOr,
    BitXor,
    BitAnd,
    Equals,
    LessGreater,
    Shift,
    Sum,
    Product,
    Prefix,
    Incdec,
    Postfix,
    Highest,
}

fn get_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Assign
        | TokenKind::PlusAssign
        | TokenKind::MinusAssign
        | TokenKind::AsteriskAssign
        | TokenKind::SlashAssign
        | TokenKind::PercentAssign
        | TokenKind::BitAndAssign
        | TokenKind::BitOrAssign
        | TokenKind::BitXorAssign
        | TokenKind::LshiftAssign
        | TokenKind::RshiftAssign => Precedence::Assign,
        TokenKind::Question => Precedence::Ternary,
        TokenKind::Or => Precedence::LogicalOr,
        TokenKind::And => Precedence::LogicalAnd,
        TokenKind::BitOr => Precedence::BitOr,
        TokenKind::BitXor => Precedence::BitXor,
        TokenKind::BitAnd => Precedence::BitAnd,
        TokenKind::Eq | TokenKind::NotEq => Precedence::Equals,
        TokenKind::Lt | TokenKind::Lte | TokenKind::Gt | TokenKind::Gte => Precedence::LessGreater,
        TokenKind::Lshift | TokenKind::Rshift => Precedence::Shift,
        TokenKind::Plus | TokenKind::Minus => Precedence::Sum,
        TokenKind::Slash | TokenKind::Asterisk | TokenKind::Percent => Precedence::Product,
        TokenKind::PlusPlus | TokenKind::MinusMinus => Precedence::Incdec,
        TokenKind::Lparen | TokenKind::Lbracket | TokenKind::Dot => Precedence::Postfix,
        _ => Precedence::Lowest,
    }
}

fn token_to_operator(kind: TokenKind) -> Operator {
    match kind {
        TokenKind::Assign => Operator::Assign,
        TokenKind::Plus | TokenKind::PlusAssign | TokenKind::PlusPlus => Operator::Plus,
        TokenKind::Minus | TokenKind::MinusAssign | TokenKind::MinusMinus => Operator::Minus,
        TokenKind::Bang => Operator::Bang,
        TokenKind::Asterisk | TokenKind::AsteriskAssign => Operator::Asterisk,
        TokenKind::Slash | TokenKind::SlashAssign => Operator::Slash,
        TokenKind::Percent | TokenKind::PercentAssign => Operator::Percent,
        TokenKind::Lt => Operator::Lt,
        TokenKind::Lte => Operator::Lte,
        TokenKind::Gt => Operator::Gt,
        TokenKind::Gte => Operator::Gte,
        TokenKind::Eq => Operator::Eq,
        TokenKind::NotEq => Operator::NotEq,
        TokenKind::And => Operator::LogicalAnd,
        TokenKind::Or => Operator::LogicalOr,
        TokenKind::BitAnd | TokenKind::BitAndAssign => Operator::BitAnd,
        TokenKind::BitOr | TokenKind::BitOrAssign => Operator::BitOr,
        TokenKind::BitXor | TokenKind::BitXorAssign => Operator::BitXor,
        TokenKind::Lshift | TokenKind::LshiftAssign => Operator::Lshift,
        TokenKind::Rshift | TokenKind::RshiftAssign => Operator::Rshift,
        _ => Operator::Assign,
    }
}

pub struct Parser {
    lexer: Lexer,
    errors: SharedErrors,
    /// In REPL mode a top-level bare `{` parses as a map literal expression
    /// rather than a block statement.
    repl_mode: bool,
}

impl Parser {
    pub fn new(source: &str, file: Option<FileRef>, errors: SharedErrors, repl_mode: bool) -> Self {
        let mut lexer = Lexer::new(source, file, errors.clone());
        lexer.next_token();
        lexer.next_token();
        Parser { lexer, errors, repl_mode }
    }

    pub fn parse_all(&mut self) -> Option<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.cur_is(TokenKind::Eof) {
            if self.lexer.failed() || self.cur_is(TokenKind::Invalid) {
                self.error_current("invalid token");
                return None;
            }
            let stmt = self.parse_statement()?;
            statements.push(stmt);
        }
        Some(statements)
    }

    // === Statements ===

    fn parse_statement(&mut self) -> Option<Stmt> {
        let position = self.cur().position.clone();
        let stmt = match self.cur().kind {
            TokenKind::Var => self.parse_define(true),
            TokenKind::Const => self.parse_define(false),
            TokenKind::If => self.parse_if(),
            TokenKind::Return => self.parse_return(),
            TokenKind::While => self.parse_while(),
            TokenKind::Break => {
                self.lexer.next_token();
                Some(Stmt::new(StmtKind::Break, position))
            }
            TokenKind::Continue => {
                self.lexer.next_token();
                Some(Stmt::new(StmtKind::Continue, position))
            }
            TokenKind::For => self.parse_for(),
            TokenKind::Function if self.lexer.peek_token_is(TokenKind::Ident) => {
                self.parse_function_statement()
            }
            TokenKind::Lbrace if !self.repl_mode => {
                let block = self.parse_code_block()?;
                Some(Stmt::new(StmtKind::Block(block), position))
            }
            TokenKind::Import => self.parse_import(),
            TokenKind::Recover => self.parse_recover(),
            _ => {
                let expr = self.parse_expression(Precedence::Lowest)?;
                let position = expr.position.clone();
                Some(Stmt::new(StmtKind::Expression(Box::new(expr)), position))
            }
        }?;
        if self.cur_is(TokenKind::Semicolon) {
            self.lexer.next_token();
        }
        Some(stmt)
    }

    fn parse_define(&mut self, assignable: bool) -> Option<Stmt> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::Ident) {
            return None;
        }
        let name = Ident::new(self.cur().literal.clone(), self.cur().position.clone());
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::Assign) {
            return None;
        }
        self.lexer.next_token();
        let mut value = self.parse_expression(Precedence::Lowest)?;
        if let ExprKind::FnLiteral { name: fn_name, .. } = &mut value.kind {
            // the defined name is copied into the literal for tracebacks
            if fn_name.is_none() {
                *fn_name = Some(name.name.clone());
            }
        }
        Some(Stmt::new(
            StmtKind::Define { name, value: Box::new(value), assignable },
            position,
        ))
    }

    fn parse_function_statement(&mut self) -> Option<Stmt> {
        // `function NAME(params) BLOCK` desugars to `const NAME = function...`
        let position = self.cur().position.clone();
        self.lexer.next_token();
        let name = Ident::new(self.cur().literal.clone(), self.cur().position.clone());
        self.lexer.next_token();
        let params = self.parse_function_params()?;
        let body = self.parse_code_block()?;
        let value = Expr::new(
            ExprKind::FnLiteral { name: Some(name.name.clone()), params, body },
            position.clone(),
        );
        Some(Stmt::new(
            StmtKind::Define { name, value: Box::new(value), assignable: false },
            position,
        ))
    }

    fn parse_if(&mut self) -> Option<Stmt> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        let mut cases = vec![self.parse_if_case()?];
        let mut alternative = None;
        while self.cur_is(TokenKind::Else) {
            self.lexer.next_token();
            if self.cur_is(TokenKind::If) {
                self.lexer.next_token();
                cases.push(self.parse_if_case()?);
            } else {
                alternative = Some(self.parse_code_block()?);
                break;
            }
        }
        Some(Stmt::new(StmtKind::If { cases, alternative }, position))
    }

    fn parse_if_case(&mut self) -> Option<IfCase> {
        if !self.lexer.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.lexer.next_token();
        let test = self.parse_expression(Precedence::Lowest)?;
        if !self.lexer.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.lexer.next_token();
        let consequence = self.parse_code_block()?;
        Some(IfCase { test, consequence })
    }

    fn parse_return(&mut self) -> Option<Stmt> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        let value = if !self.cur_is(TokenKind::Semicolon)
            && !self.cur_is(TokenKind::Rbrace)
            && !self.cur_is(TokenKind::Eof)
        {
            Some(Box::new(self.parse_expression(Precedence::Lowest)?))
        } else {
            None
        };
        Some(Stmt::new(StmtKind::Return(value), position))
    }

    fn parse_while(&mut self) -> Option<Stmt> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.lexer.next_token();
        let test = self.parse_expression(Precedence::Lowest)?;
        if !self.lexer.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.lexer.next_token();
        let body = self.parse_code_block()?;
        Some(Stmt::new(StmtKind::While { test: Box::new(test), body }, position))
    }

    fn parse_for(&mut self) -> Option<Stmt> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.lexer.next_token();
        // `for (IDENT in ...)` is distinguished from the classic for loop by
        // one token of lookahead
        if self.cur_is(TokenKind::Ident) && self.lexer.peek_token_is(TokenKind::In) {
            self.parse_foreach(position)
        } else {
            self.parse_classic_for(position)
        }
    }

    fn parse_foreach(&mut self, position: Position) -> Option<Stmt> {
        let iterator = Ident::new(self.cur().literal.clone(), self.cur().position.clone());
        self.lexer.next_token();
        self.lexer.next_token();
        let source = self.parse_expression(Precedence::Lowest)?;
        if !self.lexer.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.lexer.next_token();
        let body = self.parse_code_block()?;
        Some(Stmt::new(
            StmtKind::ForEach { iterator, source: Box::new(source), body },
            position,
        ))
    }

    fn parse_classic_for(&mut self, position: Position) -> Option<Stmt> {
        let init = if self.cur_is(TokenKind::Semicolon) {
            self.lexer.next_token();
            None
        } else {
            // parse_statement consumes the trailing semicolon
            Some(Box::new(self.parse_statement()?))
        };
        let test = if self.cur_is(TokenKind::Semicolon) {
            None
        } else {
            Some(Box::new(self.parse_expression(Precedence::Lowest)?))
        };
        if !self.lexer.expect_current(TokenKind::Semicolon) {
            return None;
        }
        self.lexer.next_token();
        let update = if self.cur_is(TokenKind::Rparen) {
            None
        } else {
            Some(Box::new(self.parse_expression(Precedence::Lowest)?))
        };
        if !self.lexer.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.lexer.next_token();
        let body = self.parse_code_block()?;
        Some(Stmt::new(StmtKind::For { init, test, update, body }, position))
    }

    fn parse_import(&mut self) -> Option<Stmt> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::String) {
            return None;
        }
        let path = self.process_string_literal()?;
        if path.is_empty() {
            self.error_current("empty import path");
            return None;
        }
        self.lexer.next_token();
        Some(Stmt::new(StmtKind::Import { path }, position))
    }

    fn parse_recover(&mut self) -> Option<Stmt> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::Ident) {
            return None;
        }
        let error_ident = Ident::new(self.cur().literal.clone(), self.cur().position.clone());
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.lexer.next_token();
        let body = self.parse_code_block()?;
        Some(Stmt::new(StmtKind::Recover { error_ident, body }, position))
    }

    fn parse_code_block(&mut self) -> Option<CodeBlock> {
        if !self.lexer.expect_current(TokenKind::Lbrace) {
            return None;
        }
        self.lexer.next_token();
        let mut statements = Vec::new();
        while !self.cur_is(TokenKind::Rbrace) {
            if self.cur_is(TokenKind::Eof) {
                self.error_current("unexpected EOF in code block");
                return None;
            }
            statements.push(self.parse_statement()?);
        }
        self.lexer.next_token();
        Some(CodeBlock { statements })
    }

    // === Expressions ===

    fn parse_expression(&mut self, precedence: Precedence) -> Option<Expr> {
        if self.cur_is(TokenKind::Invalid) {
            self.error_current("invalid token");
            return None;
        }
        let mut left = self.parse_prefix()?;
        while !self.cur_is(TokenKind::Semicolon) && precedence < get_precedence(self.cur().kind) {
            left = self.parse_infix(left)?;
        }
        Some(left)
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        let position = self.cur().position.clone();
        match self.cur().kind {
            TokenKind::Ident => {
                let ident = Ident::new(self.cur().literal.clone(), position.clone());
                self.lexer.next_token();
                Some(Expr::new(ExprKind::Ident(ident), position))
            }
            TokenKind::Number => self.parse_number_literal(),
            TokenKind::True => {
                self.lexer.next_token();
                Some(Expr::new(ExprKind::BoolLiteral(true), position))
            }
            TokenKind::False => {
                self.lexer.next_token();
                Some(Expr::new(ExprKind::BoolLiteral(false), position))
            }
            TokenKind::Null => {
                self.lexer.next_token();
                Some(Expr::new(ExprKind::NullLiteral, position))
            }
            TokenKind::String => {
                let value = self.process_string_literal()?;
                self.lexer.next_token();
                Some(Expr::new(ExprKind::StringLiteral(value), position))
            }
            TokenKind::TemplateString => self.parse_template_string(),
            TokenKind::Lbracket => self.parse_array_literal(),
            TokenKind::Lbrace => self.parse_map_literal(),
            TokenKind::Lparen => self.parse_grouped(),
            TokenKind::Function => self.parse_fn_literal(),
            TokenKind::Minus | TokenKind::Bang => {
                let op = token_to_operator(self.cur().kind);
                self.lexer.next_token();
                let right = self.parse_expression(Precedence::Prefix)?;
                Some(Expr::new(ExprKind::Prefix { op, right: Box::new(right) }, position))
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => self.parse_prefix_incdec(),
            _ => {
                self.error_at(
                    position,
                    format!(
                        "no prefix parse function for \"{}\" found",
                        self.cur().kind.name()
                    ),
                );
                None
            }
        }
    }

    fn parse_infix(&mut self, left: Expr) -> Option<Expr> {
        let position = self.cur().position.clone();
        match self.cur().kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Asterisk
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::Eq
            | TokenKind::NotEq
            | TokenKind::Lt
            | TokenKind::Lte
            | TokenKind::Gt
            | TokenKind::Gte
            | TokenKind::BitAnd
            | TokenKind::BitOr
            | TokenKind::BitXor
            | TokenKind::Lshift
            | TokenKind::Rshift => {
                let op = token_to_operator(self.cur().kind);
                let precedence = get_precedence(self.cur().kind);
                self.lexer.next_token();
                let right = self.parse_expression(precedence)?;
                Some(Expr::new(
                    ExprKind::Infix { op, left: Box::new(left), right: Box::new(right) },
                    position,
                ))
            }
            TokenKind::And | TokenKind::Or => {
                let op = token_to_operator(self.cur().kind);
                let precedence = get_precedence(self.cur().kind);
                self.lexer.next_token();
                let right = self.parse_expression(precedence)?;
                Some(Expr::new(
                    ExprKind::Logical { op, left: Box::new(left), right: Box::new(right) },
                    position,
                ))
            }
            TokenKind::Lparen => {
                let args = self.parse_expression_list(TokenKind::Lparen, TokenKind::Rparen, false)?;
                Some(Expr::new(
                    ExprKind::Call { function: Box::new(left), args },
                    position,
                ))
            }
            TokenKind::Lbracket => {
                self.lexer.next_token();
                let index = self.parse_expression(Precedence::Lowest)?;
                if !self.lexer.expect_current(TokenKind::Rbracket) {
                    return None;
                }
                self.lexer.next_token();
                Some(Expr::new(
                    ExprKind::Index { left: Box::new(left), index: Box::new(index) },
                    position,
                ))
            }
            TokenKind::Dot => self.parse_dot(left),
            TokenKind::Assign => {
                self.lexer.next_token();
                let source = self.parse_expression(Precedence::Lowest)?;
                Some(Expr::new(
                    ExprKind::Assign {
                        dest: Box::new(left),
                        source: Box::new(source),
                        is_postfix: false,
                    },
                    position,
                ))
            }
            TokenKind::PlusAssign
            | TokenKind::MinusAssign
            | TokenKind::AsteriskAssign
            | TokenKind::SlashAssign
            | TokenKind::PercentAssign
            | TokenKind::BitAndAssign
            | TokenKind::BitOrAssign
            | TokenKind::BitXorAssign
            | TokenKind::LshiftAssign
            | TokenKind::RshiftAssign => {
                // `a OP= b` desugars to `a = a OP b`
                let op = token_to_operator(self.cur().kind);
                self.lexer.next_token();
                let source = self.parse_expression(Precedence::Lowest)?;
                let combined = Expr::new(
                    ExprKind::Infix {
                        op,
                        left: Box::new(left.clone()),
                        right: Box::new(source),
                    },
                    position.clone(),
                );
                Some(Expr::new(
                    ExprKind::Assign {
                        dest: Box::new(left),
                        source: Box::new(combined),
                        is_postfix: false,
                    },
                    position,
                ))
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                // postfix form keeps the old value on the stack
                let op = token_to_operator(self.cur().kind);
                self.lexer.next_token();
                let one = Expr::new(ExprKind::NumberLiteral(1.0), position.clone());
                let source = Expr::new(
                    ExprKind::Infix {
                        op,
                        left: Box::new(left.clone()),
                        right: Box::new(one),
                    },
                    position.clone(),
                );
                Some(Expr::new(
                    ExprKind::Assign {
                        dest: Box::new(left),
                        source: Box::new(source),
                        is_postfix: true,
                    },
                    position,
                ))
            }
            TokenKind::Question => self.parse_ternary(left),
            _ => {
                self.error_at(
                    position,
                    format!("no infix parse function for \"{}\" found", self.cur().kind.name()),
                );
                None
            }
        }
    }

    fn parse_number_literal(&mut self) -> Option<Expr> {
        let position = self.cur().position.clone();
        let literal = self.cur().literal.clone();
        let parsed = if let Some(hex) = literal.strip_prefix("0x").or_else(|| literal.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16).ok().map(|n| n as f64)
        } else {
            literal.parse::<f64>().ok()
        };
        let value = match parsed {
            Some(value) => value,
            None => {
                // greedy scanning accepted more characters than a number can hold
                self.error_at(position, format!("parsing number literal \"{}\" failed", literal));
                return None;
            }
        };
        self.lexer.next_token();
        Some(Expr::new(ExprKind::NumberLiteral(value), position))
    }

    fn parse_template_string(&mut self) -> Option<Expr> {
        // `` `left${mid}right` `` desugars to `"left" + tostring(mid) + "right"`
        let position = self.cur().position.clone();
        let left_literal = self.process_string_literal()?;
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::Lbrace) {
            return None;
        }
        self.lexer.next_token();

        let left = Expr::new(ExprKind::StringLiteral(left_literal), position.clone());
        let mid_position = self.cur().position.clone();
        let template_expr = self.parse_expression(Precedence::Lowest)?;
        let tostring_call = Expr::new(
            ExprKind::Call {
                function: Box::new(Expr::new(
                    ExprKind::Ident(Ident::new("tostring", mid_position.clone())),
                    mid_position.clone(),
                )),
                args: vec![template_expr],
            },
            mid_position.clone(),
        );
        let left_add = Expr::new(
            ExprKind::Infix {
                op: Operator::Plus,
                left: Box::new(left),
                right: Box::new(tostring_call),
            },
            mid_position,
        );

        if !self.lexer.expect_current(TokenKind::Rbrace) {
            return None;
        }
        // rewind one token, then rescan from right after the '}' as string
        // content
        self.lexer.rewind_current();
        self.lexer.continue_template_string();
        self.lexer.next_token();
        self.lexer.next_token();

        let right_position = self.cur().position.clone();
        let right = self.parse_expression(Precedence::Highest)?;
        Some(Expr::new(
            ExprKind::Infix {
                op: Operator::Plus,
                left: Box::new(left_add),
                right: Box::new(right),
            },
            right_position,
        ))
    }

    fn parse_array_literal(&mut self) -> Option<Expr> {
        let position = self.cur().position.clone();
        let items = self.parse_expression_list(TokenKind::Lbracket, TokenKind::Rbracket, true)?;
        Some(Expr::new(ExprKind::ArrayLiteral(items), position))
    }

    fn parse_map_literal(&mut self) -> Option<Expr> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        let mut pairs = Vec::new();
        while !self.cur_is(TokenKind::Rbrace) {
            let key_position = self.cur().position.clone();
            let key = match self.cur().kind {
                TokenKind::Ident => {
                    let key = ExprKind::StringLiteral(self.cur().literal.clone());
                    self.lexer.next_token();
                    Expr::new(key, key_position)
                }
                TokenKind::String => {
                    let value = self.process_string_literal()?;
                    self.lexer.next_token();
                    Expr::new(ExprKind::StringLiteral(value), key_position)
                }
                TokenKind::Number => self.parse_number_literal()?,
                TokenKind::True => {
                    self.lexer.next_token();
                    Expr::new(ExprKind::BoolLiteral(true), key_position)
                }
                TokenKind::False => {
                    self.lexer.next_token();
                    Expr::new(ExprKind::BoolLiteral(false), key_position)
                }
                _ => {
                    self.error_at(key_position, "invalid map literal key type");
                    return None;
                }
            };
            if !self.lexer.expect_current(TokenKind::Colon) {
                return None;
            }
            self.lexer.next_token();
            let value = self.parse_expression(Precedence::Lowest)?;
            pairs.push((key, value));
            if self.cur_is(TokenKind::Comma) {
                self.lexer.next_token();
            } else {
                break;
            }
        }
        if !self.lexer.expect_current(TokenKind::Rbrace) {
            return None;
        }
        self.lexer.next_token();
        Some(Expr::new(ExprKind::MapLiteral(pairs), position))
    }

    fn parse_grouped(&mut self) -> Option<Expr> {
        self.lexer.next_token();
        let expr = self.parse_expression(Precedence::Lowest)?;
        if !self.lexer.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.lexer.next_token();
        Some(expr)
    }

    fn parse_fn_literal(&mut self) -> Option<Expr> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        let params = self.parse_function_params()?;
        let body = self.parse_code_block()?;
        Some(Expr::new(ExprKind::FnLiteral { name: None, params, body }, position))
    }

    fn parse_function_params(&mut self) -> Option<Vec<Ident>> {
        if !self.lexer.expect_current(TokenKind::Lparen) {
            return None;
        }
        self.lexer.next_token();
        let mut params = Vec::new();
        while !self.cur_is(TokenKind::Rparen) {
            if !self.lexer.expect_current(TokenKind::Ident) {
                return None;
            }
            params.push(Ident::new(self.cur().literal.clone(), self.cur().position.clone()));
            self.lexer.next_token();
            if self.cur_is(TokenKind::Comma) {
                self.lexer.next_token();
            } else {
                break;
            }
        }
        if !self.lexer.expect_current(TokenKind::Rparen) {
            return None;
        }
        self.lexer.next_token();
        Some(params)
    }

    fn parse_prefix_incdec(&mut self) -> Option<Expr> {
        // `++x` desugars to `x = x + 1`
        let position = self.cur().position.clone();
        let op = token_to_operator(self.cur().kind);
        self.lexer.next_token();
        let dest = self.parse_expression(Precedence::Prefix)?;
        let one = Expr::new(ExprKind::NumberLiteral(1.0), position.clone());
        let source = Expr::new(
            ExprKind::Infix {
                op,
                left: Box::new(dest.clone()),
                right: Box::new(one),
            },
            position.clone(),
        );
        Some(Expr::new(
            ExprKind::Assign {
                dest: Box::new(dest),
                source: Box::new(source),
                is_postfix: false,
            },
            position,
        ))
    }

    fn parse_dot(&mut self, left: Expr) -> Option<Expr> {
        // `e.name` desugars to `e["name"]`
        let position = self.cur().position.clone();
        self.lexer.next_token();
        if !self.lexer.expect_current(TokenKind::Ident) {
            return None;
        }
        let index = Expr::new(
            ExprKind::StringLiteral(self.cur().literal.clone()),
            self.cur().position.clone(),
        );
        self.lexer.next_token();
        Some(Expr::new(
            ExprKind::Index { left: Box::new(left), index: Box::new(index) },
            position,
        ))
    }

    fn parse_ternary(&mut self, test: Expr) -> Option<Expr> {
        let position = self.cur().position.clone();
        self.lexer.next_token();
        let if_true = self.parse_expression(Precedence::Lowest)?;
        if !self.lexer.expect_current(TokenKind::Colon) {
            return None;
        }
        self.lexer.next_token();
        let if_false = self.parse_expression(Precedence::Lowest)?;
        Some(Expr::new(
            ExprKind::Ternary {
                test: Box::new(test),
                if_true: Box::new(if_true),
                if_false: Box::new(if_false),
            },
            position,
        ))
    }

    fn parse_expression_list(
        &mut self,
        start: TokenKind,
        end: TokenKind,
        trailing_comma_allowed: bool,
    ) -> Option<Vec<Expr>> {
        if !self.lexer.expect_current(start) {
            return None;
        }
        self.lexer.next_token();
        let mut items = Vec::new();
        while !self.cur_is(end) {
            items.push(self.parse_expression(Precedence::Lowest)?);
            if self.cur_is(TokenKind::Comma) {
                self.lexer.next_token();
                if trailing_comma_allowed && self.cur_is(end) {
                    break;
                }
            } else {
                break;
            }
        }
        if !self.lexer.expect_current(end) {
            return None;
        }
        self.lexer.next_token();
        Some(items)
    }

    /// Processes escape sequences in the current token's literal. The escape
    /// set is minimal; unknown escapes pass the escaped character through.
    fn process_string_literal(&mut self) -> Option<String> {
        let literal = &self.cur().literal;
        let mut out = String::with_capacity(literal.len());
        let mut chars = literal.chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('b') => out.push('\u{8}'),
                Some('f') => out.push('\u{c}'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('0') => out.push('\0'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        Some(out)
    }

    // === Helpers ===

    fn cur(&self) -> &Token {
        self.lexer.current()
    }

    fn cur_is(&self, kind: TokenKind) -> bool {
        self.lexer.cur_token_is(kind)
    }

    fn error_current(&mut self, message: impl Into<String>) {
        let position = self.cur().position.clone();
        self.error_at(position, message);
    }

    fn error_at(&mut self, position: Position, message: impl Into<String>) {
        self.errors.borrow_mut().add(ErrorKind::Parsing, position, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorList;

    fn parse(source: &str) -> Vec<Stmt> {
        let errors = ErrorList::shared();
        let mut parser = Parser::new(source, None, errors.clone(), false);
        let statements = parser.parse_all();
        assert!(
            errors.borrow().is_empty(),
            "unexpected parse errors: {:?}",
            errors.borrow().iter().map(|e| e.message.clone()).collect::<Vec<_>>()
        );
        statements.expect("parse failed without errors")
    }

    fn parse_fails(source: &str) {
        let errors = ErrorList::shared();
        let mut parser = Parser::new(source, None, errors.clone(), false);
        let res = parser.parse_all();
        assert!(res.is_none());
        assert!(!errors.borrow().is_empty());
    }

    #[test]
    fn test_define_statements() {
        let stmts = parse("var x = 1; const y = 2;");
        assert_eq!(stmts.len(), 2);
        match &stmts[0].kind {
            StmtKind::Define { name, assignable, .. } => {
                assert_eq!(name.name, "x");
                assert!(*assignable);
            }
            other => panic!("expected define, got {:?}", other),
        }
        match &stmts[1].kind {
            StmtKind::Define { assignable, .. } => assert!(!assignable),
            other => panic!("expected define, got {:?}", other),
        }
    }

    #[test]
    fn test_operator_precedence() {
        let stmts = parse("1 + 2 * 3;");
        let StmtKind::Expression(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Infix { op: Operator::Plus, right, .. } = &expr.kind else {
            panic!("expected + at the root, got {:?}", expr.kind);
        };
        assert!(matches!(right.kind, ExprKind::Infix { op: Operator::Asterisk, .. }));
    }

    #[test]
    fn test_ternary_binds_looser_than_or() {
        let stmts = parse("a || b ? 1 : 2;");
        let StmtKind::Expression(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Ternary { test, .. } = &expr.kind else {
            panic!("expected ternary at the root");
        };
        assert!(matches!(test.kind, ExprKind::Logical { op: Operator::LogicalOr, .. }));
    }

    #[test]
    fn test_function_statement_desugars_to_const_define() {
        let stmts = parse("function add(a, b) { return a + b; }");
        match &stmts[0].kind {
            StmtKind::Define { name, value, assignable } => {
                assert_eq!(name.name, "add");
                assert!(!assignable);
                match &value.kind {
                    ExprKind::FnLiteral { name: fn_name, params, .. } => {
                        assert_eq!(fn_name.as_deref(), Some("add"));
                        assert_eq!(params.len(), 2);
                    }
                    other => panic!("expected fn literal, got {:?}", other),
                }
            }
            other => panic!("expected define, got {:?}", other),
        }
    }

    #[test]
    fn test_dot_desugars_to_string_index() {
        let stmts = parse("m.key;");
        let StmtKind::Expression(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Index { index, .. } = &expr.kind else {
            panic!("expected index expression");
        };
        assert!(matches!(&index.kind, ExprKind::StringLiteral(s) if s == "key"));
    }

    #[test]
    fn test_compound_assign_desugars() {
        let stmts = parse("x += 2;");
        let StmtKind::Expression(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Assign { source, is_postfix, .. } = &expr.kind else {
            panic!("expected assignment");
        };
        assert!(!is_postfix);
        assert!(matches!(source.kind, ExprKind::Infix { op: Operator::Plus, .. }));
    }

    #[test]
    fn test_postfix_incdec_on_index_target() {
        let stmts = parse("a[0]++;");
        let StmtKind::Expression(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Assign { dest, is_postfix, .. } = &expr.kind else {
            panic!("expected assignment, got {:?}", expr.kind);
        };
        assert!(is_postfix);
        assert!(matches!(dest.kind, ExprKind::Index { .. }));
    }

    #[test]
    fn test_template_string_desugars_to_concat_chain() {
        let stmts = parse("`a${x}b`;");
        let StmtKind::Expression(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        // ("a" + tostring(x)) + "b"
        let ExprKind::Infix { op: Operator::Plus, left, right } = &expr.kind else {
            panic!("expected + at the root, got {:?}", expr.kind);
        };
        assert!(matches!(&right.kind, ExprKind::StringLiteral(s) if s == "b"));
        let ExprKind::Infix { op: Operator::Plus, right: call, .. } = &left.kind else {
            panic!("expected nested +");
        };
        let ExprKind::Call { function, .. } = &call.kind else {
            panic!("expected tostring call");
        };
        assert!(matches!(&function.kind, ExprKind::Ident(id) if id.name == "tostring"));
    }

    #[test]
    fn test_foreach_is_distinguished_from_classic_for() {
        let stmts = parse("for (k in m) {} for (var i = 0; i < 3; i++) {}");
        assert!(matches!(stmts[0].kind, StmtKind::ForEach { .. }));
        assert!(matches!(stmts[1].kind, StmtKind::For { .. }));
    }

    #[test]
    fn test_classic_for_with_empty_clauses() {
        let stmts = parse("for (;;) { break; }");
        let StmtKind::For { init, test, update, .. } = &stmts[0].kind else {
            panic!("expected for");
        };
        assert!(init.is_none());
        assert!(test.is_none());
        assert!(update.is_none());
    }

    #[test]
    fn test_array_literal_allows_trailing_comma() {
        let stmts = parse("[1, 2, 3, ];");
        let StmtKind::Expression(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::ArrayLiteral(items) = &expr.kind else {
            panic!("expected array literal");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_map_literal_key_kinds() {
        let stmts = parse(r#"var m = { a: 1, "b": 2, 3: 4, true: 5 };"#);
        let StmtKind::Define { value, .. } = &stmts[0].kind else {
            panic!("expected define");
        };
        let ExprKind::MapLiteral(pairs) = &value.kind else {
            panic!("expected map literal");
        };
        assert_eq!(pairs.len(), 4);
        parse_fails("var m = { [1]: 2 };");
    }

    #[test]
    fn test_recover_statement() {
        let stmts = parse("function f() { recover (e) { return e; } return 1; }");
        let StmtKind::Define { value, .. } = &stmts[0].kind else {
            panic!("expected define");
        };
        let ExprKind::FnLiteral { body, .. } = &value.kind else {
            panic!("expected fn literal");
        };
        assert!(matches!(body.statements[0].kind, StmtKind::Recover { .. }));
    }

    #[test]
    fn test_bad_number_literal_reports_error() {
        parse_fails("var x = 0xzz;");
    }

    #[test]
    fn test_repl_mode_parses_bare_brace_as_map() {
        let errors = ErrorList::shared();
        let mut parser = Parser::new("{ a: 1 }", None, errors.clone(), true);
        let stmts = parser.parse_all().expect("parse failed");
        let StmtKind::Expression(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        assert!(matches!(expr.kind, ExprKind::MapLiteral(_)));
    }
}
