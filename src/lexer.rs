// File: src/lexer.rs
//
// Lexer for the Ape scripting language.
// Produces tokens on demand with a three-token window (previous, current,
// peek) so the parser can look ahead and rewind exactly one token, and
// supports re-entering template strings after a `${...}` placeholder.

use crate::errors::{ErrorKind, FileRef, Position, SharedErrors};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// The closed set of token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Invalid,
    Eof,

    // === Operators ===
    Assign,
    PlusAssign,
    MinusAssign,
    AsteriskAssign,
    SlashAssign,
    PercentAssign,
    BitAndAssign,
    BitOrAssign,
    BitXorAssign,
    LshiftAssign,
    RshiftAssign,
    Question,
    Plus,
    PlusPlus,
    Minus,
    MinusMinus,
    Bang,
    Asterisk,
    Slash,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    NotEq,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Lshift,
    Rshift,
    Percent,

    // === Delimiters ===
    Comma,
    Semicolon,
    Colon,
    Lparen,
    Rparen,
    Lbrace,
    Rbrace,
    Lbracket,
    Rbracket,
    Dot,

    // === Keywords ===
    Function,
    Const,
    Var,
    True,
    False,
    If,
    Else,
    Return,
    While,
    Break,
    For,
    In,
    Continue,
    Null,
    Import,
    Recover,

    // === Literals ===
    Ident,
    Number,
    String,
    TemplateString,
}

impl TokenKind {
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::Invalid => "ILLEGAL",
            TokenKind::Eof => "EOF",
            TokenKind::Assign => "=",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::AsteriskAssign => "*=",
            TokenKind::SlashAssign => "/=",
            TokenKind::PercentAssign => "%=",
            TokenKind::BitAndAssign => "&=",
            TokenKind::BitOrAssign => "|=",
            TokenKind::BitXorAssign => "^=",
            TokenKind::LshiftAssign => "<<=",
            TokenKind::RshiftAssign => ">>=",
            TokenKind::Question => "?",
            TokenKind::Plus => "+",
            TokenKind::PlusPlus => "++",
            TokenKind::Minus => "-",
            TokenKind::MinusMinus => "--",
            TokenKind::Bang => "!",
            TokenKind::Asterisk => "*",
            TokenKind::Slash => "/",
            TokenKind::Lt => "<",
            TokenKind::Lte => "<=",
            TokenKind::Gt => ">",
            TokenKind::Gte => ">=",
            TokenKind::Eq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::And => "&&",
            TokenKind::Or => "||",
            TokenKind::BitAnd => "&",
            TokenKind::BitOr => "|",
            TokenKind::BitXor => "^",
            TokenKind::Lshift => "<<",
            TokenKind::Rshift => ">>",
            TokenKind::Percent => "%",
            TokenKind::Comma => ",",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::Lparen => "(",
            TokenKind::Rparen => ")",
            TokenKind::Lbrace => "{",
            TokenKind::Rbrace => "}",
            TokenKind::Lbracket => "[",
            TokenKind::Rbracket => "]",
            TokenKind::Dot => ".",
            TokenKind::Function => "FUNCTION",
            TokenKind::Const => "CONST",
            TokenKind::Var => "VAR",
            TokenKind::True => "TRUE",
            TokenKind::False => "FALSE",
            TokenKind::If => "IF",
            TokenKind::Else => "ELSE",
            TokenKind::Return => "RETURN",
            TokenKind::While => "WHILE",
            TokenKind::Break => "BREAK",
            TokenKind::For => "FOR",
            TokenKind::In => "IN",
            TokenKind::Continue => "CONTINUE",
            TokenKind::Null => "NULL",
            TokenKind::Import => "IMPORT",
            TokenKind::Recover => "RECOVER",
            TokenKind::Ident => "IDENT",
            TokenKind::Number => "NUMBER",
            TokenKind::String => "STRING",
            TokenKind::TemplateString => "TEMPLATE_STRING",
        }
    }
}

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("function", TokenKind::Function);
    map.insert("const", TokenKind::Const);
    map.insert("var", TokenKind::Var);
    map.insert("true", TokenKind::True);
    map.insert("false", TokenKind::False);
    map.insert("if", TokenKind::If);
    map.insert("else", TokenKind::Else);
    map.insert("return", TokenKind::Return);
    map.insert("while", TokenKind::While);
    map.insert("break", TokenKind::Break);
    map.insert("for", TokenKind::For);
    map.insert("in", TokenKind::In);
    map.insert("continue", TokenKind::Continue);
    map.insert("null", TokenKind::Null);
    map.insert("import", TokenKind::Import);
    map.insert("recover", TokenKind::Recover);
    map
});

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub literal: String,
    pub position: Position,
}

impl Token {
    fn new(kind: TokenKind, literal: impl Into<String>, position: Position) -> Self {
        Token { kind, literal: literal.into(), position }
    }

    fn invalid() -> Self {
        Token { kind: TokenKind::Invalid, literal: String::new(), position: Position::invalid() }
    }

    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }
}

/// Scanner state snapshot, taken before every token scan so the token window
/// can be rewound by exactly one step.
#[derive(Debug, Clone, Copy, Default)]
struct ScanState {
    ch: u8,
    position: usize,
    next_position: usize,
    line: usize,
    column: i64,
}

pub struct Lexer {
    input: Vec<u8>,
    position: usize,
    next_position: usize,
    ch: u8,
    line: usize,
    column: i64,
    file: Option<FileRef>,
    errors: SharedErrors,
    failed: bool,
    continue_template: bool,
    prev_token: Option<Token>,
    cur_token: Token,
    peek_token: Token,
    prev_state: ScanState,
}

impl Lexer {
    pub fn new(input: &str, file: Option<FileRef>, errors: SharedErrors) -> Self {
        let mut lexer = Lexer {
            input: input.as_bytes().to_vec(),
            position: 0,
            next_position: 0,
            ch: 0,
            line: 0,
            column: -1,
            file,
            errors,
            failed: false,
            continue_template: false,
            prev_token: None,
            cur_token: Token::invalid(),
            peek_token: Token::invalid(),
            prev_state: ScanState::default(),
        };
        lexer.add_line(0);
        lexer.read_char();
        lexer
    }

    pub fn current(&self) -> &Token {
        &self.cur_token
    }

    pub fn peek(&self) -> &Token {
        &self.peek_token
    }

    pub fn cur_token_is(&self, kind: TokenKind) -> bool {
        self.cur_token.kind == kind
    }

    pub fn peek_token_is(&self, kind: TokenKind) -> bool {
        self.peek_token.kind == kind
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Arms the scanner to resume inside a template string: the next scan
    /// behaves as if a backtick had just been consumed.
    pub fn continue_template_string(&mut self) {
        self.continue_template = true;
    }

    /// Advances the token window by one.
    pub fn next_token(&mut self) -> bool {
        self.prev_token = Some(std::mem::replace(
            &mut self.cur_token,
            self.peek_token.clone(),
        ));
        self.peek_token = self.next_token_internal();
        !self.failed
    }

    /// Steps the token window back by one, restoring the scanner state from
    /// before the last scan. Only a single step is remembered.
    pub fn rewind_current(&mut self) -> bool {
        let prev = match self.prev_token.take() {
            Some(tok) => tok,
            None => return false,
        };
        self.peek_token = std::mem::replace(&mut self.cur_token, prev);
        self.ch = self.prev_state.ch;
        self.position = self.prev_state.position;
        self.next_position = self.prev_state.next_position;
        self.line = self.prev_state.line;
        self.column = self.prev_state.column;
        true
    }

    pub fn expect_current(&mut self, kind: TokenKind) -> bool {
        if self.failed {
            return false;
        }
        if !self.cur_token_is(kind) {
            let msg = format!(
                "expected current token to be \"{}\", got \"{}\" instead",
                kind.name(),
                self.cur_token.kind.name()
            );
            let pos = self.cur_token.position.clone();
            self.errors.borrow_mut().add(ErrorKind::Parsing, pos, msg);
            return false;
        }
        true
    }

    fn next_token_internal(&mut self) -> Token {
        self.prev_state = ScanState {
            ch: self.ch,
            position: self.position,
            next_position: self.next_position,
            line: self.line,
            column: self.column,
        };

        if !self.continue_template {
            self.skip_whitespace_and_comments();
        }

        let position = self.token_position();
        let ch = if self.continue_template { b'`' } else { self.ch };
        let mut token = Token::new(TokenKind::Invalid, "", position.clone());

        match ch {
            0 => token = Token::new(TokenKind::Eof, "EOF", position),
            b'=' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::Eq, "==", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::Assign, "=", position);
                }
            }
            b'&' => {
                if self.peek_char() == b'&' {
                    token = Token::new(TokenKind::And, "&&", position);
                    self.read_char();
                } else if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::BitAndAssign, "&=", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::BitAnd, "&", position);
                }
            }
            b'|' => {
                if self.peek_char() == b'|' {
                    token = Token::new(TokenKind::Or, "||", position);
                    self.read_char();
                } else if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::BitOrAssign, "|=", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::BitOr, "|", position);
                }
            }
            b'^' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::BitXorAssign, "^=", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::BitXor, "^", position);
                }
            }
            b'+' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::PlusAssign, "+=", position);
                    self.read_char();
                } else if self.peek_char() == b'+' {
                    token = Token::new(TokenKind::PlusPlus, "++", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::Plus, "+", position);
                }
            }
            b'-' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::MinusAssign, "-=", position);
                    self.read_char();
                } else if self.peek_char() == b'-' {
                    token = Token::new(TokenKind::MinusMinus, "--", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::Minus, "-", position);
                }
            }
            b'!' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::NotEq, "!=", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::Bang, "!", position);
                }
            }
            b'*' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::AsteriskAssign, "*=", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::Asterisk, "*", position);
                }
            }
            b'/' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::SlashAssign, "/=", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::Slash, "/", position);
                }
            }
            b'<' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::Lte, "<=", position);
                    self.read_char();
                } else if self.peek_char() == b'<' {
                    self.read_char();
                    if self.peek_char() == b'=' {
                        token = Token::new(TokenKind::LshiftAssign, "<<=", position);
                        self.read_char();
                    } else {
                        token = Token::new(TokenKind::Lshift, "<<", position);
                    }
                } else {
                    token = Token::new(TokenKind::Lt, "<", position);
                }
            }
            b'>' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::Gte, ">=", position);
                    self.read_char();
                } else if self.peek_char() == b'>' {
                    self.read_char();
                    if self.peek_char() == b'=' {
                        token = Token::new(TokenKind::RshiftAssign, ">>=", position);
                        self.read_char();
                    } else {
                        token = Token::new(TokenKind::Rshift, ">>", position);
                    }
                } else {
                    token = Token::new(TokenKind::Gt, ">", position);
                }
            }
            b'%' => {
                if self.peek_char() == b'=' {
                    token = Token::new(TokenKind::PercentAssign, "%=", position);
                    self.read_char();
                } else {
                    token = Token::new(TokenKind::Percent, "%", position);
                }
            }
            b',' => token = Token::new(TokenKind::Comma, ",", position),
            b';' => token = Token::new(TokenKind::Semicolon, ";", position),
            b':' => token = Token::new(TokenKind::Colon, ":", position),
            b'(' => token = Token::new(TokenKind::Lparen, "(", position),
            b')' => token = Token::new(TokenKind::Rparen, ")", position),
            b'{' => token = Token::new(TokenKind::Lbrace, "{", position),
            b'}' => token = Token::new(TokenKind::Rbrace, "}", position),
            b'[' => token = Token::new(TokenKind::Lbracket, "[", position),
            b']' => token = Token::new(TokenKind::Rbracket, "]", position),
            b'.' => token = Token::new(TokenKind::Dot, ".", position),
            b'?' => token = Token::new(TokenKind::Question, "?", position),
            b'"' => {
                self.read_char();
                match self.read_string(b'"', false) {
                    Some((literal, _)) => {
                        token = Token::new(TokenKind::String, literal, position);
                    }
                    None => token = Token::new(TokenKind::Invalid, "", position),
                }
            }
            b'\'' => {
                self.read_char();
                match self.read_string(b'\'', false) {
                    Some((literal, _)) => {
                        token = Token::new(TokenKind::String, literal, position);
                    }
                    None => token = Token::new(TokenKind::Invalid, "", position),
                }
            }
            b'`' => {
                if !self.continue_template {
                    self.read_char();
                }
                match self.read_string(b'`', true) {
                    Some((literal, template_found)) => {
                        let kind = if template_found {
                            TokenKind::TemplateString
                        } else {
                            TokenKind::String
                        };
                        token = Token::new(kind, literal, position);
                    }
                    None => token = Token::new(TokenKind::Invalid, "", position),
                }
            }
            _ => {
                if is_letter(self.ch) {
                    let literal = self.read_identifier();
                    let kind = KEYWORDS.get(literal.as_str()).copied().unwrap_or(TokenKind::Ident);
                    self.continue_template = false;
                    return Token::new(kind, literal, position);
                } else if is_digit(self.ch) {
                    let literal = self.read_number();
                    self.continue_template = false;
                    return Token::new(TokenKind::Number, literal, position);
                }
            }
        }

        self.read_char();
        if self.failed {
            token = Token::new(TokenKind::Invalid, "", self.token_position());
        }
        self.continue_template = false;
        token
    }

    fn token_position(&self) -> Position {
        let column = if self.column < 0 { 0 } else { self.column as usize };
        Position::new(self.file.clone(), self.line, column)
    }

    fn read_char(&mut self) {
        if self.next_position >= self.input.len() {
            self.ch = 0;
        } else {
            self.ch = self.input[self.next_position];
        }
        self.position = self.next_position;
        self.next_position += 1;
        if self.ch == b'\n' {
            self.line += 1;
            self.column = -1;
            self.add_line(self.next_position);
        } else {
            self.column += 1;
        }
    }

    fn peek_char(&self) -> u8 {
        if self.next_position >= self.input.len() {
            0
        } else {
            self.input[self.next_position]
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.ch {
                b' ' | b'\t' | b'\r' | b'\n' => self.read_char(),
                b'/' if self.peek_char() == b'/' => {
                    while self.ch != b'\n' && self.ch != 0 {
                        self.read_char();
                    }
                }
                _ => break,
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let start = self.position;
        while is_digit(self.ch) || is_letter(self.ch) || self.ch == b':' {
            if self.ch == b':' {
                // a lone ':' terminates the identifier; '::' is part of a
                // module-qualified name
                if self.peek_char() != b':' {
                    break;
                }
                self.read_char();
            }
            self.read_char();
        }
        String::from_utf8_lossy(&self.input[start..self.position]).into_owned()
    }

    fn read_number(&mut self) -> String {
        let start = self.position;
        while is_digit(self.ch) || is_number_char(self.ch) {
            self.read_char();
        }
        String::from_utf8_lossy(&self.input[start..self.position]).into_owned()
    }

    /// Scans string contents up to the closing delimiter, leaving the
    /// scanner on the delimiter. For template strings, stops early at an
    /// unescaped `${` and reports that a placeholder was found. Escape
    /// sequences are kept raw; they are processed at parse time.
    fn read_string(&mut self, delimiter: u8, is_template: bool) -> Option<(String, bool)> {
        let start = self.position;
        let mut template_found = false;
        let mut escaped = false;
        loop {
            if self.ch == 0 {
                // unterminated; the caller produces an INVALID token. Not a
                // lexer failure: the parser may be about to rewind out of a
                // speculative scan past a template placeholder.
                return None;
            }
            if self.ch == delimiter && !escaped {
                break;
            }
            if is_template && !escaped && self.ch == b'$' && self.peek_char() == b'{' {
                template_found = true;
                break;
            }
            escaped = self.ch == b'\\' && !escaped;
            self.read_char();
        }
        let literal = String::from_utf8_lossy(&self.input[start..self.position]).into_owned();
        Some((literal, template_found))
    }

    fn add_line(&mut self, offset: usize) {
        let file = match &self.file {
            Some(file) => file.clone(),
            None => return,
        };
        let mut lines = file.lines.borrow_mut();
        if self.line < lines.len() {
            return;
        }
        let rest = &self.input[offset.min(self.input.len())..];
        let end = rest.iter().position(|&c| c == b'\n').unwrap_or(rest.len());
        lines.push(String::from_utf8_lossy(&rest[..end]).into_owned());
    }
}

fn is_letter(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_digit(ch: u8) -> bool {
    ch.is_ascii_digit()
}

fn is_number_char(ch: u8) -> bool {
    // greedy: covers decimal points, hex prefixes and hex digits; the
    // parser validates the full lexeme
    matches!(ch, b'.' | b'x' | b'X') || (b'a'..=b'f').contains(&ch) || (b'A'..=b'F').contains(&ch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorList;

    fn all_tokens(input: &str) -> Vec<(TokenKind, String)> {
        let mut lexer = Lexer::new(input, None, ErrorList::shared());
        lexer.next_token();
        lexer.next_token();
        let mut tokens = Vec::new();
        while !lexer.cur_token_is(TokenKind::Eof) && !lexer.cur_token_is(TokenKind::Invalid) {
            tokens.push((lexer.current().kind, lexer.current().literal.clone()));
            lexer.next_token();
        }
        tokens
    }

    #[test]
    fn test_operators_and_compound_assigns() {
        let kinds: Vec<TokenKind> =
            all_tokens("+ += ++ - -= -- << <<= >> >>= & && &= | || |= ^ ^=")
                .into_iter()
                .map(|(kind, _)| kind)
                .collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Plus,
                TokenKind::PlusAssign,
                TokenKind::PlusPlus,
                TokenKind::Minus,
                TokenKind::MinusAssign,
                TokenKind::MinusMinus,
                TokenKind::Lshift,
                TokenKind::LshiftAssign,
                TokenKind::Rshift,
                TokenKind::RshiftAssign,
                TokenKind::BitAnd,
                TokenKind::And,
                TokenKind::BitAndAssign,
                TokenKind::BitOr,
                TokenKind::Or,
                TokenKind::BitOrAssign,
                TokenKind::BitXor,
                TokenKind::BitXorAssign,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = all_tokens("var x = null; function recover_all() {}");
        assert_eq!(tokens[0].0, TokenKind::Var);
        assert_eq!(tokens[1], (TokenKind::Ident, "x".to_string()));
        assert_eq!(tokens[3].0, TokenKind::Null);
        assert_eq!(tokens[5].0, TokenKind::Function);
        assert_eq!(tokens[6], (TokenKind::Ident, "recover_all".to_string()));
    }

    #[test]
    fn test_module_qualified_identifier() {
        let tokens = all_tokens("math::abs");
        assert_eq!(tokens, vec![(TokenKind::Ident, "math::abs".to_string())]);
        // a single colon terminates the identifier
        let tokens = all_tokens("key: 1");
        assert_eq!(tokens[0], (TokenKind::Ident, "key".to_string()));
        assert_eq!(tokens[1].0, TokenKind::Colon);
    }

    #[test]
    fn test_numbers_are_scanned_greedily() {
        let tokens = all_tokens("123 4.5 0xff");
        assert_eq!(tokens[0].1, "123");
        assert_eq!(tokens[1].1, "4.5");
        assert_eq!(tokens[2].1, "0xff");
    }

    #[test]
    fn test_comments_are_skipped() {
        let tokens = all_tokens("1 // comment until eol\n2");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].1, "2");
    }

    #[test]
    fn test_string_literals_keep_raw_escapes() {
        let tokens = all_tokens(r#""a\nb" 'c'"#);
        assert_eq!(tokens[0], (TokenKind::String, "a\\nb".to_string()));
        assert_eq!(tokens[1], (TokenKind::String, "c".to_string()));
    }

    #[test]
    fn test_template_string_stops_at_placeholder() {
        let mut lexer = Lexer::new("`a${x}b`", None, ErrorList::shared());
        lexer.next_token();
        lexer.next_token();
        assert_eq!(lexer.current().kind, TokenKind::TemplateString);
        assert_eq!(lexer.current().literal, "a");
        // the scanner resumes right after the '$', producing '{' 'x' '}'
        lexer.next_token();
        assert_eq!(lexer.current().kind, TokenKind::Lbrace);
        lexer.next_token();
        assert_eq!(lexer.current().kind, TokenKind::Ident);
        lexer.next_token();
        assert_eq!(lexer.current().kind, TokenKind::Rbrace);
        // rewind one token and re-enter the template string after '}'
        lexer.rewind_current();
        lexer.continue_template_string();
        lexer.next_token();
        lexer.next_token();
        assert_eq!(lexer.current().kind, TokenKind::String);
        assert_eq!(lexer.current().literal, "b");
    }

    #[test]
    fn test_positions_track_lines_and_columns() {
        let mut lexer = Lexer::new("a\n  b", None, ErrorList::shared());
        lexer.next_token();
        lexer.next_token();
        assert_eq!(lexer.current().position.line, 0);
        assert_eq!(lexer.current().position.column, 0);
        lexer.next_token();
        assert_eq!(lexer.current().position.line, 1);
        assert_eq!(lexer.current().position.column, 2);
    }

    #[test]
    fn test_rewind_current_restores_window() {
        let mut lexer = Lexer::new("a b c", None, ErrorList::shared());
        lexer.next_token();
        lexer.next_token();
        assert_eq!(lexer.current().literal, "a");
        lexer.next_token();
        assert_eq!(lexer.current().literal, "b");
        assert!(lexer.rewind_current());
        assert_eq!(lexer.current().literal, "a");
        assert_eq!(lexer.peek().literal, "b");
        lexer.next_token();
        lexer.next_token();
        assert_eq!(lexer.current().literal, "c");
    }
}
