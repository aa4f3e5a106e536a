// File: src/errors.rs
//
// Error handling and reporting for the Ape scripting language.
// Provides structured errors with source positions, tracebacks for runtime
// errors, and the bounded error list shared by the parser, compiler and VM.

use colored::Colorize;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Maximum number of errors kept per execution; further errors are dropped.
pub const ERRORS_MAX_COUNT: usize = 16;

/// Maximum length of a stored error message; longer messages are truncated.
pub const ERROR_MESSAGE_MAX_LENGTH: usize = 255;

/// A loaded source file. Line slices are recorded by the lexer on first
/// traversal and used when rendering errors.
#[derive(Debug)]
pub struct ScriptFile {
    pub path: String,
    pub dir_path: String,
    pub lines: RefCell<Vec<String>>,
}

pub type FileRef = Rc<ScriptFile>;

impl ScriptFile {
    pub fn new(path: &str) -> FileRef {
        let dir_path = match path.rfind('/') {
            Some(ix) => path[..=ix].to_string(),
            None => String::new(),
        };
        Rc::new(ScriptFile {
            path: path.to_string(),
            dir_path,
            lines: RefCell::new(Vec::new()),
        })
    }

    pub fn line(&self, ix: usize) -> Option<String> {
        self.lines.borrow().get(ix).cloned()
    }
}

/// Source position of a token, AST node or emitted instruction.
#[derive(Debug, Clone, Default)]
pub struct Position {
    pub file: Option<FileRef>,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(file: Option<FileRef>, line: usize, column: usize) -> Self {
        Position { file, line, column }
    }

    /// A position for errors that cannot be attributed to source code.
    pub fn invalid() -> Self {
        Position { file: None, line: 0, column: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.file.is_some()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file.path, self.line + 1, self.column + 1),
            None => write!(f, "{}:{}", self.line + 1, self.column + 1),
        }
    }
}

/// Kinds of errors produced over the lifetime of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parsing,
    Compilation,
    Runtime,
    Timeout,
    Allocation,
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Parsing => write!(f, "Parsing Error"),
            ErrorKind::Compilation => write!(f, "Compilation Error"),
            ErrorKind::Runtime => write!(f, "Runtime Error"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::Allocation => write!(f, "Allocation Error"),
            ErrorKind::User => write!(f, "User Error"),
        }
    }
}

/// One entry of a runtime traceback: the called function and the call site.
#[derive(Debug, Clone)]
pub struct TracebackItem {
    pub function_name: String,
    pub position: Position,
}

#[derive(Debug, Clone, Default)]
pub struct Traceback {
    pub items: Vec<TracebackItem>,
}

impl Traceback {
    pub fn new() -> Self {
        Traceback { items: Vec::new() }
    }

    pub fn append(&mut self, function_name: &str, position: Position) {
        self.items.push(TracebackItem { function_name: function_name.to_string(), position });
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, item) in self.items.iter().enumerate() {
            let name = if item.function_name.is_empty() {
                "anonymous"
            } else {
                &item.function_name
            };
            if item.position.is_valid() {
                writeln!(f, "{:>4}: {} at {}", ix, name, item.position)?;
            } else {
                writeln!(f, "{:>4}: {}", ix, name)?;
            }
        }
        Ok(())
    }
}

/// A structured error with position information and an optional traceback.
#[derive(Debug, Clone)]
pub struct ApeError {
    pub kind: ErrorKind,
    pub message: String,
    pub position: Position,
    pub traceback: Option<Traceback>,
}

impl ApeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, position: Position) -> Self {
        let mut message = message.into();
        if message.len() > ERROR_MESSAGE_MAX_LENGTH {
            let mut end = ERROR_MESSAGE_MAX_LENGTH;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        ApeError { kind, message, position, traceback: None }
    }

    /// The source line the error points at, when the file recorded it.
    pub fn source_line(&self) -> Option<String> {
        let file = self.position.file.as_ref()?;
        file.line(self.position.line)
    }
}

impl fmt::Display for ApeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind_str = format!("{}", self.kind);
        writeln!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;
        let location = format!("  --> {}", self.position);
        writeln!(f, "{}", location.bright_blue())?;
        if let Some(source) = self.source_line() {
            let source = source.trim_end();
            writeln!(f, "   {}", "|".bright_blue())?;
            writeln!(
                f,
                "{} {} {}",
                format!("{:3}", self.position.line + 1).bright_blue(),
                "|".bright_blue(),
                source
            )?;
            writeln!(
                f,
                "   {} {}{}",
                "|".bright_blue(),
                " ".repeat(self.position.column),
                "^".red().bold()
            )?;
        }
        if let Some(traceback) = &self.traceback {
            writeln!(f, "{}", "Traceback:".bright_yellow())?;
            write!(f, "{}", traceback)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApeError {}

/// Marker that an error has already been pushed onto the shared error list.
/// Returned through `Result` so failures propagate with `?` without carrying
/// a second copy of the message.
#[derive(Debug, Clone, Copy)]
pub struct Reported;

pub type CompileResult<T = ()> = Result<T, Reported>;

/// Bounded list of errors shared by the whole pipeline for one execution.
/// Errors past [`ERRORS_MAX_COUNT`] are silently dropped.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<ApeError>,
}

pub type SharedErrors = Rc<RefCell<ErrorList>>;

impl ErrorList {
    pub fn new() -> Self {
        ErrorList { errors: Vec::new() }
    }

    pub fn shared() -> SharedErrors {
        Rc::new(RefCell::new(ErrorList::new()))
    }

    pub fn add(&mut self, kind: ErrorKind, position: Position, message: impl Into<String>) {
        if self.errors.len() >= ERRORS_MAX_COUNT {
            return;
        }
        self.errors.push(ApeError::new(kind, message, position));
    }

    pub fn count(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn get(&self, ix: usize) -> Option<&ApeError> {
        self.errors.get(ix)
    }

    pub fn last(&self) -> Option<&ApeError> {
        self.errors.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut ApeError> {
        self.errors.last_mut()
    }

    pub fn take_last(&mut self) -> Option<ApeError> {
        self.errors.pop()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApeError> {
        self.errors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_list_is_bounded() {
        let mut list = ErrorList::new();
        for i in 0..ERRORS_MAX_COUNT + 5 {
            list.add(ErrorKind::Runtime, Position::invalid(), format!("error {}", i));
        }
        assert_eq!(list.count(), ERRORS_MAX_COUNT);
    }

    #[test]
    fn test_long_messages_are_truncated() {
        let message = "x".repeat(ERROR_MESSAGE_MAX_LENGTH * 2);
        let err = ApeError::new(ErrorKind::Runtime, message, Position::invalid());
        assert_eq!(err.message.len(), ERROR_MESSAGE_MAX_LENGTH);
    }

    #[test]
    fn test_file_dir_path() {
        let file = ScriptFile::new("dir/sub/mod.ape");
        assert_eq!(file.dir_path, "dir/sub/");
        let bare = ScriptFile::new("mod.ape");
        assert_eq!(bare.dir_path, "");
    }
}
