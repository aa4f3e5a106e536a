// File: src/repl.rs
//
// Interactive REPL for the Ape scripting language.
// Maintains one context across inputs (module globals persist between
// lines), buffers multi-line input until delimiters balance, and supports a
// few ':' commands.

use crate::context::Context;
use crate::value::Value;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    context: Context,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        let mut context = Context::new();
        context.set_repl_mode(true);
        Ok(Repl { context, editor })
    }

    fn show_banner(&self) {
        println!("{}", format!("ape {} - interactive shell", env!("CARGO_PKG_VERSION")).bright_cyan());
        println!("  type {} for commands, {} to leave", ":help".bright_yellow(), ":quit".bright_yellow());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() {
                ">> ".bright_green().to_string()
            } else {
                ".. ".bright_blue().to_string()
            };
            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    if buffer.is_empty() && line.trim_start().starts_with(':') {
                        if !self.handle_command(line.trim()) {
                            break;
                        }
                        continue;
                    }
                    buffer.push_str(&line);
                    buffer.push('\n');
                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {}", "error:".bright_red(), err);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Returns false when the REPL should quit.
    fn handle_command(&mut self, command: &str) -> bool {
        match command {
            ":help" | ":h" => {
                println!("  {}        this help", ":help".bright_yellow());
                println!("  {}        leave the shell", ":quit".bright_yellow());
                println!("  {}       clear recorded errors", ":clear".bright_yellow());
                true
            }
            ":quit" | ":q" | ":exit" => false,
            ":clear" => {
                self.context.clear_errors();
                true
            }
            other => {
                println!("unknown command: {}", other);
                true
            }
        }
    }

    fn eval_input(&mut self, input: &str) {
        let res = self.context.execute_source(input);
        if self.context.has_errors() {
            for ix in 0..self.context.error_count() {
                if let Some(error) = self.context.get_error(ix) {
                    eprint!("{}", error);
                }
            }
            self.context.clear_errors();
            return;
        }
        if res != Value::Null {
            println!("{}", self.context.serialize(res));
        }
    }
}

/// Input is complete once parentheses, brackets and braces balance outside
/// of string literals.
fn is_input_complete(input: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for ch in input.chars() {
        if let Some(delimiter) = in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == delimiter {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' | '`' => in_string = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
    }
    depth <= 0 && in_string.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_completeness() {
        assert!(is_input_complete("1 + 2;"));
        assert!(!is_input_complete("function f() {"));
        assert!(is_input_complete("function f() { return 1; }"));
        assert!(!is_input_complete("var s = \"{\" + ("));
        assert!(is_input_complete("var s = \"{\";"));
        assert!(!is_input_complete("var s = \"unterminated"));
    }
}
