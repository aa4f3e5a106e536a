// File: src/compiler.rs
//
// Single-pass bytecode compiler for Ape.
// Walks the AST driving the symbol table and emitter. Function literals
// compile in nested compilation scopes that are orphaned into constants;
// imports push file scopes and run the imported file through the same
// pipeline, caching each module's exported symbols by canonical path.

use crate::ast::{CodeBlock, Expr, ExprKind, Operator, Stmt, StmtKind};
use crate::bytecode::{
    append_instruction, patch_u16_operand, CompilationResult, Opcode, PLACEHOLDER_BREAK,
    PLACEHOLDER_JUMP,
};
use crate::errors::{
    CompileResult, ErrorKind, FileRef, Position, Reported, ScriptFile, SharedErrors,
};
use crate::heap::{FunctionData, Heap};
use crate::optimizer::optimize_expression;
use crate::parser::Parser;
use crate::symbols::{SharedGlobalStore, Symbol, SymbolKind, SymbolTable};
use crate::value::Value;
use ahash::AHashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub type FileReadFn = Box<dyn Fn(&str) -> Option<String>>;
pub type SharedFileRead = Rc<RefCell<FileReadFn>>;

/// A compiled module: its exported module-global symbols under their
/// `module::name` qualified names.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub symbols: Vec<Symbol>,
}

/// Owns one bytecode buffer and its patch-point stacks. Break and continue
/// jump to ips recorded here while their loop compiles.
struct CompilationScope {
    bytecode: Vec<u8>,
    src_positions: Vec<Position>,
    break_ip_stack: Vec<usize>,
    continue_ip_stack: Vec<usize>,
    last_opcode: Opcode,
}

impl CompilationScope {
    fn new() -> Self {
        CompilationScope {
            bytecode: Vec::new(),
            src_positions: Vec::new(),
            break_ip_stack: Vec::new(),
            continue_ip_stack: Vec::new(),
            last_opcode: Opcode::None,
        }
    }

    fn orphan_result(self) -> CompilationResult {
        CompilationResult::new(self.bytecode, self.src_positions)
    }
}

/// One file being compiled: its source file record, symbol table, and the
/// modules it has imported so far.
struct FileScope {
    file: FileRef,
    symbol_table: SymbolTable,
    loaded_module_names: Vec<String>,
}

pub struct Compiler {
    errors: SharedErrors,
    heap: Rc<RefCell<Heap>>,
    global_store: SharedGlobalStore,
    file_read: SharedFileRead,
    constants: Vec<Value>,
    /// Repeated string literals share one constants-pool slot.
    string_constants: AHashMap<String, usize>,
    /// Compiled modules by canonical path; a second import of the same path
    /// reuses the cached symbol set without recompiling.
    modules: AHashMap<String, Module>,
    file_scopes: Vec<FileScope>,
    compilation_scopes: Vec<CompilationScope>,
    src_positions_stack: Vec<Position>,
    module_global_counter: Rc<Cell<usize>>,
    repl_mode: bool,
}

impl Compiler {
    pub fn new(
        errors: SharedErrors,
        heap: Rc<RefCell<Heap>>,
        global_store: SharedGlobalStore,
        file_read: SharedFileRead,
    ) -> Self {
        let module_global_counter = Rc::new(Cell::new(0));
        let outer_scope = FileScope {
            file: ScriptFile::new("none"),
            symbol_table: SymbolTable::new(
                None,
                global_store.clone(),
                module_global_counter.clone(),
            ),
            loaded_module_names: Vec::new(),
        };
        Compiler {
            errors,
            heap,
            global_store,
            file_read,
            constants: Vec::new(),
            string_constants: AHashMap::new(),
            modules: AHashMap::new(),
            file_scopes: vec![outer_scope],
            compilation_scopes: Vec::new(),
            src_positions_stack: Vec::new(),
            module_global_counter,
            repl_mode: false,
        }
    }

    pub fn set_repl_mode(&mut self, repl_mode: bool) {
        self.repl_mode = repl_mode;
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Clears the module cache; the next import of any path recompiles it.
    pub fn clear_module_cache(&mut self) {
        self.modules.clear();
    }

    /// Compiles one top-level source text into a result ready for the VM.
    /// The compiler persists across calls so the REPL keeps its module
    /// globals and constants.
    pub fn compile_source(&mut self, code: &str, file: Option<FileRef>) -> Option<Rc<CompilationResult>> {
        let file = file.unwrap_or_else(|| ScriptFile::new("none"));
        let res = self.compile_source_inner(code, file);
        if res.is_none() {
            // unwind half-built state from a failed compile; the top file
            // scope and its surviving symbols stay (REPL continuity)
            self.file_scopes.truncate(1);
            self.compilation_scopes.clear();
            self.src_positions_stack.clear();
            let table = self.symbol_table();
            while table.outer.is_some() {
                let outer = table.outer.take().expect("outer vanished");
                *table = *outer;
            }
            table.pop_to_top_block_scope();
        }
        res
    }

    fn compile_source_inner(&mut self, code: &str, file: FileRef) -> Option<Rc<CompilationResult>> {
        self.file_scopes.truncate(1);
        self.file_scopes[0].file = file.clone();
        // the duplicate-import check is per program, not per context
        self.file_scopes[0].loaded_module_names.clear();
        self.compilation_scopes.clear();
        self.compilation_scopes.push(CompilationScope::new());

        let mut parser = Parser::new(code, Some(file), self.errors.clone(), self.repl_mode);
        let statements = parser.parse_all()?;
        if !self.errors.borrow().is_empty() {
            return None;
        }
        for stmt in &statements {
            self.compile_statement(stmt).ok()?;
        }
        let scope = self.compilation_scopes.pop().expect("no compilation scope");
        Some(Rc::new(scope.orphan_result()))
    }

    // === Statements ===

    fn compile_statement(&mut self, stmt: &Stmt) -> CompileResult {
        self.src_positions_stack.push(stmt.position.clone());
        let res = self.compile_statement_inner(stmt);
        self.src_positions_stack.pop();
        res
    }

    fn compile_statement_inner(&mut self, stmt: &Stmt) -> CompileResult {
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.compile_expression(expr)?;
                self.emit(Opcode::Pop, &[]);
                Ok(())
            }
            StmtKind::Define { name, value, assignable } => {
                self.compile_expression(value)?;
                let symbol =
                    self.define_symbol(&name.position, &name.name, *assignable, false)?;
                self.write_symbol(&symbol, true);
                Ok(())
            }
            StmtKind::If { cases, alternative } => {
                let mut jump_to_end_ips = Vec::new();
                for (ix, case) in cases.iter().enumerate() {
                    self.compile_expression(&case.test)?;
                    let next_case_jump_ip =
                        self.emit(Opcode::JumpIfFalse, &[PLACEHOLDER_JUMP]);
                    self.compile_code_block(&case.consequence)?;
                    // the last case without an alternative falls through
                    if ix < cases.len() - 1 || alternative.is_some() {
                        jump_to_end_ips.push(self.emit(Opcode::Jump, &[PLACEHOLDER_JUMP]));
                    }
                    let after_case_ip = self.ip();
                    self.patch_jump(next_case_jump_ip, after_case_ip);
                }
                if let Some(alternative) = alternative {
                    self.compile_code_block(alternative)?;
                }
                let end_ip = self.ip();
                for jump_ip in jump_to_end_ips {
                    self.patch_jump(jump_ip, end_ip);
                }
                Ok(())
            }
            StmtKind::While { test, body } => {
                let before_test_ip = self.ip();
                self.compile_expression(test)?;
                let after_test_jump_ip = self.emit(Opcode::JumpIfTrue, &[PLACEHOLDER_JUMP]);
                let jump_to_end_ip = self.emit(Opcode::Jump, &[PLACEHOLDER_BREAK]);
                let after_test_ip = self.ip();
                self.patch_jump(after_test_jump_ip, after_test_ip);
                self.push_continue_ip(before_test_ip);
                self.push_break_ip(jump_to_end_ip);
                self.compile_code_block(body)?;
                self.pop_break_ip();
                self.pop_continue_ip();
                self.emit(Opcode::Jump, &[before_test_ip as u64]);
                let end_ip = self.ip();
                self.patch_jump(jump_to_end_ip, end_ip);
                Ok(())
            }
            StmtKind::Break => {
                let Some(break_ip) = self.current_scope().break_ip_stack.last().copied() else {
                    return self.error(stmt.position.clone(), "nothing to break from");
                };
                self.emit(Opcode::Jump, &[break_ip as u64]);
                Ok(())
            }
            StmtKind::Continue => {
                let Some(continue_ip) = self.current_scope().continue_ip_stack.last().copied()
                else {
                    return self.error(stmt.position.clone(), "nothing to continue");
                };
                self.emit(Opcode::Jump, &[continue_ip as u64]);
                Ok(())
            }
            StmtKind::Return(value) => {
                if self.compilation_scopes.len() < 2 {
                    return self.error(stmt.position.clone(), "nothing to return from");
                }
                match value {
                    Some(value) => {
                        self.compile_expression(value)?;
                        self.emit(Opcode::ReturnValue, &[]);
                    }
                    None => {
                        self.emit(Opcode::Return, &[]);
                    }
                }
                Ok(())
            }
            StmtKind::ForEach { iterator, source, body } => {
                self.compile_foreach(stmt, iterator, source, body)
            }
            StmtKind::For { init, test, update, body } => {
                self.compile_classic_for(init.as_deref(), test.as_deref(), update.as_deref(), body)
            }
            StmtKind::Block(block) => self.compile_code_block(block),
            StmtKind::Import { path } => self.import_module(&stmt.position, path),
            StmtKind::Recover { error_ident, body } => {
                if self.symbol_table().is_module_global_scope() {
                    return self
                        .error(stmt.position.clone(), "recover statement cannot be defined in global scope");
                }
                if !self.symbol_table().is_top_block_scope() {
                    return self.error(
                        stmt.position.clone(),
                        "recover statement cannot be defined within other statements",
                    );
                }
                let recover_ip = self.emit(Opcode::SetRecover, &[PLACEHOLDER_JUMP]);
                let jump_to_after_recover_ip = self.emit(Opcode::Jump, &[PLACEHOLDER_JUMP]);
                let after_jump_to_recover_ip = self.ip();
                self.patch_jump(recover_ip, after_jump_to_recover_ip);
                self.symbol_table().push_block_scope();
                let error_symbol =
                    self.define_symbol(&error_ident.position, &error_ident.name, false, false)?;
                self.write_symbol(&error_symbol, true);
                self.compile_code_block(body)?;
                if !matches!(
                    self.current_scope().last_opcode,
                    Opcode::Return | Opcode::ReturnValue
                ) {
                    return self.error(
                        stmt.position.clone(),
                        "recover body must end with a return statement",
                    );
                }
                self.symbol_table().pop_block_scope();
                let after_recover_ip = self.ip();
                self.patch_jump(jump_to_after_recover_ip, after_recover_ip);
                Ok(())
            }
        }
    }

    /// For-each synthesizes two hidden locals: `@i` for the running index
    /// and `@source` for the source value when it is not already a name.
    /// The loop ends when `compare(len(source), index)` reaches zero;
    /// elements are read with GET_VALUE_AT.
    fn compile_foreach(
        &mut self,
        stmt: &Stmt,
        iterator: &crate::ast::Ident,
        source: &Expr,
        body: &CodeBlock,
    ) -> CompileResult {
        self.symbol_table().push_block_scope();

        // Init
        let index_symbol = self.define_symbol(&stmt.position, "@i", false, true)?;
        self.emit(Opcode::Number, &[0u64]);
        self.write_symbol(&index_symbol, true);

        let source_symbol = if let ExprKind::Ident(ident) = &source.kind {
            match self.symbol_table().resolve(&ident.name) {
                Some(symbol) => symbol,
                None => {
                    return self.error(
                        source.position.clone(),
                        format!("symbol '{}' could not be resolved", ident.name),
                    );
                }
            }
        } else {
            self.compile_expression(source)?;
            let symbol = self.define_symbol(&source.position, "@source", false, true)?;
            self.write_symbol(&symbol, true);
            symbol
        };

        // Update
        let jump_to_after_update_ip = self.emit(Opcode::Jump, &[PLACEHOLDER_JUMP]);
        let update_ip = self.ip();
        self.read_symbol(&index_symbol);
        self.emit(Opcode::Number, &[1.0f64.to_bits()]);
        self.emit(Opcode::Add, &[]);
        self.write_symbol(&index_symbol, false);
        let after_update_ip = self.ip();
        self.patch_jump(jump_to_after_update_ip, after_update_ip);

        // Test
        self.src_positions_stack.push(source.position.clone());
        self.read_symbol(&source_symbol);
        self.emit(Opcode::Len, &[]);
        self.src_positions_stack.pop();
        self.read_symbol(&index_symbol);
        self.emit(Opcode::Compare, &[]);
        self.emit(Opcode::Equal, &[]);

        let after_test_ip = self.ip();
        self.emit(Opcode::JumpIfFalse, &[(after_test_ip + 6) as u64]);
        let jump_to_after_body_ip = self.emit(Opcode::Jump, &[PLACEHOLDER_BREAK]);

        self.read_symbol(&source_symbol);
        self.read_symbol(&index_symbol);
        self.emit(Opcode::GetValueAt, &[]);
        let iter_symbol =
            self.define_symbol(&iterator.position, &iterator.name, false, true)?;
        self.write_symbol(&iter_symbol, true);

        // Body
        self.push_continue_ip(update_ip);
        self.push_break_ip(jump_to_after_body_ip);
        self.compile_code_block(body)?;
        self.pop_break_ip();
        self.pop_continue_ip();
        self.emit(Opcode::Jump, &[update_ip as u64]);

        let after_body_ip = self.ip();
        self.patch_jump(jump_to_after_body_ip, after_body_ip);

        self.symbol_table().pop_block_scope();
        Ok(())
    }

    fn compile_classic_for(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &CodeBlock,
    ) -> CompileResult {
        self.symbol_table().push_block_scope();

        // Init
        if let Some(init) = init {
            self.compile_statement(init)?;
        }
        let jump_to_after_update_ip = self.emit(Opcode::Jump, &[PLACEHOLDER_JUMP]);

        // Update
        let update_ip = self.ip();
        if let Some(update) = update {
            self.compile_expression(update)?;
            self.emit(Opcode::Pop, &[]);
        }
        let after_update_ip = self.ip();
        self.patch_jump(jump_to_after_update_ip, after_update_ip);

        // Test
        match test {
            Some(test) => self.compile_expression(test)?,
            None => {
                self.emit(Opcode::True, &[]);
            }
        }
        let after_test_ip = self.ip();
        self.emit(Opcode::JumpIfTrue, &[(after_test_ip + 6) as u64]);
        let jump_to_end_ip = self.emit(Opcode::Jump, &[PLACEHOLDER_BREAK]);

        // Body
        self.push_continue_ip(update_ip);
        self.push_break_ip(jump_to_end_ip);
        self.compile_code_block(body)?;
        self.pop_break_ip();
        self.pop_continue_ip();
        self.emit(Opcode::Jump, &[update_ip as u64]);

        let end_ip = self.ip();
        self.patch_jump(jump_to_end_ip, end_ip);

        self.symbol_table().pop_block_scope();
        Ok(())
    }

    fn compile_code_block(&mut self, block: &CodeBlock) -> CompileResult {
        self.symbol_table().push_block_scope();
        if block.statements.is_empty() {
            self.emit(Opcode::Null, &[]);
            self.emit(Opcode::Pop, &[]);
        }
        for stmt in &block.statements {
            self.compile_statement(stmt)?;
        }
        self.symbol_table().pop_block_scope();
        Ok(())
    }

    // === Imports ===

    fn import_module(&mut self, position: &Position, module_path: &str) -> CompileResult {
        let module_name = module_name_of(module_path);
        {
            let file_scope = self.file_scopes.last().expect("no file scope");
            if file_scope.loaded_module_names.iter().any(|name| name == &module_name) {
                return self.error(
                    position.clone(),
                    format!("module '{}' was already imported", module_name),
                );
            }
        }
        let file_path = if module_path.starts_with('/') {
            format!("{}.ape", module_path)
        } else {
            let dir = &self.file_scopes.last().expect("no file scope").file.dir_path;
            format!("{}{}.ape", dir, module_path)
        };
        let file_path = canonicalize_path(&file_path);

        {
            let symbol_table = self.symbol_table();
            if !symbol_table.is_top_global_scope() {
                return self
                    .error(position.clone(), "modules can only be imported in global scope");
            }
        }
        if self.file_scopes.iter().any(|scope| scope.file.path == file_path) {
            return self.error(
                position.clone(),
                format!("cyclic reference of file '{}'", file_path),
            );
        }

        if !self.modules.contains_key(&file_path) {
            let code = (*self.file_read.borrow())(&file_path);
            let Some(code) = code else {
                return self.error(
                    position.clone(),
                    format!("reading module file '{}' failed", file_path),
                );
            };
            self.push_file_scope(&file_path);
            let compiled = self.compile_module_code(&code);
            if compiled.is_err() {
                self.pop_file_scope();
                return Err(Reported);
            }
            let symbols: Vec<Symbol> = self
                .symbol_table()
                .module_global_symbols()
                .iter()
                .map(|symbol| {
                    Symbol::new(
                        format!("{}::{}", module_name, symbol.name),
                        SymbolKind::ModuleGlobal,
                        symbol.index,
                        symbol.assignable,
                    )
                })
                .collect();
            self.pop_file_scope();
            self.modules
                .insert(file_path.clone(), Module { name: module_name.clone(), symbols });
        }

        let module = self.modules.get(&file_path).cloned().expect("module vanished");
        for symbol in &module.symbols {
            self.symbol_table().add_module_symbol(symbol);
        }
        self.file_scopes
            .last_mut()
            .expect("no file scope")
            .loaded_module_names
            .push(module_name);
        Ok(())
    }

    fn compile_module_code(&mut self, code: &str) -> CompileResult {
        let file = self.file_scopes.last().expect("no file scope").file.clone();
        let mut parser = Parser::new(code, Some(file), self.errors.clone(), false);
        let Some(statements) = parser.parse_all() else {
            return Err(Reported);
        };
        for stmt in &statements {
            self.compile_statement(stmt)?;
        }
        Ok(())
    }

    fn push_file_scope(&mut self, path: &str) {
        self.file_scopes.push(FileScope {
            file: ScriptFile::new(path),
            symbol_table: SymbolTable::new(
                None,
                self.global_store.clone(),
                self.module_global_counter.clone(),
            ),
            loaded_module_names: Vec::new(),
        });
    }

    fn pop_file_scope(&mut self) {
        self.file_scopes.pop();
    }

    // === Expressions ===

    fn compile_expression(&mut self, expr: &Expr) -> CompileResult {
        let optimized = optimize_expression(expr);
        let expr = optimized.as_ref().unwrap_or(expr);
        self.src_positions_stack.push(expr.position.clone());
        let res = self.compile_expression_inner(expr);
        self.src_positions_stack.pop();
        res
    }

    fn compile_expression_inner(&mut self, expr: &Expr) -> CompileResult {
        match &expr.kind {
            ExprKind::Infix { op, left, right } => {
                let (opcode, rearrange) = match op {
                    Operator::Plus => (Opcode::Add, false),
                    Operator::Minus => (Opcode::Sub, false),
                    Operator::Asterisk => (Opcode::Mul, false),
                    Operator::Slash => (Opcode::Div, false),
                    Operator::Percent => (Opcode::Mod, false),
                    Operator::Eq => (Opcode::Equal, false),
                    Operator::NotEq => (Opcode::NotEqual, false),
                    Operator::Gt => (Opcode::GreaterThan, false),
                    Operator::Gte => (Opcode::GreaterThanEqual, false),
                    // a < b compiles as b > a
                    Operator::Lt => (Opcode::GreaterThan, true),
                    Operator::Lte => (Opcode::GreaterThanEqual, true),
                    Operator::BitOr => (Opcode::Or, false),
                    Operator::BitXor => (Opcode::Xor, false),
                    Operator::BitAnd => (Opcode::And, false),
                    Operator::Lshift => (Opcode::Lshift, false),
                    Operator::Rshift => (Opcode::Rshift, false),
                    _ => {
                        return self
                            .error(expr.position.clone(), "unknown infix operator");
                    }
                };
                let (first, second) = if rearrange { (right, left) } else { (left, right) };
                self.compile_expression(first)?;
                self.compile_expression(second)?;
                match opcode {
                    Opcode::Equal | Opcode::NotEqual => {
                        self.emit(Opcode::CompareEq, &[]);
                        self.emit(opcode, &[]);
                    }
                    Opcode::GreaterThan | Opcode::GreaterThanEqual => {
                        self.emit(Opcode::Compare, &[]);
                        self.emit(opcode, &[]);
                    }
                    _ => {
                        self.emit(opcode, &[]);
                    }
                }
                Ok(())
            }
            ExprKind::NumberLiteral(n) => {
                self.emit(Opcode::Number, &[n.to_bits()]);
                Ok(())
            }
            ExprKind::StringLiteral(s) => {
                let constant_ix = match self.string_constants.get(s) {
                    Some(ix) => *ix,
                    None => {
                        let obj = self.heap.borrow_mut().alloc_string(s.clone());
                        let ix = self.add_constant(&expr.position, obj)?;
                        self.string_constants.insert(s.clone(), ix);
                        ix
                    }
                };
                self.emit(Opcode::Constant, &[constant_ix as u64]);
                Ok(())
            }
            ExprKind::BoolLiteral(true) => {
                self.emit(Opcode::True, &[]);
                Ok(())
            }
            ExprKind::BoolLiteral(false) => {
                self.emit(Opcode::False, &[]);
                Ok(())
            }
            ExprKind::NullLiteral => {
                self.emit(Opcode::Null, &[]);
                Ok(())
            }
            ExprKind::Ident(ident) => {
                let Some(symbol) = self.symbol_table().resolve(&ident.name) else {
                    return self.error(
                        ident.position.clone(),
                        format!("symbol '{}' could not be resolved", ident.name),
                    );
                };
                self.read_symbol(&symbol);
                Ok(())
            }
            ExprKind::ArrayLiteral(items) => {
                for item in items {
                    self.compile_expression(item)?;
                }
                self.emit(Opcode::Array, &[items.len() as u64]);
                Ok(())
            }
            ExprKind::MapLiteral(pairs) => {
                // the map under construction lives on the this stack while
                // its keys and values evaluate
                self.emit(Opcode::MapStart, &[pairs.len() as u64]);
                for (key, value) in pairs {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                self.emit(Opcode::MapEnd, &[pairs.len() as u64]);
                Ok(())
            }
            ExprKind::Prefix { op, right } => {
                self.compile_expression(right)?;
                let opcode = match op {
                    Operator::Minus => Opcode::Minus,
                    Operator::Bang => Opcode::Bang,
                    _ => {
                        return self
                            .error(expr.position.clone(), "unknown prefix operator");
                    }
                };
                self.emit(opcode, &[]);
                Ok(())
            }
            ExprKind::FnLiteral { name, params, body } => {
                self.compile_fn_literal(expr, name.as_deref(), params, body)
            }
            ExprKind::Call { function, args } => {
                self.compile_expression(function)?;
                for arg in args {
                    self.compile_expression(arg)?;
                }
                self.emit(Opcode::Call, &[args.len() as u64]);
                Ok(())
            }
            ExprKind::Index { left, index } => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(Opcode::GetIndex, &[]);
                Ok(())
            }
            ExprKind::Assign { dest, source, is_postfix } => {
                self.compile_assign(dest, source, *is_postfix)
            }
            ExprKind::Logical { op, left, right } => {
                self.compile_expression(left)?;
                self.emit(Opcode::Dup, &[]);
                let after_left_jump_ip = if *op == Operator::LogicalAnd {
                    self.emit(Opcode::JumpIfFalse, &[PLACEHOLDER_JUMP])
                } else {
                    self.emit(Opcode::JumpIfTrue, &[PLACEHOLDER_JUMP])
                };
                self.emit(Opcode::Pop, &[]);
                self.compile_expression(right)?;
                let after_right_ip = self.ip();
                self.patch_jump(after_left_jump_ip, after_right_ip);
                Ok(())
            }
            ExprKind::Ternary { test, if_true, if_false } => {
                self.compile_expression(test)?;
                let else_jump_ip = self.emit(Opcode::JumpIfFalse, &[PLACEHOLDER_JUMP]);
                self.compile_expression(if_true)?;
                let end_jump_ip = self.emit(Opcode::Jump, &[PLACEHOLDER_JUMP]);
                let else_ip = self.ip();
                self.patch_jump(else_jump_ip, else_ip);
                self.compile_expression(if_false)?;
                let end_ip = self.ip();
                self.patch_jump(end_jump_ip, end_ip);
                Ok(())
            }
        }
    }

    fn compile_fn_literal(
        &mut self,
        expr: &Expr,
        name: Option<&str>,
        params: &[crate::ast::Ident],
        body: &CodeBlock,
    ) -> CompileResult {
        self.compilation_scopes.push(CompilationScope::new());
        self.push_symbol_table();

        if let Some(name) = name {
            if self.symbol_table().define_function_name(name, false).is_none() {
                return self.error(
                    expr.position.clone(),
                    format!("cannot define symbol '{}'", name),
                );
            }
        }
        self.symbol_table().define_this();
        for param in params {
            self.define_symbol(&param.position, &param.name, true, true)?;
        }

        for stmt in &body.statements {
            self.compile_statement(stmt)?;
        }
        if !matches!(self.current_scope().last_opcode, Opcode::Return | Opcode::ReturnValue) {
            self.emit(Opcode::Return, &[]);
        }

        let free_symbols = self.symbol_table().take_free_symbols();
        let num_locals = self.symbol_table().max_num_definitions;
        self.pop_symbol_table();
        let scope = self.compilation_scopes.pop().expect("no compilation scope");
        let comp_result = Rc::new(scope.orphan_result());

        let function = self.heap.borrow_mut().alloc_function(FunctionData {
            name: name.unwrap_or_default().to_string(),
            comp_result,
            num_locals,
            num_args: params.len(),
            free_vals: Vec::new(),
        });

        // read each captured original in the enclosing scope; FUNCTION
        // consumes them into the closure
        for free_symbol in &free_symbols {
            self.read_symbol(free_symbol);
        }
        let constant_ix = self.add_constant(&expr.position, function)?;
        self.emit(Opcode::Function, &[constant_ix as u64, free_symbols.len() as u64]);
        Ok(())
    }

    fn compile_assign(&mut self, dest: &Expr, source: &Expr, is_postfix: bool) -> CompileResult {
        if !matches!(dest.kind, ExprKind::Ident(_) | ExprKind::Index { .. }) {
            return self.error(dest.position.clone(), "expression is not assignable");
        }
        if is_postfix {
            // the old value stays below the assignment
            self.compile_expression(dest)?;
        }
        self.compile_expression(source)?;
        self.emit(Opcode::Dup, &[]);
        self.src_positions_stack.push(dest.position.clone());
        let res = self.compile_assign_dest(dest);
        self.src_positions_stack.pop();
        res?;
        if is_postfix {
            self.emit(Opcode::Pop, &[]);
        }
        Ok(())
    }

    fn compile_assign_dest(&mut self, dest: &Expr) -> CompileResult {
        match &dest.kind {
            ExprKind::Ident(ident) => {
                let resolved = self.symbol_table().resolve(&ident.name);
                let symbol = match resolved {
                    Some(symbol) => symbol,
                    // first write to an unresolved name defines it
                    None => match self.symbol_table().define(&ident.name, true) {
                        Some(symbol) => symbol,
                        None => {
                            return self.error(
                                ident.position.clone(),
                                format!("cannot define symbol '{}'", ident.name),
                            );
                        }
                    },
                };
                if !symbol.assignable {
                    return self.error(
                        ident.position.clone(),
                        format!("symbol '{}' is not assignable", ident.name),
                    );
                }
                self.write_symbol(&symbol, false);
                Ok(())
            }
            ExprKind::Index { left, index } => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(Opcode::SetIndex, &[]);
                Ok(())
            }
            _ => self.error(dest.position.clone(), "expression is not assignable"),
        }
    }

    // === Symbols ===

    fn symbol_table(&mut self) -> &mut SymbolTable {
        &mut self.file_scopes.last_mut().expect("no file scope").symbol_table
    }

    fn push_symbol_table(&mut self) {
        let global_store = self.global_store.clone();
        let counter = self.module_global_counter.clone();
        let file_scope = self.file_scopes.last_mut().expect("no file scope");
        let outer = std::mem::replace(
            &mut file_scope.symbol_table,
            SymbolTable::new(None, global_store, counter),
        );
        file_scope.symbol_table.outer = Some(Box::new(outer));
    }

    fn pop_symbol_table(&mut self) {
        let file_scope = self.file_scopes.last_mut().expect("no file scope");
        let outer = file_scope.symbol_table.outer.take().expect("no outer symbol table");
        file_scope.symbol_table = *outer;
    }

    fn define_symbol(
        &mut self,
        position: &Position,
        name: &str,
        assignable: bool,
        can_shadow: bool,
    ) -> CompileResult<Symbol> {
        let repl_mode = self.repl_mode;
        let table = self.symbol_table();
        if !can_shadow {
            let redefinable_top = repl_mode && table.is_top_global_scope();
            if !redefinable_top && table.symbol_is_defined(name) {
                return self
                    .error(position.clone(), format!("symbol '{}' is already defined", name));
            }
        }
        match self.symbol_table().define(name, assignable) {
            Some(symbol) => Ok(symbol),
            None => self.error(position.clone(), format!("cannot define symbol '{}'", name)),
        }
    }

    fn read_symbol(&mut self, symbol: &Symbol) {
        match symbol.kind {
            SymbolKind::ModuleGlobal => {
                self.emit(Opcode::GetModuleGlobal, &[symbol.index as u64]);
            }
            SymbolKind::ApeGlobal => {
                self.emit(Opcode::GetApeGlobal, &[symbol.index as u64]);
            }
            SymbolKind::Local => {
                self.emit(Opcode::GetLocal, &[symbol.index as u64]);
            }
            SymbolKind::Free => {
                self.emit(Opcode::GetFree, &[symbol.index as u64]);
            }
            SymbolKind::FunctionSelf => {
                self.emit(Opcode::CurrentFunction, &[]);
            }
            SymbolKind::This => {
                self.emit(Opcode::GetThis, &[]);
            }
        }
    }

    fn write_symbol(&mut self, symbol: &Symbol, define: bool) {
        match symbol.kind {
            SymbolKind::ModuleGlobal => {
                let op = if define { Opcode::DefineModuleGlobal } else { Opcode::SetModuleGlobal };
                self.emit(op, &[symbol.index as u64]);
            }
            SymbolKind::Local => {
                let op = if define { Opcode::DefineLocal } else { Opcode::SetLocal };
                self.emit(op, &[symbol.index as u64]);
            }
            SymbolKind::Free => {
                self.emit(Opcode::SetFree, &[symbol.index as u64]);
            }
            _ => {}
        }
    }

    // === Emitter ===

    fn current_scope(&mut self) -> &mut CompilationScope {
        self.compilation_scopes.last_mut().expect("no compilation scope")
    }

    fn ip(&mut self) -> usize {
        self.current_scope().bytecode.len()
    }

    fn emit(&mut self, op: Opcode, operands: &[u64]) -> usize {
        let position = self
            .src_positions_stack
            .last()
            .cloned()
            .unwrap_or_else(Position::invalid);
        let scope = self.current_scope();
        let ip = append_instruction(&mut scope.bytecode, &mut scope.src_positions, op, operands, position);
        scope.last_opcode = op;
        ip
    }

    fn patch_jump(&mut self, ip: usize, target: usize) {
        patch_u16_operand(&mut self.current_scope().bytecode, ip, target as u64);
    }

    fn push_break_ip(&mut self, ip: usize) {
        self.current_scope().break_ip_stack.push(ip);
    }

    fn pop_break_ip(&mut self) {
        self.current_scope().break_ip_stack.pop();
    }

    fn push_continue_ip(&mut self, ip: usize) {
        self.current_scope().continue_ip_stack.push(ip);
    }

    fn pop_continue_ip(&mut self) {
        self.current_scope().continue_ip_stack.pop();
    }

    fn add_constant(&mut self, position: &Position, value: Value) -> CompileResult<usize> {
        if self.constants.len() > u16::MAX as usize {
            return self.error(position.clone(), "too many constants");
        }
        self.constants.push(value);
        Ok(self.constants.len() - 1)
    }

    fn error<T>(&mut self, position: Position, message: impl Into<String>) -> CompileResult<T> {
        self.errors.borrow_mut().add(ErrorKind::Compilation, position, message);
        Err(Reported)
    }
}

fn module_name_of(path: &str) -> String {
    match path.rfind('/') {
        Some(ix) => path[ix + 1..].to_string(),
        None => path.to_string(),
    }
}

/// Lexical path canonicalization: resolves `.` and `..` without touching
/// the filesystem, so module cache keys are stable.
fn canonicalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            part => parts.push(part),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorList;
    use crate::symbols::GlobalStore;

    fn make_compiler() -> (Compiler, SharedErrors) {
        let errors = ErrorList::shared();
        let heap = Rc::new(RefCell::new(Heap::new()));
        let global_store = GlobalStore::shared();
        let file_read: SharedFileRead =
            Rc::new(RefCell::new(Box::new(|_path: &str| None) as FileReadFn));
        (Compiler::new(errors.clone(), heap, global_store, file_read), errors)
    }

    fn compile(code: &str) -> Rc<CompilationResult> {
        let (mut compiler, errors) = make_compiler();
        let res = compiler.compile_source(code, None);
        assert!(
            errors.borrow().is_empty(),
            "unexpected errors: {:?}",
            errors.borrow().iter().map(|e| e.message.clone()).collect::<Vec<_>>()
        );
        res.expect("compilation failed")
    }

    fn compile_err(code: &str) -> String {
        let (mut compiler, errors) = make_compiler();
        let res = compiler.compile_source(code, None);
        assert!(res.is_none(), "expected compilation to fail");
        let errors = errors.borrow();
        errors.last().expect("no error recorded").message.clone()
    }

    fn opcodes(result: &CompilationResult) -> Vec<Opcode> {
        let mut ops = Vec::new();
        let mut ip = 0;
        while ip < result.bytecode.len() {
            let op = Opcode::try_from(result.bytecode[ip]).unwrap();
            ops.push(op);
            ip += 1 + op.definition().operand_widths.iter().sum::<usize>();
        }
        ops
    }

    #[test]
    fn test_positions_parallel_bytecode() {
        let result = compile("var a = 1; a + 2;");
        assert_eq!(result.bytecode.len(), result.src_positions.len());
    }

    #[test]
    fn test_define_module_global() {
        let result = compile("var a = 1;");
        assert_eq!(opcodes(&result), vec![Opcode::Number, Opcode::DefineModuleGlobal]);
    }

    #[test]
    fn test_less_than_compiles_as_swapped_greater_than() {
        // literal comparisons fold away, so keep one operand symbolic
        let result = compile("var a = 1; a < 2;");
        assert_eq!(
            opcodes(&result),
            vec![
                Opcode::Number,
                Opcode::DefineModuleGlobal,
                Opcode::Number,
                Opcode::GetModuleGlobal,
                Opcode::Compare,
                Opcode::GreaterThan,
                Opcode::Pop,
            ]
        );
    }

    #[test]
    fn test_equality_uses_compare_eq() {
        let result = compile("var a = 1; a == 2;");
        assert!(opcodes(&result).contains(&Opcode::CompareEq));
    }

    #[test]
    fn test_string_literals_are_interned() {
        let (mut compiler, _errors) = make_compiler();
        compiler
            .compile_source(r#"var a = "dup"; var b = "dup"; var c = "other";"#, None)
            .expect("compilation failed");
        // two distinct string constants, not three
        assert_eq!(compiler.constants().len(), 2);
    }

    #[test]
    fn test_deterministic_bytecode() {
        let code = "var a = 2 + 3 * 4; function f(x) { return x; } f(a);";
        let first = compile(code);
        let second = compile(code);
        assert_eq!(first.bytecode, second.bytecode);
    }

    #[test]
    fn test_break_outside_loop_fails() {
        assert_eq!(compile_err("break;"), "nothing to break from");
        assert_eq!(compile_err("continue;"), "nothing to continue");
    }

    #[test]
    fn test_return_outside_function_fails() {
        assert_eq!(compile_err("return 1;"), "nothing to return from");
    }

    #[test]
    fn test_recover_outside_function_fails() {
        assert_eq!(
            compile_err("recover (e) { return e; }"),
            "recover statement cannot be defined in global scope"
        );
    }

    #[test]
    fn test_recover_requires_terminal_return() {
        let message = compile_err("function f() { recover (e) { var a = 1; } return 0; } f();");
        assert_eq!(message, "recover body must end with a return statement");
    }

    #[test]
    fn test_recover_must_be_at_top_of_block() {
        let message =
            compile_err("function f() { if (true) { recover (e) { return e; } } return 0; }");
        assert_eq!(message, "recover statement cannot be defined within other statements");
    }

    #[test]
    fn test_duplicate_define_fails() {
        assert_eq!(compile_err("var a = 1; var a = 2;"), "symbol 'a' is already defined");
    }

    #[test]
    fn test_repl_mode_allows_redefinition() {
        let (mut compiler, errors) = make_compiler();
        compiler.set_repl_mode(true);
        compiler.compile_source("var a = 1;", None).expect("first define failed");
        compiler.compile_source("var a = 2;", None).expect("redefinition failed");
        assert!(errors.borrow().is_empty());
    }

    #[test]
    fn test_const_assignment_fails() {
        assert_eq!(
            compile_err("const a = 1; a = 2;"),
            "symbol 'a' is not assignable"
        );
    }

    #[test]
    fn test_assignment_to_unresolved_name_defines_it() {
        let result = compile("x = 5; x;");
        assert!(opcodes(&result).contains(&Opcode::SetModuleGlobal));
    }

    #[test]
    fn test_import_requires_global_scope() {
        let message = compile_err(r#"function f() { import "mod"; return 0; }"#);
        assert_eq!(message, "modules can only be imported in global scope");
    }

    #[test]
    fn test_import_missing_file_fails() {
        let message = compile_err(r#"import "mod";"#);
        assert_eq!(message, "reading module file 'mod.ape' failed");
    }

    #[test]
    fn test_import_compiles_module_and_installs_qualified_symbols() {
        let errors = ErrorList::shared();
        let heap = Rc::new(RefCell::new(Heap::new()));
        let global_store = GlobalStore::shared();
        let file_read: SharedFileRead = Rc::new(RefCell::new(Box::new(|path: &str| {
            if path == "mod.ape" {
                Some("var exported = 42;".to_string())
            } else {
                None
            }
        }) as FileReadFn));
        let mut compiler = Compiler::new(errors.clone(), heap, global_store, file_read);
        let result = compiler
            .compile_source(r#"import "mod"; mod::exported;"#, None)
            .expect("compilation failed");
        assert!(errors.borrow().is_empty());
        assert!(opcodes(&result).contains(&Opcode::GetModuleGlobal));
    }

    #[test]
    fn test_duplicate_import_fails() {
        let errors = ErrorList::shared();
        let heap = Rc::new(RefCell::new(Heap::new()));
        let global_store = GlobalStore::shared();
        let file_read: SharedFileRead =
            Rc::new(RefCell::new(Box::new(|_path: &str| Some("var x = 1;".to_string())) as FileReadFn));
        let mut compiler = Compiler::new(errors.clone(), heap, global_store, file_read);
        let res = compiler.compile_source(r#"import "mod"; import "mod";"#, None);
        assert!(res.is_none());
        assert_eq!(errors.borrow().last().unwrap().message, "module 'mod' was already imported");
    }

    #[test]
    fn test_cyclic_import_fails() {
        let errors = ErrorList::shared();
        let heap = Rc::new(RefCell::new(Heap::new()));
        let global_store = GlobalStore::shared();
        let file_read: SharedFileRead = Rc::new(RefCell::new(Box::new(|path: &str| {
            match path {
                "a.ape" => Some(r#"import "b";"#.to_string()),
                "b.ape" => Some(r#"import "a";"#.to_string()),
                _ => None,
            }
        }) as FileReadFn));
        let mut compiler = Compiler::new(errors.clone(), heap, global_store, file_read);
        let res = compiler.compile_source(r#"import "a";"#, None);
        assert!(res.is_none());
        assert_eq!(
            errors.borrow().last().unwrap().message,
            "cyclic reference of file 'a.ape'"
        );
    }

    #[test]
    fn test_canonicalize_path() {
        assert_eq!(canonicalize_path("dir/./mod.ape"), "dir/mod.ape");
        assert_eq!(canonicalize_path("dir/sub/../mod.ape"), "dir/mod.ape");
        assert_eq!(canonicalize_path("/a/b/../c.ape"), "/a/c.ape");
    }

    #[test]
    fn test_function_literal_becomes_constant() {
        let (mut compiler, _errors) = make_compiler();
        let result = compiler
            .compile_source("var f = function() { return 1; };", None)
            .expect("compilation failed");
        assert!(opcodes(&result).contains(&Opcode::Function));
        assert_eq!(compiler.constants().len(), 1);
    }

    #[test]
    fn test_empty_block_emits_null_pop() {
        let result = compile("{}");
        assert_eq!(opcodes(&result), vec![Opcode::Null, Opcode::Pop]);
    }
}
