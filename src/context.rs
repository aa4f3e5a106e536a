// File: src/context.rs
//
// Embedding API for Ape.
// A Context owns the heap, compiler, VM, error list and global store for
// one interpreter instance; it executes source or files, registers native
// functions and host globals, installs I/O callbacks and exposes the
// collected errors.

use crate::builtins::register_builtins;
use crate::compiler::{Compiler, FileReadFn, SharedFileRead};
use crate::errors::{ApeError, ErrorKind, Position, ScriptFile, SharedErrors, ErrorList};
use crate::heap::{ExternalCopyFn, ExternalDestroyFn, Heap, NativeFn};
use crate::symbols::{GlobalStore, SharedGlobalStore};
use crate::value::{serialize, stringify, Value};
use crate::vm::Vm;
use std::any::Any;
use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

pub type SharedStdout = Rc<RefCell<Box<dyn Write>>>;
pub type FileWriteFn = Box<dyn Fn(&str, &str) -> bool>;
pub type SharedFileWrite = Rc<RefCell<FileWriteFn>>;

pub struct Context {
    errors: SharedErrors,
    heap: Rc<RefCell<Heap>>,
    global_store: SharedGlobalStore,
    compiler: Compiler,
    vm: Vm,
    stdout: SharedStdout,
    file_read: SharedFileRead,
    file_write: SharedFileWrite,
    dump_bytecode: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a context with stdlib file I/O and process stdout, and the
    /// core native library registered as host globals.
    pub fn new() -> Self {
        let errors = ErrorList::shared();
        let heap = Rc::new(RefCell::new(Heap::new()));
        let global_store = GlobalStore::shared();
        let stdout: SharedStdout =
            Rc::new(RefCell::new(Box::new(std::io::stdout()) as Box<dyn Write>));
        let file_read: SharedFileRead = Rc::new(RefCell::new(Box::new(|path: &str| {
            fs::read_to_string(path).ok()
        }) as FileReadFn));
        let file_write: SharedFileWrite = Rc::new(RefCell::new(Box::new(
            |path: &str, data: &str| fs::write(path, data).is_ok(),
        ) as FileWriteFn));

        register_builtins(
            &heap,
            &global_store,
            stdout.clone(),
            file_read.clone(),
            file_write.clone(),
        );

        let compiler = Compiler::new(
            errors.clone(),
            heap.clone(),
            global_store.clone(),
            file_read.clone(),
        );
        let vm = Vm::new(heap.clone(), errors.clone(), global_store.clone());
        Context {
            errors,
            heap,
            global_store,
            compiler,
            vm,
            stdout,
            file_read,
            file_write,
            dump_bytecode: false,
        }
    }

    /// REPL mode allows redefinition of module globals and parses a
    /// top-level `{...}` as a map expression.
    pub fn set_repl_mode(&mut self, repl_mode: bool) {
        self.compiler.set_repl_mode(repl_mode);
    }

    /// Wall-clock execution deadline in milliseconds; negative disables.
    pub fn set_timeout(&mut self, timeout_ms: f64) -> bool {
        if timeout_ms < 0.0 {
            self.vm.set_max_execution_time(None);
        } else {
            self.vm.set_max_execution_time(Some(Duration::from_millis(timeout_ms as u64)));
        }
        true
    }

    pub fn set_stdout_write(&mut self, writer: Box<dyn Write>) {
        *self.stdout.borrow_mut() = writer;
    }

    pub fn set_file_read(&mut self, read: FileReadFn) {
        *self.file_read.borrow_mut() = read;
    }

    pub fn set_file_write(&mut self, write: FileWriteFn) {
        *self.file_write.borrow_mut() = write;
    }

    pub fn set_dump_bytecode(&mut self, dump_bytecode: bool) {
        self.dump_bytecode = dump_bytecode;
    }

    /// Registers a host callback as a global. The callable receives the VM
    /// and the argument slice; raising through the VM's error list
    /// propagates as a runtime error with a synthesized traceback.
    pub fn set_native_function(
        &mut self,
        name: &str,
        func: impl Fn(&mut Vm, &[Value]) -> Value + 'static,
    ) {
        let native: NativeFn = Rc::new(func);
        let value = self.heap.borrow_mut().alloc_native(name, native);
        self.global_store.borrow_mut().set(name, value);
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.global_store.borrow_mut().set(name, value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.global_store.borrow().get_object_by_name(name)
    }

    // === Value construction for embedders ===

    pub fn make_string(&mut self, value: impl Into<String>) -> Value {
        self.heap.borrow_mut().alloc_string(value)
    }

    pub fn make_array(&mut self, items: Vec<Value>) -> Value {
        self.heap.borrow_mut().alloc_array(items)
    }

    pub fn make_map(&mut self) -> Value {
        self.heap.borrow_mut().alloc_map()
    }

    pub fn make_external(
        &mut self,
        data: Box<dyn Any>,
        copy_fn: Option<ExternalCopyFn>,
        destroy_fn: Option<ExternalDestroyFn>,
    ) -> Value {
        self.heap.borrow_mut().alloc_external(data, copy_fn, destroy_fn)
    }

    /// Rendering used by `tostring`: bare strings at the top level.
    pub fn stringify(&self, value: Value) -> String {
        let heap = self.heap.borrow();
        stringify(&heap, value)
    }

    /// Rendering used by the REPL: strings are quoted.
    pub fn serialize(&self, value: Value) -> String {
        let heap = self.heap.borrow();
        serialize(&heap, value)
    }

    // === Execution ===

    /// Runs one source text through the full pipeline and returns the last
    /// popped value, or null when any error was raised.
    pub fn execute_source(&mut self, code: &str) -> Value {
        self.execute_internal(code, None)
    }

    pub fn execute_file(&mut self, path: &str) -> Value {
        let code = (*self.file_read.borrow())(path);
        let Some(code) = code else {
            self.errors.borrow_mut().add(
                ErrorKind::User,
                Position::invalid(),
                format!("reading file '{}' failed", path),
            );
            return Value::Null;
        };
        let file = ScriptFile::new(path);
        self.execute_internal(&code, Some(file))
    }

    fn execute_internal(&mut self, code: &str, file: Option<crate::errors::FileRef>) -> Value {
        if self.vm.is_running() {
            self.errors.borrow_mut().add(
                ErrorKind::User,
                Position::invalid(),
                "context is already executing code",
            );
            return Value::Null;
        }
        self.errors.borrow_mut().clear();
        self.vm.reset();
        let Some(comp_result) = self.compiler.compile_source(code, file) else {
            return Value::Null;
        };
        if self.dump_bytecode {
            eprint!("{}", comp_result.to_pretty_string());
        }
        let ok = self.vm.run(self.compiler.constants(), comp_result);
        if !ok || !self.errors.borrow().is_empty() {
            return Value::Null;
        }
        self.vm.last_popped()
    }

    /// Drops the compiled-module cache; the next import of any path loads
    /// and compiles it again.
    pub fn clear_module_cache(&mut self) {
        self.compiler.clear_module_cache();
    }

    // === Errors ===

    pub fn has_errors(&self) -> bool {
        !self.errors.borrow().is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.borrow().count()
    }

    pub fn get_error(&self, ix: usize) -> Option<ApeError> {
        self.errors.borrow().get(ix).cloned()
    }

    pub fn clear_errors(&mut self) {
        self.errors.borrow_mut().clear();
    }
}
