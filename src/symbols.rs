// File: src/symbols.rs
//
// Lexically scoped symbol table for the Ape compiler, and the global store
// holding embedder-injected host globals.
// Resolution distinguishes module globals, host globals, frame locals, free
// variables (closure captures), the current function and `this`; free
// variables are captured by copying the original symbol into the enclosing
// function's free list.

use crate::value::Value;
use ahash::AHashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    ModuleGlobal,
    /// Host global injected through the embedding API; resolved by name
    /// before any script lookup.
    ApeGlobal,
    Local,
    Free,
    /// The function currently being compiled, for direct recursion.
    FunctionSelf,
    This,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub index: usize,
    pub assignable: bool,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, index: usize, assignable: bool) -> Self {
        Symbol { name: name.into(), kind, index, assignable }
    }
}

/// Store of host globals. Each named value gets a stable slot index used by
/// the `GET_APE_GLOBAL` opcode; the objects are GC roots.
#[derive(Debug, Default)]
pub struct GlobalStore {
    symbols: AHashMap<String, Symbol>,
    objects: Vec<Value>,
}

pub type SharedGlobalStore = Rc<RefCell<GlobalStore>>;

impl GlobalStore {
    pub fn new() -> Self {
        GlobalStore { symbols: AHashMap::new(), objects: Vec::new() }
    }

    pub fn shared() -> SharedGlobalStore {
        Rc::new(RefCell::new(GlobalStore::new()))
    }

    /// Installs or replaces a host global, returning its slot index.
    pub fn set(&mut self, name: &str, value: Value) -> usize {
        if let Some(existing) = self.symbols.get(name) {
            let ix = existing.index;
            self.objects[ix] = value;
            return ix;
        }
        let ix = self.objects.len();
        self.objects.push(value);
        self.symbols
            .insert(name.to_string(), Symbol::new(name, SymbolKind::ApeGlobal, ix, false));
        ix
    }

    pub fn get_symbol(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).cloned()
    }

    pub fn get_object_at(&self, ix: usize) -> Option<Value> {
        self.objects.get(ix).copied()
    }

    pub fn get_object_by_name(&self, name: &str) -> Option<Value> {
        let symbol = self.symbols.get(name)?;
        self.objects.get(symbol.index).copied()
    }

    pub fn objects(&self) -> &[Value] {
        &self.objects
    }
}

#[derive(Debug, Default)]
struct BlockScope {
    store: AHashMap<String, Symbol>,
    offset: usize,
    num_definitions: usize,
}

impl BlockScope {
    fn new(offset: usize) -> Self {
        BlockScope { store: AHashMap::new(), offset, num_definitions: 0 }
    }
}

/// One lexical function (or file) scope: a stack of block scopes, chained to
/// the enclosing function scope for closure capture.
#[derive(Debug)]
pub struct SymbolTable {
    pub outer: Option<Box<SymbolTable>>,
    global_store: SharedGlobalStore,
    block_scopes: Vec<BlockScope>,
    free_symbols: Vec<Symbol>,
    module_global_symbols: Vec<Symbol>,
    /// Largest number of live locals, used to size the frame's locals region.
    pub max_num_definitions: usize,
    /// Compiler-wide monotonic counter handing out module-global slots.
    module_global_counter: Rc<Cell<usize>>,
}

impl SymbolTable {
    pub fn new(
        outer: Option<Box<SymbolTable>>,
        global_store: SharedGlobalStore,
        module_global_counter: Rc<Cell<usize>>,
    ) -> Self {
        let mut table = SymbolTable {
            outer,
            global_store,
            block_scopes: Vec::new(),
            free_symbols: Vec::new(),
            module_global_symbols: Vec::new(),
            max_num_definitions: 0,
            module_global_counter,
        };
        table.push_block_scope();
        table
    }

    pub fn push_block_scope(&mut self) {
        let offset = match self.block_scopes.last() {
            Some(prev) => prev.offset + prev.num_definitions,
            None => 0,
        };
        self.block_scopes.push(BlockScope::new(offset));
    }

    pub fn pop_block_scope(&mut self) {
        self.block_scopes.pop();
    }

    /// Discards transient block scopes left behind by an aborted compile.
    pub fn pop_to_top_block_scope(&mut self) {
        self.block_scopes.truncate(1);
    }

    pub fn is_module_global_scope(&self) -> bool {
        self.outer.is_none()
    }

    pub fn is_top_block_scope(&self) -> bool {
        self.block_scopes.len() == 1
    }

    pub fn is_top_global_scope(&self) -> bool {
        self.is_module_global_scope() && self.is_top_block_scope()
    }

    /// True when `name` is defined in the current block scope or as a host
    /// global.
    pub fn symbol_is_defined(&self, name: &str) -> bool {
        if self.global_store.borrow().get_symbol(name).is_some() {
            return true;
        }
        match self.block_scopes.last() {
            Some(scope) => scope.store.contains_key(name),
            None => false,
        }
    }

    /// Defines a new symbol in the current block scope. Returns None for
    /// reserved names: `this`, module-qualified names and host globals.
    pub fn define(&mut self, name: &str, assignable: bool) -> Option<Symbol> {
        if self.global_store.borrow().get_symbol(name).is_some() {
            return None;
        }
        if name.contains(':') {
            return None;
        }
        if name == "this" {
            return None;
        }
        let kind = if self.outer.is_none() { SymbolKind::ModuleGlobal } else { SymbolKind::Local };
        let index = match kind {
            SymbolKind::ModuleGlobal => {
                let ix = self.module_global_counter.get();
                self.module_global_counter.set(ix + 1);
                ix
            }
            _ => self.next_local_index(),
        };
        let symbol = Symbol::new(name, kind, index, assignable);
        if kind == SymbolKind::ModuleGlobal && self.is_top_block_scope() {
            // exported to importers as `module::name`
            self.module_global_symbols.push(symbol.clone());
        }
        let scope = self.block_scopes.last_mut().expect("symbol table has no block scope");
        scope.store.insert(name.to_string(), symbol.clone());
        if kind == SymbolKind::Local {
            scope.num_definitions += 1;
            let definitions_count = index + 1;
            if definitions_count > self.max_num_definitions {
                self.max_num_definitions = definitions_count;
            }
        }
        Some(symbol)
    }

    /// Captures a symbol from an enclosing scope: the original is copied into
    /// this function's free list and a `Free` symbol indexed by its position
    /// replaces it locally.
    pub fn define_free(&mut self, original: Symbol) -> Symbol {
        let assignable = original.assignable;
        let name = original.name.clone();
        self.free_symbols.push(original);
        let symbol =
            Symbol::new(name.clone(), SymbolKind::Free, self.free_symbols.len() - 1, assignable);
        let scope = self.block_scopes.last_mut().expect("symbol table has no block scope");
        scope.store.insert(name, symbol.clone());
        symbol
    }

    pub fn define_function_name(&mut self, name: &str, assignable: bool) -> Option<Symbol> {
        if name.contains(':') {
            return None;
        }
        let symbol = Symbol::new(name, SymbolKind::FunctionSelf, 0, assignable);
        let scope = self.block_scopes.last_mut()?;
        scope.store.insert(name.to_string(), symbol.clone());
        Some(symbol)
    }

    pub fn define_this(&mut self) -> Symbol {
        let symbol = Symbol::new("this", SymbolKind::This, 0, false);
        let scope = self.block_scopes.last_mut().expect("symbol table has no block scope");
        scope.store.insert("this".to_string(), symbol.clone());
        symbol
    }

    /// Installs an imported module's exported symbol under its qualified
    /// name (`module::name`). No-op when the name is already taken.
    pub fn add_module_symbol(&mut self, symbol: &Symbol) -> bool {
        if symbol.kind != SymbolKind::ModuleGlobal {
            return false;
        }
        if self.symbol_is_defined(&symbol.name) {
            return true;
        }
        let scope = self.block_scopes.last_mut().expect("symbol table has no block scope");
        scope.store.insert(symbol.name.clone(), symbol.clone());
        true
    }

    /// Resolves a name to a symbol:
    ///  1. host globals win over any script binding,
    ///  2. block scopes are searched innermost first,
    ///  3. `this` found in an enclosing scope is promoted to a capture,
    ///  4. names found in the enclosing function scope pass through when
    ///     module/host-global, and are captured as free otherwise.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.global_store.borrow().get_symbol(name) {
            return Some(symbol);
        }
        let mut found = None;
        for scope in self.block_scopes.iter().rev() {
            if let Some(symbol) = scope.store.get(name) {
                found = Some(symbol.clone());
                break;
            }
        }
        if let Some(symbol) = found {
            if symbol.kind == SymbolKind::This {
                return Some(self.define_free(symbol));
            }
            return Some(symbol);
        }
        if let Some(outer) = self.outer.as_mut() {
            let symbol = outer.resolve(name)?;
            if matches!(symbol.kind, SymbolKind::ModuleGlobal | SymbolKind::ApeGlobal) {
                return Some(symbol);
            }
            return Some(self.define_free(symbol));
        }
        None
    }

    pub fn module_global_symbols(&self) -> &[Symbol] {
        &self.module_global_symbols
    }

    pub fn free_symbols(&self) -> &[Symbol] {
        &self.free_symbols
    }

    /// Detaches the collected free symbols; called when the enclosing
    /// function literal is emitted.
    pub fn take_free_symbols(&mut self) -> Vec<Symbol> {
        std::mem::take(&mut self.free_symbols)
    }

    fn next_local_index(&self) -> usize {
        let scope = self.block_scopes.last().expect("symbol table has no block scope");
        scope.offset + scope.num_definitions
    }
}
