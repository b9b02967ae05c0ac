//! A stack of lexical scopes resolving names to `(scope, index)` pairs,
//! with free-variable capture across function boundaries.
//!
//! Each `SymbolTable` owns its own name-to-symbol map and its own free-symbol
//! list; the chain from innermost to outermost is modeled as independently
//! owned records linked by `outer`, not as mutually pointing objects — the
//! compiler indexes into its parallel stack of these by depth, the same way
//! it keeps a parallel stack of compilation scopes.

use std::collections::HashMap;

/// Which index space a symbol's slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolScope {
    Global,
    Local,
    Free,
    Builtin,
    /// Injected for a named function literal so it can reference itself
    /// for recursion without capturing its own closure.
    FunctionSelf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: u16,
}

/// One lexical scope. The outermost table (no `outer`) is the global scope;
/// `define` allocates a global slot there and a local slot everywhere else.
#[derive(Debug, Default)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    store: HashMap<String, Symbol>,
    num_definitions: u16,
    /// Free variables captured from an enclosing scope, in capture order.
    /// Position `k` here is free-variable index `k` in the resulting
    /// closure; the compiler must push captured values onto the stack in
    /// this order before emitting `OpClosure`.
    pub free_symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new inner scope, taking ownership of `outer`.
    pub fn new_enclosed(outer: SymbolTable) -> Self {
        Self {
            outer: Some(Box::new(outer)),
            ..Self::default()
        }
    }

    /// Discards this scope, returning its enclosing one. Panics if this is
    /// the outermost (global) scope — that is a compiler bug, not a
    /// recoverable condition, since scope push/pop is always balanced by
    /// construction.
    pub fn pop(self) -> SymbolTable {
        *self.outer.expect("cannot pop the global symbol table")
    }

    pub fn is_global(&self) -> bool {
        self.outer.is_none()
    }

    /// Allocates a slot in this scope for `name`, overwriting any previous
    /// binding of the same name at this level. Global iff this is the
    /// outermost scope, local otherwise.
    pub fn define(&mut self, name: &str) -> Symbol {
        let scope = if self.is_global() {
            SymbolScope::Global
        } else {
            SymbolScope::Local
        };
        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index: self.num_definitions,
        };
        self.num_definitions += 1;
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Registers a builtin at an explicit index in the outermost scope,
    /// without consuming a local-definition slot.
    pub fn define_builtin(&mut self, index: u16, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Injects the function-self symbol for a named function literal, so
    /// `resolve` returns a `FunctionSelf` symbol rather than recursing
    /// outward or capturing the function as a free variable.
    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::FunctionSelf,
            index: 0,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Appends `original` to this scope's free list and rebinds `name`
    /// here to a fresh `Free` symbol pointing at that list position.
    fn define_free(&mut self, original: Symbol) -> Symbol {
        self.free_symbols.push(original.clone());
        let symbol = Symbol {
            name: original.name.clone(),
            scope: SymbolScope::Free,
            index: (self.free_symbols.len() - 1) as u16,
        };
        self.store.insert(original.name, symbol.clone());
        symbol
    }

    /// Looks up `name` in this scope, recursing outward through enclosing
    /// scopes. A symbol found in a strictly enclosing non-global,
    /// non-builtin scope is reinterpreted as a free-variable capture at
    /// every intermediate scope between its definition and this use, so
    /// nested closures chain captures correctly.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }
        let outer = self.outer.as_mut()?;
        let symbol = outer.resolve(name)?;
        match symbol.scope {
            SymbolScope::Global | SymbolScope::Builtin => Some(symbol),
            _ => Some(self.define_free(symbol)),
        }
    }

    pub fn num_definitions(&self) -> u16 {
        self.num_definitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_resolve_global() {
        let mut global = SymbolTable::new();
        global.define("a");
        global.define("b");

        let a = global.resolve("a").unwrap();
        assert_eq!(a.scope, SymbolScope::Global);
        assert_eq!(a.index, 0);
        let b = global.resolve("b").unwrap();
        assert_eq!(b.index, 1);
    }

    #[test]
    fn define_resolve_local() {
        let mut global = SymbolTable::new();
        global.define("a");
        let mut local = SymbolTable::new_enclosed(global);
        local.define("b");
        local.define("c");

        assert_eq!(local.resolve("a").unwrap().scope, SymbolScope::Global);
        let b = local.resolve("b").unwrap();
        assert_eq!(b.scope, SymbolScope::Local);
        assert_eq!(b.index, 0);
        assert_eq!(local.resolve("c").unwrap().index, 1);
    }

    #[test]
    fn resolve_free_single_level() {
        let mut global = SymbolTable::new();
        global.define("a");
        let mut first = SymbolTable::new_enclosed(global);
        first.define("b");
        let mut second = SymbolTable::new_enclosed(first);
        second.define("c");

        let b = second.resolve("b").unwrap();
        assert_eq!(b.scope, SymbolScope::Free);
        assert_eq!(b.index, 0);
        assert_eq!(second.free_symbols.len(), 1);
        assert_eq!(second.free_symbols[0].scope, SymbolScope::Local);
    }

    #[test]
    fn resolve_free_chains_through_intermediate_scopes() {
        // name defined at depth 1, used at depth 3: must become free at
        // depth 2 and depth 3, chaining the capture through every
        // intermediate scope.
        let global = SymbolTable::new();
        let mut first = SymbolTable::new_enclosed(global);
        first.define("a");
        let second = SymbolTable::new_enclosed(first);
        let mut third = SymbolTable::new_enclosed(second);

        let resolved = third.resolve("a").unwrap();
        assert_eq!(resolved.scope, SymbolScope::Free);

        // Pop back out to inspect the intermediate free list.
        let second = third.pop();
        assert_eq!(second.free_symbols.len(), 1, "depth-2 scope must also capture");
    }

    #[test]
    fn define_builtin_does_not_consume_local_slot() {
        let mut global = SymbolTable::new();
        global.define_builtin(0, "len");
        assert_eq!(global.num_definitions(), 0);
        assert_eq!(global.resolve("len").unwrap().scope, SymbolScope::Builtin);
    }

    #[test]
    fn function_self_symbol() {
        let mut global = SymbolTable::new();
        let mut func_scope = SymbolTable::new_enclosed(global);
        func_scope.define_function_name("fib");
        assert_eq!(
            func_scope.resolve("fib").unwrap().scope,
            SymbolScope::FunctionSelf
        );
    }
}
