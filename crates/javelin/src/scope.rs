//! Scope resolution for Python source prior to code generation.
//!
//! Walks the ruff AST once, building a tree of scope records that classify
//! every name as local, global, cell or free, assign frame slots, and detect
//! the semantic errors that Python reports at compile time (late `global`
//! declarations, `nonlocal` without a binding, valued `return` inside a
//! generator, and so on).
//!
//! Resolution runs in two phases. The traversal phase pushes a record per
//! scope, collects symbol flags bottom-up, and "cooks" each scope as it is
//! popped: free-variable requests from children either promote a binding
//! here to a cell or propagate further out. The closure phase then walks the
//! finished tree top-down and assigns each free variable the index it will
//! read from its provider's frame storage.

use indexmap::IndexMap;
use ruff_python_ast::{
    self as ast, Expr, ExprContext, ModModule, Stmt,
};
use ruff_text_size::Ranged;

use crate::error::CompileError;
use crate::parse::{CodeRange, SourceMap};

/// What kind of program unit a scope belongs to.
///
/// Function-like scopes (`Function`, `Lambda`, `Comprehension`) get their own
/// frame slot table and can own cells; module and class bodies resolve plain
/// names through their frame's name mapping instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Class,
    Lambda,
    Comprehension,
}

impl ScopeKind {
    pub fn is_function_like(self) -> bool {
        matches!(self, Self::Function | Self::Lambda | Self::Comprehension)
    }
}

/// Per-name classification within one scope.
#[derive(Debug, Clone, Default)]
pub struct SymbolInfo {
    /// Assigned, deleted, imported or otherwise bound in this scope.
    pub bound: bool,
    /// Appears in the scope's parameter list.
    pub parameter: bool,
    /// Named in a `global` statement.
    pub global_decl: bool,
    /// Named in a `nonlocal` statement.
    pub nonlocal_decl: bool,
    /// Bound here and captured by a nested scope.
    pub cell: bool,
    /// Captured from an enclosing function scope.
    pub free: bool,
    /// Read in this scope.
    pub used: bool,
    /// Cell whose initial value arrives as a parameter.
    pub from_parameter: bool,
    /// Frame storage index. Cells index the cell section, frees index past
    /// the cells, plain locals hold their JVM slot. `None` until the scope
    /// is cooked, and always `None` in module and class scopes.
    pub slot: Option<u16>,
}

impl SymbolInfo {
    /// True when the name resolves to this scope's own frame storage.
    pub fn is_local(&self) -> bool {
        (self.bound || self.parameter) && !self.global_decl
    }
}

/// One scope's worth of resolution results.
#[derive(Debug)]
pub struct ScopeRecord {
    pub kind: ScopeKind,
    /// Function, class or synthetic name (`<lambda>`, `<listcomp>`, ...).
    pub name: String,
    pub position: CodeRange,
    /// Index of the enclosing scope in the tree, `None` for the module.
    pub parent: Option<usize>,
    /// Child scopes in source order. Code generation replays this order.
    pub children: Vec<usize>,
    /// Symbols in first-appearance order. Parameters are inserted before
    /// any body name, so their map order matches the signature.
    pub symbols: IndexMap<String, SymbolInfo>,
    /// Parameter names in signature order: positional-only, positional,
    /// `*args`, keyword-only, `**kwargs`.
    pub params: Vec<String>,
    /// Number of parameters before `*args` (the code object's argcount).
    pub argcount: u16,
    pub has_vararg: bool,
    pub has_kwarg: bool,
    /// Names bound here and captured by nested scopes, in promotion order.
    pub cell_vars: Vec<String>,
    /// Names captured from enclosing scopes, in first-request order.
    /// Finalized during the closure phase; entries that fall back to
    /// global lookup are removed.
    pub free_vars: Vec<String>,
    /// For each entry of `free_vars`, the index into the provider frame's
    /// storage that the creator reads when materializing this closure.
    pub closure_indices: Vec<u16>,
    /// `Frame.outer()` hops from the creator's frame to the provider frame,
    /// one per class scope between this scope and its function ancestor.
    pub closure_distance: u16,
    pub is_generator: bool,
    /// Number of `yield` points, which is also the resume-table size.
    pub yield_count: u32,
    /// Deepest static nesting of `with` blocks, sizing the exit-slot array.
    pub max_with_depth: u16,
    pub uses_star_import: bool,
    pub uses_dynamic_exec: bool,
    /// Number of JVM local slots reserved for the frame reference,
    /// parameters and named locals.
    pub n_named_slots: u16,
    /// First `return <value>` seen, for the generator diagnostic.
    valued_return_pos: Option<CodeRange>,
    /// Names children request from us or beyond, pending cook.
    free_requests: Vec<String>,
}

impl ScopeRecord {
    fn new(kind: ScopeKind, name: String, position: CodeRange, parent: Option<usize>) -> Self {
        Self {
            kind,
            name,
            position,
            parent,
            children: Vec::new(),
            symbols: IndexMap::new(),
            params: Vec::new(),
            argcount: 0,
            has_vararg: false,
            has_kwarg: false,
            cell_vars: Vec::new(),
            free_vars: Vec::new(),
            closure_indices: Vec::new(),
            closure_distance: 0,
            is_generator: false,
            yield_count: 0,
            max_with_depth: 0,
            uses_star_import: false,
            uses_dynamic_exec: false,
            n_named_slots: 1,
            valued_return_pos: None,
            free_requests: Vec::new(),
        }
    }

    pub fn symbol(&self, name: &str) -> Option<&SymbolInfo> {
        self.symbols.get(name)
    }

    pub fn ncells(&self) -> u16 {
        self.cell_vars.len() as u16
    }

    pub fn nfrees(&self) -> u16 {
        self.free_vars.len() as u16
    }
}

/// The resolved scope tree for one module. Index 0 is the module scope;
/// children always carry larger indices than their parents.
#[derive(Debug)]
pub struct ScopeTree {
    scopes: Vec<ScopeRecord>,
}

impl ScopeTree {
    /// Resolves every scope in `module`, or reports the first semantic error.
    pub fn resolve(module: &ModModule, map: &SourceMap) -> Result<Self, CompileError> {
        let mut resolver = Resolver {
            scopes: Vec::new(),
            stack: Vec::new(),
            with_depths: Vec::new(),
            map,
        };
        let module_range = map.range(module.range());
        resolver.push_scope(ScopeKind::Module, "<module>".to_string(), module_range);
        resolver.visit_body(&module.body)?;
        resolver.pop_scope()?;
        let mut tree = Self {
            scopes: resolver.scopes,
        };
        tree.setup_closures(map)?;
        Ok(tree)
    }

    pub fn module(&self) -> &ScopeRecord {
        &self.scopes[0]
    }

    pub fn get(&self, idx: usize) -> &ScopeRecord {
        &self.scopes[idx]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Finalizes free variables top-down: each one either resolves to a
    /// cell (or pass-through free) in the nearest enclosing function scope,
    /// or falls back to global lookup. `nonlocal` names must resolve.
    fn setup_closures(&mut self, _map: &SourceMap) -> Result<(), CompileError> {
        for idx in 0..self.scopes.len() {
            if self.scopes[idx].free_vars.is_empty() {
                continue;
            }
            // Nearest function-like ancestor, skipping class bodies. The
            // walk also counts the frame hops the creator needs.
            let mut provider = self.scopes[idx].parent;
            while let Some(p) = provider {
                if self.scopes[p].kind.is_function_like() {
                    break;
                }
                if self.scopes[p].kind == ScopeKind::Module {
                    provider = None;
                    break;
                }
                provider = self.scopes[p].parent;
            }

            let candidates = std::mem::take(&mut self.scopes[idx].free_vars);
            let mut kept = Vec::new();
            let mut indices = Vec::new();
            for name in candidates {
                let resolved = provider.and_then(|p| {
                    let owner = &self.scopes[p];
                    let sym = owner.symbol(&name)?;
                    if sym.cell || sym.free { sym.slot } else { None }
                });
                match resolved {
                    Some(storage_idx) => {
                        let free_idx = kept.len() as u16;
                        let scope = &mut self.scopes[idx];
                        let ncells = scope.cell_vars.len() as u16;
                        let sym = scope
                            .symbols
                            .get_mut(&name)
                            .ok_or_else(|| CompileError::internal("free variable without symbol entry"))?;
                        sym.slot = Some(ncells + free_idx);
                        kept.push(name);
                        indices.push(storage_idx);
                    }
                    None => {
                        let scope = &mut self.scopes[idx];
                        let position = scope.position;
                        let sym = scope
                            .symbols
                            .get_mut(&name)
                            .ok_or_else(|| CompileError::internal("free variable without symbol entry"))?;
                        if sym.nonlocal_decl {
                            return Err(CompileError::semantic(
                                format!("no binding for nonlocal '{name}' found"),
                                position,
                            ));
                        }
                        // No enclosing binding after all: plain global.
                        sym.free = false;
                        sym.slot = None;
                    }
                }
            }
            let scope = &mut self.scopes[idx];
            scope.free_vars = kept;
            scope.closure_indices = indices;
        }
        Ok(())
    }
}

/// Traversal state. `stack` holds indices into `scopes` for the scopes
/// currently being visited; the last entry is the current scope.
struct Resolver<'a> {
    scopes: Vec<ScopeRecord>,
    stack: Vec<usize>,
    /// Live `with` nesting depth per open scope, parallel to `stack`.
    with_depths: Vec<u16>,
    map: &'a SourceMap,
}

impl Resolver<'_> {
    fn push_scope(&mut self, kind: ScopeKind, name: String, position: CodeRange) {
        let parent = self.stack.last().copied();
        let mut record = ScopeRecord::new(kind, name, position, parent);
        if let Some(p) = parent {
            // Creator frame hops: every class body between the new scope
            // and its function ancestor adds one outer() step.
            let mut walk = p;
            loop {
                match self.scopes[walk].kind {
                    ScopeKind::Class => {
                        record.closure_distance += 1;
                        match self.scopes[walk].parent {
                            Some(next) => walk = next,
                            None => break,
                        }
                    }
                    _ => break,
                }
            }
        }
        let idx = self.scopes.len();
        self.scopes.push(record);
        if let Some(p) = parent {
            self.scopes[p].children.push(idx);
        }
        self.stack.push(idx);
        self.with_depths.push(0);
    }

    fn cur(&mut self) -> &mut ScopeRecord {
        let idx = *self.stack.last().unwrap_or(&0);
        &mut self.scopes[idx]
    }

    fn range(&self, node: &impl Ranged) -> CodeRange {
        self.map.range(node.range())
    }

    /// Looks up or creates the symbol entry for `name` in the current scope.
    fn symbol_mut(&mut self, name: &str) -> &mut SymbolInfo {
        self.cur().symbols.entry(name.to_string()).or_default()
    }

    fn bind(&mut self, name: &str, position: CodeRange) -> Result<(), CompileError> {
        if name == "__debug__" {
            return Err(CompileError::semantic("cannot assign to __debug__", position));
        }
        let kind = self.cur().kind;
        let sym = self.symbol_mut(name);
        if sym.nonlocal_decl || (sym.global_decl && kind != ScopeKind::Module) {
            // Declared names bind elsewhere; the write still marks use.
            sym.used = true;
            return Ok(());
        }
        sym.bound = true;
        Ok(())
    }

    fn use_name(&mut self, name: &str) {
        self.symbol_mut(name).used = true;
    }

    /// Walrus targets bind in the nearest enclosing non-comprehension scope.
    fn bind_hoisted(&mut self, name: &str, position: CodeRange) -> Result<(), CompileError> {
        if name == "__debug__" {
            return Err(CompileError::semantic("cannot assign to __debug__", position));
        }
        let mut depth = self.stack.len() - 1;
        while self.scopes[self.stack[depth]].kind == ScopeKind::Comprehension && depth > 0 {
            depth -= 1;
        }
        let idx = self.stack[depth];
        let sym = self.scopes[idx].symbols.entry(name.to_string()).or_default();
        if !sym.nonlocal_decl && !sym.global_decl {
            sym.bound = true;
        }
        // Comprehension scopes between the walrus and its binding scope see
        // the name as free.
        for d in (depth + 1)..self.stack.len() {
            let inner = self.stack[d];
            self.scopes[inner].symbols.entry(name.to_string()).or_default().used = true;
        }
        Ok(())
    }

    fn visit_body(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        for stmt in body {
            self.visit_stmt(stmt)?;
        }
        Ok(())
    }

    fn visit_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::FunctionDef(def) => self.visit_function_def(def),
            Stmt::ClassDef(def) => self.visit_class_def(def),
            Stmt::Return(ret) => {
                if let Some(value) = &ret.value {
                    self.visit_expr(value)?;
                    if self.cur().valued_return_pos.is_none() {
                        let position = self.range(ret);
                        self.cur().valued_return_pos = Some(position);
                    }
                }
                Ok(())
            }
            Stmt::Delete(del) => {
                for target in &del.targets {
                    if let Expr::Name(name) = target
                        && name.id.as_str() == "__debug__"
                    {
                        return Err(CompileError::semantic("cannot delete __debug__", self.range(name)));
                    }
                    self.visit_expr(target)?;
                }
                Ok(())
            }
            Stmt::Assign(assign) => {
                self.visit_expr(&assign.value)?;
                for target in &assign.targets {
                    self.visit_expr(target)?;
                }
                Ok(())
            }
            Stmt::AugAssign(aug) => {
                self.visit_expr(&aug.value)?;
                // Augmented targets are both read and written.
                if let Expr::Name(name) = aug.target.as_ref() {
                    self.use_name(name.id.as_str());
                }
                self.visit_expr(&aug.target)
            }
            Stmt::AnnAssign(ann) => {
                self.visit_expr(&ann.annotation)?;
                if let Some(value) = &ann.value {
                    self.visit_expr(value)?;
                    self.visit_expr(&ann.target)?;
                } else if let Expr::Name(name) = ann.target.as_ref() {
                    // A bare annotation still makes the name local.
                    let position = self.range(name);
                    self.bind(name.id.as_str(), position)?;
                }
                Ok(())
            }
            Stmt::For(for_stmt) => {
                if for_stmt.is_async {
                    return Err(CompileError::not_implemented("async for loops", self.range(for_stmt)));
                }
                self.visit_expr(&for_stmt.iter)?;
                self.visit_expr(&for_stmt.target)?;
                self.visit_body(&for_stmt.body)?;
                self.visit_body(&for_stmt.orelse)
            }
            Stmt::While(while_stmt) => {
                self.visit_expr(&while_stmt.test)?;
                self.visit_body(&while_stmt.body)?;
                self.visit_body(&while_stmt.orelse)
            }
            Stmt::If(if_stmt) => {
                self.visit_expr(&if_stmt.test)?;
                self.visit_body(&if_stmt.body)?;
                for clause in &if_stmt.elif_else_clauses {
                    if let Some(test) = &clause.test {
                        self.visit_expr(test)?;
                    }
                    self.visit_body(&clause.body)?;
                }
                Ok(())
            }
            Stmt::With(with_stmt) => {
                if with_stmt.is_async {
                    return Err(CompileError::not_implemented("async with blocks", self.range(with_stmt)));
                }
                for item in &with_stmt.items {
                    self.visit_expr(&item.context_expr)?;
                    if let Some(vars) = &item.optional_vars {
                        self.visit_expr(vars)?;
                    }
                }
                // Exit-slot indices count every with open at runtime, so
                // nesting through loops and try bodies deepens them too.
                let saved = self.with_depths.last().copied().unwrap_or(0);
                let depth = saved + with_stmt.items.len() as u16;
                let scope = self.cur();
                scope.max_with_depth = scope.max_with_depth.max(depth);
                if let Some(top) = self.with_depths.last_mut() {
                    *top = depth;
                }
                let result = self.visit_body(&with_stmt.body);
                if let Some(top) = self.with_depths.last_mut() {
                    *top = saved;
                }
                result
            }
            Stmt::Raise(raise) => {
                if let Some(exc) = &raise.exc {
                    self.visit_expr(exc)?;
                }
                if let Some(cause) = &raise.cause {
                    self.visit_expr(cause)?;
                }
                Ok(())
            }
            Stmt::Try(try_stmt) => {
                self.visit_body(&try_stmt.body)?;
                for handler in &try_stmt.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(type_) = &h.type_ {
                        self.visit_expr(type_)?;
                    }
                    if let Some(name) = &h.name {
                        let position = self.map.range(name.range());
                        self.bind(name.as_str(), position)?;
                    }
                    self.visit_body(&h.body)?;
                }
                self.visit_body(&try_stmt.orelse)?;
                self.visit_body(&try_stmt.finalbody)
            }
            Stmt::Assert(assert) => {
                self.visit_expr(&assert.test)?;
                if let Some(msg) = &assert.msg {
                    self.visit_expr(msg)?;
                }
                Ok(())
            }
            Stmt::Import(import) => {
                for alias in &import.names {
                    let position = self.map.range(alias.range());
                    let bound = match &alias.asname {
                        Some(asname) => asname.as_str(),
                        // `import a.b` binds the top-level package name.
                        None => alias.name.split('.').next().unwrap_or(alias.name.as_str()),
                    };
                    self.bind(bound, position)?;
                }
                Ok(())
            }
            Stmt::ImportFrom(import) => {
                for alias in &import.names {
                    if alias.name.as_str() == "*" {
                        self.cur().uses_star_import = true;
                        continue;
                    }
                    let position = self.map.range(alias.range());
                    let bound = alias.asname.as_ref().map_or(alias.name.as_str(), ast::Identifier::as_str);
                    self.bind(bound, position)?;
                }
                Ok(())
            }
            Stmt::Global(global) => {
                for name in &global.names {
                    let position = self.map.range(name.range());
                    self.declare_global(name.as_str(), position)?;
                }
                Ok(())
            }
            Stmt::Nonlocal(nonlocal) => {
                for name in &nonlocal.names {
                    let position = self.map.range(name.range());
                    self.declare_nonlocal(name.as_str(), position)?;
                }
                Ok(())
            }
            Stmt::Expr(expr) => self.visit_expr(&expr.value),
            Stmt::Pass(_) | Stmt::Break(_) | Stmt::Continue(_) => Ok(()),
            Stmt::TypeAlias(alias) => {
                Err(CompileError::not_implemented("type alias statements", self.range(alias)))
            }
            Stmt::Match(m) => Err(CompileError::not_implemented("match statements", self.range(m))),
            Stmt::IpyEscapeCommand(cmd) => {
                Err(CompileError::syntax("IPython escape commands are not valid Python", self.range(cmd)))
            }
        }
    }

    fn visit_function_def(&mut self, def: &ast::StmtFunctionDef) -> Result<(), CompileError> {
        if def.is_async {
            return Err(CompileError::not_implemented("async functions", self.range(def)));
        }
        for decorator in &def.decorator_list {
            self.visit_expr(&decorator.expression)?;
        }
        // Defaults and annotations evaluate in the defining scope.
        self.visit_parameter_values(&def.parameters)?;
        if let Some(returns) = &def.returns {
            self.visit_expr(returns)?;
        }
        let position = self.range(def);
        self.bind(def.name.as_str(), position)?;

        self.push_scope(ScopeKind::Function, def.name.to_string(), position);
        self.declare_parameters(&def.parameters)?;
        self.visit_body(&def.body)?;
        self.pop_scope()
    }

    fn visit_class_def(&mut self, def: &ast::StmtClassDef) -> Result<(), CompileError> {
        for decorator in &def.decorator_list {
            self.visit_expr(&decorator.expression)?;
        }
        if let Some(arguments) = &def.arguments {
            for base in &*arguments.args {
                self.visit_expr(base)?;
            }
            for keyword in &*arguments.keywords {
                self.visit_expr(&keyword.value)?;
            }
        }
        let position = self.range(def);
        self.bind(def.name.as_str(), position)?;

        self.push_scope(ScopeKind::Class, def.name.to_string(), position);
        self.visit_body(&def.body)?;
        self.pop_scope()
    }

    fn visit_parameter_values(&mut self, params: &ast::Parameters) -> Result<(), CompileError> {
        for p in params.posonlyargs.iter().chain(&params.args).chain(&params.kwonlyargs) {
            if let Some(annotation) = &p.parameter.annotation {
                self.visit_expr(annotation)?;
            }
            if let Some(default) = &p.default {
                self.visit_expr(default)?;
            }
        }
        for p in [&params.vararg, &params.kwarg].into_iter().flatten() {
            if let Some(annotation) = &p.annotation {
                self.visit_expr(annotation)?;
            }
        }
        Ok(())
    }

    fn declare_parameters(&mut self, params: &ast::Parameters) -> Result<(), CompileError> {
        for p in params.posonlyargs.iter().chain(&params.args) {
            self.declare_parameter(p.parameter.name.as_str(), self.map.range(p.range()))?;
        }
        let argcount = self.cur().params.len() as u16;
        self.cur().argcount = argcount;
        if let Some(vararg) = &params.vararg {
            self.declare_parameter(vararg.name.as_str(), self.map.range(vararg.range()))?;
            self.cur().has_vararg = true;
        }
        for p in &params.kwonlyargs {
            self.declare_parameter(p.parameter.name.as_str(), self.map.range(p.range()))?;
        }
        if let Some(kwarg) = &params.kwarg {
            self.declare_parameter(kwarg.name.as_str(), self.map.range(kwarg.range()))?;
            self.cur().has_kwarg = true;
        }
        Ok(())
    }

    fn declare_parameter(&mut self, name: &str, position: CodeRange) -> Result<(), CompileError> {
        if self.cur().params.iter().any(|p| p == name) {
            return Err(CompileError::syntax(
                format!("duplicate argument '{name}' in function definition"),
                position,
            ));
        }
        self.cur().params.push(name.to_string());
        let sym = self.symbol_mut(name);
        sym.parameter = true;
        Ok(())
    }

    fn declare_global(&mut self, name: &str, position: CodeRange) -> Result<(), CompileError> {
        if self.cur().kind == ScopeKind::Module {
            // Redundant but legal at module level.
            self.symbol_mut(name).global_decl = true;
            return Ok(());
        }
        if let Some(sym) = self.cur().symbols.get(name) {
            if sym.parameter {
                return Err(CompileError::semantic(
                    format!("name '{name}' is parameter and global"),
                    position,
                ));
            }
            if sym.bound {
                return Err(CompileError::semantic(
                    format!("name '{name}' is assigned to before global declaration"),
                    position,
                ));
            }
            if sym.used {
                return Err(CompileError::semantic(
                    format!("name '{name}' is used prior to global declaration"),
                    position,
                ));
            }
            if sym.nonlocal_decl {
                return Err(CompileError::semantic(
                    format!("name '{name}' is nonlocal and global"),
                    position,
                ));
            }
        }
        self.symbol_mut(name).global_decl = true;
        Ok(())
    }

    fn declare_nonlocal(&mut self, name: &str, position: CodeRange) -> Result<(), CompileError> {
        if self.cur().kind == ScopeKind::Module {
            return Err(CompileError::syntax(
                "nonlocal declaration not allowed at module level",
                position,
            ));
        }
        if let Some(sym) = self.cur().symbols.get(name) {
            if sym.parameter {
                return Err(CompileError::semantic(
                    format!("name '{name}' is parameter and nonlocal"),
                    position,
                ));
            }
            if sym.bound {
                return Err(CompileError::semantic(
                    format!("name '{name}' is assigned to before nonlocal declaration"),
                    position,
                ));
            }
            if sym.used {
                return Err(CompileError::semantic(
                    format!("name '{name}' is used prior to nonlocal declaration"),
                    position,
                ));
            }
            if sym.global_decl {
                return Err(CompileError::semantic(
                    format!("name '{name}' is nonlocal and global"),
                    position,
                ));
            }
        }
        let sym = self.symbol_mut(name);
        sym.nonlocal_decl = true;
        sym.used = true;
        Ok(())
    }

    fn visit_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Name(name) => {
                match name.ctx {
                    ExprContext::Load | ExprContext::Invalid => self.use_name(name.id.as_str()),
                    ExprContext::Store | ExprContext::Del => {
                        let position = self.range(name);
                        self.bind(name.id.as_str(), position)?;
                    }
                }
                Ok(())
            }
            Expr::BoolOp(op) => {
                for value in &op.values {
                    self.visit_expr(value)?;
                }
                Ok(())
            }
            Expr::Named(named) => {
                self.visit_expr(&named.value)?;
                match named.target.as_ref() {
                    Expr::Name(name) => {
                        let position = self.range(name);
                        self.bind_hoisted(name.id.as_str(), position)
                    }
                    other => Err(CompileError::syntax(
                        "assignment expression target must be a name",
                        self.range(other),
                    )),
                }
            }
            Expr::BinOp(op) => {
                self.visit_expr(&op.left)?;
                self.visit_expr(&op.right)
            }
            Expr::UnaryOp(op) => self.visit_expr(&op.operand),
            Expr::Lambda(lambda) => {
                if let Some(params) = &lambda.parameters {
                    self.visit_parameter_values(params)?;
                }
                let position = self.range(lambda);
                self.push_scope(ScopeKind::Lambda, "<lambda>".to_string(), position);
                if let Some(params) = &lambda.parameters {
                    self.declare_parameters(params)?;
                }
                self.visit_expr(&lambda.body)?;
                self.pop_scope()
            }
            Expr::If(if_expr) => {
                self.visit_expr(&if_expr.test)?;
                self.visit_expr(&if_expr.body)?;
                self.visit_expr(&if_expr.orelse)
            }
            Expr::Dict(dict) => {
                for item in &dict.items {
                    if let Some(key) = &item.key {
                        self.visit_expr(key)?;
                    }
                    self.visit_expr(&item.value)?;
                }
                Ok(())
            }
            Expr::Set(set) => {
                for elt in &set.elts {
                    self.visit_expr(elt)?;
                }
                Ok(())
            }
            Expr::ListComp(comp) => {
                self.visit_comprehension("<listcomp>", &comp.generators, |r| r.visit_expr(&comp.elt), self.range(comp), false)
            }
            Expr::SetComp(comp) => {
                self.visit_comprehension("<setcomp>", &comp.generators, |r| r.visit_expr(&comp.elt), self.range(comp), false)
            }
            Expr::DictComp(comp) => self.visit_comprehension(
                "<dictcomp>",
                &comp.generators,
                |r| {
                    if let Some(key) = &comp.key {
                        r.visit_expr(key)?;
                    }
                    r.visit_expr(&comp.value)
                },
                self.range(comp),
                false,
            ),
            Expr::Generator(comp) => {
                self.visit_comprehension("<genexpr>", &comp.generators, |r| r.visit_expr(&comp.elt), self.range(comp), true)
            }
            Expr::Await(await_expr) => {
                Err(CompileError::not_implemented("await expressions", self.range(await_expr)))
            }
            Expr::Yield(yield_expr) => {
                let position = self.range(yield_expr);
                if !self.cur().kind.is_function_like() {
                    return Err(CompileError::syntax("'yield' outside function", position));
                }
                if let Some(value) = &yield_expr.value {
                    self.visit_expr(value)?;
                }
                let scope = self.cur();
                scope.is_generator = true;
                scope.yield_count += 1;
                Ok(())
            }
            Expr::YieldFrom(yield_from) => {
                Err(CompileError::not_implemented("'yield from' expressions", self.range(yield_from)))
            }
            Expr::Compare(cmp) => {
                self.visit_expr(&cmp.left)?;
                for comparator in &cmp.comparators {
                    self.visit_expr(comparator)?;
                }
                Ok(())
            }
            Expr::Call(call) => {
                // A bare exec() or eval() call can introduce names the
                // resolver cannot see; flag the scope so cooking can reject
                // closures over it.
                if let Expr::Name(name) = call.func.as_ref()
                    && matches!(name.id.as_str(), "exec" | "eval")
                    && !self.scopes[self.stack[0]].symbols.get(name.id.as_str()).is_some_and(|s| s.bound)
                {
                    self.cur().uses_dynamic_exec = true;
                }
                self.visit_expr(&call.func)?;
                for arg in &*call.arguments.args {
                    self.visit_expr(arg)?;
                }
                for keyword in &*call.arguments.keywords {
                    self.visit_expr(&keyword.value)?;
                }
                Ok(())
            }
            Expr::FString(fstring) => {
                for part in &fstring.value {
                    if let ast::FStringPart::FString(f) = part {
                        self.visit_interp_elements(&f.elements)?;
                    }
                }
                Ok(())
            }
            Expr::TString(tstring) => {
                Err(CompileError::not_implemented("template strings", self.range(tstring)))
            }
            Expr::Attribute(attr) => self.visit_expr(&attr.value),
            Expr::Subscript(sub) => {
                self.visit_expr(&sub.value)?;
                self.visit_expr(&sub.slice)
            }
            Expr::Starred(starred) => self.visit_expr(&starred.value),
            Expr::List(list) => {
                for elt in &list.elts {
                    self.visit_expr(elt)?;
                }
                Ok(())
            }
            Expr::Tuple(tuple) => {
                for elt in &tuple.elts {
                    self.visit_expr(elt)?;
                }
                Ok(())
            }
            Expr::Slice(slice) => {
                for part in [&slice.lower, &slice.upper, &slice.step].into_iter().flatten() {
                    self.visit_expr(part)?;
                }
                Ok(())
            }
            Expr::StringLiteral(_)
            | Expr::BytesLiteral(_)
            | Expr::NumberLiteral(_)
            | Expr::BooleanLiteral(_)
            | Expr::NoneLiteral(_)
            | Expr::EllipsisLiteral(_) => Ok(()),
            Expr::IpyEscapeCommand(cmd) => {
                Err(CompileError::syntax("IPython escape commands are not valid Python", self.range(cmd)))
            }
        }
    }

    fn visit_interp_elements(
        &mut self,
        elements: &ast::InterpolatedStringElements,
    ) -> Result<(), CompileError> {
        for element in elements {
            if let ast::InterpolatedStringElement::Interpolation(interp) = element {
                self.visit_expr(&interp.expression)?;
                if let Some(spec) = &interp.format_spec {
                    self.visit_interp_elements(&spec.elements)?;
                }
            }
        }
        Ok(())
    }

    /// Comprehensions get their own scope with a hidden `.0` parameter;
    /// the outermost iterable is evaluated by the caller and passed in.
    fn visit_comprehension(
        &mut self,
        name: &str,
        generators: &[ast::Comprehension],
        visit_elt: impl FnOnce(&mut Self) -> Result<(), CompileError>,
        position: CodeRange,
        is_generator: bool,
    ) -> Result<(), CompileError> {
        let Some((first, rest)) = generators.split_first() else {
            return Err(CompileError::internal("comprehension without generators"));
        };
        if first.is_async || rest.iter().any(|g| g.is_async) {
            return Err(CompileError::not_implemented("async comprehensions", position));
        }
        self.visit_expr(&first.iter)?;

        self.push_scope(ScopeKind::Comprehension, name.to_string(), position);
        self.declare_parameter(".0", position)?;
        self.cur().argcount = 1;
        if is_generator {
            let scope = self.cur();
            scope.is_generator = true;
            // The element expression is the single implicit yield point.
            scope.yield_count = 1;
        }
        self.visit_expr(&first.target)?;
        for if_clause in &first.ifs {
            self.visit_expr(if_clause)?;
        }
        for r#gen in rest {
            self.visit_expr(&r#gen.iter)?;
            self.visit_expr(&r#gen.target)?;
            for if_clause in &r#gen.ifs {
                self.visit_expr(if_clause)?;
            }
        }
        visit_elt(self)?;
        self.pop_scope()
    }

    /// Cooks and pops the current scope: resolves child free requests
    /// against local bindings (promoting them to cells), forwards the rest
    /// together with this scope's own unbound names, runs the deferred
    /// semantic checks, and assigns frame slots.
    fn pop_scope(&mut self) -> Result<(), CompileError> {
        let idx = self
            .stack
            .pop()
            .ok_or_else(|| CompileError::internal("scope stack underflow"))?;
        self.with_depths.pop();
        let parent = self.scopes[idx].parent;
        let kind = self.scopes[idx].kind;
        let function_like = kind.is_function_like();

        if self.scopes[idx].is_generator
            && let Some(position) = self.scopes[idx].valued_return_pos
        {
            return Err(CompileError::semantic("'return' with argument inside generator", position));
        }

        // Requests from already-cooked children.
        let child_requests = std::mem::take(&mut self.scopes[idx].free_requests);
        if function_like && !child_requests.is_empty() {
            let scope = &self.scopes[idx];
            if scope.uses_star_import {
                return Err(CompileError::semantic(
                    format!(
                        "import * is not allowed in function '{}' because it contains a nested function with free variables",
                        scope.name
                    ),
                    scope.position,
                ));
            }
            if scope.uses_dynamic_exec {
                return Err(CompileError::semantic(
                    format!(
                        "unqualified exec is not allowed in function '{}' because it contains a nested function with free variables",
                        scope.name
                    ),
                    scope.position,
                ));
            }
        }

        let mut outgoing: Vec<String> = Vec::new();
        for name in child_requests {
            let scope = &mut self.scopes[idx];
            let resolves_here = function_like
                && scope.symbols.get(&name).is_some_and(SymbolInfo::is_local);
            if resolves_here {
                if let Some(sym) = scope.symbols.get_mut(&name)
                    && !sym.cell
                {
                    sym.cell = true;
                    sym.from_parameter = sym.parameter;
                    scope.cell_vars.push(name);
                }
            } else if function_like {
                // Pass-through: carry the name as our own free variable so
                // we can hand it to the grandchild's closure.
                let sym = scope.symbols.entry(name.clone()).or_default();
                if !sym.free {
                    sym.free = true;
                    scope.free_vars.push(name.clone());
                }
                outgoing.push(name);
            } else {
                // Module and class bodies neither bind cells for children
                // nor pass frees through; requests continue outward.
                outgoing.push(name);
            }
        }

        // This scope's own unresolved reads.
        if kind != ScopeKind::Module {
            let scope = &mut self.scopes[idx];
            let mut own: Vec<String> = Vec::new();
            for (name, sym) in &scope.symbols {
                if sym.is_local() || sym.global_decl || sym.free {
                    continue;
                }
                if sym.used || sym.nonlocal_decl {
                    own.push(name.clone());
                }
            }
            for name in own {
                if let Some(sym) = scope.symbols.get_mut(&name) {
                    sym.free = true;
                }
                scope.free_vars.push(name.clone());
                outgoing.push(name);
            }
        }

        if let Some(p) = parent {
            for name in outgoing {
                if !self.scopes[p].free_requests.contains(&name) {
                    self.scopes[p].free_requests.push(name);
                }
            }
        }

        self.assign_slots(idx);
        Ok(())
    }

    /// Slot layout: frame storage interleaves cells then frees; JVM locals
    /// reserve slot 0 for the frame, then one per parameter, then named
    /// locals. Free slots here are tentative until closures are set up.
    fn assign_slots(&mut self, idx: usize) {
        let scope = &mut self.scopes[idx];
        if !scope.kind.is_function_like() {
            scope.n_named_slots = 1;
            return;
        }
        for (cell_idx, name) in scope.cell_vars.iter().enumerate() {
            if let Some(sym) = scope.symbols.get_mut(name) {
                sym.slot = Some(cell_idx as u16);
            }
        }
        let nparams = scope.params.len() as u16;
        let mut next = 1 + nparams;
        for (ordinal, name) in scope.params.iter().enumerate() {
            if let Some(sym) = scope.symbols.get_mut(name)
                && !sym.cell
            {
                sym.slot = Some(1 + ordinal as u16);
            }
        }
        let locals: Vec<String> = scope
            .symbols
            .iter()
            .filter(|(_, sym)| sym.is_local() && !sym.cell && !sym.parameter)
            .map(|(name, _)| name.clone())
            .collect();
        for name in locals {
            if let Some(sym) = scope.symbols.get_mut(&name) {
                sym.slot = Some(next);
                next += 1;
            }
        }
        scope.n_named_slots = next;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parse::parse;

    fn resolve(code: &str) -> Result<ScopeTree, CompileError> {
        let (module, map) = parse(code)?;
        ScopeTree::resolve(&module, &map)
    }

    fn find<'a>(tree: &'a ScopeTree, name: &str) -> &'a ScopeRecord {
        (0..tree.len())
            .map(|i| tree.get(i))
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no scope named {name}"))
    }

    #[test]
    fn closure_promotes_binding_to_cell() {
        let tree = resolve(
            "def f():\n    x = 1\n    def g():\n        return x\n    return g\n",
        )
        .unwrap();
        let f = find(&tree, "f");
        assert_eq!(f.cell_vars, vec!["x".to_string()]);
        let x = f.symbol("x").unwrap();
        assert!(x.cell && x.bound);
        assert_eq!(x.slot, Some(0));

        let g = find(&tree, "g");
        assert_eq!(g.free_vars, vec!["x".to_string()]);
        assert_eq!(g.closure_indices, vec![0]);
        assert_eq!(g.closure_distance, 0);
        assert!(g.symbol("x").unwrap().free);
    }

    #[test]
    fn pass_through_scope_carries_free() {
        let tree = resolve(
            "def a():\n    x = 1\n    def b():\n        def c():\n            return x\n        return c\n    return b\n",
        )
        .unwrap();
        let b = find(&tree, "b");
        assert_eq!(b.free_vars, vec!["x".to_string()]);
        // b reads x from a's cell storage.
        assert_eq!(b.closure_indices, vec![0]);
        let c = find(&tree, "c");
        // c reads x from b's storage, past b's (zero) cells.
        assert_eq!(c.closure_indices, vec![0]);
        assert_eq!(c.free_vars, vec!["x".to_string()]);
    }

    #[test]
    fn method_closure_skips_class_scope() {
        let tree = resolve(
            "def f():\n    x = 1\n    class C:\n        def m(self):\n            return x\n",
        )
        .unwrap();
        let m = find(&tree, "m");
        assert_eq!(m.free_vars, vec!["x".to_string()]);
        assert_eq!(m.closure_distance, 1);
        let c = find(&tree, "C");
        // The class body itself carries no free variables for x.
        assert!(c.free_vars.is_empty());
    }

    #[test]
    fn unresolved_free_falls_back_to_global() {
        let tree = resolve("def f():\n    def g():\n        return y\n").unwrap();
        let g = find(&tree, "g");
        assert!(g.free_vars.is_empty());
        assert!(!g.symbol("y").unwrap().free);
    }

    #[test]
    fn global_after_use_is_rejected() {
        let err = resolve("def f():\n    print(x)\n    global x\n").unwrap_err();
        assert_eq!(err.message(), "name 'x' is used prior to global declaration");
        let err = resolve("def f():\n    x = 1\n    global x\n").unwrap_err();
        assert_eq!(err.message(), "name 'x' is assigned to before global declaration");
    }

    #[test]
    fn nonlocal_requires_enclosing_binding() {
        let err = resolve("def f():\n    def g():\n        nonlocal x\n        x = 1\n").unwrap_err();
        assert_eq!(err.message(), "no binding for nonlocal 'x' found");

        let err = resolve("nonlocal x\n").unwrap_err();
        assert_eq!(err.message(), "nonlocal declaration not allowed at module level");
    }

    #[test]
    fn nonlocal_marks_free_without_binding_locally() {
        let tree = resolve(
            "def f():\n    x = 1\n    def g():\n        nonlocal x\n        x = 2\n",
        )
        .unwrap();
        let g = find(&tree, "g");
        let x = g.symbol("x").unwrap();
        assert!(x.free && !x.bound);
        assert_eq!(g.free_vars, vec!["x".to_string()]);
    }

    #[test]
    fn generator_detection_and_valued_return() {
        let tree = resolve("def gen():\n    yield 1\n    yield 2\n").unwrap();
        let r#gen = find(&tree, "gen");
        assert!(r#gen.is_generator);
        assert_eq!(r#gen.yield_count, 2);

        let err = resolve("def gen():\n    yield 1\n    return 2\n").unwrap_err();
        assert_eq!(err.message(), "'return' with argument inside generator");
    }

    #[test]
    fn comprehension_gets_hidden_parameter_scope() {
        let tree = resolve("nums = [1, 2]\nsquares = [n * n for n in nums]\n").unwrap();
        let comp = find(&tree, "<listcomp>");
        assert_eq!(comp.params, vec![".0".to_string()]);
        assert!(comp.symbol("n").unwrap().bound);
        assert!(!comp.is_generator);
        // The iteration variable does not leak into the module scope.
        assert!(tree.module().symbol("n").is_none());
    }

    #[test]
    fn generator_expression_is_a_generator_scope() {
        let tree = resolve("total = sum(n for n in range(3))\n").unwrap();
        let comp = find(&tree, "<genexpr>");
        assert!(comp.is_generator);
        assert_eq!(comp.yield_count, 1);
    }

    #[test]
    fn walrus_in_comprehension_binds_outside() {
        let tree = resolve("def f():\n    vals = [y := n for n in range(3)]\n    return y\n").unwrap();
        let f = find(&tree, "f");
        assert!(f.symbol("y").unwrap().bound);
        let comp = find(&tree, "<listcomp>");
        assert!(!comp.symbol("y").unwrap().bound);
    }

    #[test]
    fn star_import_with_nested_free_is_rejected() {
        let err = resolve(
            "def f():\n    from os import *\n    x = 1\n    def g():\n        return x\n",
        )
        .unwrap_err();
        assert_eq!(
            err.message(),
            "import * is not allowed in function 'f' because it contains a nested function with free variables"
        );
    }

    #[test]
    fn dynamic_exec_with_nested_free_is_rejected() {
        let err = resolve(
            "def f():\n    exec('x = 1')\n    y = 2\n    def g():\n        return y\n",
        )
        .unwrap_err();
        assert_eq!(
            err.message(),
            "unqualified exec is not allowed in function 'f' because it contains a nested function with free variables"
        );
    }

    #[test]
    fn slots_cover_frame_params_and_locals() {
        let tree = resolve("def f(a, b):\n    c = a + b\n    return c\n").unwrap();
        let f = find(&tree, "f");
        assert_eq!(f.params, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(f.argcount, 2);
        assert_eq!(f.symbol("a").unwrap().slot, Some(1));
        assert_eq!(f.symbol("b").unwrap().slot, Some(2));
        assert_eq!(f.symbol("c").unwrap().slot, Some(3));
        assert_eq!(f.n_named_slots, 4);
    }

    #[test]
    fn captured_parameter_becomes_cell() {
        let tree = resolve("def f(a):\n    def g():\n        return a\n    return g\n").unwrap();
        let f = find(&tree, "f");
        assert_eq!(f.cell_vars, vec!["a".to_string()]);
        let a = f.symbol("a").unwrap();
        assert!(a.cell && a.parameter && a.from_parameter);
        assert_eq!(a.slot, Some(0));
    }

    #[test]
    fn with_depth_and_debug_guard() {
        let tree = resolve(
            "def f(cm):\n    with cm as a:\n        with cm as b:\n            pass\n    with cm:\n        pass\n",
        )
        .unwrap();
        assert_eq!(find(&tree, "f").max_with_depth, 2);

        let err = resolve("__debug__ = 1\n").unwrap_err();
        assert_eq!(err.message(), "cannot assign to __debug__");
    }

    #[test]
    fn with_depth_counts_through_intervening_statements() {
        // The inner with is still open inside the outer one even though a
        // loop sits between them, so two exit slots are live at once.
        let tree = resolve(
            "def f(cm):\n    with cm:\n        for i in cm:\n            with cm:\n                pass\n",
        )
        .unwrap();
        assert_eq!(find(&tree, "f").max_with_depth, 2);

        let tree = resolve(
            "def f(cm):\n    with cm:\n        try:\n            with cm, cm:\n                pass\n        finally:\n            pass\n",
        )
        .unwrap();
        assert_eq!(find(&tree, "f").max_with_depth, 3);

        // A nested function starts its own exit-slot accounting.
        let tree = resolve("def f(cm):\n    with cm:\n        def g():\n            with cm:\n                pass\n")
            .unwrap();
        assert_eq!(find(&tree, "f").max_with_depth, 1);
        assert_eq!(find(&tree, "g").max_with_depth, 1);
    }

    #[test]
    fn duplicate_parameter_is_rejected() {
        let err = resolve("def f(a, a):\n    pass\n").unwrap_err();
        assert_eq!(err.message(), "duplicate argument 'a' in function definition");
    }

    #[test]
    fn except_name_and_import_bind() {
        let tree = resolve(
            "import os.path\ntry:\n    pass\nexcept ValueError as e:\n    pass\n",
        )
        .unwrap();
        let module = tree.module();
        assert!(module.symbol("os").unwrap().bound);
        assert!(module.symbol("e").unwrap().bound);
    }
}
