//! Code generation: lowers a resolved module into one JVM class.
//!
//! Each scope in the tree becomes one static method with the shared
//! body signature; `<clinit>` materializes the literal table and the code
//! objects, and a `tableswitch` dispatch method lets the runtime invoke
//! any body by index. The per-scope work lives in [`FunctionCompiler`],
//! whose statement and expression halves are in the sibling modules.

mod expr;
mod stmt;

use ruff_python_ast::{self as ast, Expr, ModModule, Stmt};
use ruff_text_size::Ranged;

use crate::classfile::{
    ACC_FINAL, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC, Annotation, AnnotationValue, ClassBuilder, CodeBuilder,
    ExceptionRange, Label, MethodCode, Op,
};
use crate::constants::{ConstValue, ConstantTable};
use crate::error::CompileError;
use crate::parse::SourceMap;
use crate::runtime::{self, InvokeKind, MethodAbi};
use crate::scope::{ScopeRecord, ScopeTree};
use crate::{CompileOptions, CompiledMethod, CompiledModule};

/// Shared compilation state threaded through every `FunctionCompiler`.
pub(crate) struct Gen<'a> {
    tree: &'a ScopeTree,
    map: &'a SourceMap,
    options: &'a CompileOptions,
    class: ClassBuilder,
    constants: ConstantTable,
    /// Finished method bodies, indexed by scope.
    methods: Vec<Option<(String, MethodCode)>>,
}

impl Gen<'_> {
    fn class_name(&self) -> String {
        self.class.name().to_string()
    }
}

/// Compiles a resolved module into class-file bytes.
pub(crate) fn compile_module(
    module: &ModModule,
    tree: &ScopeTree,
    map: &SourceMap,
    options: &CompileOptions,
) -> Result<CompiledModule, CompileError> {
    let class_name = format!("{}$py", sanitize(&options.module_name));
    let mut g = Gen {
        tree,
        map,
        options,
        class: ClassBuilder::new(&class_name, runtime::FUNCTION_TABLE),
        constants: ConstantTable::new(),
        methods: (0..tree.len()).map(|_| None).collect(),
    };

    compile_method(&mut g, 0, ScopeAst::Body(&module.body))?;
    for (idx, method) in g.methods.iter().enumerate() {
        if method.is_none() {
            return Err(CompileError::internal(format!("scope {idx} was never compiled")));
        }
    }

    emit_static_fields(&mut g)?;
    emit_init(&mut g)?;
    emit_clinit(&mut g)?;
    emit_dispatch(&mut g)?;

    g.class.set_source_file(&options.filename);
    g.class.add_annotation(Annotation {
        type_descriptor: runtime::ANN_API_VERSION.to_string(),
        elements: vec![("value".to_string(), AnnotationValue::Int(runtime::API_VERSION))],
    });
    g.class.add_annotation(Annotation {
        type_descriptor: runtime::ANN_MTIME.to_string(),
        elements: vec![("value".to_string(), AnnotationValue::Long(options.mtime.unwrap_or(-1)))],
    });
    g.class.add_annotation(Annotation {
        type_descriptor: runtime::ANN_FILENAME.to_string(),
        elements: vec![("value".to_string(), AnnotationValue::Str(options.filename.clone()))],
    });

    let descriptors: Vec<CompiledMethod> = g
        .methods
        .iter()
        .flatten()
        .map(|(name, code)| CompiledMethod {
            name: name.clone(),
            code: code.clone(),
        })
        .collect();
    let bytes = g.class.finish()?;
    Ok(CompiledModule {
        class_name,
        bytes,
        methods: descriptors,
    })
}

/// Replaces everything outside `[A-Za-z0-9_]`, so `<lambda>` and dotted
/// module names survive as JVM identifiers.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() { "anon".to_string() } else { trimmed.to_string() }
}

fn method_name(scope: &ScopeRecord, idx: usize) -> String {
    format!("{}${idx}", sanitize(&scope.name))
}

fn code_field(idx: usize) -> String {
    format!("c${idx}")
}

/// What a scope's body looks like in the AST.
#[derive(Clone, Copy)]
pub(crate) enum ScopeAst<'ast> {
    Body(&'ast [Stmt]),
    /// Lambda: a single expression that is also the return value.
    Value(&'ast Expr),
    Comprehension(CompSpec<'ast>),
}

#[derive(Clone, Copy)]
pub(crate) enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

#[derive(Clone, Copy)]
pub(crate) struct CompSpec<'ast> {
    pub kind: CompKind,
    pub generators: &'ast [ast::Comprehension],
    pub key: Option<&'ast Expr>,
    pub element: &'ast Expr,
}

pub(crate) struct LoopInfo {
    pub continue_label: Label,
    pub break_label: Label,
    /// Cleanup-stack height at loop entry; `break` unwinds down to it.
    pub cleanup_depth: usize,
}

/// Work to replay when control leaves a protected region early.
#[derive(Clone, Copy)]
pub(crate) enum Cleanup<'ast> {
    /// Inline this `finally` body, suspending its catch-all range first.
    Finally { body: &'ast [Stmt], range: usize },
    /// Call the saved `__exit__` with a `None` triple.
    WithExit { exit_index: u16, range: usize },
}

/// Emits one scope's body as a static method, recursing into child scopes
/// at their definition sites.
pub(crate) struct FunctionCompiler<'ast> {
    pub scope_idx: usize,
    pub code: CodeBuilder,
    /// Cursor into the scope's children; definition order matches the
    /// resolver's visitation order.
    next_child: usize,
    pub loops: Vec<LoopInfo>,
    pub cleanups: Vec<Cleanup<'ast>>,
    /// Exception ranges owned for the lifetime of the method, addressed
    /// by index so cleanup inlining can suspend them mid-flight.
    pub ranges: Vec<ExceptionRange>,
    /// Resume targets, one per yield point.
    resume_labels: Vec<Label>,
    next_yield: u32,
    /// Current static `with` nesting, indexing the frame's exit slots.
    pub with_depth: u16,
    /// Temp slots currently holding a `Throwable` rather than a `Value`.
    pub throwable_slots: Vec<u16>,
}

pub(crate) fn compile_method(g: &mut Gen, scope_idx: usize, body: ScopeAst) -> Result<(), CompileError> {
    let scope = g.tree.get(scope_idx);
    let name = method_name(scope, scope_idx);
    let mut f = FunctionCompiler {
        scope_idx,
        code: CodeBuilder::new(scope.n_named_slots),
        next_child: 0,
        loops: Vec::new(),
        cleanups: Vec::new(),
        ranges: Vec::new(),
        resume_labels: Vec::new(),
        next_yield: 0,
        with_depth: 0,
        throwable_slots: Vec::new(),
    };

    let result = f.compile_body(g, body);
    let finished = result.and_then(|()| f.code.finish());
    let code = match finished {
        Ok(code) => code,
        Err(err) if err.is_capacity() => blob_fallback(g, scope_idx, &err)?,
        Err(err) => return Err(err),
    };
    g.class.add_method(ACC_PUBLIC | ACC_STATIC, &name, runtime::BODY_DESC, code.clone());
    g.methods[scope_idx] = Some((name, code));
    Ok(())
}

/// When a body overflows a JVM method, fall back to a caller-supplied
/// precompiled blob run through the runtime's interpreter trampoline.
fn blob_fallback(g: &mut Gen, scope_idx: usize, err: &CompileError) -> Result<MethodCode, CompileError> {
    let scope = g.tree.get(scope_idx);
    let Some(blob) = g.options.precompiled.get(&scope.name) else {
        return Err(CompileError::capacity(format!(
            "{} and no precompiled fallback was provided for '{}'",
            err.message(),
            scope.name
        )));
    };
    // Latin-1 chars cost up to two bytes in the pool's modified UTF-8,
    // so 32000 chars keeps every chunk under the Utf8 length limit.
    let chunks: Vec<String> = blob
        .chunks(32_000)
        .map(|chunk| chunk.iter().map(|&b| b as char).collect())
        .collect();
    let mut code = CodeBuilder::new(1);
    emit_string_array(g, &mut code, &chunks)?;
    code.emit_aload(0)?;
    runtime::RUN_PRECOMPILED.emit(g.class.pool(), &mut code)?;
    code.emit_areturn();
    code.finish()
}

fn emit_static_fields(g: &mut Gen) -> Result<(), CompileError> {
    let class_name = g.class_name();
    let self_desc = format!("L{class_name};");
    g.class.add_field(ACC_PRIVATE | ACC_STATIC | ACC_FINAL, "self$", &self_desc);
    for idx in 0..g.tree.len() {
        g.class
            .add_field(ACC_PRIVATE | ACC_STATIC | ACC_FINAL, &code_field(idx), runtime::CODE_DESC);
    }
    for (idx, _) in g.constants.iter() {
        g.class.add_field(
            ACC_PRIVATE | ACC_STATIC | ACC_FINAL,
            &ConstantTable::field_name(idx),
            runtime::VALUE_DESC,
        );
    }
    // The runtime's entry point into a compiled module.
    g.class.add_field(ACC_PUBLIC | ACC_STATIC | ACC_FINAL, "module$code", runtime::CODE_DESC);
    Ok(())
}

fn emit_init(g: &mut Gen) -> Result<(), CompileError> {
    let mut code = CodeBuilder::new(1);
    code.emit_aload(0)?;
    runtime::TABLE_INIT.emit(g.class.pool(), &mut code)?;
    code.emit_return();
    g.class.add_method(ACC_PUBLIC, "<init>", "()V", code.finish()?);
    Ok(())
}

fn emit_clinit(g: &mut Gen) -> Result<(), CompileError> {
    let class_name = g.class_name();
    let self_desc = format!("L{class_name};");
    let mut code = CodeBuilder::new(0);

    let class_idx = g.class.pool().class(&class_name)?;
    code.emit_new(class_idx);
    code.emit(Op::Dup);
    let init_idx = g.class.pool().methodref(&class_name, "<init>", "()V")?;
    code.emit_invoke(Op::Invokespecial, init_idx, 1, 0);
    let self_field = g.class.pool().fieldref(&class_name, "self$", &self_desc)?;
    code.emit_putstatic(self_field);

    emit_constant_loads(g, &mut code)?;

    for idx in 0..g.tree.len() {
        let scope = g.tree.get(idx);
        code.emit_getstatic(g.class.pool().fieldref(&class_name, "self$", &self_desc)?);
        code.emit_iconst(idx as i32)?;
        let name_idx = g.class.pool().string(&scope.name)?;
        code.emit_ldc(name_idx);
        code.emit_iconst(i32::from(scope.argcount))?;
        emit_string_array(g, &mut code, &scope.params)?;
        code.emit_iconst(i32::from(scope.has_vararg))?;
        code.emit_iconst(i32::from(scope.has_kwarg))?;
        code.emit_iconst(i32::from(scope.is_generator))?;
        code.emit_iconst(i32::from(scope.ncells()))?;
        code.emit_iconst(i32::from(scope.nfrees()))?;
        code.emit_iconst(i32::from(scope.max_with_depth))?;
        runtime::NEW_CODE.emit(g.class.pool(), &mut code)?;
        let field = g.class.pool().fieldref(&class_name, &code_field(idx), runtime::CODE_DESC)?;
        code.emit_putstatic(field);
    }

    let module_code = g.class.pool().fieldref(&class_name, &code_field(0), runtime::CODE_DESC)?;
    code.emit_getstatic(module_code);
    let entry = g.class.pool().fieldref(&class_name, "module$code", runtime::CODE_DESC)?;
    code.emit_putstatic(entry);
    code.emit_return();
    g.class.add_method(ACC_STATIC, "<clinit>", "()V", code.finish()?);
    Ok(())
}

fn emit_constant_loads(g: &mut Gen, code: &mut CodeBuilder) -> Result<(), CompileError> {
    let class_name = g.class_name();
    // The table is immutable from here on; snapshot to release the borrow.
    let values: Vec<(u16, ConstValue)> = g.constants.iter().map(|(i, v)| (i, v.clone())).collect();
    for (idx, value) in values {
        match &value {
            ConstValue::Int(v) => {
                let entry = g.class.pool().long(*v)?;
                code.emit_ldc2(entry);
                runtime::NEW_INTEGER.emit(g.class.pool(), code)?;
            }
            ConstValue::Big(v) => {
                let entry = g.class.pool().string(&v.to_string())?;
                code.emit_ldc(entry);
                runtime::NEW_BIG_INTEGER.emit(g.class.pool(), code)?;
            }
            ConstValue::Float(v) => {
                let entry = g.class.pool().double(*v)?;
                code.emit_ldc2(entry);
                runtime::NEW_FLOAT.emit(g.class.pool(), code)?;
            }
            ConstValue::Imaginary(v) => {
                let entry = g.class.pool().double(*v)?;
                code.emit_ldc2(entry);
                runtime::NEW_IMAGINARY.emit(g.class.pool(), code)?;
            }
            ConstValue::Str(v) => {
                let entry = g.class.pool().string(v)?;
                code.emit_ldc(entry);
                runtime::NEW_STRING.emit(g.class.pool(), code)?;
            }
            ConstValue::Bytes(v) => {
                // One latin-1 char per byte round-trips exactly.
                let text: String = v.iter().map(|&b| b as char).collect();
                let entry = g.class.pool().string(&text)?;
                code.emit_ldc(entry);
                runtime::NEW_BYTES.emit(g.class.pool(), code)?;
            }
        }
        let field = g
            .class
            .pool()
            .fieldref(&class_name, &ConstantTable::field_name(idx), runtime::VALUE_DESC)?;
        code.emit_putstatic(field);
    }
    Ok(())
}

fn emit_string_array(g: &mut Gen, code: &mut CodeBuilder, items: &[String]) -> Result<(), CompileError> {
    code.emit_iconst(items.len() as i32)?;
    let string_class = g.class.pool().class(runtime::STRING)?;
    code.emit_anewarray(string_class);
    for (i, item) in items.iter().enumerate() {
        code.emit(Op::Dup);
        code.emit_iconst(i as i32)?;
        let entry = g.class.pool().string(item)?;
        code.emit_ldc(entry);
        code.emit(Op::Aastore);
    }
    Ok(())
}

/// The per-class dispatch: `call_function(index, frame)` jumps to the
/// matching static body.
fn emit_dispatch(g: &mut Gen) -> Result<(), CompileError> {
    let class_name = g.class_name();
    let mut code = CodeBuilder::new(3);
    let default = code.new_label();
    let targets: Vec<Label> = (0..g.tree.len()).map(|_| code.new_label()).collect();
    code.emit_iload(1)?;
    code.emit_tableswitch(0, &targets, default)?;
    for (idx, &target) in targets.iter().enumerate() {
        code.bind(target)?;
        code.set_stack_depth(0);
        code.emit_aload(2)?;
        let scope = g.tree.get(idx);
        let method_idx = g
            .class
            .pool()
            .methodref(&class_name, &method_name(scope, idx), runtime::BODY_DESC)?;
        code.emit_invoke(Op::Invokestatic, method_idx, 1, 1);
        code.emit_areturn();
    }
    code.bind(default)?;
    code.set_stack_depth(0);
    code.emit(Op::AconstNull);
    code.emit_areturn();
    g.class
        .add_method(ACC_PUBLIC, "call_function", runtime::DISPATCH_DESC, code.finish()?);
    Ok(())
}

/// How a name is reached from the current scope.
pub(crate) enum Access {
    /// A JVM local slot; `checked` loads verify against `del`.
    Slot { slot: u16, checked: bool },
    /// Cell or free variable in the frame's deref storage.
    Deref(u16),
    Global,
    /// Frame name lookup, used by module and class bodies.
    FrameName,
}

impl<'ast> FunctionCompiler<'ast> {
    pub fn scope<'g>(&self, g: &Gen<'g>) -> &'g ScopeRecord {
        g.tree.get(self.scope_idx)
    }

    /// Consumes the next child scope index; definition sites appear in the
    /// same order the resolver visited them.
    pub fn take_child(&mut self, g: &Gen) -> usize {
        let child = self.scope(g).children[self.next_child];
        self.next_child += 1;
        child
    }

    pub fn classify(&self, g: &Gen, name: &str) -> Access {
        let scope = self.scope(g);
        if !scope.kind.is_function_like() {
            return match scope.symbol(name) {
                Some(sym) if sym.global_decl => Access::Global,
                _ => Access::FrameName,
            };
        }
        match scope.symbol(name) {
            Some(sym) if sym.cell || sym.free => Access::Deref(sym.slot.unwrap_or(0)),
            Some(sym) if sym.is_local() && sym.parameter => Access::Slot {
                slot: sym.slot.unwrap_or(0),
                checked: false,
            },
            Some(sym) if sym.is_local() => Access::Slot {
                slot: sym.slot.unwrap_or(0),
                checked: true,
            },
            _ => Access::Global,
        }
    }

    pub fn invoke(&mut self, g: &mut Gen, abi: &MethodAbi) -> Result<(), CompileError> {
        debug_assert!(abi.kind != InvokeKind::Special || abi.name == "<init>");
        abi.emit(g.class.pool(), &mut self.code)
    }

    pub fn emit_none(&mut self, g: &mut Gen) -> Result<(), CompileError> {
        runtime::NONE.emit_get(g.class.pool(), &mut self.code)
    }

    /// Loads an interned literal from its `k$<n>` field.
    pub fn load_const(&mut self, g: &mut Gen, value: ConstValue) -> Result<(), CompileError> {
        let idx = g.constants.intern(value);
        let class_name = g.class_name();
        let field = g
            .class
            .pool()
            .fieldref(&class_name, &ConstantTable::field_name(idx), runtime::VALUE_DESC)?;
        self.code.emit_getstatic(field);
        Ok(())
    }

    /// Pushes a `java.lang.String` constant, for name-based runtime calls.
    pub fn load_java_string(&mut self, g: &mut Gen, text: &str) -> Result<(), CompileError> {
        let idx = g.class.pool().string(text)?;
        self.code.emit_ldc(idx);
        Ok(())
    }

    pub fn load_name(&mut self, g: &mut Gen, name: &str) -> Result<(), CompileError> {
        match self.classify(g, name) {
            Access::Slot { slot, checked: false } => self.code.emit_aload(slot),
            Access::Slot { slot, checked: true } => {
                self.code.emit_aload(slot)?;
                self.code.emit(Op::Dup);
                let ok = self.code.new_label();
                self.code.emit_branch(Op::Ifnonnull, ok)?;
                self.code.emit(Op::Pop);
                self.load_java_string(g, name)?;
                self.invoke(g, &runtime::UNBOUND_LOCAL)?;
                self.code.emit_athrow();
                self.code.bind(ok)?;
                self.code.set_stack_depth(1);
                Ok(())
            }
            Access::Deref(idx) => {
                self.code.emit_aload(0)?;
                self.code.emit_iconst(i32::from(idx))?;
                self.invoke(g, &runtime::GET_DEREF)
            }
            Access::Global => {
                self.code.emit_aload(0)?;
                self.load_java_string(g, name)?;
                self.invoke(g, &runtime::GET_GLOBAL)
            }
            Access::FrameName => {
                self.code.emit_aload(0)?;
                self.load_java_string(g, name)?;
                self.invoke(g, &runtime::GET_NAME)
            }
        }
    }

    /// Stores the value on top of the stack into `name`.
    pub fn store_name(&mut self, g: &mut Gen, name: &str) -> Result<(), CompileError> {
        match self.classify(g, name) {
            Access::Slot { slot, .. } => self.code.emit_astore(slot),
            Access::Deref(idx) => {
                // Rearrange to receiver, index, value.
                self.code.emit_aload(0)?;
                self.code.emit(Op::Swap);
                self.code.emit_iconst(i32::from(idx))?;
                self.code.emit(Op::Swap);
                self.invoke(g, &runtime::SET_DEREF)
            }
            Access::Global => {
                self.code.emit_aload(0)?;
                self.code.emit(Op::Swap);
                self.load_java_string(g, name)?;
                self.code.emit(Op::Swap);
                self.invoke(g, &runtime::SET_GLOBAL)
            }
            Access::FrameName => {
                self.code.emit_aload(0)?;
                self.code.emit(Op::Swap);
                self.load_java_string(g, name)?;
                self.code.emit(Op::Swap);
                self.invoke(g, &runtime::SET_NAME)
            }
        }
    }

    pub fn delete_name(&mut self, g: &mut Gen, name: &str) -> Result<(), CompileError> {
        match self.classify(g, name) {
            Access::Slot { slot, .. } => {
                // Later loads detect the hole and raise an unbound error.
                self.code.emit(Op::AconstNull);
                self.code.emit_astore(slot)
            }
            Access::Deref(idx) => {
                self.code.emit_aload(0)?;
                self.code.emit_iconst(i32::from(idx))?;
                self.code.emit(Op::AconstNull);
                self.invoke(g, &runtime::SET_DEREF)
            }
            Access::Global => {
                self.code.emit_aload(0)?;
                self.load_java_string(g, name)?;
                self.invoke(g, &runtime::DEL_GLOBAL)
            }
            Access::FrameName => {
                self.code.emit_aload(0)?;
                self.load_java_string(g, name)?;
                self.invoke(g, &runtime::DEL_NAME)
            }
        }
    }

    fn compile_body(&mut self, g: &mut Gen, body: ScopeAst<'ast>) -> Result<(), CompileError> {
        let scope = self.scope(g);
        let is_generator = scope.is_generator;
        if is_generator {
            self.emit_generator_header(g)?;
        }
        self.emit_prologue(g)?;
        match body {
            ScopeAst::Body(stmts) => self.compile_stmts(g, stmts)?,
            ScopeAst::Value(expr) => {
                self.compile_expr(g, expr)?;
                self.code.emit_areturn();
            }
            ScopeAst::Comprehension(spec) => self.compile_comprehension_body(g, spec)?,
        }
        // Fall-off return; unreachable when every path returned already.
        if is_generator {
            self.code.emit_aload(0)?;
            self.code.emit_iconst(-1)?;
            self.invoke(g, &runtime::SET_RESUME_POINT)?;
        }
        self.emit_none(g)?;
        self.code.emit_areturn();
        Ok(())
    }

    /// Generator methods re-enter through a resume table keyed by the
    /// frame's resume point: 0 is a fresh start, k continues after the
    /// k-th yield, and anything else means the generator is spent.
    fn emit_generator_header(&mut self, g: &mut Gen) -> Result<(), CompileError> {
        let scope = self.scope(g);
        let yields = scope.yield_count as usize;
        self.code.emit_aload(0)?;
        self.invoke(g, &runtime::CHECK_THROW)?;

        let start = self.code.new_label();
        let exhausted = self.code.new_label();
        self.resume_labels = (0..yields).map(|_| self.code.new_label()).collect();
        let mut targets = Vec::with_capacity(yields + 1);
        targets.push(start);
        targets.extend(&self.resume_labels);

        self.code.emit_aload(0)?;
        self.invoke(g, &runtime::GET_RESUME_POINT)?;
        self.code.emit_tableswitch(0, &targets, exhausted)?;

        self.code.bind(exhausted)?;
        self.code.set_stack_depth(0);
        self.emit_none(g)?;
        self.code.emit_areturn();

        self.code.bind(start)?;
        self.code.set_stack_depth(0);
        Ok(())
    }

    /// Copies parameters out of the frame into their JVM slots or cells,
    /// and null-initializes plain locals in generators so every yield can
    /// snapshot the full slot range.
    fn emit_prologue(&mut self, g: &mut Gen) -> Result<(), CompileError> {
        let scope = self.scope(g);
        if !scope.kind.is_function_like() {
            return Ok(());
        }
        let params: Vec<(usize, String)> = scope.params.iter().cloned().enumerate().collect();
        let is_generator = scope.is_generator;
        let n_named = scope.n_named_slots;
        for (ordinal, name) in params {
            let sym = self
                .scope(g)
                .symbol(&name)
                .ok_or_else(|| CompileError::internal("parameter without symbol entry"))?;
            let (is_cell, slot) = (sym.cell, sym.slot.unwrap_or(0));
            if is_cell {
                self.code.emit_aload(0)?;
                self.code.emit_iconst(i32::from(slot))?;
                self.code.emit_aload(0)?;
                self.code.emit_iconst(ordinal as i32)?;
                self.invoke(g, &runtime::GET_LOCAL)?;
                self.invoke(g, &runtime::SET_DEREF)?;
            } else {
                self.code.emit_aload(0)?;
                self.code.emit_iconst(ordinal as i32)?;
                self.invoke(g, &runtime::GET_LOCAL)?;
                self.code.emit_astore(slot)?;
            }
        }
        if is_generator {
            let nparams = self.scope(g).params.len() as u16;
            for slot in (1 + nparams)..n_named {
                self.code.emit(Op::AconstNull);
                self.code.emit_astore(slot)?;
            }
        }
        Ok(())
    }

    /// Suspends execution: saves live slots, parks the resume point, and
    /// returns the yielded value. On re-entry the slots are restored and
    /// the value sent into the generator is pushed.
    pub fn emit_yield_point(&mut self, g: &mut Gen) -> Result<(), CompileError> {
        // Suspension saves frame slots, not operands; anything else on the
        // stack here would be lost across the resume.
        if self.code.stack_depth() != 1 {
            return Err(CompileError::not_implemented(
                "yield inside an expression with pending operands",
                self.scope(g).position,
            ));
        }
        self.next_yield += 1;
        let k = self.next_yield;
        let resume = self.resume_labels[(k - 1) as usize];

        // Handlers guard the Python-level body, not the suspend and
        // restore machinery; every open range skips this stretch.
        let open_ranges: Vec<usize> = (0..self.ranges.len()).filter(|&i| self.ranges[i].is_open()).collect();
        for &i in &open_ranges {
            self.ranges[i].suspend(self.code.pos());
        }

        self.code.emit_aload(0)?;
        self.code.emit_iconst(k as i32)?;
        self.invoke(g, &runtime::SET_RESUME_POINT)?;

        let mut slots: Vec<u16> = (1..self.scope(g).n_named_slots).collect();
        // Cell parameters leave their positional slot untouched; those
        // slots are undefined and must not be saved.
        let scope = self.scope(g);
        let cell_param_slots: Vec<u16> = scope
            .params
            .iter()
            .enumerate()
            .filter(|(_, name)| scope.symbol(name).is_some_and(|s| s.cell))
            .map(|(i, _)| 1 + i as u16)
            .collect();
        slots.retain(|s| !cell_param_slots.contains(s));
        slots.extend(self.code.live_temps());

        self.code.emit_aload(0)?;
        self.code.emit_iconst(slots.len() as i32)?;
        let object_class = g.class.pool().class(runtime::OBJECT)?;
        self.code.emit_anewarray(object_class);
        for (pos, &slot) in slots.iter().enumerate() {
            self.code.emit(Op::Dup);
            self.code.emit_iconst(pos as i32)?;
            self.code.emit_aload(slot)?;
            self.code.emit(Op::Aastore);
        }
        self.invoke(g, &runtime::SET_SAVED_LOCALS)?;
        self.code.emit_areturn();

        self.code.bind(resume)?;
        self.code.set_stack_depth(0);
        self.code.emit_aload(0)?;
        self.invoke(g, &runtime::GET_SAVED_LOCALS)?;
        let value_class = g.class.pool().class(runtime::VALUE)?;
        let throwable_class = g.class.pool().class(runtime::THROWABLE)?;
        for (pos, &slot) in slots.iter().enumerate() {
            self.code.emit(Op::Dup);
            self.code.emit_iconst(pos as i32)?;
            self.code.emit(Op::Aaload);
            if self.throwable_slots.contains(&slot) {
                self.code.emit_checkcast(throwable_class);
            } else {
                self.code.emit_checkcast(value_class);
            }
            self.code.emit_astore(slot)?;
        }
        self.code.emit(Op::Pop);
        self.code.emit_aload(0)?;
        self.invoke(g, &runtime::GENERATOR_INPUT)?;
        for &i in &open_ranges {
            self.ranges[i].resume(self.code.pos());
        }
        Ok(())
    }

    /// Builds a `[LValue;` array from `exprs`.
    pub fn emit_value_array(&mut self, g: &mut Gen, exprs: &'ast [Expr]) -> Result<(), CompileError> {
        self.code.emit_iconst(exprs.len() as i32)?;
        let value_class = g.class.pool().class(runtime::VALUE)?;
        self.code.emit_anewarray(value_class);
        for (i, expr) in exprs.iter().enumerate() {
            self.code.emit(Op::Dup);
            self.code.emit_iconst(i as i32)?;
            self.compile_expr(g, expr)?;
            self.code.emit(Op::Aastore);
        }
        Ok(())
    }

    /// Creates a function object and leaves it on the stack. Defaults and
    /// annotations run in the defining scope first; only then is the child
    /// body compiled, so nested scopes are consumed in resolver order.
    pub fn emit_make_function(
        &mut self,
        g: &mut Gen,
        parameters: Option<&'ast ast::Parameters>,
        returns: Option<&'ast Expr>,
        body: ScopeAst<'ast>,
    ) -> Result<(), CompileError> {
        let value_class = g.class.pool().class(runtime::VALUE)?;

        let mut defaults_slot = None;
        let mut kw_defaults_slot = None;
        if let Some(params) = parameters {
            let n_defaults = params
                .posonlyargs
                .iter()
                .chain(&params.args)
                .filter(|p| p.default.is_some())
                .count();
            self.code.emit_iconst(n_defaults as i32)?;
            self.code.emit_anewarray(value_class);
            let mut next = 0;
            for p in params.posonlyargs.iter().chain(&params.args) {
                if let Some(annotation) = &p.parameter.annotation {
                    self.compile_expr(g, annotation)?;
                    self.code.emit(Op::Pop);
                }
                if let Some(default) = &p.default {
                    self.code.emit(Op::Dup);
                    self.code.emit_iconst(next)?;
                    next += 1;
                    self.compile_expr(g, default)?;
                    self.code.emit(Op::Aastore);
                }
            }
            let slot = self.code.acquire_temp();
            self.code.emit_astore(slot)?;
            defaults_slot = Some(slot);

            let n_kw_defaults = params.kwonlyargs.iter().filter(|p| p.default.is_some()).count();
            if n_kw_defaults > 0 {
                // Alternating name/value pairs become a dict.
                self.code.emit_iconst(2 * n_kw_defaults as i32)?;
                self.code.emit_anewarray(value_class);
                let mut pair = 0;
                for p in &params.kwonlyargs {
                    if let Some(annotation) = &p.parameter.annotation {
                        self.compile_expr(g, annotation)?;
                        self.code.emit(Op::Pop);
                    }
                    if let Some(default) = &p.default {
                        self.code.emit(Op::Dup);
                        self.code.emit_iconst(2 * pair)?;
                        self.load_const(g, ConstValue::Str(p.parameter.name.to_string()))?;
                        self.code.emit(Op::Aastore);
                        self.code.emit(Op::Dup);
                        self.code.emit_iconst(2 * pair + 1)?;
                        self.compile_expr(g, default)?;
                        self.code.emit(Op::Aastore);
                        pair += 1;
                    }
                }
                self.invoke(g, &runtime::NEW_DICT)?;
                let slot = self.code.acquire_temp();
                self.code.emit_astore(slot)?;
                kw_defaults_slot = Some(slot);
            } else {
                for p in &params.kwonlyargs {
                    if let Some(annotation) = &p.parameter.annotation {
                        self.compile_expr(g, annotation)?;
                        self.code.emit(Op::Pop);
                    }
                }
            }
            for p in [&params.vararg, &params.kwarg].into_iter().flatten() {
                if let Some(annotation) = &p.annotation {
                    self.compile_expr(g, annotation)?;
                    self.code.emit(Op::Pop);
                }
            }
        }
        if let Some(returns) = returns {
            self.compile_expr(g, returns)?;
            self.code.emit(Op::Pop);
        }

        let child_idx = self.take_child(g);
        compile_method(g, child_idx, body)?;

        let class_name = g.class_name();
        let field = g
            .class
            .pool()
            .fieldref(&class_name, &code_field(child_idx), runtime::CODE_DESC)?;
        self.code.emit_getstatic(field);
        match defaults_slot {
            Some(slot) => {
                self.code.emit_aload(slot)?;
                self.code.free_temp(slot);
            }
            None => {
                self.code.emit_iconst(0)?;
                self.code.emit_anewarray(value_class);
            }
        }
        match kw_defaults_slot {
            Some(slot) => {
                self.code.emit_aload(slot)?;
                self.code.free_temp(slot);
            }
            None => self.code.emit(Op::AconstNull),
        }
        self.emit_closure_array(g, child_idx)?;
        self.code.emit_aload(0)?;
        self.invoke(g, &runtime::MAKE_FUNCTION)
    }

    /// Materializes the cells a child scope captures, or null when it
    /// captures nothing. Each class scope between the child and its
    /// provider adds one `outer()` hop.
    pub fn emit_closure_array(&mut self, g: &mut Gen, child_idx: usize) -> Result<(), CompileError> {
        let child = g.tree.get(child_idx);
        if child.free_vars.is_empty() {
            self.code.emit(Op::AconstNull);
            return Ok(());
        }
        let indices = child.closure_indices.clone();
        let distance = child.closure_distance;
        self.code.emit_iconst(indices.len() as i32)?;
        let cell_class = g.class.pool().class(runtime::CELL)?;
        self.code.emit_anewarray(cell_class);
        for (i, &storage_idx) in indices.iter().enumerate() {
            self.code.emit(Op::Dup);
            self.code.emit_iconst(i as i32)?;
            self.code.emit_aload(0)?;
            for _ in 0..distance {
                self.invoke(g, &runtime::OUTER)?;
            }
            self.code.emit_iconst(i32::from(storage_idx))?;
            self.invoke(g, &runtime::GET_CLOSURE)?;
            self.code.emit(Op::Aastore);
        }
        Ok(())
    }

    /// Records source position bookkeeping at a statement boundary.
    pub fn mark_line(&mut self, g: &mut Gen, node: &impl Ranged) -> Result<(), CompileError> {
        if !g.options.linenumbers {
            return Ok(());
        }
        let line = g.map.range(node.range()).start().line;
        self.code.set_line(line);
        self.code.emit_aload(0)?;
        self.code.emit_iconst(line.min(i32::MAX as u32) as i32)?;
        self.invoke(g, &runtime::SET_LINE)
    }

    pub fn syntax_err(&self, g: &Gen, msg: impl Into<std::borrow::Cow<'static, str>>, node: &impl Ranged) -> CompileError {
        CompileError::syntax(msg, g.map.range(node.range()))
    }

    pub fn unsupported(&self, g: &Gen, what: impl Into<std::borrow::Cow<'static, str>>, node: &impl Ranged) -> CompileError {
        CompileError::not_implemented(what, g.map.range(node.range()))
    }
}
