#![doc = include_str!("../../../README.md")]

pub mod classfile;
mod codegen;
mod constants;
mod error;
mod parse;
mod runtime;
mod scope;

use ahash::AHashMap;

pub use classfile::MethodCode;
pub use error::CompileError;
pub use parse::{CodeLoc, CodeRange};

/// Knobs for a single compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Source file name recorded in the class file and its annotations.
    pub filename: String,
    /// Dotted module name; it becomes the class name after sanitizing.
    pub module_name: String,
    /// Emit line-number tables and frame position updates.
    pub linenumbers: bool,
    /// Print the value of bare expression statements at module level,
    /// the way the interactive prompt does.
    pub print_results: bool,
    /// Source modification time recorded for staleness checks, or -1.
    pub mtime: Option<i64>,
    /// Precompiled fallback blobs by scope name, used when a body
    /// overflows the JVM method size limit.
    pub precompiled: AHashMap<String, Vec<u8>>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            filename: "<string>".to_string(),
            module_name: "__main__".to_string(),
            linenumbers: true,
            print_results: false,
            mtime: None,
            precompiled: AHashMap::new(),
        }
    }
}

/// One emitted body method, exposed for inspection and testing.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub name: String,
    pub code: MethodCode,
}

/// The result of compiling one module: a single JVM class.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    /// Binary class name, e.g. `mymodule$py`.
    pub class_name: String,
    /// The assembled class file.
    pub bytes: Vec<u8>,
    pub methods: Vec<CompiledMethod>,
}

/// Compiles Python source to a JVM class file.
pub fn compile(source: &str, options: &CompileOptions) -> Result<CompiledModule, CompileError> {
    let (module, _) = parse::parse(source)?;
    compile_ast(&module, source, options)
}

/// Compiles an already-parsed module. `source` must be the text the tree
/// was parsed from; line numbers are recovered from it.
pub fn compile_ast(
    module: &ruff_python_ast::ModModule,
    source: &str,
    options: &CompileOptions,
) -> Result<CompiledModule, CompileError> {
    let map = parse::SourceMap::new(source);
    let tree = scope::ScopeTree::resolve(module, &map)?;
    codegen::compile_module(module, &tree, &map, options)
}
