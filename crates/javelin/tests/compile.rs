//! End-to-end compilation tests: source text in, class-file bytes out.
//!
//! Nothing here executes the emitted bytecode; the assertions cover the
//! class-file envelope, the one-method-per-scope layout, exception-table
//! shapes, and the errors reported for unsupported or invalid input.

use javelin::{CompileOptions, CompiledModule, compile};
use pretty_assertions::assert_eq;

fn build(source: &str) -> CompiledModule {
    compile(source, &CompileOptions::default()).expect("source should compile")
}

fn build_err(source: &str) -> String {
    match compile(source, &CompileOptions::default()) {
        Ok(_) => panic!("source compiled unexpectedly"),
        Err(err) => err.to_string(),
    }
}

fn method_names(module: &CompiledModule) -> Vec<&str> {
    module.methods.iter().map(|m| m.name.as_str()).collect()
}

#[test]
fn class_file_envelope() {
    let module = build("pass\n");
    assert_eq!(&module.bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
    // Minor 0, major 49: old enough that no stack map table is needed.
    assert_eq!(&module.bytes[4..8], &[0, 0, 0, 49]);
}

#[test]
fn class_name_follows_module_name() {
    let options = CompileOptions {
        module_name: "my.mod".to_string(),
        ..CompileOptions::default()
    };
    let module = compile("pass\n", &options).unwrap();
    assert_eq!(module.class_name, "my_mod$py");
}

#[test]
fn output_is_deterministic() {
    let source = "def f(x):\n    return x + 1\n\ny = [f(i) for i in range(3)]\n";
    let first = build(source);
    let second = build(source);
    assert_eq!(first.bytes, second.bytes);
}

#[test]
fn one_method_per_scope() {
    let module = build("def f(x):\n    return x\n");
    assert_eq!(method_names(&module), vec!["module$0", "f$1"]);
}

#[test]
fn hidden_scopes_get_methods_too() {
    let module = build("ys = [x for x in xs]\ng = lambda: 1\n");
    assert_eq!(method_names(&module), vec!["module$0", "listcomp$1", "lambda$2"]);
}

#[test]
fn nested_closures_compile_in_definition_order() {
    let source = "
def outer():
    x = 1
    def inner():
        return x
    return inner
";
    let module = build(source);
    assert_eq!(method_names(&module), vec!["module$0", "outer$1", "inner$2"]);
}

#[test]
fn class_bodies_are_scopes() {
    let source = "
class Greeter:
    prefix = 'hi '
    def greet(self, name):
        return self.prefix + name
";
    let module = build(source);
    assert_eq!(method_names(&module), vec!["module$0", "Greeter$1", "greet$2"]);
}

#[test]
fn generators_compile() {
    let source = "
def countdown(n):
    while n > 0:
        yield n
        n = n - 1
";
    let module = build(source);
    assert_eq!(method_names(&module), vec!["module$0", "countdown$1"]);
    // The generator body dispatches on the resume point.
    assert!(module.methods[1].code.code.contains(&0xAAu8));
}

#[test]
fn break_jumps_past_the_loop_else_clause() {
    let source = "
def f(xs, c):
    for i in xs:
        if c:
            break
    else:
        report(xs)
";
    let module = build(source);
    let code = &module.methods[1].code.code;
    // The loop is the body's last statement, so the break target is the
    // implicit-None return (getstatic + areturn); landing there proves
    // the jump clears the else clause with no flag variable.
    let end = code.len() - 4;
    let targets: Vec<usize> = code
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == 0xA7)
        .filter_map(|(pc, _)| {
            let off = i16::from_be_bytes([*code.get(pc + 1)?, *code.get(pc + 2)?]);
            pc.checked_add_signed(isize::from(off))
        })
        .collect();
    assert!(targets.contains(&end), "goto targets {targets:?}, want {end}");
}

#[test]
fn yield_inside_try_splits_the_protected_range() {
    // The handler must not cover the suspend/restore stretch around the
    // yield, only the Python-level body on both sides of it.
    let source = "
def g():
    try:
        yield 1
    except ValueError:
        pass
";
    let module = build(source);
    assert_eq!(module.methods[1].code.exceptions.len(), 2);
}

#[test]
fn every_exit_path_returns() {
    let source = "
def f(x):
    if x:
        g()
";
    let module = build(source);
    for method in &module.methods {
        // areturn: both the taken and fall-through paths end by
        // returning the implicit None.
        assert_eq!(*method.code.code.last().unwrap(), 0xB0);
    }
}

#[test]
fn try_except_emits_a_handler_range() {
    let source = "
try:
    risky()
except ValueError as e:
    handle(e)
";
    let module = build(source);
    assert_eq!(module.methods[0].code.exceptions.len(), 1);
}

#[test]
fn bare_except_must_come_last() {
    let source = "
try:
    risky()
except:
    pass
except ValueError:
    pass
";
    let message = build_err(source);
    assert!(message.contains("default 'except' must be last"), "{message}");
}

#[test]
fn break_through_finally_splits_the_protected_range() {
    // The inlined finally body at the break must not be covered by the
    // finally's own catch-all, so the range splits around it.
    let source = "
for i in xs:
    try:
        break
    finally:
        cleanup()
";
    let module = build(source);
    assert_eq!(module.methods[0].code.exceptions.len(), 2);
}

#[test]
fn plain_try_body_is_one_contiguous_range() {
    let source = "
def f(xs):
    for i in xs:
        try:
            step(i)
        except StopIteration:
            break
";
    let module = build(source);
    assert_eq!(module.methods[1].code.exceptions.len(), 1);
}

#[test]
fn with_statement_compiles() {
    let source = "
with open(p) as f:
    data = f.read()
";
    let module = build(source);
    assert_eq!(module.methods[0].code.exceptions.len(), 1);
}

#[test]
fn line_numbers_are_optional() {
    let source = "x = 1\ny = 2\n";
    let with_lines = build(source);
    let without = compile(
        source,
        &CompileOptions {
            linenumbers: false,
            ..CompileOptions::default()
        },
    )
    .unwrap();
    assert!(!with_lines.methods[0].code.line_numbers.is_empty());
    assert!(without.methods[0].code.line_numbers.is_empty());
    assert_ne!(with_lines.bytes, without.bytes);
}

#[test]
fn oversized_body_needs_a_precompiled_blob() {
    // Enough statements to overflow the 65535-byte method limit.
    let source = "x = 1\n".repeat(12_000);
    let message = build_err(&source);
    assert!(message.contains("precompiled fallback"), "{message}");

    // A supplied blob larger than one Utf8 constant allows still compiles;
    // the body becomes a trampoline over the chunked blob.
    let blob = vec![0xABu8; 70_000];
    let mut options = CompileOptions::default();
    options.precompiled.insert("<module>".to_string(), blob);
    let module = compile(&source, &options).unwrap();
    assert!(module.methods[0].code.code.len() < 100);
}

#[test]
fn huge_string_literals_are_rejected_not_truncated() {
    let source = format!("s = \"{}\"\n", "a".repeat(70_000));
    let message = build_err(&source);
    assert!(message.contains("65535"), "{message}");
}

#[test]
fn print_results_changes_module_statements() {
    let source = "1 + 1\n";
    let quiet = build(source);
    let chatty = compile(
        source,
        &CompileOptions {
            print_results: true,
            ..CompileOptions::default()
        },
    )
    .unwrap();
    assert_ne!(quiet.bytes, chatty.bytes);
}

#[test]
fn surface_features_compile() {
    // A smoke test over constructs that exercise most of the lowering.
    let source = "
import os.path
from sys import argv as args

a, *rest = args
total = 0
for n in rest:
    if 0 < int(n) <= 100:
        total += int(n)
    else:
        continue

label = f'total={total:>6}'
table = {n: n * n for n in range(10) if n % 2}
assert total >= 0, 'negative total'

def fmt(prefix, *, sep=': '):
    return prefix + sep + label

del a
print(fmt('sum'))
";
    let module = build(source);
    assert_eq!(module.methods.len(), 3);
}

#[test]
fn return_outside_function_is_rejected() {
    let err = build_err("return 1\n");
    assert!(err.contains("'return' outside function"), "{err}");
}

#[test]
fn match_statements_are_not_supported() {
    let err = build_err("match x:\n    case 1:\n        pass\n");
    assert!(err.contains("match statements"), "{err}");
}

#[test]
fn yield_from_is_not_supported() {
    let err = build_err("def f():\n    yield from xs\n");
    assert!(err.contains("yield from"), "{err}");
}

#[test]
fn starred_call_arguments_are_not_supported() {
    let err = build_err("f(*args)\n");
    assert!(err.contains("argument unpacking"), "{err}");
}

#[test]
fn keyword_unpacking_is_not_supported() {
    let err = build_err("f(**kwargs)\n");
    assert!(err.contains("keyword argument unpacking"), "{err}");
}

#[test]
fn async_functions_are_not_supported() {
    let err = build_err("async def f():\n    pass\n");
    assert!(err.contains("async functions"), "{err}");
}

#[test]
fn errors_carry_line_numbers() {
    let err = build_err("x = 1\ny = 2\nmatch x:\n    case 1:\n        pass\n");
    assert!(err.contains("line 3"), "{err}");
}
