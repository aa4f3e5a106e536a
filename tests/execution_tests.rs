// Integration tests for the Ape interpreter.
//
// These run complete programs through the public Context API and check the
// resulting values: literals and operators, control flow, closures,
// collections, template strings, operator overloading, recover, imports
// and the embedding surface.

use ape::{Context, ErrorKind, Value};
use std::cell::Cell;
use std::rc::Rc;

fn run(code: &str) -> (Context, Value) {
    let mut ctx = Context::new();
    let res = ctx.execute_source(code);
    assert!(
        !ctx.has_errors(),
        "unexpected errors for {:?}: {:?}",
        code,
        (0..ctx.error_count()).filter_map(|ix| ctx.get_error(ix)).map(|e| e.message).collect::<Vec<_>>()
    );
    (ctx, res)
}

fn run_number(code: &str) -> f64 {
    let (_, res) = run(code);
    match res {
        Value::Number(n) => n,
        other => panic!("expected number from {:?}, got {:?}", code, other),
    }
}

fn run_string(code: &str) -> String {
    let (ctx, res) = run(code);
    assert!(matches!(res, Value::Object(_)), "expected string from {:?}", code);
    ctx.stringify(res)
}

fn run_bool(code: &str) -> bool {
    let (_, res) = run(code);
    match res {
        Value::Bool(b) => b,
        other => panic!("expected bool from {:?}, got {:?}", code, other),
    }
}

// === End-to-end scenarios ===

#[test]
fn test_arithmetic_with_precedence() {
    assert_eq!(run_number("var a = 2 + 3 * 4; a;"), 14.0);
}

#[test]
fn test_template_string_interpolation() {
    assert_eq!(run_string(r#"var n = "world"; `hello, ${n}!`;"#), "hello, world!");
    assert_eq!(run_string(r#"`1 + 1 = ${1 + 1}`;"#), "1 + 1 = 2");
    assert_eq!(run_string(r#"`${1}${2}${3}`;"#), "123");
    // escaped placeholders stay literal
    assert_eq!(run_string(r#"`a \${x} b`;"#), "a ${x} b");
}

#[test]
fn test_closures_capture_enclosing_locals() {
    assert_eq!(
        run_number("function make(x) { return function(y) { return x + y; }; } make(10)(7);"),
        17.0
    );
}

#[test]
fn test_foreach_over_map_yields_key_value_pairs() {
    assert_eq!(
        run_number("var m = { a: 1, b: 2 }; var s = 0; for (k in m) { s = s + m[k.key]; } s;"),
        3.0
    );
    assert_eq!(
        run_number("var m = { a: 10, b: 20 }; var s = 0; for (k in m) { s = s + k.value; } s;"),
        30.0
    );
}

#[test]
fn test_recover_returns_caught_error_and_clears_errors() {
    let (ctx, res) = run(
        r#"function f() { recover (e) { return e; } crash("boom"); return 0; } f();"#,
    );
    assert!(matches!(res, Value::Object(_)));
    assert_eq!(ctx.stringify(res).lines().next(), Some("ERROR: boom"));
    assert!(!ctx.has_errors());
}

#[test]
fn test_negative_array_index_counts_from_end() {
    assert_eq!(run_number("var a = [1, 2, 3]; a[-1];"), 3.0);
    assert_eq!(run_number("var a = [1, 2, 3]; a[-3];"), 1.0);
}

#[test]
fn test_operator_overload_on_map() {
    assert_eq!(
        run_number(
            r#"var M = {}; M["__operator_add__"] = function(x, y) { return 42; }; M + 1;"#
        ),
        42.0
    );
}

// === Language surface ===

#[test]
fn test_if_else_if_else_chain() {
    let code = "function grade(n) { \
                  if (n > 89) { return \"a\"; } \
                  else if (n > 79) { return \"b\"; } \
                  else if (n > 69) { return \"c\"; } \
                  else { return \"f\"; } \
                } grade(85);";
    assert_eq!(run_string(code), "b");
}

#[test]
fn test_logical_operators_return_operand_values() {
    assert_eq!(run_number("null || 3;"), 3.0);
    assert_eq!(run_number("2 && 3;"), 3.0);
    assert_eq!(run_number("0 && 5;"), 0.0);
}

#[test]
fn test_ternary() {
    assert_eq!(run_number("1 < 2 ? 10 : 20;"), 10.0);
}

#[test]
fn test_compound_assignments() {
    assert_eq!(run_number("var x = 8; x >>= 2; x;"), 2.0);
    assert_eq!(run_number("var x = 5; x += 2; x *= 3; x;"), 21.0);
    assert_eq!(run_number("var x = 6; x &= 3; x;"), 2.0);
}

#[test]
fn test_prefix_and_postfix_incdec() {
    assert_eq!(run_number("var x = 3; ++x; x;"), 4.0);
    assert_eq!(run_number("var x = 3; --x;"), 2.0);
    // the postfix form evaluates to the old value
    assert_eq!(run_number("var x = 3; x++;"), 3.0);
    assert_eq!(run_number("var x = 3; x++; x;"), 4.0);
}

#[test]
fn test_postfix_incdec_on_index_targets() {
    assert_eq!(run_number("var a = [5]; a[0]++; a[0];"), 6.0);
    assert_eq!(run_number("var a = [5]; a[0]++;"), 5.0);
    assert_eq!(run_number("var m = { n: 1 }; m.n++; m.n;"), 2.0);
}

#[test]
fn test_string_operations() {
    assert_eq!(run_string(r#""foo" + "bar";"#), "foobar");
    assert_eq!(run_string(r#""n = " + 42;"#), "n = 42");
    assert_eq!(run_number(r#"len("hello");"#), 5.0);
    assert_eq!(run_string(r#"var s = "abc"; s[1];"#), "b");
}

#[test]
fn test_hex_number_literals() {
    assert_eq!(run_number("0xff;"), 255.0);
    assert_eq!(run_number("0x10 + 1;"), 17.0);
}

#[test]
fn test_modulus_and_shifts_truncate_to_integers() {
    assert_eq!(run_number("7.9 % 3;"), 1.0);
    assert_eq!(run_number("var a = 7.9; var b = 3; a % b;"), 1.0);
    assert_eq!(run_number("var a = 1; a << 4.7;"), 16.0);
}

#[test]
fn test_constant_folding_agrees_with_runtime() {
    // the left side folds at compile time, the right side runs in the VM
    for (folded, runtime) in [
        ("2 + 3 * 4;", "var a = 2; var b = 3; var c = 4; a + b * c;"),
        ("7 % 3;", "var a = 7; a % 3;"),
        ("1 << 6;", "var a = 1; a << 6;"),
        ("10 / 4;", "var a = 10; a / 4;"),
    ] {
        assert_eq!(run_number(folded), run_number(runtime), "mismatch for {}", folded);
    }
}

#[test]
fn test_functions_are_first_class() {
    assert_eq!(
        run_number(
            "function apply(f, x) { return f(x); } apply(function(n) { return n * n; }, 9);"
        ),
        81.0
    );
}

#[test]
fn test_direct_recursion_through_function_name() {
    assert_eq!(
        run_number("function fact(n) { if (n < 2) { return 1; } return n * fact(n - 1); } fact(6);"),
        720.0
    );
}

#[test]
fn test_anonymous_recursion_via_const() {
    assert_eq!(
        run_number("const fib = function(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); }; fib(10);"),
        55.0
    );
}

#[test]
fn test_closure_counter_mutates_captured_state() {
    assert_eq!(
        run_number(
            "function counter() { var n = 0; return function() { n += 1; return n; }; } \
             const c = counter(); c(); c(); c();"
        ),
        3.0
    );
}

#[test]
fn test_foreach_over_string() {
    assert_eq!(run_number(r#"var n = 0; for (ch in "abcd") { n = n + 1; } n;"#), 4.0);
}

#[test]
fn test_nested_loops_with_break_and_continue() {
    assert_eq!(
        run_number(
            "var s = 0; \
             for (var i = 0; i < 3; i++) { \
               for (var j = 0; j < 3; j++) { \
                 if (j == 2) { break; } \
                 if (i == 1) { continue; } \
                 s = s + 1; \
               } \
             } s;"
        ),
        4.0
    );
}

#[test]
fn test_map_iteration_order_is_insertion_order() {
    let code = r#"var m = { z: 1, a: 2, m: 3 }; var order = ""; for (k in m) { order = order + k.key; } order;"#;
    assert_eq!(run_string(code), "zam");
}

#[test]
fn test_maps_with_number_and_bool_keys() {
    assert_eq!(run_number("var m = { 1: 10, true: 20 }; m[1] + m[true];"), 30.0);
}

#[test]
fn test_builtin_library_surface() {
    assert_eq!(run_number("len([1, 2, 3]);"), 3.0);
    assert_eq!(run_string("tostring(14);"), "14");
    assert_eq!(run_number(r#"to_num("2.5") * 2;"#), 5.0);
    assert_eq!(run_number("len(range(5));"), 5.0);
    assert_eq!(run_number("var a = [1]; append(a, 9); a[1];"), 9.0);
    assert_eq!(run_number("len(keys({ a: 1, b: 2 }));"), 2.0);
    assert_eq!(run_bool(r#"is_error(error("x"));"#), true);
    assert_eq!(run_bool("is_error(1);"), false);
    assert_eq!(run_bool("assert(1 < 2);"), true);
}

#[test]
fn test_deep_copy_is_structural() {
    assert_eq!(
        run_number("var a = [[1]]; var b = deep_copy(a); b[0][0] = 9; a[0][0];"),
        1.0
    );
    // plain assignment shares structure
    assert_eq!(run_number("var a = [[1]]; var b = a; b[0][0] = 9; a[0][0];"), 9.0);
}

#[test]
fn test_unary_operators() {
    assert_eq!(run_number("-(3 + 4);"), -7.0);
    assert_eq!(run_bool("!false;"), true);
    assert_eq!(run_bool("!null;"), true);
}

#[test]
fn test_operator_overload_full_set() {
    let preamble = r#"
        var V = { n: 6 };
        V["__operator_sub__"] = function(a, b) { return a.n - b; };
        V["__operator_mul__"] = function(a, b) { return a.n * b; };
        V["__operator_minus__"] = function(a) { return 0 - a.n; };
        V["__operator_bang__"] = function(a) { return a.n == 0; };
    "#;
    assert_eq!(run_number(&format!("{} V - 1;", preamble)), 5.0);
    assert_eq!(run_number(&format!("{} V * 2;", preamble)), 12.0);
    assert_eq!(run_number(&format!("{} -V;", preamble)), -6.0);
    assert_eq!(run_bool(&format!("{} !V;", preamble)), false);
}

#[test]
fn test_this_is_captured_by_map_literal_methods() {
    // a function literal inside a map literal captures the map under
    // construction as `this`
    assert_eq!(
        run_number(
            "var obj = { value: 41, next: function() { return this.value + 1; } }; obj.next();"
        ),
        42.0
    );
    assert_eq!(
        run_number(
            "var counter = { n: 0, bump: function() { this.n = this.n + 1; return this.n; } }; \
             counter.bump(); counter.bump();"
        ),
        2.0
    );
}

#[test]
fn test_cmp_overload_drives_comparisons() {
    let code = r#"
        var V = { rank: 3, __cmp__: function(a, b) { return a.rank - b.rank; } };
        var W = { rank: 5, __cmp__: function(a, b) { return a.rank - b.rank; } };
        V < W ? 1 : 0;
    "#;
    // V < W compiles as W > V, so __cmp__ sees (W, V)
    assert_eq!(run_number(code), 1.0);
}

// === Errors and recover ===

#[test]
fn test_runtime_error_surfaces_with_traceback() {
    let mut ctx = Context::new();
    let res = ctx.execute_source("function f() { return null[0]; } f();");
    assert_eq!(res, Value::Null);
    assert_eq!(ctx.error_count(), 1);
    let error = ctx.get_error(0).unwrap();
    assert_eq!(error.kind, ErrorKind::Runtime);
    let traceback = error.traceback.expect("runtime error should carry a traceback");
    assert_eq!(traceback.items[0].function_name, "f");
}

#[test]
fn test_error_raised_inside_recover_body_surfaces() {
    let mut ctx = Context::new();
    let res = ctx.execute_source(
        r#"function f() { recover (e) { crash("second"); return e; } crash("first"); return 0; } f();"#,
    );
    assert_eq!(res, Value::Null);
    assert_eq!(ctx.error_count(), 1);
    assert_eq!(ctx.get_error(0).unwrap().message, "second");
}

#[test]
fn test_recover_in_caller_catches_callee_error() {
    let (ctx, res) = run(
        r#"function g() { crash("deep"); return 1; }
           function f() { recover (e) { return e; } return g(); }
           f();"#,
    );
    assert_eq!(ctx.stringify(res).lines().next(), Some("ERROR: deep"));
}

#[test]
fn test_error_values_are_inert_until_raised() {
    // error() builds a value; it does not raise
    let (ctx, res) = run(r#"var e = error("not raised"); is_error(e) ? 1 : 0;"#);
    assert_eq!(res, Value::Number(1.0));
    assert!(!ctx.has_errors());
}

#[test]
fn test_parse_errors_prevent_execution() {
    let mut ctx = Context::new();
    let res = ctx.execute_source("var = 1;");
    assert_eq!(res, Value::Null);
    assert!(ctx.error_count() >= 1);
    assert_eq!(ctx.get_error(0).unwrap().kind, ErrorKind::Parsing);
}

#[test]
fn test_compilation_errors_prevent_execution() {
    let mut ctx = Context::new();
    // the hook would observe any execution
    let hit = Rc::new(Cell::new(false));
    let flag = hit.clone();
    ctx.set_native_function("hook", move |_vm, _args| {
        flag.set(true);
        Value::Null
    });
    let res = ctx.execute_source("hook(); break;");
    assert_eq!(res, Value::Null);
    assert_eq!(ctx.get_error(0).unwrap().kind, ErrorKind::Compilation);
    assert!(!hit.get(), "no bytecode may run when compilation fails");
}

#[test]
fn test_error_positions_point_at_source() {
    let mut ctx = Context::new();
    ctx.execute_source("var a = 1;\nvar b = null[0];");
    let error = ctx.get_error(0).unwrap();
    assert_eq!(error.position.line, 1);
}

// === Imports ===

#[test]
fn test_import_shares_one_compilation() {
    let reads = Rc::new(Cell::new(0usize));
    let counter = reads.clone();
    let mut ctx = Context::new();
    ctx.set_file_read(Box::new(move |path| match path {
        "a.ape" => Some(r#"import "c"; const a_val = c::base + 1;"#.to_string()),
        "b.ape" => Some(r#"import "c"; const b_val = c::base + 2;"#.to_string()),
        "c.ape" => {
            counter.set(counter.get() + 1);
            Some("const base = 10;".to_string())
        }
        _ => None,
    }));
    let res = ctx.execute_source(r#"import "a"; import "b"; a::a_val + b::b_val;"#);
    assert_eq!(res, Value::Number(23.0));
    // the diamond dependency compiled once
    assert_eq!(reads.get(), 1);
}

#[test]
fn test_module_cache_clear_forces_reload() {
    let reads = Rc::new(Cell::new(0usize));
    let counter = reads.clone();
    let mut ctx = Context::new();
    ctx.set_file_read(Box::new(move |path| match path {
        "m.ape" => {
            counter.set(counter.get() + 1);
            Some("const x = 1;".to_string())
        }
        _ => None,
    }));
    ctx.set_repl_mode(true);
    ctx.execute_source(r#"import "m";"#);
    assert_eq!(reads.get(), 1);
    ctx.clear_module_cache();
    ctx.execute_source(r#"import "m";"#);
    assert_eq!(reads.get(), 2);
}

#[test]
fn test_imported_functions_are_callable() {
    let mut ctx = Context::new();
    ctx.set_file_read(Box::new(|path| match path {
        "lib.ape" => Some("function helper(x) { return x * 2; }".to_string()),
        _ => None,
    }));
    let res = ctx.execute_source(r#"import "lib"; lib::helper(21);"#);
    assert_eq!(res, Value::Number(42.0));
}

#[test]
fn test_import_resolves_relative_to_importing_file() {
    let mut ctx = Context::new();
    ctx.set_file_read(Box::new(|path| match path {
        "dir/main.ape" => Some(r#"import "sub/lib"; lib::nine();"#.to_string()),
        "dir/sub/lib.ape" => Some("function nine() { return 9; }".to_string()),
        _ => None,
    }));
    // the qualified name uses the module's basename
    let res = ctx.execute_file("dir/main.ape");
    assert!(!ctx.has_errors(), "{:?}", ctx.get_error(0).map(|e| e.message));
    assert_eq!(res, Value::Number(9.0));
}

#[test]
fn test_cyclic_import_is_rejected() {
    let mut ctx = Context::new();
    ctx.set_file_read(Box::new(|path| match path {
        "x.ape" => Some(r#"import "y";"#.to_string()),
        "y.ape" => Some(r#"import "x";"#.to_string()),
        _ => None,
    }));
    ctx.execute_source(r#"import "x";"#);
    assert!(ctx.has_errors());
    assert!(ctx.get_error(0).unwrap().message.contains("cyclic reference"));
}

// === Embedding surface ===

#[test]
fn test_successive_executions_share_module_globals() {
    let mut ctx = Context::new();
    ctx.set_repl_mode(true);
    ctx.execute_source("var total = 0;");
    ctx.execute_source("total = total + 5;");
    let res = ctx.execute_source("total;");
    assert_eq!(res, Value::Number(5.0));
}

#[test]
fn test_host_globals_win_over_script_definitions() {
    let mut ctx = Context::new();
    ctx.set_global("answer", Value::Number(42.0));
    // defining over a host global is rejected
    ctx.execute_source("var answer = 1;");
    assert!(ctx.has_errors());
}

#[test]
fn test_gc_heavy_program_is_stable() {
    let code = "
        var acc = [];
        for (var i = 0; i < 200; i++) {
            var m = { ix: i, name: `item ${i}` };
            if (i % 7 == 0) { acc = acc + m; }
        }
        var total = 0;
        for (entry in acc) { total = total + entry.ix; }
        total;
    ";
    // 0 + 7 + ... + 196
    assert_eq!(run_number(code), (0..200).filter(|n| n % 7 == 0).sum::<i64>() as f64);
}

#[test]
fn test_deterministic_results_across_fresh_contexts() {
    let code = "var parts = []; for (var i = 0; i < 10; i++) { parts = parts + i * i; } parts[-1];";
    assert_eq!(run_number(code), run_number(code));
}
