// Integration tests for the Strand VM
//
// These tests compile and run complete Strand programs through the public
// API and check the results. Tests cover:
// - Arithmetic and scope cleanup
// - Classes, accessor overrides and mutability locks
// - Closures and fibers
// - Bytecode serialization
// - Async natives and breakpoints

use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;
use strand::bytecode::{deserialize, disassemble, serialize};
use strand::config::VmConfig;
use strand::debug::{BreakpointView, Inspector};
use strand::errors::StrandError;
use strand::lexer::SourceFile;
use strand::runtime::natives::GLOBAL_MODULE;
use strand::runtime::{NativeCtx, NativeFunction, RuntimeContext};
use strand::value::Value;
use strand::vm::{CapturedOutput, Vm};

fn run_code(code: &str) -> (Value, String) {
    let output = CapturedOutput::new();
    let mut vm = Vm::with_output(VmConfig::default(), Box::new(output.clone()));
    match strand::run_on(&mut vm, "test.sd", code) {
        Ok(value) => (value, output.contents()),
        Err(err) => panic!("script failed: {}", err),
    }
}

fn eval(code: &str) -> String {
    run_code(code).0.to_string()
}

/// Records every breakpoint snapshot
#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<BreakpointView>>>);

impl Inspector for Recorder {
    fn on_breakpoint(&mut self, view: &BreakpointView) {
        self.0.borrow_mut().push(view.clone());
    }
}

fn run_with_breakpoints(code: &str, config: VmConfig) -> Vec<BreakpointView> {
    let recorder = Recorder::default();
    let mut vm = Vm::with_output(config, Box::new(CapturedOutput::new()));
    vm.set_inspector(Box::new(recorder.clone()));
    strand::run_on(&mut vm, "bp.sd", code).expect("script runs");
    let views = recorder.0.borrow().clone();
    views
}

#[test]
fn test_numeric_results() {
    assert!(matches!(run_code("1 + 2").0, Value::Int(3)));
    assert!(matches!(run_code("5 / 2").0, Value::Double(d) if d == 2.5));
    assert!(matches!(run_code("4 / 2").0, Value::Int(2)));
    assert!(matches!(run_code("nil + 5").0, Value::Nil));
    assert!(matches!(run_code("2.5 * 2").0, Value::Double(d) if d == 5.0));
}

#[test]
fn test_if_expression_requires_else() {
    assert_eq!(eval("let v = if true { 1 } else { 2 }\nv"), "1");
    let ctx = RuntimeContext::new();
    let err = strand::compile_source("t.sd", "let v = if true { 1 }", &ctx, &VmConfig::default()).unwrap_err();
    assert!(err.message.contains("else"), "{}", err.message);
}

#[test]
fn test_trailing_if_else_is_the_block_value() {
    let code = "
        fn pick(x) { if x { 1 } else { 2 } }
        fn sign(n) {
            if n < 0 { \"neg\" } else if n == 0 { \"zero\" } else { \"pos\" }
        }
        fn partial(x) { if x { 1 } }
        [pick(true), pick(false), sign(-3), sign(0), sign(8), partial(true)]
    ";
    assert_eq!(eval(code), "[1, 2, \"neg\", \"zero\", \"pos\", nil]");
    assert_eq!(eval("let r = { let a = 4\n if a > 3 { a * 10 } else { 0 } }\nr"), "40");
}

#[test]
fn test_trailing_when_is_the_block_value() {
    let code = "
        fn name(n) {
            when n {
                1 -> \"one\"
                2, 3 -> { let s = \"few\"\n s }
                else -> \"many\"
            }
        }
        fn partial(n) { when n { 1 -> \"one\" } }
        [name(1), name(3), name(9), partial(1)]
    ";
    assert_eq!(eval(code), "[\"one\", \"few\", \"many\", nil]");
}

#[test]
fn test_trailing_branches_with_only_side_effects() {
    let code = "
        let log = []
        fn act(x) {
            if x { log.add(\"yes\")\n let unused = 1 } else { let y = 2 }
        }
        let loops = 0
        while loops < 3 {
            loops = loops + 1
            if loops == 2 { continue } else { log.add(loops) }
        }
        [act(true), act(false), log]
    ";
    assert_eq!(eval(code), "[nil, nil, [1, 3, \"yes\"]]");
}

#[test]
fn test_block_scope_cleanup_is_balanced() {
    let code = "
        let a = 1
        // @break
        {
            let b = 2
            let c = b + a
            { let d = c }
        }
        // @break
        a
    ";
    let views = run_with_breakpoints(code, VmConfig::default());
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].stack_depth, views[1].stack_depth);
    assert_eq!(views[0].line, Some(4));
}

#[test]
fn test_break_from_nested_block_is_balanced() {
    let code = "
        let n = 0
        // @break
        while true {
            let x = 1
            {
                let y = x + 1
                if y > 1 {
                    let z = y
                    n = z
                    break
                }
            }
        }
        // @break
        n
    ";
    let views = run_with_breakpoints(code, VmConfig::default());
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].stack_depth, views[1].stack_depth);
    assert!(matches!(views[1].local("n"), Some(Value::Int(2))));
}

#[test]
fn test_breakpoint_sees_frames_and_locals() {
    let code = "
        fn inner(p) {
            let q = p * 2
            // @break
            q
        }
        inner(21)
    ";
    let views = run_with_breakpoints(code, VmConfig::default());
    assert_eq!(views.len(), 1);
    let view = &views[0];
    let names: Vec<&str> = view.frames.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(names, vec!["<script>", "inner"]);
    assert!(matches!(view.local("p"), Some(Value::Int(21))));
    assert!(matches!(view.local("q"), Some(Value::Int(42))));
}

#[test]
fn test_release_mode_skips_breakpoints() {
    let code = "let a = 1\n// @break\na";
    let config = VmConfig { breakpoints: false, ..VmConfig::default() };
    assert!(run_with_breakpoints(code, config).is_empty());
}

#[test]
fn test_redeclaration_and_shadowing() {
    let ctx = RuntimeContext::new();
    let config = VmConfig::default();
    assert!(strand::compile_source("t.sd", "let a = 1\nlet a = 2", &ctx, &config).is_err());
    assert_eq!(eval("let a = 1\nlet r = 0\n{ let a = 2\n r = a }\nr + a"), "3");
}

#[test]
fn test_multiple_inheritance_getter_and_is() {
    let code = "
        class A { a = 1 }
        class B { fn get(name) = name + \"!\" }
        class C : A, B { }
        class D { }
        let c = C()
        [c.hello, c is A, c is B, c is C, c is D]
    ";
    assert_eq!(eval(code), "[\"hello!\", 1, 1, 1, 0]");
}

#[test]
fn test_mixins_contribute_methods() {
    let code = "
        class Greets { fn greet() = \"hi \" + self.name }
        class Person with Greets { name = \"ada\" }
        Person().greet()
    ";
    assert_eq!(eval(code), "hi ada");
}

#[test]
fn test_locked_instance_is_unchanged() {
    let code = "
        let items = [1, 2]
        items.lock()
        let a = items.add(3)
        let b = items.clear()
        let c = items[0] = 9
        [items, a is MutabilityLockException, b is MutabilityLockException, c is MutabilityLockException]
    ";
    assert_eq!(eval(code), "[[1, 2], 1, 1, 1]");
}

#[test]
fn test_locked_map_is_unchanged() {
    let code = "
        let m = [\"a\": 1]
        m.lock()
        let a = m.put(\"b\", 2)
        let b = m.clear()
        let c = m.merge([\"z\": 26])
        let d = m[\"a\"] = 5
        [m, a is MutabilityLockException, b is MutabilityLockException, c is MutabilityLockException, d is MutabilityLockException]
    ";
    assert_eq!(eval(code), "[[\"a\": 1], 1, 1, 1, 1]");
}

#[test]
fn test_locked_user_instance_keeps_fields() {
    let code = "
        class Point { x = 1\n y = 2 }
        let p = Point()
        p.x = 10
        p.lock()
        let r = p.y = 20
        [p.x, p.y, p.isLocked(), r is MutabilityLockException]
    ";
    assert_eq!(eval(code), "[10, 2, 1, 1]");
}

#[test]
fn test_closure_counter_outlives_frame() {
    let code = "
        fn make() {
            let count = 0
            fn() {
                count = count + 1
                count
            }
        }
        let next = make()
        next()
        next()
        next()
    ";
    assert_eq!(eval(code), "3");
}

#[test]
fn test_fiber_generator() {
    let code = "
        let gen = Fiber(fn() {
            for i in 0..3 { yield i }
            nil
        })
        let seen = []
        while !gen.isDone() {
            let v = gen.call()
            if v != nil { seen.add(v) }
        }
        seen
    ";
    assert_eq!(eval(code), "[0, 1, 2]");
}

#[test]
fn test_nested_fibers_return_to_their_caller() {
    let code = "
        let inner = Fiber(fn() { yield \"a\"\n \"b\" })
        let outer = Fiber(fn() {
            let first = inner.call()
            yield first + \"1\"
            inner.call() + \"2\"
        })
        [outer.call(), outer.call(), inner.isDone(), outer.isDone()]
    ";
    assert_eq!(eval(code), "[\"a1\", \"b2\", 1, 1]");
}

#[test]
fn test_async_natives_resume_with_result() {
    let path = std::env::temp_dir().join(format!("strand_async_{}.txt", std::process::id()));
    std::fs::write(&path, "payload").unwrap();
    let code = format!("Sys.sleep(5)\nFile.readAsync({:?})", path.display().to_string());
    assert_eq!(eval(&code), "payload");
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_print_writes_to_vm_output() {
    let (_, out) = run_code("for i in 1..4 { print(i * i) }");
    assert_eq!(out, "1\n4\n9\n");
}

#[test]
fn test_serialized_bytecode_runs_identically() {
    let code = "
        class Acc { total = 0\n fn add(n) { self.total = self.total + n } }
        let acc = Acc()
        let bump = fn(x = 2) = x * 3
        for i in 0..5 { acc.add(bump(i)) }
        acc.total + bump()
    ";
    let ctx = RuntimeContext::new();
    let function = strand::compile_source("t.sd", code, &ctx, &VmConfig::default()).unwrap();
    let text = serialize(&function).unwrap();
    let reloaded = deserialize(&text).unwrap();
    assert_eq!(disassemble(&function), disassemble(&reloaded));

    let run = |f: Rc<strand::bytecode::Function>| Vm::with_output(VmConfig::default(), Box::new(CapturedOutput::new())).interpret(f).unwrap().to_string();
    assert_eq!(run(function), "36");
    assert_eq!(run(reloaded), "36");
}

#[test]
fn test_non_finite_defaults_survive_serialization() {
    let code = "fn big(x = 1e999) = x\nfn small(x = -1e999) = x\n[big(), small(), big() > 1]";
    let ctx = RuntimeContext::new();
    let function = strand::compile_source("t.sd", code, &ctx, &VmConfig::default()).unwrap();
    let reloaded = deserialize(&serialize(&function).unwrap()).unwrap();
    let result = Vm::with_output(VmConfig::default(), Box::new(CapturedOutput::new())).interpret(reloaded).unwrap();
    assert_eq!(result.to_string(), "[inf, -inf, 1]");
}

fn host_twice(cx: &mut NativeCtx, _receiver: &Value, args: &[Value]) -> Value {
    match &args[0] {
        Value::Int(n) => Value::Int(n * 2),
        other => cx.ctx.error(strand::runtime::ErrorKind::IllegalArgument, format!("expected Int, got {}", other.type_name())),
    }
}

fn host_shout(_cx: &mut NativeCtx, receiver: &Value, _args: &[Value]) -> Value {
    Value::str(&format!("{}!", receiver.to_string().to_uppercase()))
}

#[test]
fn test_host_natives_and_globals() {
    let mut ctx = RuntimeContext::new();
    ctx.register_native(NativeFunction::sync(GLOBAL_MODULE, "twice", 1, host_twice));
    ctx.define_global("answer", Value::Int(21));
    let output = CapturedOutput::new();
    let mut vm = Vm::with_context(ctx, VmConfig::default(), Box::new(output.clone()));
    vm.context_mut().register_native(NativeFunction::sync("String", "shout", 0, host_shout));
    vm.context_mut().define_global("greeting", Value::str("hey"));

    let result = strand::run_on(&mut vm, "host.sd", "print(greeting.shout())\ntwice(answer)").unwrap();
    assert!(matches!(result, Value::Int(42)));
    assert_eq!(output.contents(), "HEY!\n");

    let err = strand::run_on(&mut vm, "host.sd", "twice(\"x\")").unwrap();
    assert!(err.to_string().contains("expected Int"), "{}", err);
}

#[test]
fn test_run_source_uses_a_fresh_vm() {
    assert!(matches!(strand::run_source("a.sd", "let a = 40\na + 2"), Ok(Value::Int(42))));
    // Globals from one run are not visible to the next
    assert!(matches!(strand::run_source("b.sd", "a"), Err(StrandError::Compile(_))));
}

#[test]
fn test_faults_abort_the_run() {
    let mut vm = Vm::with_output(VmConfig::default(), Box::new(CapturedOutput::new()));
    let err = strand::run_on(&mut vm, "t.sd", "let x = \"text\"\nx()").unwrap_err();
    assert!(matches!(err, StrandError::Fault(_)));

    let err = strand::run_on(&mut vm, "t.sd", "let x = 1\nclass C : x { }").unwrap_err();
    assert!(err.to_string().contains("not a class"), "{}", err);
}

#[test]
fn test_compile_error_reports_location() {
    let ctx = RuntimeContext::new();
    let source = SourceFile::new("t.sd", "let total = 1\nprint(totl)");
    let err = strand::compiler::compile(&source, &ctx).unwrap_err();
    assert_eq!(err.line, 2);
    assert_eq!(err.suggestion.as_deref(), Some("total"));
}
