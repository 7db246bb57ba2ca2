//! End-to-end tests of the runtime through its public API.

use std::sync::Arc;

use quickrt::config::{GcMode, RuntimeConfig};
use quickrt::{JValue, Program, Runtime, RuntimeError};

fn runtime_with(config: RuntimeConfig, source: &str) -> Arc<Runtime> {
    let runtime = Runtime::new(config).unwrap();
    runtime
        .load_program(&Program::from_toml_str(source).unwrap())
        .unwrap();
    runtime
}

fn runtime(source: &str) -> Arc<Runtime> {
    runtime_with(RuntimeConfig::default(), source)
}

fn run(source: &str, entry: &str, args: &[JValue]) -> quickrt::Result<JValue> {
    let runtime = runtime(source);
    let mut ctx = runtime.attach_current_thread("main");
    ctx.invoke(entry, args)
}

fn uncaught(result: quickrt::Result<JValue>) -> (String, String, Vec<String>) {
    match result {
        Err(RuntimeError::UncaughtException {
            class,
            message,
            trace,
        }) => (class, message, trace),
        other => panic!("expected an uncaught exception, got {:?}", other),
    }
}

const POINT: &str = r#"
[[classes]]
name = "Point"
fields = [{ name = "x", kind = "int" }, { name = "y", kind = "int" }]

[[methods]]
name = "Main.main"
registers = 3
code = [
    { op = "new-instance", dst = 0, class = "Point" },
    { op = "const", dst = 1, value = 3 },
    { op = "iput", src = 1, obj = 0, field = "Point.x" },
    { op = "const", dst = 1, value = 4 },
    { op = "iput-quick", kind = "int", src = 1, obj = 0, offset = 12 },
    { op = "iget-quick", kind = "int", dst = 1, obj = 0, offset = 8 },
    { op = "iget", dst = 2, obj = 0, field = "Point.y" },
    { op = "mul-int", dst = 1, a = 1, b = 2 },
    { op = "return", src = 1 },
]

[[methods]]
name = "Main.readX"
registers = 2
ins = 1
code = [
    { op = "iget", dst = 0, obj = 1, field = "Point.x" },
    { op = "return", src = 0 },
]
"#;

#[test]
fn test_generic_and_quick_field_access_agree() {
    assert_eq!(run(POINT, "Main.main", &[]).unwrap(), JValue::Int(12));
}

#[test]
fn test_generic_get_on_null_names_the_field() {
    let (class, message, trace) = uncaught(run(POINT, "Main.readX", &[JValue::null()]));
    assert_eq!(class, "java.lang.NullPointerException");
    assert_eq!(
        message,
        "Attempt to read from field 'Point.x' on a null object reference"
    );
    assert_eq!(trace, vec!["Main.readX (dex pc 0)".to_string()]);
}

const EXCEPTIONS: &str = r#"
[[classes]]
name = "Circle"

[[classes]]
name = "Square"

[[methods]]
name = "Main.divide"
registers = 3
ins = 2
code = [
    { op = "div-int", dst = 0, a = 1, b = 2 },
    { op = "return", src = 0 },
]

[[methods]]
name = "Main.safeDivide"
registers = 4
ins = 2
code = [
    { op = "invoke", method = "Main.divide", args = [2, 3], dst = 0 },
    { op = "return", src = 0 },
    { op = "move-exception", dst = 1 },
    { op = "const", dst = 0, value = -1 },
    { op = "return", src = 0 },
]
tries = [{ start = 0, end = 1, handler = 2, class = "java.lang.ArithmeticException" }]

[[methods]]
name = "Main.castFails"
registers = 3
code = [
    { op = "new-instance", dst = 0, class = "Circle" },
    { op = "const", dst = 1, value = 99 },
    { op = "check-cast", dst = 1, src = 0, class = "Square" },
    { op = "const", dst = 1, value = 0 },
    { op = "return", src = 1 },
    { op = "move-exception", dst = 2 },
    { op = "instance-of", dst = 2, src = 2, class = "java.lang.ClassCastException" },
    { op = "add-int", dst = 1, a = 1, b = 2 },
    { op = "return", src = 1 },
]
tries = [{ start = 2, end = 3, handler = 5 }]

[[methods]]
name = "Main.instanceOf"
registers = 3
code = [
    { op = "new-instance", dst = 0, class = "Circle" },
    { op = "instance-of", dst = 1, src = 0, class = "Circle" },
    { op = "instance-of", dst = 2, src = 0, class = "Square" },
    { op = "add-int", dst = 1, a = 1, b = 1 },
    { op = "add-int", dst = 1, a = 1, b = 2 },
    { op = "const-null", dst = 0 },
    { op = "instance-of", dst = 2, src = 0, class = "Circle" },
    { op = "add-int", dst = 1, a = 1, b = 2 },
    { op = "return", src = 1 },
]

[[methods]]
name = "Main.throwNull"
registers = 1
code = [
    { op = "const-null", dst = 0 },
    { op = "throw", src = 0 },
]

[[methods]]
name = "Main.throwCircle"
registers = 1
code = [
    { op = "new-instance", dst = 0, class = "Circle" },
    { op = "throw", src = 0 },
]

[[methods]]
name = "Main.rethrow"
registers = 2
code = [
    { op = "const-null", dst = 0 },
    { op = "throw", src = 0 },
    { op = "move-exception", dst = 1 },
    { op = "throw", src = 1 },
]
tries = [{ start = 0, end = 2, handler = 2, class = "java.lang.NullPointerException" }]
"#;

#[test]
fn test_exception_caught_in_caller_frame() {
    let runtime = runtime(EXCEPTIONS);
    let mut ctx = runtime.attach_current_thread("main");
    let ok = ctx.invoke("Main.safeDivide", &[JValue::Int(12), JValue::Int(4)]);
    assert_eq!(ok.unwrap(), JValue::Int(3));
    let caught = ctx.invoke("Main.safeDivide", &[JValue::Int(12), JValue::Int(0)]);
    assert_eq!(caught.unwrap(), JValue::Int(-1));
    assert!(!ctx.is_exception_pending());
}

#[test]
fn test_uncaught_exception_carries_stack_trace() {
    let (class, message, trace) = uncaught(run(
        EXCEPTIONS,
        "Main.divide",
        &[JValue::Int(1), JValue::Int(0)],
    ));
    assert_eq!(class, "java.lang.ArithmeticException");
    assert_eq!(message, "divide by zero");
    assert_eq!(trace, vec!["Main.divide (dex pc 0)".to_string()]);
}

#[test]
fn test_failed_check_cast_leaves_destination_unchanged() {
    // 99 survives the failed cast; the handler adds 1 for the right class.
    assert_eq!(run(EXCEPTIONS, "Main.castFails", &[]).unwrap(), JValue::Int(100));
}

#[test]
fn test_instance_of_results() {
    assert_eq!(run(EXCEPTIONS, "Main.instanceOf", &[]).unwrap(), JValue::Int(2));
}

#[test]
fn test_throw_null_and_non_throwable() {
    let (class, message, _) = uncaught(run(EXCEPTIONS, "Main.throwNull", &[]));
    assert_eq!(class, "java.lang.NullPointerException");
    assert_eq!(message, "throw with null exception");

    let (class, message, _) = uncaught(run(EXCEPTIONS, "Main.throwCircle", &[]));
    assert_eq!(class, "java.lang.ClassCastException");
    assert_eq!(message, "Circle cannot be cast to java.lang.Throwable");
}

#[test]
fn test_rethrow_from_handler() {
    let (class, _, _) = uncaught(run(EXCEPTIONS, "Main.rethrow", &[]));
    assert_eq!(class, "java.lang.NullPointerException");
}

const WIDE: &str = r#"
[[classes]]
name = "Counter"
fields = [{ name = "flag", kind = "boolean" }, { name = "total", kind = "wide" }]

[[methods]]
name = "Main.main"
registers = 5
code = [
    { op = "new-instance", dst = 0, class = "Counter" },
    { op = "const-wide", dst = 1, value = 4294967296 },
    { op = "const-wide", dst = 3, value = 5 },
    { op = "add-long", dst = 1, a = 1, b = 3 },
    { op = "iput-quick", kind = "wide", src = 1, obj = 0, offset = 8 },
    { op = "iget-quick", kind = "wide", dst = 3, obj = 0, offset = 8 },
    { op = "return-wide", src = 3 },
]
"#;

#[test]
fn test_wide_values_use_register_pairs() {
    assert_eq!(
        run(WIDE, "Main.main", &[]).unwrap(),
        JValue::Wide(4_294_967_301)
    );
}

fn load(runtime: &Runtime, source: &str) -> quickrt::Result<()> {
    runtime.load_program(&Program::from_toml_str(source).unwrap())
}

#[test]
fn test_generic_wide_field_needs_register_pair() {
    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let put = r#"
[[classes]]
name = "Box"
fields = [{ name = "w", kind = "wide" }]

[[methods]]
name = "Main.main"
registers = 2
code = [
    { op = "new-instance", dst = 0, class = "Box" },
    { op = "const", dst = 1, value = 7 },
    { op = "iput", src = 1, obj = 0, field = "Box.w" },
    { op = "return-void" },
]
"#;
    match load(&runtime, put) {
        Err(RuntimeError::InvalidProgram(message)) => {
            assert!(message.contains("Box.w"), "{}", message)
        }
        other => panic!("expected a link error, got {:?}", other),
    }

    let get = put.replace(
        r#"{ op = "iput", src = 1, obj = 0, field = "Box.w" }"#,
        r#"{ op = "iget", dst = 1, obj = 0, field = "Box.w" }"#,
    );
    assert!(matches!(
        load(&runtime, &get),
        Err(RuntimeError::InvalidProgram(_))
    ));
}

#[test]
fn test_wide_field_of_later_class_raises_verify_error() {
    let runtime = runtime(
        r#"
[[methods]]
name = "Main.peek"
registers = 2
code = [
    { op = "new-instance", dst = 0, class = "Late" },
    { op = "iget", dst = 1, obj = 0, field = "Late.w" },
    { op = "return-void" },
]
"#,
    );
    load(
        &runtime,
        r#"
[[classes]]
name = "Late"
fields = [{ name = "w", kind = "wide" }]
"#,
    )
    .unwrap();

    let mut ctx = runtime.attach_current_thread("main");
    let (class, message, trace) = uncaught(ctx.invoke("Main.peek", &[]));
    assert_eq!(class, "java.lang.VerifyError");
    assert!(message.contains("Late.w"), "{}", message);
    assert_eq!(trace, vec!["Main.peek (dex pc 1)".to_string()]);
}

#[test]
fn test_failed_load_leaves_no_classes_behind() {
    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let broken = r#"
[[classes]]
name = "Pt"
fields = [{ name = "x", kind = "int" }]

[[methods]]
name = "Main.main"
registers = 1
code = [{ op = "nop" }]
"#;
    assert!(load(&runtime, broken).is_err());
    assert!(runtime.classes().lookup("Pt").is_none());
    assert!(runtime.method_by_name("Main.main").is_none());

    let fixed = broken.replace(r#"{ op = "nop" }"#, r#"{ op = "return-void" }"#);
    load(&runtime, &fixed).unwrap();
    assert!(runtime.classes().lookup("Pt").is_some());
    let mut ctx = runtime.attach_current_thread("main");
    assert_eq!(ctx.invoke("Main.main", &[]).unwrap(), JValue::Void);
}

const RECURSE: &str = r#"
[[methods]]
name = "Main.forever"
registers = 1
ins = 1
code = [
    { op = "invoke", method = "Main.forever", args = [0] },
    { op = "return-void" },
]
"#;

#[test]
fn test_unbounded_recursion_overflows() {
    let config = RuntimeConfig {
        max_stack_depth: 64,
        ..RuntimeConfig::default()
    };
    let runtime = runtime_with(config, RECURSE);
    let mut ctx = runtime.attach_current_thread("main");
    let (class, _, trace) = uncaught(ctx.invoke("Main.forever", &[JValue::Int(0)]));
    assert_eq!(class, "java.lang.StackOverflowError");
    assert_eq!(trace.len(), 64);
    assert!(ctx.frames().is_empty());
}

const LIST: &str = r#"
[[classes]]
name = "Node"
fields = [{ name = "value", kind = "int" }, { name = "next", kind = "object" }]

# Build a list of `n` nodes, then walk it and return its length.
[[methods]]
name = "Main.build"
registers = 6
ins = 1
code = [
    { op = "const", dst = 0, value = 0 },
    { op = "const-null", dst = 1 },
    { op = "new-instance", dst = 2, class = "Node" },
    { op = "iput-quick", kind = "object", src = 1, obj = 2, offset = 8 },
    { op = "iput-quick", kind = "int", src = 0, obj = 2, offset = 12 },
    { op = "move-object", dst = 1, src = 2 },
    { op = "add-int-lit", dst = 0, src = 0, value = 1 },
    { op = "if-lt", a = 0, b = 5, target = 2 },
    { op = "const", dst = 3, value = 0 },
    { op = "if-eqz", src = 1, target = 13 },
    { op = "iget-quick", kind = "object", dst = 1, obj = 1, offset = 8 },
    { op = "add-int-lit", dst = 3, src = 3, value = 1 },
    { op = "goto", target = 9 },
    { op = "return", src = 3 },
]
"#;

fn gc_config(mode: GcMode) -> RuntimeConfig {
    RuntimeConfig {
        gc_mode: mode,
        gc_threshold: 4096,
        ..RuntimeConfig::default()
    }
}

#[test]
fn test_live_list_survives_stop_the_world_collections() {
    let runtime = runtime_with(gc_config(GcMode::Stw), LIST);
    let mut ctx = runtime.attach_current_thread("main");
    for _ in 0..3 {
        let length = ctx.invoke("Main.build", &[JValue::Int(2000)]).unwrap();
        assert_eq!(length, JValue::Int(2000));
    }
    let stats = runtime.gc_stats();
    assert!(stats.cycles > 0);
    assert!(stats.objects_freed > 0);
}

#[test]
fn test_threads_allocate_under_concurrent_collection() {
    let runtime = runtime_with(gc_config(GcMode::Concurrent), LIST);
    let mut ctx = runtime.attach_current_thread("main");
    let workers: Vec<_> = (0..3)
        .map(|_| runtime.spawn("Main.build", vec![JValue::Int(1500)]).unwrap())
        .collect();

    let length = ctx.invoke("Main.build", &[JValue::Int(1500)]).unwrap();
    assert_eq!(length, JValue::Int(1500));
    for worker in workers {
        assert_eq!(worker.join(&mut ctx).unwrap(), JValue::Int(1500));
    }
    assert!(runtime.gc_stats().cycles > 0);
}

#[test]
fn test_explicit_collection_frees_garbage() {
    let runtime = runtime_with(gc_config(GcMode::Stw), LIST);
    let mut ctx = runtime.attach_current_thread("main");
    ctx.invoke("Main.build", &[JValue::Int(100)]).unwrap();
    let before = runtime.heap().object_count();
    ctx.collect_garbage();
    // Only the runtime's pre-allocated error is still reachable.
    assert!(runtime.heap().object_count() < before);
    assert_eq!(runtime.heap().object_count(), 1);
}

const COMPILED: &str = r#"
[[methods]]
name = "Main.main"
registers = 2
compiled = true
code = [
    { op = "const", dst = 0, value = 7 },
    { op = "const", dst = 1, value = 0 },
    { op = "invoke", method = "Main.check", args = [0, 1], dst = 0 },
    { op = "return", src = 0 },
    { op = "move-exception", dst = 1 },
    { op = "const", dst = 0, value = 42 },
    { op = "return", src = 0 },
]
tries = [{ start = 2, end = 3, handler = 4 }]

[[methods]]
name = "Main.check"
registers = 3
ins = 2
compiled = true
code = [
    { op = "div-int", dst = 0, a = 1, b = 2 },
    { op = "return", src = 0 },
]
"#;

#[test]
fn test_exception_caught_in_compiled_frame() {
    let runtime = runtime(COMPILED);
    let main = runtime.method_by_name("Main.main").unwrap();
    assert!(runtime.code_cache().code_for(main.id()).is_some());
    let mut ctx = runtime.attach_current_thread("main");
    assert_eq!(ctx.invoke("Main.main", &[]).unwrap(), JValue::Int(42));
}

#[test]
fn test_compiled_frames_in_stack_trace() {
    let runtime = runtime(COMPILED);
    let mut ctx = runtime.attach_current_thread("main");
    let (_, _, trace) = uncaught(ctx.invoke("Main.check", &[JValue::Int(1), JValue::Int(0)]));
    assert_eq!(trace, vec!["Main.check (dex pc 0, compiled)".to_string()]);
}

#[test]
fn test_invalidated_code_runs_in_interpreter() {
    let runtime = runtime(COMPILED);
    assert!(runtime.invalidate_method("Main.check").unwrap());
    assert!(runtime.invalidate_method("Main.main").unwrap());
    let mut ctx = runtime.attach_current_thread("main");

    let (_, _, trace) = uncaught(ctx.invoke("Main.check", &[JValue::Int(1), JValue::Int(0)]));
    assert_eq!(trace, vec!["Main.check (dex pc 0)".to_string()]);
    assert_eq!(ctx.invoke("Main.main", &[]).unwrap(), JValue::Int(42));
    assert!(runtime.invalidate_method("Main.missing").is_err());
}

#[test]
fn test_wrong_argument_count_is_a_host_error() {
    let runtime = runtime(COMPILED);
    let mut ctx = runtime.attach_current_thread("main");
    assert!(matches!(
        ctx.invoke("Main.check", &[JValue::Int(1)]),
        Err(RuntimeError::InvalidProgram(_))
    ));
    assert!(matches!(
        ctx.invoke("Main.nope", &[]),
        Err(RuntimeError::UnknownMethod(_))
    ));
}
