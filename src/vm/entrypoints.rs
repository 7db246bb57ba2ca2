//! Out-of-line helpers called by the generic opcodes.
//!
//! Every helper either returns a usable value or leaves an exception in
//! the caller's slot. Some results are ambiguous on their own (`None` from
//! `resolve_field` may follow a thrown error), so callers check
//! [`ExecutionContext::is_exception_pending`] after every call.
//!
//! Helpers may allocate, and allocation may collect: callers keep every
//! live reference in frame registers across a helper call.

use std::sync::Arc;

use super::bytecode::{Instruction, Opcode};
use super::class::{Class, ClassId, well_known};
use super::context::ExecutionContext;
use super::heap::ThrowableInfo;
use super::program::{Method, ResolvedField};
use super::runtime::Runtime;
use super::stack_walk;
use super::value::ObjRef;

/// Resolve a type operand without raising anything.
pub(crate) fn lookup_type(runtime: &Runtime, method: &Method, index: u32) -> Option<Arc<Class>> {
    if let Some(id) = method.resolved_type(index) {
        return Some(runtime.classes.get(id));
    }
    let class = runtime.classes.lookup(method.type_name(index))?;
    method.cache_type(index, class.id);
    Some(class)
}

/// Resolve a type operand, raising `NoClassDefFoundError` on failure.
fn resolve_type(ctx: &mut ExecutionContext, method: &Method, index: u32) -> Option<Arc<Class>> {
    let class = lookup_type(ctx.runtime(), method, index);
    if class.is_none() {
        let message = method.type_name(index).to_string();
        throw_new(ctx, well_known::NO_CLASS_DEF_FOUND_ERROR, message);
    }
    class
}

/// Resolve a field operand to its offset and kind.
pub fn resolve_field(
    ctx: &mut ExecutionContext,
    method: &Method,
    index: u32,
) -> Option<ResolvedField> {
    if let Some(field) = method.resolved_field(index) {
        return Some(field);
    }
    let (class_name, field_name) = method.field_name(index);
    let Some(class) = ctx.runtime().classes.lookup(class_name) else {
        let message = class_name.to_string();
        throw_new(ctx, well_known::NO_CLASS_DEF_FOUND_ERROR, message);
        return None;
    };
    let Some(field) = class.find_field(field_name) else {
        let message = format!("No field {} in class {}", field_name, class_name);
        throw_new(ctx, well_known::NO_SUCH_FIELD_ERROR, message);
        return None;
    };
    let resolved = ResolvedField {
        offset: field.offset,
        kind: field.kind,
    };
    method.cache_field(index, resolved);
    Some(resolved)
}

/// `check-cast`: true when `obj` may be stored as the resolved type.
/// On a mismatch `ClassCastException` is left pending.
pub fn check_cast(
    ctx: &mut ExecutionContext,
    method: &Method,
    index: u32,
    obj: Option<ObjRef>,
) -> bool {
    // null passes any cast without resolving the type
    let Some(obj) = obj else { return true };
    let Some(target) = resolve_type(ctx, method, index) else {
        return false;
    };
    let runtime = ctx.runtime();
    let actual = runtime.heap.class_of(obj);
    if runtime.classes.is_subclass_of(actual, target.id) {
        return true;
    }
    let message = format!(
        "{} cannot be cast to {}",
        runtime.classes.name_of(actual),
        target.name
    );
    throw_new(ctx, well_known::CLASS_CAST_EXCEPTION, message);
    false
}

/// `instance-of`. Never raises: an unresolvable type matches nothing.
pub fn instance_of(
    ctx: &mut ExecutionContext,
    method: &Method,
    index: u32,
    obj: Option<ObjRef>,
) -> bool {
    let Some(obj) = obj else { return false };
    let runtime = ctx.runtime();
    match lookup_type(runtime, method, index) {
        Some(target) => runtime
            .classes
            .is_subclass_of(runtime.heap.class_of(obj), target.id),
        None => false,
    }
}

/// `new-instance`. May run the collector; on failure the exception
/// (`InstantiationError`, `NoClassDefFoundError` or `OutOfMemoryError`) is
/// left pending.
pub fn allocate_instance(
    ctx: &mut ExecutionContext,
    method: &Method,
    index: u32,
) -> Option<ObjRef> {
    let class = resolve_type(ctx, method, index)?;
    if class.is_abstract {
        let message = class.name.clone();
        throw_new(ctx, well_known::INSTANTIATION_ERROR, message);
        return None;
    }
    let obj = alloc_object(ctx, &class)?;
    if ctx.runtime().classes.is_throwable(class.id) {
        // Throwables capture the stack where they are created.
        let stack_trace = stack_walk::stack_trace(ctx.frames());
        ctx.runtime().heap.set_throwable_info(
            obj,
            ThrowableInfo {
                message: String::new(),
                stack_trace,
            },
        );
    }
    Some(obj)
}

/// Allocate, collecting first when the trigger is reached and once more
/// before giving up. Raises the pre-allocated `OutOfMemoryError`.
pub(crate) fn alloc_object(ctx: &mut ExecutionContext, class: &Class) -> Option<ObjRef> {
    if ctx.runtime().heap.should_gc() {
        ctx.collect_garbage();
    }
    if let Some(r) = ctx.runtime().heap.allocate(class) {
        return Some(r);
    }
    if ctx.runtime().heap.gc_enabled() {
        tracing::debug!(class = %class.name, "allocation failed, collecting");
        ctx.collect_garbage();
        if let Some(r) = ctx.runtime().heap.allocate(class) {
            return Some(r);
        }
    }
    tracing::warn!(class = %class.name, "heap exhausted");
    let oome = ctx.runtime().preallocated_oome();
    ctx.set_exception(oome);
    None
}

/// Create and raise an exception of a built-in or loaded class.
pub fn throw_new(ctx: &mut ExecutionContext, class: ClassId, message: impl Into<String>) {
    let class = ctx.runtime().classes.get(class);
    let message = message.into();
    let dex_pc = ctx.frames().last().map(|f| f.dex_pc());
    tracing::debug!(class = %class.name, ?dex_pc, %message, "throwing");

    let Some(exception) = alloc_object(ctx, &class) else {
        // OutOfMemoryError is already pending.
        return;
    };
    let stack_trace = stack_walk::stack_trace(ctx.frames());
    ctx.runtime()
        .heap
        .set_throwable_info(exception, ThrowableInfo { message, stack_trace });
    ctx.set_exception(exception);
}

/// Raise the `NullPointerException` for a null receiver at `insn`.
pub fn throw_null_pointer_from_dex_pc(ctx: &mut ExecutionContext, method: &Method, insn: &Instruction) {
    let message = match insn.opcode {
        Opcode::Iget => {
            let (class, field) = method.field_name(insn.index);
            format!("Attempt to read from field '{}.{}' on a null object reference", class, field)
        }
        Opcode::Iput => {
            let (class, field) = method.field_name(insn.index);
            format!("Attempt to write to field '{}.{}' on a null object reference", class, field)
        }
        Opcode::Throw => "throw with null exception".to_string(),
        op => match op.quick_field_kind() {
            Some(kind) if op.mnemonic().starts_with("iget") => format!(
                "Attempt to read {} field at offset {} on a null object reference",
                kind.name(),
                insn.c
            ),
            Some(kind) => format!(
                "Attempt to write {} field at offset {} on a null object reference",
                kind.name(),
                insn.c
            ),
            None => "Attempt to dereference a null object reference".to_string(),
        },
    };
    throw_new(ctx, well_known::NULL_POINTER_EXCEPTION, message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::vm::Program;

    const CLASSES: &str = r#"
[[classes]]
name = "Shape"
abstract = true

[[classes]]
name = "Circle"
super = "Shape"
fields = [{ name = "r", kind = "int" }]

[[classes]]
name = "Square"
super = "Shape"

[[methods]]
name = "Main.main"
registers = 1
code = [
    { op = "new-instance", dst = 0, class = "Circle" },
    { op = "check-cast", dst = 0, src = 0, class = "Square" },
    { op = "check-cast", dst = 0, src = 0, class = "Missing" },
    { op = "iget", dst = 0, obj = 0, field = "Circle.r" },
    { op = "iget", dst = 0, obj = 0, field = "Circle.nope" },
    { op = "new-instance", dst = 0, class = "Shape" },
    { op = "return-void" },
]
"#;

    fn setup() -> (Arc<Runtime>, ExecutionContext, Arc<Method>) {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        runtime
            .load_program(&Program::from_toml_str(CLASSES).unwrap())
            .unwrap();
        let ctx = runtime.attach_current_thread("test");
        let method = runtime.method_by_name("Main.main").unwrap();
        (runtime, ctx, method)
    }

    fn pending_class(ctx: &mut ExecutionContext) -> String {
        let exception = ctx.take_exception().expect("exception pending");
        let runtime = ctx.runtime();
        runtime.classes.name_of(runtime.heap.class_of(exception))
    }

    #[test]
    fn test_instance_of_never_raises() {
        let (_runtime, mut ctx, method) = setup();
        let circle = allocate_instance(&mut ctx, &method, method.code()[0].index).unwrap();
        ctx.add_local_ref(circle);

        let square = method.code()[1].index;
        let missing = method.code()[2].index;
        assert!(!instance_of(&mut ctx, &method, square, Some(circle)));
        assert!(!instance_of(&mut ctx, &method, missing, Some(circle)));
        assert!(!instance_of(&mut ctx, &method, square, None));
        assert!(!ctx.is_exception_pending());
    }

    #[test]
    fn test_check_cast_outcomes() {
        let (_runtime, mut ctx, method) = setup();
        let circle = allocate_instance(&mut ctx, &method, method.code()[0].index).unwrap();
        ctx.add_local_ref(circle);

        assert!(check_cast(&mut ctx, &method, method.code()[1].index, None));
        assert!(!ctx.is_exception_pending());

        assert!(!check_cast(&mut ctx, &method, method.code()[1].index, Some(circle)));
        assert_eq!(pending_class(&mut ctx), "java.lang.ClassCastException");

        assert!(!check_cast(&mut ctx, &method, method.code()[2].index, Some(circle)));
        assert_eq!(pending_class(&mut ctx), "java.lang.NoClassDefFoundError");
    }

    #[test]
    fn test_resolve_field_caches() {
        let (_runtime, mut ctx, method) = setup();
        let index = method.code()[3].index;
        let field = resolve_field(&mut ctx, &method, index).unwrap();
        assert_eq!(field.offset, 8);
        assert_eq!(method.resolved_field(index), Some(field));

        assert!(resolve_field(&mut ctx, &method, method.code()[4].index).is_none());
        assert_eq!(pending_class(&mut ctx), "java.lang.NoSuchFieldError");
    }

    #[test]
    fn test_abstract_class_is_not_instantiable() {
        let (_runtime, mut ctx, method) = setup();
        assert!(allocate_instance(&mut ctx, &method, method.code()[5].index).is_none());
        assert_eq!(pending_class(&mut ctx), "java.lang.InstantiationError");
    }

    #[test]
    fn test_exhausted_heap_raises_preallocated_oome() {
        let config = RuntimeConfig {
            heap_limit: Some(1024),
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::new(config).unwrap();
        runtime
            .load_program(&Program::from_toml_str(CLASSES).unwrap())
            .unwrap();
        let mut ctx = runtime.attach_current_thread("test");
        let method = runtime.method_by_name("Main.main").unwrap();

        let mut kept = Vec::new();
        while let Some(r) = allocate_instance(&mut ctx, &method, method.code()[0].index) {
            ctx.add_local_ref(r);
            kept.push(r);
        }
        let oome = ctx.take_exception().unwrap();
        assert_eq!(oome, runtime.preallocated_oome());
        // 16-byte circles after the 8-byte preallocated error
        assert_eq!(kept.len(), (1024 - 8) / 16);

        // The same exhaustion surfaces as an uncaught error from managed code.
        match ctx.invoke("Main.main", &[]) {
            Err(crate::RuntimeError::UncaughtException { class, .. }) => {
                assert_eq!(class, "java.lang.OutOfMemoryError")
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!ctx.is_exception_pending());
    }
}
