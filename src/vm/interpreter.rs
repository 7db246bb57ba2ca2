//! The dispatch loop.
//!
//! Every opcode has its own handler in a table indexed by opcode value.
//! A handler performs its effect and tells the loop where control goes
//! next; the loop is a trampoline, so managed calls never grow the native
//! stack.
//!
//! Handler shapes:
//! - quick field handlers null-check the receiver and access the field at
//!   the offset embedded in the instruction
//! - generic handlers call an out-of-line helper and then consult the
//!   exception slot before trusting its result
//!
//! A null receiver in any handler goes to the shared null-object path.

use std::sync::Arc;

use super::bytecode::{FieldKind, Instruction, NO_REGISTER, Opcode};
use super::class::well_known;
use super::context::{ExecutionContext, ExecutionFrame, FrameMode};
use super::entrypoints;
use super::program::{Method, MethodId};
use super::stack_walk::{self, CatchLocation};
use super::value::{JValue, Register};
use crate::fatal;

/// Where control goes after a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlFlow {
    /// Fall through to the next instruction
    Next,
    Branch(u32),
    Invoke(MethodId),
    Return(JValue),
    /// The exception slot holds an exception to deliver
    Exception,
    /// The receiver was null
    NullObject,
}

pub(crate) type Handler = fn(&mut ExecutionContext, &Method, &Instruction) -> ControlFlow;

static HANDLERS: [Handler; Opcode::COUNT] = {
    let mut table = [op_nop as Handler; Opcode::COUNT];
    let mut i = 0;
    while i < Opcode::COUNT {
        let op = Opcode::ALL[i];
        table[op as usize] = handler_for(op);
        i += 1;
    }
    table
};

const fn handler_for(op: Opcode) -> Handler {
    match op {
        Opcode::Nop => op_nop,
        Opcode::Const => op_const,
        Opcode::ConstWide => op_const_wide,
        Opcode::ConstNull => op_const_null,
        Opcode::Move | Opcode::MoveObject => op_move,
        Opcode::MoveWide => op_move_wide,
        Opcode::MoveException => op_move_exception,
        Opcode::ReturnVoid => op_return_void,
        Opcode::Return => op_return,
        Opcode::ReturnWide => op_return_wide,
        Opcode::ReturnObject => op_return_object,
        Opcode::Goto => op_goto,
        Opcode::IfEqz => op_if_eqz,
        Opcode::IfNez => op_if_nez,
        Opcode::IfEq => op_if_eq,
        Opcode::IfNe => op_if_ne,
        Opcode::IfLt => op_if_lt,
        Opcode::IfGe => op_if_ge,
        Opcode::AddInt => op_add_int,
        Opcode::SubInt => op_sub_int,
        Opcode::MulInt => op_mul_int,
        Opcode::DivInt => op_div_int,
        Opcode::AddIntLit => op_add_int_lit,
        Opcode::AddLong => op_add_long,
        Opcode::Throw => op_throw,
        Opcode::Invoke => op_invoke,
        Opcode::NewInstance => op_new_instance,
        Opcode::CheckCast => op_check_cast,
        Opcode::InstanceOf => op_instance_of,
        Opcode::Iget => op_iget,
        Opcode::Iput => op_iput,
        Opcode::IgetBooleanQuick => op_iget_boolean_quick,
        Opcode::IgetByteQuick => op_iget_byte_quick,
        Opcode::IgetCharQuick => op_iget_char_quick,
        Opcode::IgetShortQuick => op_iget_short_quick,
        Opcode::IgetQuick => op_iget_quick,
        Opcode::IgetWideQuick => op_iget_wide_quick,
        Opcode::IgetObjectQuick => op_iget_object_quick,
        Opcode::IputBooleanQuick => op_iput_boolean_quick,
        Opcode::IputByteQuick => op_iput_byte_quick,
        Opcode::IputCharQuick => op_iput_char_quick,
        Opcode::IputShortQuick => op_iput_short_quick,
        Opcode::IputQuick => op_iput_quick,
        Opcode::IputWideQuick => op_iput_wide_quick,
        Opcode::IputObjectQuick => op_iput_object_quick,
    }
}

pub(crate) fn handler(op: Opcode) -> Handler {
    HANDLERS[op as usize]
}

// =============================================================================
// The loop
// =============================================================================

/// Run `method` with `args` in its last registers until it returns.
///
/// Returns `None` when an exception escapes; it is left in the slot.
pub(crate) fn execute(
    ctx: &mut ExecutionContext,
    method: Arc<Method>,
    args: &[Register],
) -> Option<JValue> {
    let base = ctx.frames.len();
    if !push_frame(ctx, Arc::clone(&method), args) {
        return None;
    }
    let mut method = method;

    loop {
        let pc = ctx.top().dex_pc;
        let insn = &method.code()[pc as usize];
        tracing::trace!(method = method.name(), pc, insn = %insn, "dispatch");
        if insn.opcode.can_throw() {
            export_native_pc(ctx.top_mut(), pc);
        }

        match handler(insn.opcode)(ctx, &method, insn) {
            ControlFlow::Next => {
                ctx.top_mut().dex_pc = pc + 1;
                if insn.opcode.can_throw() {
                    ctx.poll_safepoint();
                }
            }
            ControlFlow::Branch(target) => {
                ctx.top_mut().dex_pc = target;
                if target <= pc {
                    ctx.poll_safepoint();
                }
            }
            ControlFlow::Invoke(id) => {
                let callee = ctx.runtime().method(id);
                let args: Vec<Register> = insn.args.iter().map(|&r| ctx.reg(r)).collect();
                if push_frame(ctx, Arc::clone(&callee), &args) {
                    method = callee;
                } else {
                    match deliver_exception(ctx, base) {
                        Some(handler_method) => method = handler_method,
                        None => return None,
                    }
                }
            }
            ControlFlow::Return(value) => {
                ctx.frames.pop();
                if ctx.frames.len() == base {
                    return Some(value);
                }
                method = return_to_caller(ctx, value);
                ctx.poll_safepoint();
            }
            ControlFlow::Exception => match deliver_exception(ctx, base) {
                Some(handler_method) => method = handler_method,
                None => return None,
            },
            ControlFlow::NullObject => {
                entrypoints::throw_null_pointer_from_dex_pc(ctx, &method, insn);
                match deliver_exception(ctx, base) {
                    Some(handler_method) => method = handler_method,
                    None => return None,
                }
            }
        }
    }
}

/// Push a frame for `method`, entering its compiled code when it has
/// valid code. Raises `StackOverflowError` and returns false when the
/// stack is full.
fn push_frame(ctx: &mut ExecutionContext, method: Arc<Method>, args: &[Register]) -> bool {
    if ctx.frames.len() >= ctx.runtime().config().max_stack_depth {
        let message = format!("stack depth {} exceeded", ctx.frames.len());
        entrypoints::throw_new(ctx, well_known::STACK_OVERFLOW_ERROR, message);
        return false;
    }

    let mode = match ctx.runtime().code_cache.code_for(method.id()) {
        Some(header) if !header.has_should_deoptimize_flag() => FrameMode::Quick {
            native_pc: header.get_entry_point(),
            header,
        },
        _ => FrameMode::Interpreted,
    };
    let mut frame = ExecutionFrame::new(method, ctx.thread_id(), mode);
    let first = frame.registers.len() - args.len();
    frame.registers[first..].copy_from_slice(args);
    ctx.frames.push(frame);
    // Method entry is a safepoint.
    ctx.poll_safepoint();
    true
}

/// Compiled frames publish the return address of the call about to be made.
fn export_native_pc(frame: &mut ExecutionFrame, pc: u32) {
    if let FrameMode::Quick { header, native_pc } = &mut frame.mode {
        *native_pc = header.to_native_quick_pc(&frame.method, pc, false, true);
    }
}

/// Store a callee's result in the caller and resume after the invoke.
fn return_to_caller(ctx: &mut ExecutionContext, value: JValue) -> Arc<Method> {
    let caller = Arc::clone(&ctx.top().method);
    let dst = caller.code()[ctx.top().dex_pc as usize].a;
    if dst != NO_REGISTER {
        match value {
            JValue::Void => {}
            JValue::Int(n) => ctx.set_reg(dst, Register::from_int(n)),
            JValue::Wide(n) => ctx.set_wide(dst, n),
            JValue::Ref(r) => ctx.set_reg(dst, Register::from_ref(r)),
        }
    }

    let frame = ctx.top_mut();
    frame.dex_pc += 1;
    let flagged = matches!(
        &frame.mode,
        FrameMode::Quick { header, .. } if header.has_should_deoptimize_flag()
    );
    if flagged {
        frame.deoptimize();
    }
    caller
}

/// Unwind to the innermost handler at or above `base`. Returns the
/// handler's method, or `None` after unwinding every frame of this
/// invocation.
fn deliver_exception(ctx: &mut ExecutionContext, base: usize) -> Option<Arc<Method>> {
    let Some(exception) = ctx.pending_exception() else {
        fatal!("exception dispatch on thread {} with an empty slot", ctx.thread_id());
    };
    let Some(site) = stack_walk::find_catch(ctx.runtime(), &ctx.frames, base, exception) else {
        ctx.frames.truncate(base);
        return None;
    };

    ctx.frames.truncate(site.frame + 1);
    let frame = ctx.top_mut();
    frame.dex_pc = site.location.dex_pc();
    match site.location {
        CatchLocation::Interpreter { .. } => {}
        CatchLocation::Quick { native_pc: pc, .. } => {
            if let FrameMode::Quick { native_pc, .. } = &mut frame.mode {
                *native_pc = pc;
            }
        }
        CatchLocation::Deoptimize { .. } => frame.deoptimize(),
    }
    let method = Arc::clone(&frame.method);
    tracing::debug!(
        method = method.name(),
        handler = site.location.dex_pc(),
        "exception caught"
    );

    // The handler's move-exception consumes the slot; without one nothing will.
    if method.code()[site.location.dex_pc() as usize].opcode != Opcode::MoveException {
        ctx.clear_exception();
    }
    Some(method)
}

// =============================================================================
// Constants, moves, control flow
// =============================================================================

fn op_nop(_ctx: &mut ExecutionContext, _method: &Method, _insn: &Instruction) -> ControlFlow {
    ControlFlow::Next
}

fn op_const(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    ctx.set_reg(insn.a, Register::from_int(insn.literal as i32));
    ControlFlow::Next
}

fn op_const_wide(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    ctx.set_wide(insn.a, insn.literal);
    ControlFlow::Next
}

fn op_const_null(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    ctx.set_reg(insn.a, Register::from_ref(None));
    ControlFlow::Next
}

fn op_move(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    let value = ctx.reg(insn.b);
    ctx.set_reg(insn.a, value);
    ControlFlow::Next
}

fn op_move_wide(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    let value = ctx.wide(insn.b);
    ctx.set_wide(insn.a, value);
    ControlFlow::Next
}

fn op_move_exception(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    let exception = ctx.take_exception();
    ctx.set_reg(insn.a, Register::from_ref(exception));
    ControlFlow::Next
}

fn op_return_void(_ctx: &mut ExecutionContext, _method: &Method, _insn: &Instruction) -> ControlFlow {
    ControlFlow::Return(JValue::Void)
}

fn op_return(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    ControlFlow::Return(JValue::Int(ctx.reg(insn.a).int()))
}

fn op_return_wide(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    ControlFlow::Return(JValue::Wide(ctx.wide(insn.a)))
}

fn op_return_object(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    ControlFlow::Return(JValue::Ref(ctx.reg(insn.a).reference()))
}

fn op_goto(_ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    ControlFlow::Branch(insn.target())
}

fn branch_if(cond: bool, insn: &Instruction) -> ControlFlow {
    if cond {
        ControlFlow::Branch(insn.target())
    } else {
        ControlFlow::Next
    }
}

fn op_if_eqz(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    branch_if(ctx.reg(insn.a).bits() == 0, insn)
}

fn op_if_nez(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    branch_if(ctx.reg(insn.a).bits() != 0, insn)
}

fn op_if_eq(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    branch_if(ctx.reg(insn.a).bits() == ctx.reg(insn.b).bits(), insn)
}

fn op_if_ne(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    branch_if(ctx.reg(insn.a).bits() != ctx.reg(insn.b).bits(), insn)
}

fn op_if_lt(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    branch_if(ctx.reg(insn.a).int() < ctx.reg(insn.b).int(), insn)
}

fn op_if_ge(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    branch_if(ctx.reg(insn.a).int() >= ctx.reg(insn.b).int(), insn)
}

// =============================================================================
// Arithmetic
// =============================================================================

fn binop(ctx: &mut ExecutionContext, insn: &Instruction, f: fn(i32, i32) -> i32) -> ControlFlow {
    let result = f(ctx.reg(insn.b).int(), ctx.reg(insn.c).int());
    ctx.set_reg(insn.a, Register::from_int(result));
    ControlFlow::Next
}

fn op_add_int(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    binop(ctx, insn, i32::wrapping_add)
}

fn op_sub_int(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    binop(ctx, insn, i32::wrapping_sub)
}

fn op_mul_int(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    binop(ctx, insn, i32::wrapping_mul)
}

fn op_div_int(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    if ctx.reg(insn.c).int() == 0 {
        entrypoints::throw_new(ctx, well_known::ARITHMETIC_EXCEPTION, "divide by zero");
        return ControlFlow::Exception;
    }
    binop(ctx, insn, i32::wrapping_div)
}

fn op_add_int_lit(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    let result = ctx.reg(insn.b).int().wrapping_add(insn.literal as i32);
    ctx.set_reg(insn.a, Register::from_int(result));
    ControlFlow::Next
}

fn op_add_long(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    let result = ctx.wide(insn.b).wrapping_add(ctx.wide(insn.c));
    ctx.set_wide(insn.a, result);
    ControlFlow::Next
}

// =============================================================================
// Calls and exceptions
// =============================================================================

fn op_invoke(_ctx: &mut ExecutionContext, method: &Method, insn: &Instruction) -> ControlFlow {
    ControlFlow::Invoke(method.callee(insn.index))
}

fn op_throw(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
    let Some(exception) = ctx.reg(insn.a).reference() else {
        return ControlFlow::NullObject;
    };
    let runtime = ctx.runtime();
    let class = runtime.heap.class_of(exception);
    if !runtime.classes.is_throwable(class) {
        let message = format!(
            "{} cannot be cast to java.lang.Throwable",
            runtime.classes.name_of(class)
        );
        entrypoints::throw_new(ctx, well_known::CLASS_CAST_EXCEPTION, message);
        return ControlFlow::Exception;
    }
    ctx.set_exception(exception);
    ControlFlow::Exception
}

// =============================================================================
// Helper-backed object operations
// =============================================================================

fn op_new_instance(ctx: &mut ExecutionContext, method: &Method, insn: &Instruction) -> ControlFlow {
    let obj = entrypoints::allocate_instance(ctx, method, insn.index);
    if ctx.is_exception_pending() {
        return ControlFlow::Exception;
    }
    ctx.set_reg(insn.a, Register::from_ref(obj));
    ControlFlow::Next
}

fn op_check_cast(ctx: &mut ExecutionContext, method: &Method, insn: &Instruction) -> ControlFlow {
    let obj = ctx.reg(insn.b).reference();
    let passed = entrypoints::check_cast(ctx, method, insn.index, obj);
    if ctx.is_exception_pending() {
        // The destination keeps its old value.
        return ControlFlow::Exception;
    }
    debug_assert!(passed);
    ctx.set_reg(insn.a, Register::from_ref(obj));
    ControlFlow::Next
}

fn op_instance_of(ctx: &mut ExecutionContext, method: &Method, insn: &Instruction) -> ControlFlow {
    let obj = ctx.reg(insn.b).reference();
    let result = entrypoints::instance_of(ctx, method, insn.index, obj);
    if ctx.is_exception_pending() {
        return ControlFlow::Exception;
    }
    ctx.set_reg(insn.a, Register::from_int(result as i32));
    ControlFlow::Next
}

fn op_iget(ctx: &mut ExecutionContext, method: &Method, insn: &Instruction) -> ControlFlow {
    let field = entrypoints::resolve_field(ctx, method, insn.index);
    if ctx.is_exception_pending() {
        return ControlFlow::Exception;
    }
    let Some(field) = field else {
        fatal!("field {} resolved to nothing without an exception", insn.index);
    };
    if !operand_fits(ctx, method, insn, field.kind) {
        return ControlFlow::Exception;
    }
    get_field(ctx, insn, field.offset as usize, field.kind)
}

fn op_iput(ctx: &mut ExecutionContext, method: &Method, insn: &Instruction) -> ControlFlow {
    let field = entrypoints::resolve_field(ctx, method, insn.index);
    if ctx.is_exception_pending() {
        return ControlFlow::Exception;
    }
    let Some(field) = field else {
        fatal!("field {} resolved to nothing without an exception", insn.index);
    };
    if !operand_fits(ctx, method, insn, field.kind) {
        return ControlFlow::Exception;
    }
    put_field(ctx, insn, field.offset as usize, field.kind)
}

/// Loading checks generic field ops against the classes known then; one
/// resolving to a wide field of a class loaded later is caught here.
fn operand_fits(
    ctx: &mut ExecutionContext,
    method: &Method,
    insn: &Instruction,
    kind: FieldKind,
) -> bool {
    if kind != FieldKind::Wide || u32::from(insn.a) + 1 < u32::from(method.registers()) {
        return true;
    }
    let (class_name, field_name) = method.field_name(insn.index);
    let message = format!(
        "wide field {}.{} needs register pair v{} in {}",
        class_name,
        field_name,
        insn.a,
        method.name()
    );
    entrypoints::throw_new(ctx, well_known::VERIFY_ERROR, message);
    false
}

// =============================================================================
// Field access
// =============================================================================

/// Widen a loaded sub-word value the way the field's type requires.
fn extend(kind: FieldKind, raw: u64) -> i32 {
    match kind {
        FieldKind::Byte => raw as u8 as i8 as i32,
        FieldKind::Short => raw as u16 as i16 as i32,
        FieldKind::Boolean | FieldKind::Char => raw as i32,
        FieldKind::Int | FieldKind::Wide | FieldKind::Object => raw as u32 as i32,
    }
}

/// Load `vA <- vB.field`.
fn get_field(ctx: &mut ExecutionContext, insn: &Instruction, offset: usize, kind: FieldKind) -> ControlFlow {
    let Some(obj) = ctx.reg(insn.b).reference() else {
        return ControlFlow::NullObject;
    };
    let heap = &ctx.runtime().heap;
    match kind {
        FieldKind::Object => {
            let value = heap.load_ref(obj, offset);
            ctx.set_reg(insn.a, Register::from_ref(value));
        }
        FieldKind::Wide => {
            let value = heap.load(obj, offset, kind) as i64;
            ctx.set_wide(insn.a, value);
        }
        _ => {
            let value = extend(kind, heap.load(obj, offset, kind));
            ctx.set_reg(insn.a, Register::from_int(value));
        }
    }
    ControlFlow::Next
}

/// Store `vB.field <- vA`.
fn put_field(ctx: &mut ExecutionContext, insn: &Instruction, offset: usize, kind: FieldKind) -> ControlFlow {
    let Some(obj) = ctx.reg(insn.b).reference() else {
        return ControlFlow::NullObject;
    };
    let runtime = ctx.runtime();
    match kind {
        FieldKind::Object => {
            let value = ctx.reg(insn.a).reference();
            // Barrier first: a concurrent marker must not miss the new edge.
            runtime.collector.write_barrier(obj, value);
            runtime.heap.store_ref(obj, offset, value);
        }
        FieldKind::Wide => {
            runtime.heap.store(obj, offset, kind, ctx.wide(insn.a) as u64);
        }
        _ => {
            runtime.heap.store(obj, offset, kind, ctx.reg(insn.a).bits() as u64);
        }
    }
    ControlFlow::Next
}

macro_rules! quick_field_handlers {
    ($($get:ident, $put:ident => $kind:ident;)*) => {
        $(
            fn $get(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
                get_field(ctx, insn, insn.c as usize, FieldKind::$kind)
            }

            fn $put(ctx: &mut ExecutionContext, _method: &Method, insn: &Instruction) -> ControlFlow {
                put_field(ctx, insn, insn.c as usize, FieldKind::$kind)
            }
        )*
    };
}

quick_field_handlers! {
    op_iget_boolean_quick, op_iput_boolean_quick => Boolean;
    op_iget_byte_quick, op_iput_byte_quick => Byte;
    op_iget_char_quick, op_iput_char_quick => Char;
    op_iget_short_quick, op_iput_short_quick => Short;
    op_iget_quick, op_iput_quick => Int;
    op_iget_wide_quick, op_iput_wide_quick => Wide;
    op_iget_object_quick, op_iput_object_quick => Object;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::jit::CompiledCodeHeader;
    use crate::vm::{Program, Runtime};

    const PROGRAM: &str = r#"
[[classes]]
name = "Point"
fields = [{ name = "x", kind = "int" }, { name = "y", kind = "int" }]

[[methods]]
name = "Main.readY"
registers = 2
ins = 1
code = [
    { op = "iget-quick", kind = "int", dst = 0, obj = 1, offset = 12 },
    { op = "return", src = 0 },
]

[[methods]]
name = "Main.bytes"
registers = 3
code = [
    { op = "new-instance", dst = 0, class = "Point" },
    { op = "const", dst = 1, value = 200 },
    { op = "iput-quick", kind = "byte", src = 1, obj = 0, offset = 8 },
    { op = "iget-quick", kind = "byte", dst = 2, obj = 0, offset = 8 },
    { op = "return", src = 2 },
]

[[methods]]
name = "Main.caller"
registers = 2
compiled = true
code = [
    { op = "invoke", method = "Main.readY", args = [1], dst = 0 },
    { op = "return", src = 0 },
]
"#;

    fn setup() -> (Arc<Runtime>, ExecutionContext) {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        runtime
            .load_program(&Program::from_toml_str(PROGRAM).unwrap())
            .unwrap();
        let ctx = runtime.attach_current_thread("test");
        (runtime, ctx)
    }

    #[test]
    fn test_quick_get_on_null_takes_null_object_path() {
        let (runtime, mut ctx) = setup();
        let method = runtime.method_by_name("Main.readY").unwrap();
        let objects = runtime.heap.object_count();
        let thread_id = ctx.thread_id();
        ctx.frames
            .push(ExecutionFrame::new(Arc::clone(&method), thread_id, FrameMode::Interpreted));

        let insn = &method.code()[0];
        assert_eq!(insn.c, 12);
        let flow = handler(insn.opcode)(&mut ctx, &method, insn);
        assert_eq!(flow, ControlFlow::NullObject);
        assert!(!ctx.is_exception_pending());
        assert_eq!(ctx.reg(0), Register::default());
        assert_eq!(runtime.heap.object_count(), objects);
    }

    #[test]
    fn test_null_receiver_raises_npe_with_offset() {
        let (_runtime, mut ctx) = setup();
        match ctx.invoke("Main.readY", &[JValue::null()]) {
            Err(crate::RuntimeError::UncaughtException { class, message, .. }) => {
                assert_eq!(class, "java.lang.NullPointerException");
                assert!(message.contains("offset 12"), "{}", message);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!ctx.is_exception_pending());
        assert!(ctx.frames().is_empty());
    }

    #[test]
    fn test_byte_field_is_sign_extended() {
        let (_runtime, mut ctx) = setup();
        assert_eq!(ctx.invoke("Main.bytes", &[]).unwrap(), JValue::Int(200u8 as i8 as i32));
    }

    fn push_compiled_caller(runtime: &Runtime, ctx: &mut ExecutionContext) -> Arc<CompiledCodeHeader> {
        let caller = runtime.method_by_name("Main.caller").unwrap();
        let header = runtime.code_cache.code_for(caller.id()).unwrap();
        let native_pc = header.to_native_quick_pc(&caller, 0, false, true);
        let mode = FrameMode::Quick {
            header: Arc::clone(&header),
            native_pc,
        };
        let thread_id = ctx.thread_id();
        ctx.frames.push(ExecutionFrame::new(caller, thread_id, mode));
        header
    }

    #[test]
    fn test_return_into_compiled_frame() {
        let (runtime, mut ctx) = setup();
        push_compiled_caller(&runtime, &mut ctx);
        let resumed = return_to_caller(&mut ctx, JValue::Int(5));
        assert_eq!(resumed.name(), "Main.caller");
        assert!(ctx.top().is_quick());
        assert_eq!(ctx.top().dex_pc(), 1);
        assert_eq!(ctx.reg(0).int(), 5);
    }

    #[test]
    fn test_return_into_flagged_frame_deoptimizes() {
        let (runtime, mut ctx) = setup();
        let header = push_compiled_caller(&runtime, &mut ctx);
        header.set_has_should_deoptimize_flag();
        return_to_caller(&mut ctx, JValue::Int(5));
        assert!(!ctx.top().is_quick());
        assert_eq!(ctx.top().dex_pc(), 1);
        assert_eq!(ctx.reg(0).int(), 5);
    }

    #[test]
    fn test_extend_by_kind() {
        assert_eq!(extend(FieldKind::Byte, 0xff), -1);
        assert_eq!(extend(FieldKind::Boolean, 1), 1);
        assert_eq!(extend(FieldKind::Char, 0xffff), 0xffff);
        assert_eq!(extend(FieldKind::Short, 0xffff), -1);
        assert_eq!(extend(FieldKind::Int, 0xffff_ffff), -1);
    }
}
