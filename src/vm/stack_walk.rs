//! Walking a thread's managed stack.
//!
//! Interpreted frames know their dex pc directly. Compiled frames only
//! know the native return address of the call in flight; their bytecode
//! position is recovered through the code header's stack map, which is
//! the same path exception delivery and deoptimization take.

use std::sync::Arc;

use super::class::ClassTable;
use super::context::{ExecutionFrame, FrameMode};
use super::entrypoints::lookup_type;
use super::heap::Heap;
use super::program::Method;
use super::runtime::Runtime;
use super::value::ObjRef;
use crate::jit::DEX_NO_INDEX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Interpreted,
    Quick,
    /// Compiled frame whose code has been invalidated; it resumes in the
    /// interpreter
    Deoptimize,
}

#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub method: Arc<Method>,
    /// `DEX_NO_INDEX` when a compiled frame's PC has no mapping
    pub dex_pc: u32,
    pub kind: FrameKind,
}

impl std::fmt::Display for FrameRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (", self.method.name())?;
        if self.dex_pc == DEX_NO_INDEX {
            write!(f, "unknown dex pc")?;
        } else {
            write!(f, "dex pc {}", self.dex_pc)?;
        }
        match self.kind {
            FrameKind::Interpreted => write!(f, ")"),
            FrameKind::Quick => write!(f, ", compiled)"),
            FrameKind::Deoptimize => write!(f, ", deoptimizing)"),
        }
    }
}

/// Innermost-first iterator over frames.
pub struct StackWalker<'a> {
    frames: std::iter::Rev<std::slice::Iter<'a, ExecutionFrame>>,
}

impl<'a> StackWalker<'a> {
    pub fn new(frames: &'a [ExecutionFrame]) -> Self {
        Self {
            frames: frames.iter().rev(),
        }
    }
}

impl Iterator for StackWalker<'_> {
    type Item = FrameRecord;

    fn next(&mut self) -> Option<FrameRecord> {
        let frame = self.frames.next()?;
        let (dex_pc, kind) = match frame.mode() {
            FrameMode::Interpreted => (frame.dex_pc(), FrameKind::Interpreted),
            FrameMode::Quick { header, native_pc } => {
                // Diagnostics must survive a bad mapping.
                let dex_pc = header.to_dex_pc(frame.method(), *native_pc, false);
                let kind = if header.has_should_deoptimize_flag() {
                    FrameKind::Deoptimize
                } else {
                    FrameKind::Quick
                };
                (dex_pc, kind)
            }
        };
        Some(FrameRecord {
            method: Arc::clone(frame.method()),
            dex_pc,
            kind,
        })
    }
}

/// One line per frame, innermost first.
pub fn stack_trace(frames: &[ExecutionFrame]) -> Vec<String> {
    StackWalker::new(frames).map(|f| f.to_string()).collect()
}

/// Where a thrown exception will be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchLocation {
    Interpreter { dex_pc: u32 },
    /// Resume compiled code at its catch block entry
    Quick { dex_pc: u32, native_pc: usize },
    /// The handler is in compiled code that must not run again
    Deoptimize { dex_pc: u32 },
}

impl CatchLocation {
    pub fn dex_pc(self) -> u32 {
        match self {
            CatchLocation::Interpreter { dex_pc }
            | CatchLocation::Quick { dex_pc, .. }
            | CatchLocation::Deoptimize { dex_pc } => dex_pc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchSite {
    /// Index of the catching frame on the thread's stack
    pub frame: usize,
    pub location: CatchLocation,
}

/// First handler for `exception` in `frames[base..]`, innermost first.
pub(crate) fn find_catch(
    runtime: &Runtime,
    frames: &[ExecutionFrame],
    base: usize,
    exception: ObjRef,
) -> Option<CatchSite> {
    let class = runtime.heap.class_of(exception);
    for (index, frame) in frames.iter().enumerate().skip(base).rev() {
        let location = match frame.mode() {
            FrameMode::Interpreted => {
                find_handler(runtime, frame.method(), frame.dex_pc(), class)
                    .map(|dex_pc| CatchLocation::Interpreter { dex_pc })
            }
            FrameMode::Quick { header, native_pc } => {
                let method = frame.method();
                let throw_pc = header.to_dex_pc(method, *native_pc, true);
                find_handler(runtime, method, throw_pc, class).map(|dex_pc| {
                    if header.has_should_deoptimize_flag() {
                        CatchLocation::Deoptimize { dex_pc }
                    } else {
                        let native_pc = header.to_native_quick_pc(method, dex_pc, true, true);
                        CatchLocation::Quick { dex_pc, native_pc }
                    }
                })
            }
        };
        if let Some(location) = location {
            return Some(CatchSite {
                frame: index,
                location,
            });
        }
    }
    None
}

/// Handler dex pc covering `dex_pc` for an exception of class `thrown`.
fn find_handler(
    runtime: &Runtime,
    method: &Method,
    dex_pc: u32,
    thrown: super::class::ClassId,
) -> Option<u32> {
    method
        .tries()
        .iter()
        .filter(|t| t.covers(dex_pc))
        .find(|t| match t.catch_type {
            None => true,
            // A catch type that cannot be resolved catches nothing.
            Some(index) => lookup_type(runtime, method, index)
                .is_some_and(|c| runtime.classes.is_subclass_of(thrown, c.id)),
        })
        .map(|t| t.handler)
}

/// Render an exception for diagnostics: class, message and stack trace.
pub fn describe(classes: &ClassTable, heap: &Heap, exception: ObjRef) -> (String, String, Vec<String>) {
    let class = classes.name_of(heap.class_of(exception));
    let info = heap.throwable_info(exception).unwrap_or_default();
    (class, info.message, info.stack_trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::vm::Program;
    use crate::vm::class::well_known;

    const SOURCE: &str = r#"
[[methods]]
name = "Main.main"
registers = 2
code = [
    { op = "const", dst = 0, value = 1 },
    { op = "div-int", dst = 0, a = 0, b = 1 },
    { op = "return", src = 0 },
    { op = "move-exception", dst = 1 },
    { op = "return", src = 0 },
]
tries = [{ start = 0, end = 3, handler = 3, class = "java.lang.ArithmeticException" }]
"#;

    fn setup() -> (Arc<Runtime>, Arc<Method>) {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        runtime
            .load_program(&Program::from_toml_str(SOURCE).unwrap())
            .unwrap();
        let method = runtime.method_by_name("Main.main").unwrap();
        (runtime, method)
    }

    fn exception(runtime: &Runtime, class: crate::vm::class::ClassId) -> ObjRef {
        runtime.heap.allocate(&runtime.classes.get(class)).unwrap()
    }

    #[test]
    fn test_interpreted_catch() {
        let (runtime, method) = setup();
        let mut frame = ExecutionFrame::new(Arc::clone(&method), 1, FrameMode::Interpreted);
        frame.dex_pc = 1;
        let frames = vec![frame];

        let arith = exception(&runtime, well_known::ARITHMETIC_EXCEPTION);
        let site = find_catch(&runtime, &frames, 0, arith).unwrap();
        assert_eq!(site.frame, 0);
        assert_eq!(site.location, CatchLocation::Interpreter { dex_pc: 3 });

        let npe = exception(&runtime, well_known::NULL_POINTER_EXCEPTION);
        assert_eq!(find_catch(&runtime, &frames, 0, npe), None);
        // Frames below `base` belong to an outer invocation.
        assert_eq!(find_catch(&runtime, &frames, 1, arith), None);
    }

    #[test]
    fn test_quick_frame_maps_through_header() {
        let (runtime, method) = setup();
        let header = runtime.compile_method(&method).unwrap();
        let native_pc = header.to_native_quick_pc(&method, 1, false, true);
        let mut frame = ExecutionFrame::new(
            Arc::clone(&method),
            1,
            FrameMode::Quick {
                header: Arc::clone(&header),
                native_pc,
            },
        );
        frame.dex_pc = 1;
        let frames = vec![frame];

        let trace = stack_trace(&frames);
        assert_eq!(trace, vec!["Main.main (dex pc 1, compiled)".to_string()]);

        let arith = exception(&runtime, well_known::ARITHMETIC_EXCEPTION);
        let site = find_catch(&runtime, &frames, 0, arith).unwrap();
        let catch_pc = header.to_native_quick_pc(&method, 3, true, true);
        assert_eq!(
            site.location,
            CatchLocation::Quick {
                dex_pc: 3,
                native_pc: catch_pc
            }
        );
        assert!(header.contains(catch_pc));

        header.set_has_should_deoptimize_flag();
        assert_eq!(
            find_catch(&runtime, &frames, 0, arith).unwrap().location,
            CatchLocation::Deoptimize { dex_pc: 3 }
        );
        let record = StackWalker::new(&frames).next().unwrap();
        assert_eq!(record.kind, FrameKind::Deoptimize);
        assert_eq!(record.dex_pc, 1);
    }

    #[test]
    fn test_unmapped_pc_is_reported_not_fatal() {
        let (runtime, method) = setup();
        let header = runtime.compile_method(&method).unwrap();
        let frames = vec![ExecutionFrame::new(
            Arc::clone(&method),
            1,
            FrameMode::Quick {
                native_pc: header.get_entry_point(),
                header,
            },
        )];
        assert_eq!(
            stack_trace(&frames),
            vec!["Main.main (unknown dex pc, compiled)".to_string()]
        );
    }
}
