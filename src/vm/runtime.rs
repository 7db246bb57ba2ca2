//! The runtime context.
//!
//! A `Runtime` owns everything shared between threads: configuration, the
//! class and method tables, the heap and its collector, the code cache and
//! the thread list. It is created explicitly and handed around as an
//! `Arc`; there is no process-wide instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::bytecode::{FieldKind, Opcode};
use super::class::{Class, ClassTable, well_known};
use super::context::ExecutionContext;
use super::gc::{Collector, GcStats, RootVisitor};
use super::heap::{Heap, ThrowableInfo};
use super::program::{Method, MethodId, Program, link_method};
use super::stack_walk;
use super::threads::{ThreadHandle, ThreadList};
use super::value::{JValue, ObjRef};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::isa::InstructionSetPolicy;
use crate::jit::{CodeCache, CompiledCodeHeader, TemplateCompiler};

#[derive(Debug, Default)]
struct MethodTable {
    methods: Vec<Arc<Method>>,
    by_name: HashMap<String, MethodId>,
}

pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) policy: InstructionSetPolicy,
    pub(crate) classes: ClassTable,
    methods: RwLock<MethodTable>,
    pub(crate) heap: Heap,
    pub(crate) collector: Collector,
    pub(crate) code_cache: CodeCache,
    pub(crate) threads: ThreadList,
    /// Serializes program loads
    load_lock: Mutex<()>,
    /// Raised when the heap is exhausted; allocating it then could not work.
    oome: ObjRef,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let policy = InstructionSetPolicy::new(config.isa);
        let classes = ClassTable::new();
        let heap = Heap::new(config.heap_limit, config.gc_threshold, config.gc_enabled);

        let oome = heap
            .allocate(&classes.get(well_known::OUT_OF_MEMORY_ERROR))
            .ok_or_else(|| {
                RuntimeError::InvalidConfig("heap limit leaves no room for the runtime".to_string())
            })?;
        heap.set_throwable_info(
            oome,
            ThrowableInfo {
                message: "heap exhausted".to_string(),
                stack_trace: Vec::new(),
            },
        );

        tracing::info!(
            isa = policy.isa().name(),
            gc_mode = ?config.gc_mode,
            heap_limit = ?config.heap_limit,
            "runtime created"
        );
        Ok(Arc::new(Self {
            collector: Collector::new(config.gc_mode),
            code_cache: CodeCache::new(policy),
            config,
            policy,
            classes,
            methods: RwLock::new(MethodTable::default()),
            heap,
            threads: ThreadList::new(),
            load_lock: Mutex::new(()),
            oome,
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn policy(&self) -> &InstructionSetPolicy {
        &self.policy
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    /// Register the calling OS thread and return its execution context.
    pub fn attach_current_thread(self: &Arc<Self>, name: &str) -> ExecutionContext {
        let record = self.threads.register(name);
        ExecutionContext::new(Arc::clone(self), record)
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Define the program's classes, link its methods and compile the ones
    /// that ask for compiled code. A program that fails to link leaves the
    /// runtime as it was.
    #[tracing::instrument(level = "debug", skip_all, fields(methods = program.methods.len()))]
    pub fn load_program(&self, program: &Program) -> Result<()> {
        let _loading = self.load_lock.lock();
        let staged = self.classes.stage(&program.classes)?;

        let linked = {
            let table = self.methods.read();
            let mut ids = table.by_name.clone();
            let mut ins: HashMap<MethodId, u16> =
                table.methods.iter().map(|m| (m.id(), m.ins())).collect();
            for (i, spec) in program.methods.iter().enumerate() {
                let id = MethodId((table.methods.len() + i) as u32);
                if ids.insert(spec.name.clone(), id).is_some() {
                    return Err(RuntimeError::InvalidProgram(format!(
                        "duplicate method `{}`",
                        spec.name
                    )));
                }
                ins.insert(id, spec.ins);
            }

            let mut linked = Vec::with_capacity(program.methods.len());
            for (i, spec) in program.methods.iter().enumerate() {
                let id = MethodId((table.methods.len() + i) as u32);
                let method = link_method(id, spec, &ids)?;
                check_call_arity(&method, &ins)?;
                check_field_registers(&method, |name| self.classes.lookup_staged(&staged, name))?;
                linked.push(Arc::new(method));
            }
            linked
        };

        self.classes.commit(staged)?;
        {
            let mut table = self.methods.write();
            for method in &linked {
                table.by_name.insert(method.name().to_string(), method.id());
                table.methods.push(Arc::clone(method));
            }
        }

        for method in linked.iter().filter(|m| m.wants_compiled_code()) {
            self.compile_method(method)?;
        }
        tracing::info!(
            classes = program.classes.len(),
            methods = linked.len(),
            compiled = self.code_cache.len(),
            "program loaded"
        );
        Ok(())
    }

    pub fn method_by_name(&self, name: &str) -> Option<Arc<Method>> {
        let table = self.methods.read();
        let id = table.by_name.get(name)?;
        Some(Arc::clone(&table.methods[id.0 as usize]))
    }

    /// Method by id. Ids come from linked code, so an unknown one is fatal.
    pub fn method(&self, id: MethodId) -> Arc<Method> {
        match self.methods.read().methods.get(id.0 as usize) {
            Some(method) => Arc::clone(method),
            None => crate::fatal!("unknown method id {}", id.0),
        }
    }

    // -------------------------------------------------------------------------
    // Compiled code
    // -------------------------------------------------------------------------

    /// Compile `method` and make it the method's current code.
    pub fn compile_method(&self, method: &Method) -> Result<Arc<CompiledCodeHeader>> {
        let compiled = TemplateCompiler::new().compile(method)?;
        let header = self.code_cache.install(method.id(), &compiled)?;
        Ok(header)
    }

    /// Send frames running `name`'s compiled code back to the interpreter.
    /// Returns false when the method has no compiled code.
    pub fn invalidate_method(&self, name: &str) -> Result<bool> {
        let method = self
            .method_by_name(name)
            .ok_or_else(|| RuntimeError::UnknownMethod(name.to_string()))?;
        Ok(self.code_cache.invalidate_method(method.id()))
    }

    // -------------------------------------------------------------------------
    // Heap and collection
    // -------------------------------------------------------------------------

    pub fn preallocated_oome(&self) -> ObjRef {
        self.oome
    }

    /// Roots owned by the runtime rather than any thread.
    pub fn visit_global_roots(&self, visitor: &mut dyn RootVisitor) {
        visitor.visit_root(self.oome);
    }

    /// Collect from a thread that is not attached to this runtime. Attached
    /// threads use [`ExecutionContext::collect_garbage`]; calling this from
    /// one would wait for itself.
    pub fn collect_garbage(&self) -> GcStats {
        let cycle = self.collector.lock_cycle();
        self.collector
            .collect(&cycle, &self.heap, &self.threads, None, &|visitor| {
                self.visit_global_roots(visitor)
            })
    }

    pub fn gc_stats(&self) -> GcStats {
        self.collector.stats()
    }

    /// Host-level error for an exception that escaped managed code.
    pub fn describe_exception(&self, exception: ObjRef) -> RuntimeError {
        let (class, message, trace) = stack_walk::describe(&self.classes, &self.heap, exception);
        RuntimeError::UncaughtException {
            class,
            message,
            trace,
        }
    }

    // -------------------------------------------------------------------------
    // Threads
    // -------------------------------------------------------------------------

    /// Run `method_name` on a new thread with its own execution context.
    pub fn spawn(self: &Arc<Self>, method_name: &str, args: Vec<JValue>) -> Result<ThreadHandle> {
        let method = self
            .method_by_name(method_name)
            .ok_or_else(|| RuntimeError::UnknownMethod(method_name.to_string()))?;

        let record = self.threads.register(method_name);
        // Until the new thread attaches, its arguments are only reachable
        // from here.
        record.enter_native(|roots| {
            roots.extend(args.iter().filter_map(JValue::as_object));
        });

        let runtime = Arc::clone(self);
        let thread = Arc::clone(&record);
        let spawned = std::thread::Builder::new()
            .name(format!("quickrt-{}", record.id()))
            .spawn(move || {
                let mut ctx = ExecutionContext::new(runtime, thread);
                ctx.invoke_method(&method, &args)
            });
        match spawned {
            Ok(handle) => {
                tracing::debug!(thread = record.id(), method = method_name, "spawned");
                Ok(ThreadHandle::new(record.id(), handle))
            }
            Err(e) => {
                self.threads.unregister(&record);
                Err(RuntimeError::ThreadSpawn(e))
            }
        }
    }
}

/// Every invoke must pass exactly as many registers as the callee takes.
fn check_call_arity(method: &Method, ins: &HashMap<MethodId, u16>) -> Result<()> {
    for (pc, insn) in method.code().iter().enumerate() {
        if insn.opcode != Opcode::Invoke {
            continue;
        }
        let callee = method.callee(insn.index);
        let expected = ins.get(&callee).copied().unwrap_or_default();
        if insn.args.len() != expected as usize {
            return Err(RuntimeError::InvalidProgram(format!(
                "{}: invoke at {} passes {} registers, callee takes {}",
                method.name(),
                pc,
                insn.args.len(),
                expected
            )));
        }
    }
    Ok(())
}

/// A generic field op naming a wide field needs a register pair. Fields of
/// classes not known yet are checked when they resolve.
fn check_field_registers(
    method: &Method,
    lookup: impl Fn(&str) -> Option<Arc<Class>>,
) -> Result<()> {
    for (pc, insn) in method.code().iter().enumerate() {
        if !matches!(insn.opcode, Opcode::Iget | Opcode::Iput) {
            continue;
        }
        let (class_name, field_name) = method.field_name(insn.index);
        let kind = lookup(class_name).and_then(|class| class.find_field(field_name).map(|f| f.kind));
        if kind == Some(FieldKind::Wide) && u32::from(insn.a) + 1 >= u32::from(method.registers()) {
            return Err(RuntimeError::InvalidProgram(format!(
                "{}: wide field {}.{} needs register pair v{} at pc {}",
                method.name(),
                class_name,
                field_name,
                insn.a,
                pc
            )));
        }
    }
    Ok(())
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("isa", &self.policy.isa())
            .field("classes", &self.classes.len())
            .field("methods", &self.methods.read().methods.len())
            .field("code_cache", &self.code_cache)
            .field("threads", &self.threads.len())
            .finish()
    }
}
