use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::table::Table;
use crate::value::{as_object, is_object, Value};
use crate::vm::VM;

/// Aggregated GC statistics (live-byte totals stay with the allocator).
#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with the gc_debug feature).
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace {
    ($($arg:tt)*) => {};
}
pub(crate) use gc_trace;

/// Stop-the-world, non-moving mark-sweep. Marking is iterative over an
/// explicit worklist so deep object graphs cannot exhaust the Rust stack;
/// the mark bit lives in the object header.
#[derive(Default)]
pub struct GarbageCollector {
    worklist: Vec<*mut Object>,
    stats: GCStats,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }

    pub fn mark_object(&mut self, object: *mut Object) {
        if object.is_null() {
            return;
        }
        unsafe {
            if (*object).marked {
                return;
            }
            (*object).marked = true;
        }
        gc_trace!("mark ptr={:p}", object);
        self.worklist.push(object);
    }

    pub fn mark_value(&mut self, value: &Value) {
        if is_object(value) {
            self.mark_object(as_object(value));
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key.0 as *mut Object);
            self.mark_value(value);
        }
    }

    /// Enumerates every root the VM holds: the value stack, frame closures,
    /// the open-upvalue list, loaded modules, the core-class cache and any
    /// propagating exception with its trace.
    pub fn mark_roots(&mut self, vm: &VM) {
        for value in &vm.stack[0..vm.stack_top_pos] {
            self.mark_value(value);
        }

        for frame in &vm.frames {
            self.mark_object(frame.closure as *mut Object);
        }

        let mut upvalue = vm.open_upvalues;
        while !upvalue.is_null() {
            self.mark_object(upvalue as *mut Object);
            upvalue = unsafe { (*upvalue).next };
        }

        self.mark_table(&vm.modules);

        for class in vm.core.iter() {
            self.mark_object(class as *mut Object);
        }

        self.mark_value(&vm.exception);
        self.mark_object(vm.stack_trace as *mut Object);
    }

    /// Drains the worklist, tracing each object's children by kind.
    pub fn trace_references(&mut self) {
        while let Some(object) = self.worklist.pop() {
            gc_trace!("trace ptr={:p}", object);
            unsafe {
                self.blacken_object(object);
            }
        }
    }

    unsafe fn blacken_object(&mut self, object: *mut Object) {
        self.mark_object((*object).class as *mut Object);

        match (*object).kind {
            ObjectKind::ObjString | ObjectKind::ObjRange | ObjectKind::ObjStackTrace => {}
            ObjectKind::ObjFunction => {
                let function = (*object).as_function();
                for constant in function.chunk.iter_constants() {
                    self.mark_value(constant);
                }
                for default in &function.defaults {
                    self.mark_value(default);
                }
                self.mark_object(function.module as *mut Object);
            }
            ObjectKind::ObjNative => {
                let native = (*object).as_native();
                for default in &native.defaults {
                    self.mark_value(default);
                }
                self.mark_object(native.module as *mut Object);
            }
            ObjectKind::ObjClass => {
                let class = (*object).as_class();
                self.mark_object(class.superclass as *mut Object);
                self.mark_table(&class.methods);
            }
            ObjectKind::ObjInstance => {
                self.mark_table(&(*object).as_instance().fields);
            }
            ObjectKind::ObjModule => {
                self.mark_table(&(*object).as_module().globals);
            }
            ObjectKind::ObjList => {
                for item in &(*object).as_list().items {
                    self.mark_value(item);
                }
            }
            ObjectKind::ObjTuple => {
                for item in (*object).as_tuple().items.iter() {
                    self.mark_value(item);
                }
            }
            ObjectKind::ObjBoundMethod => {
                let bound = (*object).as_bound_method();
                self.mark_value(&bound.receiver);
                self.mark_object(bound.method);
            }
            ObjectKind::ObjClosure => {
                let closure = (*object).as_closure();
                self.mark_object(closure.function as *mut Object);
                for upvalue in &closure.upvalues {
                    self.mark_object(*upvalue as *mut Object);
                }
            }
            ObjectKind::ObjUpvalue => {
                self.mark_value(&(*object).as_upvalue().closed);
            }
        }
    }

    /// Frees everything left unmarked. The caller prunes the intern table
    /// first so no byte-keyed entry outlives its string.
    pub fn sweep(&mut self, manager: &mut ObjectManager) -> usize {
        let freed = manager.sweep();
        gc_trace!("sweep freed_bytes={}", freed);
        freed
    }

    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle summary cycles={} freed={} before={} after={} next_trigger={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_object_is_idempotent() {
        let mut manager = ObjectManager::new();
        let string = manager.alloc_string("once".to_string());
        let mut gc = GarbageCollector::new();

        gc.mark_object(string as *mut Object);
        gc.mark_object(string as *mut Object);
        assert_eq!(gc.worklist.len(), 1);
    }

    #[test]
    fn test_trace_through_list() {
        let mut manager = ObjectManager::new();
        let element = manager.alloc_string("element".to_string());
        let list = manager.alloc_list(vec![crate::value::make_object_value(
            element as *mut Object,
        )]);

        let mut gc = GarbageCollector::new();
        gc.mark_object(list as *mut Object);
        gc.trace_references();

        unsafe {
            assert!((*element).object.marked);
        }
        let freed = gc.sweep(&mut manager);
        assert_eq!(freed, 0);
        assert_eq!(manager.object_count(), 2);
    }

    #[test]
    fn test_sweep_collects_unreachable_closure_graph() {
        let mut manager = ObjectManager::new();
        let module = manager.alloc_module("m".to_string());
        let function = manager.alloc_function(0, "f".to_string(), module);
        let closure = manager.alloc_closure(function);
        let _garbage = manager.alloc_string("garbage".to_string());

        let mut gc = GarbageCollector::new();
        gc.mark_object(closure as *mut Object);
        gc.trace_references();
        let freed = gc.sweep(&mut manager);

        assert!(freed > 0);
        // closure, function and module survive through the trace
        assert_eq!(manager.object_count(), 3);
    }

    #[test]
    fn test_stats_record_cycle() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);
        gc.record_cycle(1000, 400, 600, 1200);
        assert_eq!(gc.stats().cycles, 1);
        assert_eq!(gc.stats().last_before_bytes, 1000);
        assert_eq!(gc.stats().last_freed_bytes, 400);
        assert_eq!(gc.stats().last_after_bytes, 600);
        assert_eq!(gc.stats().last_next_trigger_bytes, 1200);
        assert_eq!(gc.stats().total_freed_bytes, 400);
    }
}
