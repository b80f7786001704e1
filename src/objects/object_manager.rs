use crate::objects::object::Object;
use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_list::ObjectList;
use crate::objects::object_module::ObjectModule;
use crate::objects::object_native::{NativeFn, ObjectNative};
use crate::objects::object_range::ObjectRange;
use crate::objects::object_stack_trace::ObjectStackTrace;
use crate::objects::object_string::ObjectString;
use crate::objects::object_tuple::ObjectTuple;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::value::Value;

const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// Owns every heap object. Objects are boxed, leaked into raw pointers and
/// registered here; the sweep phase is the only place they are freed (plus
/// `free_all` on shutdown). Byte accounting drives the collection threshold,
/// which doubles after each cycle.
pub struct ObjectManager {
    objects: Vec<*mut Object>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn should_collect(&self) -> bool {
        if cfg!(feature = "gc_stress") {
            return true;
        }
        self.bytes_allocated > self.next_gc
    }

    pub fn update_after_collection(&mut self, freed: usize) {
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.next_gc = std::cmp::max(self.bytes_allocated * 2, FIRST_GC_THRESHOLD);
    }

    fn push_object(&mut self, object: *mut Object) {
        let size = unsafe { (*object).deep_size() };
        self.bytes_allocated += size;
        self.objects.push(object);
    }

    pub fn alloc_string(&mut self, content: String) -> *mut ObjectString {
        let ptr = Box::into_raw(ObjectString::new(content));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_function(
        &mut self,
        arity: u8,
        name: String,
        module: *mut ObjectModule,
    ) -> *mut ObjectFunction {
        let ptr = Box::into_raw(ObjectFunction::new(arity, name, module));
        self.push_object(ptr as *mut Object);
        ptr
    }

    #[allow(clippy::too_many_arguments)]
    pub fn alloc_native(
        &mut self,
        name: String,
        arity: u8,
        vararg: bool,
        defaults: Vec<Value>,
        module: *mut ObjectModule,
        function: NativeFn,
    ) -> *mut ObjectNative {
        let ptr = Box::into_raw(ObjectNative::new(
            name, arity, vararg, defaults, module, function,
        ));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_class(&mut self, name: String) -> *mut ObjectClass {
        let ptr = Box::into_raw(ObjectClass::new(name));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_instance(&mut self, class: *mut ObjectClass) -> *mut ObjectInstance {
        let ptr = Box::into_raw(ObjectInstance::new(class));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_module(&mut self, name: String) -> *mut ObjectModule {
        let ptr = Box::into_raw(ObjectModule::new(name));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> *mut ObjectList {
        let ptr = Box::into_raw(ObjectList::new(items));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_tuple(&mut self, items: Vec<Value>) -> *mut ObjectTuple {
        let ptr = Box::into_raw(ObjectTuple::new(items));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_range(&mut self, start: f64, stop: f64, step: f64) -> *mut ObjectRange {
        let ptr = Box::into_raw(ObjectRange::new(start, stop, step));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: *mut Object,
    ) -> *mut ObjectBoundMethod {
        let ptr = Box::into_raw(ObjectBoundMethod::new(receiver, method));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_closure(&mut self, function: *mut ObjectFunction) -> *mut ObjectClosure {
        let ptr = Box::into_raw(ObjectClosure::new(function));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_upvalue(&mut self, addr: *mut Value) -> *mut ObjectUpvalue {
        let ptr = Box::into_raw(ObjectUpvalue::new(addr));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_stack_trace(&mut self) -> *mut ObjectStackTrace {
        let ptr = Box::into_raw(ObjectStackTrace::new());
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn iter(&self) -> impl Iterator<Item = &*mut Object> {
        self.objects.iter()
    }

    /// Frees every unmarked object and clears the mark on the survivors.
    /// Returns the number of bytes freed. Callers must have pruned weak
    /// references (the intern table) first.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        self.objects.retain(|&object| unsafe {
            if (*object).marked {
                (*object).marked = false;
                true
            } else {
                freed += (*object).deep_size();
                free_object(object);
                false
            }
        });
        freed
    }

    /// # Safety
    /// No pointer to any managed object may be dereferenced afterwards.
    pub unsafe fn free_all(&mut self) {
        for &object in &self.objects {
            free_object(object);
        }
        self.objects.clear();
        self.bytes_allocated = 0;
    }
}

unsafe fn free_object(object: *mut Object) {
    use crate::objects::object::ObjectKind;
    match (*object).kind {
        ObjectKind::ObjString => drop(Box::from_raw(object as *mut ObjectString)),
        ObjectKind::ObjFunction => drop(Box::from_raw(object as *mut ObjectFunction)),
        ObjectKind::ObjNative => drop(Box::from_raw(object as *mut ObjectNative)),
        ObjectKind::ObjClass => drop(Box::from_raw(object as *mut ObjectClass)),
        ObjectKind::ObjInstance => drop(Box::from_raw(object as *mut ObjectInstance)),
        ObjectKind::ObjModule => drop(Box::from_raw(object as *mut ObjectModule)),
        ObjectKind::ObjList => drop(Box::from_raw(object as *mut ObjectList)),
        ObjectKind::ObjTuple => drop(Box::from_raw(object as *mut ObjectTuple)),
        ObjectKind::ObjRange => drop(Box::from_raw(object as *mut ObjectRange)),
        ObjectKind::ObjBoundMethod => drop(Box::from_raw(object as *mut ObjectBoundMethod)),
        ObjectKind::ObjClosure => drop(Box::from_raw(object as *mut ObjectClosure)),
        ObjectKind::ObjUpvalue => drop(Box::from_raw(object as *mut ObjectUpvalue)),
        ObjectKind::ObjStackTrace => drop(Box::from_raw(object as *mut ObjectStackTrace)),
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        unsafe {
            self.free_all();
        }
    }
}

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_registers_and_accounts_bytes() {
        let mut manager = ObjectManager::new();
        assert_eq!(manager.bytes_allocated(), 0);
        let _ = manager.alloc_string("hello".to_string());
        let _ = manager.alloc_range(0.0, 10.0, 1.0);
        assert_eq!(manager.object_count(), 2);
        assert!(manager.bytes_allocated() > 0);
    }

    #[test]
    fn test_sweep_frees_unmarked_only() {
        let mut manager = ObjectManager::new();
        let keep = manager.alloc_string("keep".to_string());
        let _drop = manager.alloc_string("drop".to_string());
        unsafe {
            (*keep).object.marked = true;
        }
        let freed = manager.sweep();
        assert!(freed > 0);
        assert_eq!(manager.object_count(), 1);
        // survivor mark is cleared for the next cycle
        unsafe {
            assert!(!(*keep).object.marked);
        }
    }

    #[test]
    fn test_threshold_doubles_from_live_bytes() {
        let mut manager = ObjectManager::new();
        let _ = manager.alloc_string("x".repeat(32));
        let before = manager.next_gc();
        manager.update_after_collection(0);
        assert!(manager.next_gc() >= before);
    }
}
