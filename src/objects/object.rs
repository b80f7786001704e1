use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_list::ObjectList;
use crate::objects::object_module::ObjectModule;
use crate::objects::object_native::ObjectNative;
use crate::objects::object_range::ObjectRange;
use crate::objects::object_stack_trace::ObjectStackTrace;
use crate::objects::object_string::ObjectString;
use crate::objects::object_tuple::ObjectTuple;
use crate::objects::object_upvalue::ObjectUpvalue;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ObjString,
    ObjFunction,
    ObjNative,
    ObjClass,
    ObjInstance,
    ObjModule,
    ObjList,
    ObjTuple,
    ObjRange,
    ObjBoundMethod,
    ObjClosure,
    ObjUpvalue,
    ObjStackTrace,
}

/// Shared header of every heap object. Each concrete object embeds this as
/// its first field (`#[repr(C)]`), so a `*mut Object` can be cast to the
/// concrete type once the kind has been checked.
///
/// `class` is only populated for instances; primitives and internal kinds
/// resolve their class through the VM's core-class cache.
#[repr(C)]
pub struct Object {
    pub kind: ObjectKind,
    pub marked: bool,
    pub class: *mut ObjectClass,
}

impl Object {
    pub fn new(kind: ObjectKind) -> Self {
        Object {
            kind,
            marked: false,
            class: std::ptr::null_mut(),
        }
    }

    /// # Safety
    /// The caller must have checked `self.kind == ObjectKind::ObjString`.
    pub unsafe fn as_string(&self) -> &ObjectString {
        &*(self as *const Object as *const ObjectString)
    }

    pub unsafe fn as_string_mut(&mut self) -> &mut ObjectString {
        &mut *(self as *mut Object as *mut ObjectString)
    }

    pub unsafe fn as_function(&self) -> &ObjectFunction {
        &*(self as *const Object as *const ObjectFunction)
    }

    pub unsafe fn as_function_mut(&mut self) -> &mut ObjectFunction {
        &mut *(self as *mut Object as *mut ObjectFunction)
    }

    pub unsafe fn as_native(&self) -> &ObjectNative {
        &*(self as *const Object as *const ObjectNative)
    }

    pub unsafe fn as_class(&self) -> &ObjectClass {
        &*(self as *const Object as *const ObjectClass)
    }

    pub unsafe fn as_class_mut(&mut self) -> &mut ObjectClass {
        &mut *(self as *mut Object as *mut ObjectClass)
    }

    pub unsafe fn as_instance(&self) -> &ObjectInstance {
        &*(self as *const Object as *const ObjectInstance)
    }

    pub unsafe fn as_instance_mut(&mut self) -> &mut ObjectInstance {
        &mut *(self as *mut Object as *mut ObjectInstance)
    }

    pub unsafe fn as_module(&self) -> &ObjectModule {
        &*(self as *const Object as *const ObjectModule)
    }

    pub unsafe fn as_module_mut(&mut self) -> &mut ObjectModule {
        &mut *(self as *mut Object as *mut ObjectModule)
    }

    pub unsafe fn as_list(&self) -> &ObjectList {
        &*(self as *const Object as *const ObjectList)
    }

    pub unsafe fn as_list_mut(&mut self) -> &mut ObjectList {
        &mut *(self as *mut Object as *mut ObjectList)
    }

    pub unsafe fn as_tuple(&self) -> &ObjectTuple {
        &*(self as *const Object as *const ObjectTuple)
    }

    pub unsafe fn as_range(&self) -> &ObjectRange {
        &*(self as *const Object as *const ObjectRange)
    }

    pub unsafe fn as_bound_method(&self) -> &ObjectBoundMethod {
        &*(self as *const Object as *const ObjectBoundMethod)
    }

    pub unsafe fn as_closure(&self) -> &ObjectClosure {
        &*(self as *const Object as *const ObjectClosure)
    }

    pub unsafe fn as_closure_mut(&mut self) -> &mut ObjectClosure {
        &mut *(self as *mut Object as *mut ObjectClosure)
    }

    pub unsafe fn as_upvalue(&self) -> &ObjectUpvalue {
        &*(self as *const Object as *const ObjectUpvalue)
    }

    pub unsafe fn as_upvalue_mut(&mut self) -> &mut ObjectUpvalue {
        &mut *(self as *mut Object as *mut ObjectUpvalue)
    }

    pub unsafe fn as_stack_trace(&self) -> &ObjectStackTrace {
        &*(self as *const Object as *const ObjectStackTrace)
    }

    pub unsafe fn as_stack_trace_mut(&mut self) -> &mut ObjectStackTrace {
        &mut *(self as *mut Object as *mut ObjectStackTrace)
    }

    /// Approximate retained size in bytes, used by the allocator for the
    /// collection threshold accounting.
    pub unsafe fn deep_size(&self) -> usize {
        use std::mem::size_of;
        match self.kind {
            ObjectKind::ObjString => {
                size_of::<ObjectString>() + self.as_string().content.capacity()
            }
            ObjectKind::ObjFunction => {
                let function = self.as_function();
                size_of::<ObjectFunction>()
                    + function.chunk.code.capacity()
                    + function.chunk.lines.capacity() * size_of::<usize>()
                    + function.chunk.constants.capacity() * size_of::<crate::value::Value>()
                    + function.defaults.capacity() * size_of::<crate::value::Value>()
            }
            ObjectKind::ObjNative => {
                size_of::<ObjectNative>()
                    + self.as_native().defaults.capacity() * size_of::<crate::value::Value>()
            }
            ObjectKind::ObjClass => {
                size_of::<ObjectClass>() + self.as_class().methods.len() * size_of::<crate::value::Value>() * 2
            }
            ObjectKind::ObjInstance => {
                size_of::<ObjectInstance>()
                    + self.as_instance().fields.len() * size_of::<crate::value::Value>() * 2
            }
            ObjectKind::ObjModule => {
                size_of::<ObjectModule>()
                    + self.as_module().globals.len() * size_of::<crate::value::Value>() * 2
            }
            ObjectKind::ObjList => {
                size_of::<ObjectList>()
                    + self.as_list().items.capacity() * size_of::<crate::value::Value>()
            }
            ObjectKind::ObjTuple => {
                size_of::<ObjectTuple>()
                    + self.as_tuple().items.len() * size_of::<crate::value::Value>()
            }
            ObjectKind::ObjRange => size_of::<ObjectRange>(),
            ObjectKind::ObjBoundMethod => size_of::<ObjectBoundMethod>(),
            ObjectKind::ObjClosure => {
                size_of::<ObjectClosure>()
                    + self.as_closure().upvalues.capacity() * size_of::<*mut ObjectUpvalue>()
            }
            ObjectKind::ObjUpvalue => size_of::<ObjectUpvalue>(),
            ObjectKind::ObjStackTrace => {
                size_of::<ObjectStackTrace>() + self.as_stack_trace().trace.capacity()
            }
        }
    }
}
