use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_upvalue::ObjectUpvalue;

/// A function plus the flattened hierarchy of upvalues it closes over.
#[repr(C)]
pub struct ObjectClosure {
    pub object: Object,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
}

impl ObjectClosure {
    pub fn new(function: *mut ObjectFunction) -> Box<ObjectClosure> {
        let upvalue_count = unsafe { (*function).upvalue_count };
        Box::new(ObjectClosure {
            object: Object::new(ObjectKind::ObjClosure),
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        })
    }
}
