use crate::objects::object::{Object, ObjectKind};
use crate::value::Value;

/// A method with its receiver captured, produced by field access that
/// resolved to a class method. `method` is a closure or a native.
#[repr(C)]
pub struct ObjectBoundMethod {
    pub object: Object,
    pub receiver: Value,
    pub method: *mut Object,
}

impl ObjectBoundMethod {
    pub fn new(receiver: Value, method: *mut Object) -> Box<ObjectBoundMethod> {
        Box::new(ObjectBoundMethod {
            object: Object::new(ObjectKind::ObjBoundMethod),
            receiver,
            method,
        })
    }
}
