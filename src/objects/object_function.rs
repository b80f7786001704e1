use crate::chunk::Chunk;
use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_module::ObjectModule;
use crate::value::Value;

/// A compiled function. `defaults` holds the trailing parameter defaults
/// (length `defaults.len()`, so the first `arity - defaults.len()` parameters
/// are required); when `vararg` is set, surplus arguments are collected into
/// a tuple bound after the named parameters.
#[repr(C)]
pub struct ObjectFunction {
    pub object: Object,
    pub arity: u8,
    pub vararg: bool,
    pub defaults: Vec<Value>,
    pub module: *mut ObjectModule,
    pub name: String,
    pub chunk: Box<Chunk>,
    pub upvalue_count: usize,
}

impl ObjectFunction {
    pub fn new(arity: u8, name: String, module: *mut ObjectModule) -> Box<ObjectFunction> {
        Box::new(ObjectFunction {
            object: Object::new(ObjectKind::ObjFunction),
            arity,
            vararg: false,
            defaults: vec![],
            module,
            name,
            chunk: Box::new(Chunk::new()),
            upvalue_count: 0,
        })
    }

    pub fn required_args(&self) -> usize {
        self.arity as usize - self.defaults.len()
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use super::ObjectFunction;

    impl Drop for ObjectFunction {
        fn drop(&mut self) {
            println!("drop function object: name={}", self.name);
        }
    }
}
