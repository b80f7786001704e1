use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_module::ObjectModule;
use crate::value::Value;
use crate::vm::VM;

/// A host function callable from the language. Arguments occupy stack slots
/// `1..=n` relative to the call base, `this` sits at slot 0. The function
/// returns the value to push, or `Err(())` after raising through the VM.
pub type NativeFn = fn(&mut VM, usize) -> Result<Value, ()>;

#[repr(C)]
pub struct ObjectNative {
    pub object: Object,
    pub arity: u8,
    pub vararg: bool,
    pub defaults: Vec<Value>,
    pub module: *mut ObjectModule,
    pub name: String,
    pub function: NativeFn,
}

impl ObjectNative {
    pub fn new(
        name: String,
        arity: u8,
        vararg: bool,
        defaults: Vec<Value>,
        module: *mut ObjectModule,
        function: NativeFn,
    ) -> Box<ObjectNative> {
        Box::new(ObjectNative {
            object: Object::new(ObjectKind::ObjNative),
            arity,
            vararg,
            defaults,
            module,
            name,
            function,
        })
    }

    pub fn required_args(&self) -> usize {
        self.arity as usize - self.defaults.len()
    }
}
