use crate::objects::object::{Object, ObjectKind};
use crate::value::Value;

/// A growable array of values.
#[repr(C)]
pub struct ObjectList {
    pub object: Object,
    pub items: Vec<Value>,
}

impl ObjectList {
    pub fn new(items: Vec<Value>) -> Box<ObjectList> {
        Box::new(ObjectList {
            object: Object::new(ObjectKind::ObjList),
            items,
        })
    }
}
