use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_class::ObjectClass;
use crate::table::Table;

/// An instance of a user-defined class. The class link lives in the shared
/// object header; only the field table is stored here.
#[repr(C)]
pub struct ObjectInstance {
    pub object: Object,
    pub fields: Table,
}

impl ObjectInstance {
    pub fn new(class: *mut ObjectClass) -> Box<ObjectInstance> {
        let mut object = Object::new(ObjectKind::ObjInstance);
        object.class = class;
        Box::new(ObjectInstance {
            object,
            fields: Table::new(),
        })
    }
}
