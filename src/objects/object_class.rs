use crate::objects::object::{Object, ObjectKind};
use crate::table::Table;

/// A class: name, optional superclass and the method table. Method lookup
/// walks the superclass chain at call time; `Subclass` linkage only stores
/// the pointer.
#[repr(C)]
pub struct ObjectClass {
    pub object: Object,
    pub name: String,
    pub superclass: *mut ObjectClass,
    pub methods: Table,
}

impl ObjectClass {
    pub fn new(name: String) -> Box<ObjectClass> {
        Box::new(ObjectClass {
            object: Object::new(ObjectKind::ObjClass),
            name,
            superclass: std::ptr::null_mut(),
            methods: Table::new(),
        })
    }
}
