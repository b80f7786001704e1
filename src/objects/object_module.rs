use crate::objects::object::{Object, ObjectKind};
use crate::table::Table;

/// A top-level namespace: a name plus its global-variable table.
#[repr(C)]
pub struct ObjectModule {
    pub object: Object,
    pub name: String,
    pub globals: Table,
}

impl ObjectModule {
    pub fn new(name: String) -> Box<ObjectModule> {
        Box::new(ObjectModule {
            object: Object::new(ObjectKind::ObjModule),
            name,
            globals: Table::new(),
        })
    }
}
