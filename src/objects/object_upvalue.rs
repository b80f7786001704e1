use crate::objects::object::{Object, ObjectKind};
use crate::value::{make_null_value, Value};

/// A variable captured from an enclosing frame. While open, `addr` points at
/// the live stack slot; closing copies the value into `closed` and redirects
/// `addr` at it. `next` links the VM's list of open upvalues, kept strictly
/// decreasing in stack address; it is null once closed.
#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub addr: *mut Value,
    pub closed: Value,
    pub next: *mut ObjectUpvalue,
}

impl ObjectUpvalue {
    pub fn new(addr: *mut Value) -> Box<ObjectUpvalue> {
        Box::new(ObjectUpvalue {
            object: Object::new(ObjectKind::ObjUpvalue),
            addr,
            closed: make_null_value(),
            next: std::ptr::null_mut(),
        })
    }

    pub fn close(&mut self) {
        self.closed = unsafe { *self.addr };
        self.addr = &mut self.closed;
        self.next = std::ptr::null_mut();
    }

    pub fn is_closed(&self) -> bool {
        std::ptr::eq(self.addr, &self.closed)
    }
}
