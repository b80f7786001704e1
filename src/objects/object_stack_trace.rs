use std::fmt::Write;

use crate::objects::object::{Object, ObjectKind};

/// Rendered dump of the frames an exception unwound through, recorded while
/// no handler matched.
#[repr(C)]
pub struct ObjectStackTrace {
    pub object: Object,
    pub last_frame: i64,
    pub trace: String,
}

impl ObjectStackTrace {
    pub fn new() -> Box<ObjectStackTrace> {
        Box::new(ObjectStackTrace {
            object: Object::new(ObjectKind::ObjStackTrace),
            last_frame: -1,
            trace: String::new(),
        })
    }

    pub fn record(&mut self, line: usize, module: &str, function: &str) {
        self.last_frame += 1;
        let _ = writeln!(self.trace, "[line {}] {}.{}()", line, module, function);
    }
}
