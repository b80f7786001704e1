use std::ffi::c_void;

use crate::objects::object::{Object, ObjectKind};

/// An opaque host pointer carried through the VM untouched.
pub type Handle = *mut c_void;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    ValueNull,
    ValueBool,
    ValueNumber,
    ValueHandle,
    ValueObject,
}

#[derive(Clone, Copy)]
pub union ValueUnion {
    pub boolean: bool,
    pub number: f64,
    pub handle: Handle,
    pub object: *mut Object,
}

/// The uniform datum every stack slot, constant and table entry holds.
/// A tag plus an untagged union, sized so it stays trivially copyable.
#[derive(Clone, Copy)]
pub struct Value {
    pub value_type: ValueType,
    pub value_as: ValueUnion,
}

pub type ValueArray = Vec<Value>;

pub fn make_null_value() -> Value {
    Value {
        value_type: ValueType::ValueNull,
        value_as: ValueUnion { number: 0.0 },
    }
}

pub fn make_bool_value(boolean: bool) -> Value {
    Value {
        value_type: ValueType::ValueBool,
        value_as: ValueUnion { boolean },
    }
}

pub fn make_number_value(number: f64) -> Value {
    Value {
        value_type: ValueType::ValueNumber,
        value_as: ValueUnion { number },
    }
}

pub fn make_handle_value(handle: Handle) -> Value {
    Value {
        value_type: ValueType::ValueHandle,
        value_as: ValueUnion { handle },
    }
}

pub fn make_object_value(object: *mut Object) -> Value {
    Value {
        value_type: ValueType::ValueObject,
        value_as: ValueUnion { object },
    }
}

pub fn is_null(value: &Value) -> bool {
    value.value_type == ValueType::ValueNull
}

pub fn is_bool(value: &Value) -> bool {
    value.value_type == ValueType::ValueBool
}

pub fn is_number(value: &Value) -> bool {
    value.value_type == ValueType::ValueNumber
}

pub fn is_handle(value: &Value) -> bool {
    value.value_type == ValueType::ValueHandle
}

pub fn is_object(value: &Value) -> bool {
    value.value_type == ValueType::ValueObject
}

pub fn is_object_kind(value: &Value, kind: ObjectKind) -> bool {
    is_object(value) && unsafe { (*as_object(value)).kind == kind }
}

pub fn is_string(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::ObjString)
}

pub fn is_instance(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::ObjInstance)
}

pub fn is_class(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::ObjClass)
}

pub fn is_module(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::ObjModule)
}

pub fn as_bool(value: &Value) -> bool {
    unsafe { value.value_as.boolean }
}

pub fn as_number(value: &Value) -> f64 {
    unsafe { value.value_as.number }
}

pub fn as_handle(value: &Value) -> Handle {
    unsafe { value.value_as.handle }
}

pub fn as_object(value: &Value) -> *mut Object {
    unsafe { value.value_as.object }
}

/// `null` and `false` are falsy, every other value (including `0` and the
/// empty string) is truthy.
pub fn is_falsey(value: &Value) -> bool {
    is_null(value) || (is_bool(value) && !as_bool(value))
}

/// Equality is per-variant. Interning makes pointer comparison the correct
/// (and complete) equality for strings; other objects compare by identity.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a.value_type != b.value_type {
        return false;
    }
    match a.value_type {
        ValueType::ValueNull => true,
        ValueType::ValueBool => as_bool(a) == as_bool(b),
        ValueType::ValueNumber => as_number(a) == as_number(b),
        ValueType::ValueHandle => as_handle(a) == as_handle(b),
        ValueType::ValueObject => std::ptr::eq(as_object(a), as_object(b)),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        values_equal(self, other)
    }
}

/// Formats a number the way the language prints it: integral doubles print
/// without a fractional part.
pub fn number_to_string(number: f64) -> String {
    if number.is_nan() {
        return "nan".to_string();
    }
    if number.is_infinite() {
        return if number > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        let formatted = format!("{:.10}", number);
        let formatted = formatted.trim_end_matches('0').trim_end_matches('.');
        formatted.to_string()
    }
}

/// The `print` rendering of a value. Strings render bare; container elements
/// render through [`value_to_repr`] so nested strings stay quoted.
pub fn value_to_string(value: &Value) -> String {
    match value.value_type {
        ValueType::ValueNull => "null".to_string(),
        ValueType::ValueBool => as_bool(value).to_string(),
        ValueType::ValueNumber => number_to_string(as_number(value)),
        ValueType::ValueHandle => format!("<handle {:p}>", as_handle(value)),
        ValueType::ValueObject => unsafe { object_to_string(as_object(value)) },
    }
}

pub fn value_to_repr(value: &Value) -> String {
    if is_string(value) {
        let content = unsafe { (*as_object(value)).as_string().content.as_str() };
        format!("\"{}\"", content)
    } else {
        value_to_string(value)
    }
}

unsafe fn object_to_string(object: *mut Object) -> String {
    match (*object).kind {
        ObjectKind::ObjString => (*object).as_string().content.clone(),
        ObjectKind::ObjFunction => {
            let function = (*object).as_function();
            if function.name.is_empty() {
                "<fun anonymous>".to_string()
            } else {
                format!("<fun {}>", function.name)
            }
        }
        ObjectKind::ObjNative => format!("<native {}>", (*object).as_native().name),
        ObjectKind::ObjClosure => object_to_string((*object).as_closure().function as *mut Object),
        ObjectKind::ObjBoundMethod => object_to_string((*object).as_bound_method().method),
        ObjectKind::ObjClass => format!("<class {}>", (*object).as_class().name),
        ObjectKind::ObjInstance => {
            let class = (*object).class;
            if class.is_null() {
                "<instance>".to_string()
            } else {
                format!("<instance of {}>", (*class).name)
            }
        }
        ObjectKind::ObjModule => format!("<module {}>", (*object).as_module().name),
        ObjectKind::ObjList => {
            let items = &(*object).as_list().items;
            let rendered: Vec<String> = items.iter().map(value_to_repr).collect();
            format!("[{}]", rendered.join(", "))
        }
        ObjectKind::ObjTuple => {
            let items = &(*object).as_tuple().items;
            let rendered: Vec<String> = items.iter().map(value_to_repr).collect();
            if rendered.len() == 1 {
                format!("({},)", rendered[0])
            } else {
                format!("({})", rendered.join(", "))
            }
        }
        ObjectKind::ObjRange => {
            let range = (*object).as_range();
            format!(
                "range({}, {}, {})",
                number_to_string(range.start),
                number_to_string(range.stop),
                number_to_string(range.step)
            )
        }
        ObjectKind::ObjUpvalue => "<upvalue>".to_string(),
        ObjectKind::ObjStackTrace => (*object).as_stack_trace().trace.clone(),
    }
}

pub fn print_value(value: &Value) {
    print!("{}", value_to_string(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(is_falsey(&make_null_value()));
        assert!(is_falsey(&make_bool_value(false)));
        assert!(!is_falsey(&make_bool_value(true)));
        assert!(!is_falsey(&make_number_value(0.0)));
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(7.0), "7");
        assert_eq!(number_to_string(-3.0), "-3");
        assert_eq!(number_to_string(2.5), "2.5");
        assert_eq!(number_to_string(0.1), "0.1");
        assert_eq!(number_to_string(f64::NAN), "nan");
    }

    #[test]
    fn test_values_equal() {
        assert!(values_equal(&make_number_value(1.0), &make_number_value(1.0)));
        assert!(!values_equal(&make_number_value(1.0), &make_bool_value(true)));
        assert!(values_equal(&make_null_value(), &make_null_value()));
        assert!(!values_equal(&make_bool_value(true), &make_bool_value(false)));
    }
}
