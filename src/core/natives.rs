use std::time::{SystemTime, UNIX_EPOCH};

use crate::objects::object::Object;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_native::NativeFn;
use crate::objects::object_string::copy_string;
use crate::value::{
    as_number, as_object, is_null, is_number, make_null_value, make_number_value,
    make_object_value, value_to_string, Value,
};
use crate::vm::VM;

pub(crate) fn install(vm: &mut VM) {
    def_native(vm, "print", 0, true, vec![], native_print);
    def_native(vm, "type", 1, false, vec![], native_type);
    def_native(vm, "clock", 0, false, vec![], native_clock);

    let empty = {
        let string = copy_string(&mut vm.manager, &mut vm.intern, "");
        make_object_value(string as *mut Object)
    };
    let exception = vm.core.exception;
    def_method(vm, exception, "new", 1, false, vec![empty], exc_new);

    let list = vm.core.list;
    def_method(vm, list, "add", 1, false, vec![], list_add);
    def_method(vm, list, "insert", 2, false, vec![], list_insert);
    def_method(vm, list, "remove", 1, false, vec![], list_remove);
    def_method(vm, list, "clear", 0, false, vec![], list_clear);
    def_method(vm, list, "__iter__", 1, false, vec![], list_iter);
    def_method(vm, list, "__next__", 1, false, vec![], list_next);

    let tuple = vm.core.tuple;
    def_method(vm, tuple, "__iter__", 1, false, vec![], tuple_iter);
    def_method(vm, tuple, "__next__", 1, false, vec![], tuple_next);

    let null_default = make_null_value();
    let range = vm.core.range;
    def_method(
        vm,
        range,
        "new",
        3,
        false,
        vec![null_default, null_default],
        range_new,
    );
    def_method(vm, range, "__iter__", 1, false, vec![], range_iter);
    def_method(vm, range, "__next__", 1, false, vec![], range_next);

    let string = vm.core.string;
    def_method(vm, string, "len", 0, false, vec![], string_len);
    def_method(vm, string, "sub", 2, false, vec![null_default], string_sub);
    def_method(vm, string, "contains", 1, false, vec![], string_contains);
    def_method(vm, string, "__iter__", 1, false, vec![], string_iter);
    def_method(vm, string, "__next__", 1, false, vec![], string_next);

    let number = vm.core.number;
    def_method(vm, number, "floor", 0, false, vec![], number_floor);
    def_method(vm, number, "ceil", 0, false, vec![], number_ceil);
    def_method(vm, number, "round", 0, false, vec![], number_round);
}

fn def_native(
    vm: &mut VM,
    name: &str,
    arity: u8,
    vararg: bool,
    defaults: Vec<Value>,
    function: NativeFn,
) {
    let module = vm.core_module;
    let native = vm
        .manager
        .alloc_native(name.to_string(), arity, vararg, defaults, module, function);
    let key = copy_string(&mut vm.manager, &mut vm.intern, name);
    unsafe {
        (*module)
            .globals
            .put(key, make_object_value(native as *mut Object));
    }
}

fn def_method(
    vm: &mut VM,
    class: *mut ObjectClass,
    name: &str,
    arity: u8,
    vararg: bool,
    defaults: Vec<Value>,
    function: NativeFn,
) {
    let native = vm.manager.alloc_native(
        name.to_string(),
        arity,
        vararg,
        defaults,
        vm.core_module,
        function,
    );
    let key = copy_string(&mut vm.manager, &mut vm.intern, name);
    unsafe {
        (*class)
            .methods
            .put(key, make_object_value(native as *mut Object));
    }
}

// ---- free natives ----

fn native_print(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let varargs = vm.native_slot(1);
    let parts: Vec<String> = unsafe {
        (*as_object(&varargs))
            .as_tuple()
            .items
            .iter()
            .map(value_to_string)
            .collect()
    };
    vm.write_line(&parts.join(" "));
    Ok(make_null_value())
}

fn native_type(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let value = vm.native_slot(1);
    let class = vm.class_of(&value);
    if class.is_null() {
        Ok(make_null_value())
    } else {
        Ok(make_object_value(class as *mut Object))
    }
}

fn native_clock(_vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let now = SystemTime::now();
    let elapsed = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(make_number_value(elapsed.as_millis() as f64))
}

// ---- Exception ----

fn exc_new(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let err = vm.native_slot(1);
    let key = vm.intern_string("err");
    unsafe {
        (*as_object(&this)).as_instance_mut().fields.put(key, err);
    }
    Ok(this)
}

// ---- List ----

fn list_add(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let value = vm.native_slot(1);
    unsafe {
        (*as_object(&this)).as_list_mut().items.push(value);
    }
    Ok(make_null_value())
}

fn list_insert(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let index = vm.check_int(1)?;
    let value = vm.native_slot(2);
    let items = unsafe { &mut (*as_object(&this)).as_list_mut().items };
    if index < 0 || index as usize > items.len() {
        return vm
            .throw(vm.core.invalid_arg_exception, "List index out of range.")
            .map(|_| make_null_value());
    }
    items.insert(index as usize, value);
    Ok(make_null_value())
}

fn list_remove(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let index = vm.check_int(1)?;
    let items = unsafe { &mut (*as_object(&this)).as_list_mut().items };
    if index < 0 || index as usize >= items.len() {
        return vm
            .throw(vm.core.invalid_arg_exception, "List index out of range.")
            .map(|_| make_null_value());
    }
    Ok(items.remove(index as usize))
}

fn list_clear(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    unsafe {
        (*as_object(&this)).as_list_mut().items.clear();
    }
    Ok(make_null_value())
}

fn sequence_iter(len: usize, state: &Value, vm: &mut VM) -> Result<Value, ()> {
    if is_null(state) {
        return Ok(if len == 0 {
            make_null_value()
        } else {
            make_number_value(0.0)
        });
    }
    if !is_number(state) {
        return vm
            .throw(vm.core.type_exception, "Invalid iteration state.")
            .map(|_| make_null_value());
    }
    let next = as_number(state) + 1.0;
    Ok(if (next as usize) < len {
        make_number_value(next)
    } else {
        make_null_value()
    })
}

fn list_iter(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let state = vm.native_slot(1);
    let len = unsafe { (*as_object(&this)).as_list().items.len() };
    sequence_iter(len, &state, vm)
}

fn list_next(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let index = vm.check_int(1)?;
    let items = unsafe { &(*as_object(&this)).as_list().items };
    match items.get(index as usize) {
        Some(value) => Ok(*value),
        None => vm
            .throw(vm.core.invalid_arg_exception, "Iteration state out of range.")
            .map(|_| make_null_value()),
    }
}

// ---- Tuple ----

fn tuple_iter(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let state = vm.native_slot(1);
    let len = unsafe { (*as_object(&this)).as_tuple().items.len() };
    sequence_iter(len, &state, vm)
}

fn tuple_next(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let index = vm.check_int(1)?;
    let items = unsafe { &(*as_object(&this)).as_tuple().items };
    match items.get(index as usize) {
        Some(value) => Ok(*value),
        None => vm
            .throw(vm.core.invalid_arg_exception, "Iteration state out of range.")
            .map(|_| make_null_value()),
    }
}

// ---- Range ----

fn range_new(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let first = vm.check_number(1)?;
    let stop_value = vm.native_slot(2);
    let step_value = vm.native_slot(3);

    let (start, stop) = if is_null(&stop_value) {
        (0.0, first)
    } else {
        (first, vm.check_number(2)?)
    };
    let step = if is_null(&step_value) {
        1.0
    } else {
        vm.check_number(3)?
    };
    if step == 0.0 {
        return vm
            .throw(vm.core.invalid_arg_exception, "Range step cannot be zero.")
            .map(|_| make_null_value());
    }

    vm.maybe_collect();
    let range = vm.manager.alloc_range(start, stop, step);
    Ok(make_object_value(range as *mut Object))
}

fn range_iter(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let state = vm.native_slot(1);
    let range = unsafe { (*as_object(&this)).as_range() };

    if is_null(&state) {
        return Ok(if range.in_bounds(range.start) {
            make_number_value(range.start)
        } else {
            make_null_value()
        });
    }
    if !is_number(&state) {
        return vm
            .throw(vm.core.type_exception, "Invalid iteration state.")
            .map(|_| make_null_value());
    }
    let next = as_number(&state) + range.step;
    Ok(if range.in_bounds(next) {
        make_number_value(next)
    } else {
        make_null_value()
    })
}

fn range_next(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let state = vm.check_number(1)?;
    Ok(make_number_value(state))
}

// ---- String ----

fn string_len(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let len = unsafe { (*as_object(&this)).as_string().len() };
    Ok(make_number_value(len as f64))
}

fn string_sub(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let start = vm.check_int(1)?;
    let stop_value = vm.native_slot(2);

    let content = unsafe { (*as_object(&this)).as_string().content.clone() };
    let stop = if is_null(&stop_value) {
        content.len() as i64
    } else {
        vm.check_int(2)?
    };

    if start < 0 || stop < start || stop as usize > content.len() {
        return vm
            .throw(vm.core.invalid_arg_exception, "String index out of range.")
            .map(|_| make_null_value());
    }
    let Some(slice) = content.get(start as usize..stop as usize) else {
        return vm
            .throw(
                vm.core.invalid_arg_exception,
                "String indexes must lie on character boundaries.",
            )
            .map(|_| make_null_value());
    };

    let slice = slice.to_string();
    vm.maybe_collect();
    let string = copy_string(&mut vm.manager, &mut vm.intern, &slice);
    Ok(make_object_value(string as *mut Object))
}

fn string_contains(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let needle = vm.check_string(1)?;
    let found = unsafe { (*as_object(&this)).as_string().content.contains(&needle) };
    Ok(crate::value::make_bool_value(found))
}

fn string_iter(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let state = vm.native_slot(1);
    let content = unsafe { &(*as_object(&this)).as_string().content };

    if is_null(&state) {
        return Ok(if content.is_empty() {
            make_null_value()
        } else {
            make_number_value(0.0)
        });
    }
    if !is_number(&state) {
        return vm
            .throw(vm.core.type_exception, "Invalid iteration state.")
            .map(|_| make_null_value());
    }
    let index = as_number(&state) as usize;
    let Some(ch) = content[index..].chars().next() else {
        return Ok(make_null_value());
    };
    let next = index + ch.len_utf8();
    Ok(if next < content.len() {
        make_number_value(next as f64)
    } else {
        make_null_value()
    })
}

fn string_next(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    let index = vm.check_int(1)? as usize;
    let ch = unsafe {
        let content = &(*as_object(&this)).as_string().content;
        content[index..].chars().next()
    };
    let Some(ch) = ch else {
        return vm
            .throw(vm.core.invalid_arg_exception, "Iteration state out of range.")
            .map(|_| make_null_value());
    };
    let text = ch.to_string();
    vm.maybe_collect();
    let string = copy_string(&mut vm.manager, &mut vm.intern, &text);
    Ok(make_object_value(string as *mut Object))
}

// ---- Number ----

fn number_floor(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    Ok(make_number_value(as_number(&this).floor()))
}

fn number_ceil(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    Ok(make_number_value(as_number(&this).ceil()))
}

fn number_round(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
    let this = vm.native_slot(0);
    Ok(make_number_value(as_number(&this).round()))
}
