//! Bootstrap of the `__core__` module: the core-class cache, the class
//! hierarchy primitives resolve their methods through, and the built-in
//! natives. Runs once per VM before any user code.

pub mod natives;

use std::ptr::null_mut;

use crate::objects::object::Object;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_string::copy_string;
use crate::value::make_object_value;
use crate::vm::VM;

pub const CORE_MODULE_NAME: &str = "__core__";

/// Per-VM cache of the built-in classes, used for primitive method
/// resolution and for raising well-known exception kinds without a global
/// lookup.
pub struct CoreClasses {
    pub object: *mut ObjectClass,
    pub number: *mut ObjectClass,
    pub boolean: *mut ObjectClass,
    pub string: *mut ObjectClass,
    pub null_class: *mut ObjectClass,
    pub list: *mut ObjectClass,
    pub tuple: *mut ObjectClass,
    pub range: *mut ObjectClass,
    pub function: *mut ObjectClass,
    pub module: *mut ObjectClass,
    pub stack_trace: *mut ObjectClass,
    pub exception: *mut ObjectClass,
    pub io_exception: *mut ObjectClass,
    pub type_exception: *mut ObjectClass,
    pub name_exception: *mut ObjectClass,
    pub method_exception: *mut ObjectClass,
    pub invalid_arg_exception: *mut ObjectClass,
    pub file_not_found_exception: *mut ObjectClass,
    pub regex_exception: *mut ObjectClass,
    pub termination_exception: *mut ObjectClass,
}

impl Default for CoreClasses {
    fn default() -> Self {
        CoreClasses {
            object: null_mut(),
            number: null_mut(),
            boolean: null_mut(),
            string: null_mut(),
            null_class: null_mut(),
            list: null_mut(),
            tuple: null_mut(),
            range: null_mut(),
            function: null_mut(),
            module: null_mut(),
            stack_trace: null_mut(),
            exception: null_mut(),
            io_exception: null_mut(),
            type_exception: null_mut(),
            name_exception: null_mut(),
            method_exception: null_mut(),
            invalid_arg_exception: null_mut(),
            file_not_found_exception: null_mut(),
            regex_exception: null_mut(),
            termination_exception: null_mut(),
        }
    }
}

impl CoreClasses {
    pub fn iter(&self) -> impl Iterator<Item = *mut ObjectClass> {
        [
            self.object,
            self.number,
            self.boolean,
            self.string,
            self.null_class,
            self.list,
            self.tuple,
            self.range,
            self.function,
            self.module,
            self.stack_trace,
            self.exception,
            self.io_exception,
            self.type_exception,
            self.name_exception,
            self.method_exception,
            self.invalid_arg_exception,
            self.file_not_found_exception,
            self.regex_exception,
            self.termination_exception,
        ]
        .into_iter()
    }
}

pub fn init_core(vm: &mut VM) {
    let module = vm.manager.alloc_module(CORE_MODULE_NAME.to_string());
    vm.core_module = module;
    let key = copy_string(&mut vm.manager, &mut vm.intern, CORE_MODULE_NAME);
    vm.modules
        .put(key, make_object_value(module as *mut Object));

    let object = define_class(vm, "Object", null_mut());
    vm.core.object = object;
    vm.core.number = define_class(vm, "Number", object);
    vm.core.boolean = define_class(vm, "Boolean", object);
    vm.core.string = define_class(vm, "String", object);
    vm.core.null_class = define_class(vm, "Null", object);
    vm.core.list = define_class(vm, "List", object);
    vm.core.tuple = define_class(vm, "Tuple", object);
    vm.core.range = define_class(vm, "Range", object);
    vm.core.function = define_class(vm, "Function", object);
    vm.core.module = define_class(vm, "Module", object);
    vm.core.stack_trace = define_class(vm, "StackTrace", object);

    let exception = define_class(vm, "Exception", object);
    vm.core.exception = exception;
    vm.core.io_exception = define_class(vm, "IOException", exception);
    vm.core.type_exception = define_class(vm, "TypeException", exception);
    vm.core.name_exception = define_class(vm, "NameException", exception);
    vm.core.method_exception = define_class(vm, "MethodException", exception);
    vm.core.invalid_arg_exception = define_class(vm, "InvalidArgException", exception);
    vm.core.file_not_found_exception = define_class(vm, "FileNotFoundException", exception);
    vm.core.regex_exception = define_class(vm, "RegexException", exception);
    vm.core.termination_exception = define_class(vm, "TerminationException", exception);

    natives::install(vm);
}

fn define_class(vm: &mut VM, name: &str, superclass: *mut ObjectClass) -> *mut ObjectClass {
    let class = vm.manager.alloc_class(name.to_string());
    unsafe {
        (*class).superclass = superclass;
    }
    let key = copy_string(&mut vm.manager, &mut vm.intern, name);
    unsafe {
        (*vm.core_module)
            .globals
            .put(key, make_object_value(class as *mut Object));
    }
    class
}
