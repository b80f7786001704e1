//! Host embedding surface. Stack slots are relative to the active native
//! call frame while one is running (`this` at slot 0, arguments at 1..=n);
//! outside a native call they index from the bottom of the value stack.
//! `check_*` accessors raise `InvalidArgException` on a type mismatch, so a
//! native can propagate the failure with `?` and let the VM unwind.

use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_native::NativeFn;
use crate::value::{
    as_bool, as_handle, as_number, as_object, is_bool, is_handle, is_instance, is_null, is_number,
    is_string, make_bool_value, make_handle_value, make_null_value, make_number_value,
    make_object_value, Handle, Value,
};
use crate::vm::{NativeDef, VM};

impl VM {
    // ---- typed pushers ----

    pub fn push_null(&mut self) {
        self.push(make_null_value());
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push(make_bool_value(value));
    }

    pub fn push_number(&mut self, value: f64) {
        self.push(make_number_value(value));
    }

    pub fn push_string(&mut self, value: &str) {
        let string = self.intern_string(value);
        self.push(make_object_value(string as *mut Object));
    }

    pub fn push_handle(&mut self, handle: Handle) {
        self.push(make_handle_value(handle));
    }

    pub fn pop_value(&mut self) -> Value {
        self.pop()
    }

    pub fn push_value(&mut self, value: Value) {
        self.push(value);
    }

    // ---- typed getters ----

    pub fn slot(&self, slot: usize) -> Value {
        self.native_slot(slot)
    }

    pub fn get_bool(&self, slot: usize) -> Option<bool> {
        let value = self.native_slot(slot);
        is_bool(&value).then(|| as_bool(&value))
    }

    pub fn get_number(&self, slot: usize) -> Option<f64> {
        let value = self.native_slot(slot);
        is_number(&value).then(|| as_number(&value))
    }

    pub fn get_string(&self, slot: usize) -> Option<String> {
        let value = self.native_slot(slot);
        is_string(&value).then(|| unsafe { (*as_object(&value)).as_string().content.clone() })
    }

    pub fn get_handle(&self, slot: usize) -> Option<Handle> {
        let value = self.native_slot(slot);
        is_handle(&value).then(|| as_handle(&value))
    }

    pub fn slot_is_null(&self, slot: usize) -> bool {
        is_null(&self.native_slot(slot))
    }

    // ---- checked getters ----

    pub fn check_number(&mut self, slot: usize) -> Result<f64, ()> {
        let value = self.native_slot(slot);
        if !is_number(&value) {
            let type_name = self.type_name(&value);
            self.throw(
                self.core.invalid_arg_exception,
                &format!("Expected a number, got '{}'.", type_name),
            )?;
            unreachable!("throw always unwinds");
        }
        Ok(as_number(&value))
    }

    pub fn check_int(&mut self, slot: usize) -> Result<i64, ()> {
        let number = self.check_number(slot)?;
        if number.fract() != 0.0 {
            self.throw(
                self.core.invalid_arg_exception,
                "Expected an integer number.",
            )?;
            unreachable!("throw always unwinds");
        }
        Ok(number as i64)
    }

    pub fn check_bool(&mut self, slot: usize) -> Result<bool, ()> {
        let value = self.native_slot(slot);
        if !is_bool(&value) {
            let type_name = self.type_name(&value);
            self.throw(
                self.core.invalid_arg_exception,
                &format!("Expected a boolean, got '{}'.", type_name),
            )?;
            unreachable!("throw always unwinds");
        }
        Ok(as_bool(&value))
    }

    pub fn check_string(&mut self, slot: usize) -> Result<String, ()> {
        let value = self.native_slot(slot);
        if !is_string(&value) {
            let type_name = self.type_name(&value);
            self.throw(
                self.core.invalid_arg_exception,
                &format!("Expected a string, got '{}'.", type_name),
            )?;
            unreachable!("throw always unwinds");
        }
        Ok(unsafe { (*as_object(&value)).as_string().content.clone() })
    }

    pub fn check_handle(&mut self, slot: usize) -> Result<Handle, ()> {
        let value = self.native_slot(slot);
        if !is_handle(&value) {
            let type_name = self.type_name(&value);
            self.throw(
                self.core.invalid_arg_exception,
                &format!("Expected a handle, got '{}'.", type_name),
            )?;
            unreachable!("throw always unwinds");
        }
        Ok(as_handle(&value))
    }

    // ---- instance fields ----

    /// Pushes the named field of the instance in `slot`.
    pub fn get_field(&mut self, slot: usize, name: &str) -> Result<(), ()> {
        let value = self.native_slot(slot);
        if !is_instance(&value) {
            let type_name = self.type_name(&value);
            return self.throw(
                self.core.invalid_arg_exception,
                &format!("Expected an instance, got '{}'.", type_name),
            );
        }
        let key = self.intern_string(name);
        let field = unsafe { (*as_object(&value)).as_instance().fields.get(key) };
        match field {
            Some(field) => {
                self.push(field);
                Ok(())
            }
            None => self.throw(
                self.core.name_exception,
                &format!("Object has no field '{}'.", name),
            ),
        }
    }

    /// Pops the top of the stack into the named field of the instance in
    /// `slot`.
    pub fn set_field(&mut self, slot: usize, name: &str) -> Result<(), ()> {
        let target = self.native_slot(slot);
        if !is_instance(&target) {
            let type_name = self.type_name(&target);
            return self.throw(
                self.core.invalid_arg_exception,
                &format!("Expected an instance, got '{}'.", type_name),
            );
        }
        let key = self.intern_string(name);
        let value = self.pop();
        unsafe {
            (*as_object(&target)).as_instance_mut().fields.put(key, value);
        }
        Ok(())
    }

    // ---- calls ----

    /// Calls the value sitting under `argc` pushed arguments and leaves the
    /// result on the stack. Re-enters the dispatch loop for bytecode
    /// callables.
    pub fn call(&mut self, argc: usize) -> Result<(), ()> {
        let floor = self.frames.len();
        let callee = self.peek_steps(argc);
        self.call_value(callee, argc)?;
        if self.frames.len() > floor {
            self.run(floor)?;
        }
        Ok(())
    }

    // ---- host wiring ----

    pub fn set_module_resolver<F>(&mut self, resolver: F)
    where
        F: FnMut(&str) -> Option<String> + 'static,
    {
        self.resolver = Some(Box::new(resolver));
    }

    /// Registers a native for `native` declarations in `module` to bind
    /// against; `"*"` registers it for every module.
    pub fn register_native(
        &mut self,
        module: &str,
        name: &str,
        arity: u8,
        vararg: bool,
        function: NativeFn,
    ) {
        self.natives.insert(
            format!("{}::{}", module, name),
            NativeDef {
                arity,
                vararg,
                function,
            },
        );
    }

    /// Installs a callable global directly into a loaded module, without a
    /// `native` declaration on the script side.
    pub fn define_global_native(
        &mut self,
        module_name: &str,
        name: &str,
        arity: u8,
        vararg: bool,
        function: NativeFn,
    ) {
        let key = self.intern_string(module_name);
        let module = match self.modules.get(key) {
            Some(module_value) => as_object(&module_value) as *mut crate::objects::object_module::ObjectModule,
            None => return,
        };
        let native = self.manager.alloc_native(
            name.to_string(),
            arity,
            vararg,
            vec![],
            module,
            function,
        );
        let name_key = self.intern_string(name);
        unsafe {
            (*module)
                .globals
                .put(name_key, make_object_value(native as *mut Object));
        }
    }

    /// Kind of the object in `slot`, for hosts that dispatch on it.
    pub fn slot_kind(&self, slot: usize) -> Option<ObjectKind> {
        let value = self.native_slot(slot);
        crate::value::is_object(&value).then(|| unsafe { (*as_object(&value)).kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterpretResult;
    use crate::value::value_to_string;

    #[test]
    fn test_push_call_and_read_result() {
        let mut vm = VM::new();
        vm.capture_output();
        assert_eq!(
            vm.evaluate("main", "fun add(a, b) return a + b end"),
            InterpretResult::InterpretOk
        );

        // callee, then arguments
        let key = vm.intern_string("add");
        let module = {
            let main = vm.intern_string("main");
            vm.modules.get(main).unwrap()
        };
        let function = unsafe { (*as_object(&module)).as_module().globals.get(key).unwrap() };
        vm.push_value(function);
        vm.push_number(2.0);
        vm.push_number(40.0);
        assert!(vm.call(2).is_ok());
        let result = vm.pop_value();
        assert_eq!(value_to_string(&result), "42");
    }

    #[test]
    fn test_register_native_binds_declaration() {
        fn triple(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
            let x = vm.check_number(1)?;
            Ok(make_number_value(x * 3.0))
        }

        let mut vm = VM::new();
        vm.capture_output();
        vm.register_native("main", "triple", 1, false, triple);
        assert_eq!(
            vm.evaluate("main", "native triple(x); print(triple(14))"),
            InterpretResult::InterpretOk
        );
        assert_eq!(vm.take_output(), "42\n");
    }

    #[test]
    fn test_check_mismatch_raises_invalid_arg() {
        fn wants_number(vm: &mut VM, _argc: usize) -> Result<Value, ()> {
            let x = vm.check_number(1)?;
            Ok(make_number_value(x))
        }

        let mut vm = VM::new();
        vm.capture_output();
        vm.register_native("main", "wantsNumber", 1, false, wants_number);
        assert_eq!(
            vm.evaluate(
                "main",
                "native wantsNumber(x) \
                 try wantsNumber(\"nope\") \
                 except InvalidArgException as e print(\"invalid\") end"
            ),
            InterpretResult::InterpretOk
        );
        assert_eq!(vm.take_output(), "invalid\n");
    }

    #[test]
    fn test_host_field_access() {
        let mut vm = VM::new();
        vm.capture_output();
        assert_eq!(
            vm.evaluate("main", "class Box end var b = Box() b.v = 7"),
            InterpretResult::InterpretOk
        );

        let key = vm.intern_string("b");
        let module = {
            let main = vm.intern_string("main");
            vm.modules.get(main).unwrap()
        };
        let instance = unsafe { (*as_object(&module)).as_module().globals.get(key).unwrap() };
        vm.push_value(instance);

        // slots are stack-bottom relative outside a native call
        let slot = 0;
        assert!(vm.get_field(slot, "v").is_ok());
        let value = vm.pop_value();
        assert_eq!(value_to_string(&value), "7");

        vm.push_number(9.0);
        assert!(vm.set_field(slot, "v").is_ok());
        assert!(vm.get_field(slot, "v").is_ok());
        assert_eq!(value_to_string(&vm.pop_value()), "9");
        vm.pop_value();
    }

    #[test]
    fn test_handles_round_trip() {
        let mut vm = VM::new();
        let marker = &mut 5u32 as *mut u32 as Handle;
        vm.push_handle(marker);
        assert_eq!(vm.get_handle(0), Some(marker));
        let value = vm.pop_value();
        assert!(is_handle(&value));
    }
}
