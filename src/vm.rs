use std::collections::HashMap;

use crate::call_frame::{ActiveHandler, CallFrame};
use crate::chunk::{Chunk, HandlerDesc, OpCode};
use crate::compiler::Compiler;
use crate::core::{self, CoreClasses};
use crate::error::InterpretResult;
use crate::gc::GarbageCollector;
use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_module::ObjectModule;
use crate::objects::object_native::{NativeFn, ObjectNative};
use crate::objects::object_stack_trace::ObjectStackTrace;
use crate::objects::object_string::{copy_string, take_string, ObjectString};
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::parser::Parser;
use crate::table::{InternTable, Table};
use crate::value::{
    as_number, as_object, is_falsey, is_instance, is_number, is_object, is_string,
    make_bool_value, make_null_value, make_number_value, make_object_value, value_to_string,
    values_equal, Value, ValueType,
};

pub const FRAMES_MAX: usize = 256;
pub const STACK_MAX: usize = FRAMES_MAX * 64;

/// A host native registered for `native` declarations to bind against.
pub(crate) struct NativeDef {
    pub arity: u8,
    pub vararg: bool,
    pub function: NativeFn,
}

pub(crate) enum OutputSink {
    Stdout,
    Capture(String),
}

/// The virtual machine: value stack, frame stack, open-upvalue list, module
/// registry, intern table, core-class cache and the propagating-exception
/// slot. Every table is per-VM so multiple instances can coexist.
pub struct VM {
    pub(crate) stack: Vec<Value>,
    pub(crate) stack_top_pos: usize,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) open_upvalues: *mut ObjectUpvalue,
    pub(crate) manager: ObjectManager,
    pub(crate) intern: InternTable,
    pub(crate) modules: Table,
    pub(crate) core: CoreClasses,
    pub(crate) core_module: *mut ObjectModule,
    pub(crate) exception: Value,
    pub(crate) last_exception: Value,
    pub(crate) stack_trace: *mut ObjectStackTrace,
    gc: GarbageCollector,
    pub(crate) resolver: Option<Box<dyn FnMut(&str) -> Option<String>>>,
    pub(crate) natives: HashMap<String, NativeDef>,
    pub(crate) native_base: usize,
    halt: bool,
    out: OutputSink,
}

impl VM {
    pub fn new() -> Box<VM> {
        let mut vm = Box::new(VM {
            stack: vec![make_null_value(); STACK_MAX],
            stack_top_pos: 0,
            frames: vec![],
            open_upvalues: std::ptr::null_mut(),
            manager: ObjectManager::new(),
            intern: InternTable::new(),
            modules: Table::new(),
            core: CoreClasses::default(),
            core_module: std::ptr::null_mut(),
            exception: make_null_value(),
            last_exception: make_null_value(),
            stack_trace: std::ptr::null_mut(),
            gc: GarbageCollector::new(),
            resolver: None,
            natives: HashMap::new(),
            native_base: 0,
            halt: false,
            out: OutputSink::Stdout,
        });
        core::init_core(&mut vm);
        vm
    }

    /// Compiles and runs `source` as the body of `module_name`, creating the
    /// module on first use and reusing its globals afterwards.
    pub fn evaluate(&mut self, module_name: &str, source: &str) -> InterpretResult {
        let stmts = match Parser::new(source).parse() {
            Ok(stmts) => stmts,
            Err(errors) => {
                for error in errors {
                    eprintln!("{}", error);
                }
                return InterpretResult::InterpretCompileError;
            }
        };

        let module = self.get_or_create_module(module_name);
        let function =
            match Compiler::new(&mut self.manager, &mut self.intern, module).compile(&stmts) {
                Ok(function) => function,
                Err(errors) => {
                    for error in errors {
                        eprintln!("{}", error);
                    }
                    return InterpretResult::InterpretCompileError;
                }
            };

        let closure = self.manager.alloc_closure(function);
        self.push(make_object_value(closure as *mut Object));
        let callee = self.peek_steps(0);
        if self.call_value(callee, 0).is_err() {
            self.report_runtime_error();
            self.reset_after_error();
            return InterpretResult::InterpretRuntimeError;
        }

        match self.run(0) {
            Ok(()) => {
                // The module body evaluates to its module object.
                self.pop();
                InterpretResult::InterpretOk
            }
            Err(()) => {
                self.report_runtime_error();
                self.reset_after_error();
                InterpretResult::InterpretRuntimeError
            }
        }
    }

    pub fn set_halt(&mut self, halt: bool) {
        self.halt = halt;
    }

    pub fn capture_output(&mut self) {
        self.out = OutputSink::Capture(String::new());
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            OutputSink::Stdout => String::new(),
            OutputSink::Capture(buffer) => std::mem::take(buffer),
        }
    }

    pub(crate) fn write_line(&mut self, text: &str) {
        match &mut self.out {
            OutputSink::Stdout => println!("{}", text),
            OutputSink::Capture(buffer) => {
                buffer.push_str(text);
                buffer.push('\n');
            }
        }
    }

    /// Exception message of the last unhandled error, for the host.
    pub fn error_message(&self) -> Option<String> {
        if !is_instance(&self.exception) {
            return None;
        }
        unsafe {
            let instance = (*as_object(&self.exception)).as_instance();
            let class_name = (*(*as_object(&self.exception)).class).name.clone();
            let err = self
                .intern
                .find("err")
                .and_then(|key| instance.fields.get(key))
                .map(|value| value_to_string(&value))
                .unwrap_or_default();
            Some(format!("{}: {}", class_name, err))
        }
    }

    pub fn stack_trace_text(&self) -> Option<String> {
        if self.stack_trace.is_null() {
            return None;
        }
        Some(unsafe { (*self.stack_trace).trace.clone() })
    }

    fn report_runtime_error(&mut self) {
        if let Some(message) = self.error_message() {
            eprintln!("Unhandled {}", message);
        }
        if let Some(trace) = self.stack_trace_text() {
            eprint!("{}", trace);
        }
    }

    fn reset_after_error(&mut self) {
        self.stack_top_pos = 0;
        self.frames.clear();
        self.open_upvalues = std::ptr::null_mut();
        self.native_base = 0;
    }

    // ---- stack ----

    pub(crate) fn push(&mut self, value: Value) {
        assert!(self.stack_top_pos < STACK_MAX, "value stack overflow");
        self.stack[self.stack_top_pos] = value;
        self.stack_top_pos += 1;
    }

    pub(crate) fn pop(&mut self) -> Value {
        assert!(self.stack_top_pos > 0, "value stack underflow");
        self.stack_top_pos -= 1;
        self.stack[self.stack_top_pos]
    }

    pub(crate) fn peek_steps(&self, distance: usize) -> Value {
        self.stack[self.stack_top_pos - distance - 1]
    }

    pub(crate) fn native_slot(&self, index: usize) -> Value {
        self.stack[self.native_base + index]
    }

    // ---- frames and bytecode reading ----

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn current_function(&self) -> *mut ObjectFunction {
        self.frame().function()
    }

    pub(crate) fn current_module(&self) -> *mut ObjectModule {
        unsafe { (*self.current_function()).module }
    }

    fn current_chunk(&self) -> &Chunk {
        unsafe { &(*self.current_function()).chunk }
    }

    fn read_byte(&mut self) -> u8 {
        let function = self.current_function();
        let frame = self.frame_mut();
        let byte = unsafe { (&(*function).chunk.code)[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        unsafe { (&(*self.current_function()).chunk.constants)[index] }
    }

    fn read_string_constant(&mut self) -> *mut ObjectString {
        as_object(&self.read_constant()) as *mut ObjectString
    }

    // ---- allocation with collection points ----

    pub(crate) fn maybe_collect(&mut self) {
        if self.manager.should_collect() {
            self.collect_garbage();
        }
    }

    /// Runs a full stop-the-world cycle. Callers must ensure every live
    /// value is reachable from a root (the eval stack being the usual one).
    pub fn collect_garbage(&mut self) {
        let before = self.manager.bytes_allocated();
        let mut gc = std::mem::take(&mut self.gc);
        gc.mark_roots(self);
        gc.mark_value(&self.last_exception);
        gc.trace_references();
        self.intern.remove_unmarked();
        let freed = gc.sweep(&mut self.manager);
        self.manager.update_after_collection(freed);
        let after = self.manager.bytes_allocated();
        gc.record_cycle(before, freed, after, self.manager.next_gc());
        self.gc = gc;
    }

    pub fn gc_cycles(&self) -> u64 {
        self.gc.stats().cycles
    }

    pub(crate) fn intern_string(&mut self, content: &str) -> *mut ObjectString {
        self.maybe_collect();
        copy_string(&mut self.manager, &mut self.intern, content)
    }

    fn get_or_create_module(&mut self, name: &str) -> *mut ObjectModule {
        let key = copy_string(&mut self.manager, &mut self.intern, name);
        if let Some(existing) = self.modules.get(key) {
            return as_object(&existing) as *mut ObjectModule;
        }
        let module = self.manager.alloc_module(name.to_string());
        self.modules.put(key, make_object_value(module as *mut Object));
        module
    }

    // ---- classes and method resolution ----

    pub(crate) fn class_of(&self, value: &Value) -> *mut ObjectClass {
        match value.value_type {
            ValueType::ValueNull => self.core.null_class,
            ValueType::ValueBool => self.core.boolean,
            ValueType::ValueNumber => self.core.number,
            ValueType::ValueHandle => std::ptr::null_mut(),
            ValueType::ValueObject => unsafe {
                let object = as_object(value);
                match (*object).kind {
                    ObjectKind::ObjString => self.core.string,
                    ObjectKind::ObjList => self.core.list,
                    ObjectKind::ObjTuple => self.core.tuple,
                    ObjectKind::ObjRange => self.core.range,
                    ObjectKind::ObjFunction
                    | ObjectKind::ObjNative
                    | ObjectKind::ObjClosure
                    | ObjectKind::ObjBoundMethod => self.core.function,
                    ObjectKind::ObjModule => self.core.module,
                    ObjectKind::ObjStackTrace => self.core.stack_trace,
                    ObjectKind::ObjInstance => (*object).class,
                    ObjectKind::ObjClass => self.core.object,
                    ObjectKind::ObjUpvalue => std::ptr::null_mut(),
                }
            },
        }
    }

    pub(crate) fn type_name(&self, value: &Value) -> String {
        let class = self.class_of(value);
        if class.is_null() {
            "handle".to_string()
        } else {
            unsafe { (*class).name.clone() }
        }
    }

    fn lookup_method(&self, mut class: *mut ObjectClass, name: *mut ObjectString) -> Option<Value> {
        while !class.is_null() {
            unsafe {
                if let Some(method) = (*class).methods.get(name) {
                    return Some(method);
                }
                class = (*class).superclass;
            }
        }
        None
    }

    fn lookup_method_str(&self, class: *mut ObjectClass, name: &str) -> Option<Value> {
        // Method names are interned when defined, so an intern miss is a
        // method miss.
        let key = self.intern.find(name)?;
        self.lookup_method(class, key)
    }

    pub(crate) fn class_chain_contains(
        mut class: *mut ObjectClass,
        target: *mut ObjectClass,
    ) -> bool {
        while !class.is_null() {
            if std::ptr::eq(class, target) {
                return true;
            }
            class = unsafe { (*class).superclass };
        }
        false
    }

    // ---- raising ----

    pub(crate) fn throw(&mut self, class: *mut ObjectClass, message: &str) -> Result<(), ()> {
        let class = if class.is_null() {
            self.core.exception
        } else {
            class
        };
        self.maybe_collect();
        let instance = self.manager.alloc_instance(class);
        // Root the instance while the message string is interned.
        self.push(make_object_value(instance as *mut Object));
        let message = copy_string(&mut self.manager, &mut self.intern, message);
        let err_key = copy_string(&mut self.manager, &mut self.intern, "err");
        unsafe {
            (*instance)
                .fields
                .put(err_key, make_object_value(message as *mut Object));
        }
        let value = self.pop();
        self.do_raise(value)
    }

    fn do_raise(&mut self, value: Value) -> Result<(), ()> {
        let valid = is_instance(&value)
            && Self::class_chain_contains(unsafe { (*as_object(&value)).class }, self.core.exception);
        if !valid {
            return self.throw(
                self.core.type_exception,
                "Can only raise instances of Exception.",
            );
        }

        // A fresh exception starts a fresh trace; re-raising continues one.
        if !values_equal(&value, &self.last_exception) {
            self.stack_trace = std::ptr::null_mut();
        }
        self.last_exception = value;
        self.exception = value;
        Err(())
    }

    /// Walks frames top-down consuming active handlers. Returns false when
    /// no handler matched down to `frame_floor`; the exception stays set.
    fn unwind(&mut self, frame_floor: usize) -> bool {
        let exception = self.exception;
        loop {
            if self.frames.len() <= frame_floor {
                return false;
            }

            let frame_index = self.frames.len() - 1;
            loop {
                let Some(handler) = self.frames[frame_index].handlers.pop() else {
                    break;
                };
                let pc = self.frames[frame_index].ip.saturating_sub(1);
                if !handler.covers(pc) {
                    // Left behind by a jump out of the region; discard.
                    continue;
                }

                let base = self.frames[frame_index].base;
                self.stack_top_pos = base + handler.stack_slots as usize;
                self.stack[base + handler.slot as usize] = exception;
                self.frames[frame_index].ip = handler.handler_pc;
                self.exception = make_null_value();
                return true;
            }

            self.record_trace_frame(frame_index);
            let base = self.frames[frame_index].base;
            self.close_upvalues(base);
            self.frames.pop();
            self.stack_top_pos = base;
        }
    }

    fn record_trace_frame(&mut self, frame_index: usize) {
        if self.stack_trace.is_null() {
            // Rooted through the VM's stack_trace slot from here on.
            self.stack_trace = self.manager.alloc_stack_trace();
        }
        let frame = &self.frames[frame_index];
        let function = frame.function();
        unsafe {
            let line = (*function).chunk.line_at(frame.ip.saturating_sub(1));
            let module_name = (*(*function).module).name.clone();
            let function_name = if (&(*function).name).is_empty() {
                "<anonymous>"
            } else {
                (*function).name.as_str()
            };
            (*self.stack_trace).record(line, &module_name, function_name);
        }
    }

    fn check_halt(&mut self) -> Result<(), ()> {
        if self.halt {
            self.halt = false;
            return self.throw(self.core.termination_exception, "Execution halted.");
        }
        Ok(())
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, slot_index: usize) -> *mut ObjectUpvalue {
        let addr = &mut self.stack[slot_index] as *mut Value;

        let mut prev: *mut ObjectUpvalue = std::ptr::null_mut();
        let mut current = self.open_upvalues;
        unsafe {
            while !current.is_null() && (*current).addr > addr {
                prev = current;
                current = (*current).next;
            }
            if !current.is_null() && std::ptr::eq((*current).addr, addr) {
                return current;
            }
        }

        self.maybe_collect();
        let created = self.manager.alloc_upvalue(addr);
        unsafe {
            (*created).next = current;
            if prev.is_null() {
                self.open_upvalues = created;
            } else {
                (*prev).next = created;
            }
        }
        created
    }

    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        let from_addr = &mut self.stack[from_slot] as *mut Value;
        unsafe {
            while !self.open_upvalues.is_null() && (*self.open_upvalues).addr >= from_addr {
                let upvalue = self.open_upvalues;
                self.open_upvalues = (*upvalue).next;
                (*upvalue).close();
            }
        }
    }

    // ---- calls ----

    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), ()> {
        if is_object(&callee) {
            let object = as_object(&callee);
            unsafe {
                match (*object).kind {
                    ObjectKind::ObjClosure => {
                        return self.call_closure(object as *mut ObjectClosure, argc)
                    }
                    ObjectKind::ObjNative => {
                        return self.call_native(object as *mut ObjectNative, argc)
                    }
                    ObjectKind::ObjClass => {
                        return self.instantiate(object as *mut ObjectClass, argc)
                    }
                    ObjectKind::ObjBoundMethod => {
                        let bound = (*object).as_bound_method();
                        let slot = self.stack_top_pos - argc - 1;
                        self.stack[slot] = bound.receiver;
                        return self.call_object(bound.method, argc);
                    }
                    _ => {}
                }
            }
        }
        let type_name = self.type_name(&callee);
        self.throw(
            self.core.type_exception,
            &format!("'{}' is not callable.", type_name),
        )
    }

    fn call_object(&mut self, method: *mut Object, argc: usize) -> Result<(), ()> {
        unsafe {
            match (*method).kind {
                ObjectKind::ObjClosure => self.call_closure(method as *mut ObjectClosure, argc),
                ObjectKind::ObjNative => self.call_native(method as *mut ObjectNative, argc),
                _ => self.throw(self.core.type_exception, "Method is not callable."),
            }
        }
    }

    /// Checks the arity, fills defaults, collects varargs into a tuple and
    /// returns the resulting local slot count (named params + vararg).
    fn adjust_args(
        &mut self,
        name: &str,
        arity: usize,
        required: usize,
        vararg: bool,
        defaults_of: *mut Object,
        argc: usize,
    ) -> Result<usize, ()> {
        if argc < required {
            return self.throw(
                self.core.type_exception,
                &format!(
                    "{}() takes at least {} arguments ({} given).",
                    name, required, argc
                ),
            ).map(|_| 0);
        }
        if !vararg && argc > arity {
            return self.throw(
                self.core.type_exception,
                &format!(
                    "{}() takes at most {} arguments ({} given).",
                    name, arity, argc
                ),
            ).map(|_| 0);
        }

        for index in argc..arity {
            let default = unsafe {
                match (*defaults_of).kind {
                    ObjectKind::ObjFunction => (*defaults_of).as_function().defaults[index - required],
                    _ => (*defaults_of).as_native().defaults[index - required],
                }
            };
            self.push(default);
        }

        if vararg {
            let surplus = argc.saturating_sub(arity);
            self.maybe_collect();
            let items =
                self.stack[self.stack_top_pos - surplus..self.stack_top_pos].to_vec();
            let tuple = self.manager.alloc_tuple(items);
            self.stack_top_pos -= surplus;
            self.push(make_object_value(tuple as *mut Object));
        }

        Ok(arity + vararg as usize)
    }

    fn call_closure(&mut self, closure: *mut ObjectClosure, argc: usize) -> Result<(), ()> {
        let function = unsafe { (*closure).function };
        let (name, arity, required, vararg) = unsafe {
            (
                (*function).name.clone(),
                (*function).arity as usize,
                (*function).required_args(),
                (*function).vararg,
            )
        };
        let display_name = if name.is_empty() { "<anonymous>" } else { &name };

        let local_slots = self.adjust_args(
            display_name,
            arity,
            required,
            vararg,
            function as *mut Object,
            argc,
        )?;

        if self.frames.len() >= FRAMES_MAX {
            return self.throw(self.core.exception, "Maximum call depth exceeded.");
        }

        let base = self.stack_top_pos - local_slots - 1;
        self.frames.push(CallFrame::new(closure, base));
        Ok(())
    }

    fn call_native(&mut self, native: *mut ObjectNative, argc: usize) -> Result<(), ()> {
        let (name, arity, required, vararg) = unsafe {
            (
                (*native).name.clone(),
                (*native).arity as usize,
                (*native).required_args(),
                (*native).vararg,
            )
        };

        let local_slots =
            self.adjust_args(&name, arity, required, vararg, native as *mut Object, argc)?;

        let base = self.stack_top_pos - local_slots - 1;
        let saved_base = self.native_base;
        self.native_base = base;
        let function = unsafe { (*native).function };
        let result = function(self, local_slots);
        self.native_base = saved_base;

        match result {
            Ok(value) => {
                self.stack_top_pos = base;
                self.push(value);
                Ok(())
            }
            Err(()) => Err(()),
        }
    }

    fn instantiate(&mut self, class: *mut ObjectClass, argc: usize) -> Result<(), ()> {
        let callee_slot = self.stack_top_pos - argc - 1;
        self.maybe_collect();
        let instance = self.manager.alloc_instance(class);
        let instance_value = make_object_value(instance as *mut Object);

        if let Some(init) = self.lookup_method_str(class, "new") {
            self.stack[callee_slot] = instance_value;
            self.call_object(as_object(&init), argc)
        } else if argc != 0 {
            let name = unsafe { (*class).name.clone() };
            self.throw(
                self.core.type_exception,
                &format!("{}() takes no arguments ({} given).", name, argc),
            )
        } else {
            self.stack[callee_slot] = instance_value;
            Ok(())
        }
    }

    fn invoke_from_class(
        &mut self,
        class: *mut ObjectClass,
        name: *mut ObjectString,
        argc: usize,
    ) -> Result<(), ()> {
        match self.lookup_method(class, name) {
            Some(method) => self.call_object(as_object(&method), argc),
            None => {
                let class_name = if class.is_null() {
                    "handle".to_string()
                } else {
                    unsafe { (*class).name.clone() }
                };
                let method_name = unsafe { (*name).content.clone() };
                self.throw(
                    self.core.method_exception,
                    &format!("'{}' has no method '{}'.", class_name, method_name),
                )
            }
        }
    }

    // ---- operators ----

    fn binary_method_names(op: OpCode) -> (&'static str, &'static str) {
        match op {
            OpCode::Add => ("__add__", "__radd__"),
            OpCode::Subtract => ("__sub__", "__rsub__"),
            OpCode::Multiply => ("__mul__", "__rmul__"),
            OpCode::Divide => ("__div__", "__rdiv__"),
            OpCode::Modulo => ("__mod__", "__rmod__"),
            OpCode::Pow => ("__pow__", "__rpow__"),
            _ => unreachable!("not an arithmetic opcode"),
        }
    }

    fn binary_arith(&mut self, op: OpCode) -> Result<(), ()> {
        let b = self.peek_steps(0);
        let a = self.peek_steps(1);

        if is_number(&a) && is_number(&b) {
            let x = as_number(&a);
            let y = as_number(&b);
            let result = match op {
                OpCode::Add => x + y,
                OpCode::Subtract => x - y,
                OpCode::Multiply => x * y,
                OpCode::Divide => {
                    if y == 0.0 {
                        return self.throw(self.core.type_exception, "Division by zero.");
                    }
                    x / y
                }
                OpCode::Modulo => {
                    if y == 0.0 {
                        return self.throw(self.core.type_exception, "Modulo by zero.");
                    }
                    x % y
                }
                OpCode::Pow => x.powf(y),
                _ => unreachable!("not an arithmetic opcode"),
            };
            self.pop();
            self.pop();
            self.push(make_number_value(result));
            return Ok(());
        }

        if op == OpCode::Add && is_string(&a) && is_string(&b) {
            let combined = unsafe {
                let left = &(*as_object(&a)).as_string().content;
                let right = &(*as_object(&b)).as_string().content;
                let mut combined = String::with_capacity(left.len() + right.len());
                combined.push_str(left);
                combined.push_str(right);
                combined
            };
            self.maybe_collect();
            let string = take_string(&mut self.manager, &mut self.intern, combined);
            self.pop();
            self.pop();
            self.push(make_object_value(string as *mut Object));
            return Ok(());
        }

        // Operator-method fallback: left operand's class first, then the
        // reflected form on the right operand's class.
        let (name, reflected) = Self::binary_method_names(op);
        let class_a = self.class_of(&a);
        if !class_a.is_null() {
            if let Some(method) = self.lookup_method_str(class_a, name) {
                return self.call_object(as_object(&method), 1);
            }
        }
        let class_b = self.class_of(&b);
        if !class_b.is_null() {
            if let Some(method) = self.lookup_method_str(class_b, reflected) {
                let top = self.stack_top_pos;
                self.stack.swap(top - 1, top - 2);
                return self.call_object(as_object(&method), 1);
            }
        }

        let op_symbol = match op {
            OpCode::Add => "+",
            OpCode::Subtract => "-",
            OpCode::Multiply => "*",
            OpCode::Divide => "/",
            OpCode::Modulo => "%",
            _ => "^",
        };
        let left_name = self.type_name(&a);
        let right_name = self.type_name(&b);
        self.throw(
            self.core.type_exception,
            &format!(
                "Unsupported operand types for {}: '{}' and '{}'.",
                op_symbol, left_name, right_name
            ),
        )
    }

    fn binary_compare(&mut self, op: OpCode) -> Result<(), ()> {
        let b = self.peek_steps(0);
        let a = self.peek_steps(1);

        let result = if is_number(&a) && is_number(&b) {
            let x = as_number(&a);
            let y = as_number(&b);
            match op {
                OpCode::Greater => x > y,
                OpCode::GreaterEqual => x >= y,
                OpCode::Less => x < y,
                OpCode::LessEqual => x <= y,
                _ => unreachable!("not a comparison opcode"),
            }
        } else if is_string(&a) && is_string(&b) {
            let (left, right) = unsafe {
                (
                    (*as_object(&a)).as_string().content.as_str(),
                    (*as_object(&b)).as_string().content.as_str(),
                )
            };
            match op {
                OpCode::Greater => left > right,
                OpCode::GreaterEqual => left >= right,
                OpCode::Less => left < right,
                OpCode::LessEqual => left <= right,
                _ => unreachable!("not a comparison opcode"),
            }
        } else {
            return self.throw(
                self.core.type_exception,
                "Operands must be two numbers or two strings.",
            );
        };

        self.pop();
        self.pop();
        self.push(make_bool_value(result));
        Ok(())
    }

    // ---- the dispatch loop ----

    /// Interprets until the frame stack drops back to `frame_floor`.
    /// `Err(())` means an exception escaped past the floor.
    pub(crate) fn run(&mut self, frame_floor: usize) -> Result<(), ()> {
        loop {
            debug_feature::trace_execution(self);

            let op = OpCode::from_byte(self.read_byte()).expect("corrupt bytecode");

            let result: Result<(), ()> = match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                    Ok(())
                }
                OpCode::Null => {
                    self.push(make_null_value());
                    Ok(())
                }
                OpCode::True => {
                    self.push(make_bool_value(true));
                    Ok(())
                }
                OpCode::False => {
                    self.push(make_bool_value(false));
                    Ok(())
                }
                OpCode::Pop => {
                    self.pop();
                    Ok(())
                }
                OpCode::Dup => {
                    self.push(self.peek_steps(0));
                    Ok(())
                }
                OpCode::Dup2 => {
                    self.push(self.peek_steps(1));
                    self.push(self.peek_steps(1));
                    Ok(())
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot]);
                    Ok(())
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek_steps(0);
                    Ok(())
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let value = self.peek_steps(0);
                    unsafe {
                        (*self.current_module()).globals.put(name, value);
                    }
                    self.pop();
                    Ok(())
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let module = self.current_module();
                    let found = unsafe { (*module).globals.get(name) }.or_else(|| unsafe {
                        (*self.core_module).globals.get(name)
                    });
                    match found {
                        Some(value) => {
                            self.push(value);
                            Ok(())
                        }
                        None => {
                            let text = unsafe { (*name).content.clone() };
                            self.throw(
                                self.core.name_exception,
                                &format!("Name '{}' is not defined.", text),
                            )
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let module = self.current_module();
                    if unsafe { (*module).globals.contains(name) } {
                        let value = self.peek_steps(0);
                        unsafe {
                            (*module).globals.put(name, value);
                        }
                        Ok(())
                    } else {
                        let text = unsafe { (*name).content.clone() };
                        self.throw(
                            self.core.name_exception,
                            &format!("Name '{}' is not defined.", text),
                        )
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let value = unsafe {
                        let upvalue = (&(*closure).upvalues)[index];
                        *(*upvalue).addr
                    };
                    self.push(value);
                    Ok(())
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let value = self.peek_steps(0);
                    unsafe {
                        let upvalue = (&(*closure).upvalues)[index];
                        *(*upvalue).addr = value;
                    }
                    Ok(())
                }
                OpCode::GetField => self.op_get_field(),
                OpCode::SetField => self.op_set_field(),
                OpCode::GetIndex => self.op_get_index(),
                OpCode::SetIndex => self.op_set_index(),
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(make_bool_value(values_equal(&a, &b)));
                    Ok(())
                }
                OpCode::Greater
                | OpCode::GreaterEqual
                | OpCode::Less
                | OpCode::LessEqual => self.binary_compare(op),
                OpCode::Add
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Modulo
                | OpCode::Pow => self.binary_arith(op),
                OpCode::Not => {
                    let value = self.pop();
                    self.push(make_bool_value(is_falsey(&value)));
                    Ok(())
                }
                OpCode::Negate => {
                    let value = self.peek_steps(0);
                    if is_number(&value) {
                        self.pop();
                        self.push(make_number_value(-as_number(&value)));
                        Ok(())
                    } else {
                        let type_name = self.type_name(&value);
                        self.throw(
                            self.core.type_exception,
                            &format!("Cannot negate '{}'.", type_name),
                        )
                    }
                }
                OpCode::Length => self.op_length(),
                OpCode::Is => {
                    let class = self.peek_steps(0);
                    if !crate::value::is_class(&class) {
                        self.throw(
                            self.core.type_exception,
                            "Right operand of 'is' must be a class.",
                        )
                    } else {
                        let class = as_object(&class) as *mut ObjectClass;
                        let value = self.peek_steps(1);
                        let result =
                            Self::class_chain_contains(self.class_of(&value), class);
                        self.pop();
                        self.pop();
                        self.push(make_bool_value(result));
                        Ok(())
                    }
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                    Ok(())
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if is_falsey(&self.peek_steps(0)) {
                        self.frame_mut().ip += offset;
                    }
                    Ok(())
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    if !is_falsey(&self.peek_steps(0)) {
                        self.frame_mut().ip += offset;
                    }
                    Ok(())
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                    self.check_halt()
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    match self.check_halt() {
                        Ok(()) => {
                            let callee = self.peek_steps(argc);
                            self.call_value(callee, argc)
                        }
                        Err(()) => Err(()),
                    }
                }
                OpCode::Invoke => self.op_invoke(),
                OpCode::SuperInvoke => self.op_super_invoke(),
                OpCode::GetSuper => self.op_get_super(),
                OpCode::Closure => self.op_closure(),
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack_top_pos - 1);
                    self.pop();
                    Ok(())
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame stack underflow");
                    self.close_upvalues(frame.base);
                    self.stack_top_pos = frame.base;
                    self.push(result);
                    if self.frames.len() == frame_floor {
                        return Ok(());
                    }
                    Ok(())
                }
                OpCode::Class => {
                    let name = self.read_string_constant();
                    self.maybe_collect();
                    let class =
                        self.manager.alloc_class(unsafe { (*name).content.clone() });
                    unsafe {
                        (*class).superclass = self.core.object;
                    }
                    self.push(make_object_value(class as *mut Object));
                    Ok(())
                }
                OpCode::Subclass => {
                    let class = self.peek_steps(0);
                    let superclass = self.peek_steps(1);
                    if !crate::value::is_class(&superclass) {
                        self.throw(self.core.type_exception, "Superclass must be a class.")
                    } else {
                        unsafe {
                            let class = as_object(&class) as *mut ObjectClass;
                            (*class).superclass =
                                as_object(&superclass) as *mut ObjectClass;
                        }
                        self.pop();
                        Ok(())
                    }
                }
                OpCode::DefMethod => {
                    let name = self.read_string_constant();
                    let method = self.peek_steps(0);
                    let class = self.peek_steps(1);
                    unsafe {
                        let class = as_object(&class) as *mut ObjectClass;
                        (*class).methods.put(name, method);
                    }
                    self.pop();
                    Ok(())
                }
                OpCode::NativeLookup => self.op_native_lookup(),
                OpCode::BuildList => {
                    let count = self.read_byte() as usize;
                    self.maybe_collect();
                    let items =
                        self.stack[self.stack_top_pos - count..self.stack_top_pos].to_vec();
                    let list = self.manager.alloc_list(items);
                    self.stack_top_pos -= count;
                    self.push(make_object_value(list as *mut Object));
                    Ok(())
                }
                OpCode::BuildTuple => {
                    let count = self.read_byte() as usize;
                    self.maybe_collect();
                    let items =
                        self.stack[self.stack_top_pos - count..self.stack_top_pos].to_vec();
                    let tuple = self.manager.alloc_tuple(items);
                    self.stack_top_pos -= count;
                    self.push(make_object_value(tuple as *mut Object));
                    Ok(())
                }
                OpCode::Raise => {
                    let value = self.pop();
                    self.do_raise(value)
                }
                OpCode::SetupTry => {
                    let index = self.read_byte();
                    let desc: HandlerDesc =
                        self.current_chunk().handlers[index as usize];
                    self.frame_mut()
                        .handlers
                        .push(ActiveHandler::from_desc(index, &desc));
                    Ok(())
                }
                OpCode::PopTry => {
                    let index = self.read_byte();
                    let frame = self.frame_mut();
                    if frame
                        .handlers
                        .last()
                        .is_some_and(|handler| handler.index == index)
                    {
                        frame.handlers.pop();
                    }
                    Ok(())
                }
                OpCode::ImportModule => self.op_import_module(),
                OpCode::ImportName => self.op_import_name(),
                OpCode::ImportEnd => {
                    self.pop();
                    Ok(())
                }
                OpCode::PushModule => {
                    let module = self.current_module();
                    self.push(make_object_value(module as *mut Object));
                    Ok(())
                }
            };

            if result.is_err() && !self.unwind(frame_floor) {
                return Err(());
            }
        }
    }

    // ---- compound opcode handlers ----

    fn op_get_field(&mut self) -> Result<(), ()> {
        let name = self.read_string_constant();
        let value = self.peek_steps(0);

        if is_instance(&value) {
            let instance = unsafe { (*as_object(&value)).as_instance() };
            if let Some(field) = instance.fields.get(name) {
                self.stack[self.stack_top_pos - 1] = field;
                return Ok(());
            }
            let class = unsafe { (*as_object(&value)).class };
            if let Some(method) = self.lookup_method(class, name) {
                self.maybe_collect();
                let bound = self
                    .manager
                    .alloc_bound_method(value, as_object(&method));
                self.stack[self.stack_top_pos - 1] =
                    make_object_value(bound as *mut Object);
                return Ok(());
            }
            let class_name = unsafe { (*class).name.clone() };
            let field_name = unsafe { (*name).content.clone() };
            return self.throw(
                self.core.name_exception,
                &format!("'{}' object has no field '{}'.", class_name, field_name),
            );
        }

        if crate::value::is_module(&value) {
            let module = unsafe { (*as_object(&value)).as_module() };
            if let Some(global) = module.globals.get(name) {
                self.stack[self.stack_top_pos - 1] = global;
                return Ok(());
            }
            let module_name = unsafe { (*as_object(&value)).as_module().name.clone() };
            let field_name = unsafe { (*name).content.clone() };
            return self.throw(
                self.core.name_exception,
                &format!(
                    "Module '{}' has no name '{}'.",
                    module_name, field_name
                ),
            );
        }

        // Primitives resolve methods through their pre-registered class.
        let class = self.class_of(&value);
        if !class.is_null() {
            if let Some(method) = self.lookup_method(class, name) {
                self.maybe_collect();
                let bound = self
                    .manager
                    .alloc_bound_method(value, as_object(&method));
                self.stack[self.stack_top_pos - 1] =
                    make_object_value(bound as *mut Object);
                return Ok(());
            }
        }

        let type_name = self.type_name(&value);
        let field_name = unsafe { (*name).content.clone() };
        self.throw(
            self.core.method_exception,
            &format!("'{}' has no method '{}'.", type_name, field_name),
        )
    }

    fn op_set_field(&mut self) -> Result<(), ()> {
        let name = self.read_string_constant();
        let value = self.peek_steps(0);
        let target = self.peek_steps(1);

        if is_instance(&target) {
            unsafe {
                (*as_object(&target)).as_instance_mut().fields.put(name, value);
            }
        } else if crate::value::is_module(&target) {
            unsafe {
                (*as_object(&target)).as_module_mut().globals.put(name, value);
            }
        } else {
            let type_name = self.type_name(&target);
            return self.throw(
                self.core.type_exception,
                &format!("Cannot set a field on '{}'.", type_name),
            );
        }

        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn check_index(&mut self, value: &Value, len: usize, what: &str) -> Result<usize, ()> {
        if !is_number(value) || as_number(value).fract() != 0.0 {
            return self
                .throw(
                    self.core.invalid_arg_exception,
                    &format!("{} index must be an integer.", what),
                )
                .map(|_| 0);
        }
        let index = as_number(value);
        if index < 0.0 || index >= len as f64 {
            return self
                .throw(
                    self.core.invalid_arg_exception,
                    &format!("{} index out of range.", what),
                )
                .map(|_| 0);
        }
        Ok(index as usize)
    }

    fn op_get_index(&mut self) -> Result<(), ()> {
        let index = self.peek_steps(0);
        let target = self.peek_steps(1);

        if is_object(&target) {
            let object = as_object(&target);
            unsafe {
                match (*object).kind {
                    ObjectKind::ObjList => {
                        let len = (*object).as_list().items.len();
                        let index = self.check_index(&index, len, "List")?;
                        let value = (*object).as_list().items[index];
                        self.pop();
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    ObjectKind::ObjTuple => {
                        let len = (*object).as_tuple().items.len();
                        let index = self.check_index(&index, len, "Tuple")?;
                        let value = (*object).as_tuple().items[index];
                        self.pop();
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    ObjectKind::ObjString => {
                        let chars = (*object).as_string().content.chars().count();
                        let index = self.check_index(&index, chars, "String")?;
                        let ch = (*object)
                            .as_string()
                            .content
                            .chars()
                            .nth(index)
                            .expect("index checked in range");
                        self.maybe_collect();
                        let string = copy_string(
                            &mut self.manager,
                            &mut self.intern,
                            &ch.to_string(),
                        );
                        self.pop();
                        self.pop();
                        self.push(make_object_value(string as *mut Object));
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }

        let type_name = self.type_name(&target);
        self.throw(
            self.core.type_exception,
            &format!("'{}' is not subscriptable.", type_name),
        )
    }

    fn op_set_index(&mut self) -> Result<(), ()> {
        let value = self.peek_steps(0);
        let index = self.peek_steps(1);
        let target = self.peek_steps(2);

        if is_object(&target) {
            let object = as_object(&target);
            unsafe {
                match (*object).kind {
                    ObjectKind::ObjList => {
                        let len = (*object).as_list().items.len();
                        let index = self.check_index(&index, len, "List")?;
                        (*object).as_list_mut().items[index] = value;
                        self.pop();
                        self.pop();
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    ObjectKind::ObjTuple => {
                        return self
                            .throw(self.core.type_exception, "Tuples are immutable.");
                    }
                    ObjectKind::ObjString => {
                        return self
                            .throw(self.core.type_exception, "Strings are immutable.");
                    }
                    _ => {}
                }
            }
        }

        let type_name = self.type_name(&target);
        self.throw(
            self.core.type_exception,
            &format!("'{}' does not support index assignment.", type_name),
        )
    }

    fn op_length(&mut self) -> Result<(), ()> {
        let value = self.peek_steps(0);
        if is_object(&value) {
            let object = as_object(&value);
            let length = unsafe {
                match (*object).kind {
                    ObjectKind::ObjString => Some((*object).as_string().len()),
                    ObjectKind::ObjList => Some((*object).as_list().items.len()),
                    ObjectKind::ObjTuple => Some((*object).as_tuple().items.len()),
                    ObjectKind::ObjRange => Some((*object).as_range().len()),
                    _ => None,
                }
            };
            if let Some(length) = length {
                self.pop();
                self.push(make_number_value(length as f64));
                return Ok(());
            }
        }
        let type_name = self.type_name(&value);
        self.throw(
            self.core.type_exception,
            &format!("'{}' has no length.", type_name),
        )
    }

    fn op_invoke(&mut self) -> Result<(), ()> {
        let name = self.read_string_constant();
        let argc = self.read_byte() as usize;
        self.check_halt()?;

        let receiver = self.peek_steps(argc);

        if is_instance(&receiver) {
            let instance = unsafe { (*as_object(&receiver)).as_instance() };
            // A callable field shadows a method of the same name.
            if let Some(field) = instance.fields.get(name) {
                let slot = self.stack_top_pos - argc - 1;
                self.stack[slot] = field;
                return self.call_value(field, argc);
            }
            let class = unsafe { (*as_object(&receiver)).class };
            return self.invoke_from_class(class, name, argc);
        }

        if crate::value::is_module(&receiver) {
            let module = unsafe { (*as_object(&receiver)).as_module() };
            if let Some(global) = module.globals.get(name) {
                let slot = self.stack_top_pos - argc - 1;
                self.stack[slot] = global;
                return self.call_value(global, argc);
            }
            let module_name = unsafe { (*as_object(&receiver)).as_module().name.clone() };
            let text = unsafe { (*name).content.clone() };
            return self.throw(
                self.core.name_exception,
                &format!("Module '{}' has no name '{}'.", module_name, text),
            );
        }

        let class = self.class_of(&receiver);
        self.invoke_from_class(class, name, argc)
    }

    fn op_super_invoke(&mut self) -> Result<(), ()> {
        let name = self.read_string_constant();
        let argc = self.read_byte() as usize;
        self.check_halt()?;

        let superclass = self.pop();
        let superclass = as_object(&superclass) as *mut ObjectClass;
        self.invoke_from_class(superclass, name, argc)
    }

    fn op_get_super(&mut self) -> Result<(), ()> {
        let name = self.read_string_constant();
        let superclass = self.pop();
        let superclass = as_object(&superclass) as *mut ObjectClass;
        let receiver = self.peek_steps(0);

        match self.lookup_method(superclass, name) {
            Some(method) => {
                self.maybe_collect();
                let bound = self
                    .manager
                    .alloc_bound_method(receiver, as_object(&method));
                self.stack[self.stack_top_pos - 1] =
                    make_object_value(bound as *mut Object);
                Ok(())
            }
            None => {
                let class_name = unsafe { (*superclass).name.clone() };
                let method_name = unsafe { (*name).content.clone() };
                self.throw(
                    self.core.method_exception,
                    &format!("'{}' has no method '{}'.", class_name, method_name),
                )
            }
        }
    }

    fn op_closure(&mut self) -> Result<(), ()> {
        let function = self.read_constant();
        let function = as_object(&function) as *mut ObjectFunction;

        self.maybe_collect();
        let closure = self.manager.alloc_closure(function);
        self.push(make_object_value(closure as *mut Object));

        let upvalue_count = unsafe { (*function).upvalue_count };
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() == 1;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let base = self.frame().base;
                self.capture_upvalue(base + index)
            } else {
                let parent = self.frame().closure;
                unsafe { (&(*parent).upvalues)[index] }
            };
            unsafe {
                (*closure).upvalues.push(upvalue);
            }
        }
        Ok(())
    }

    fn op_native_lookup(&mut self) -> Result<(), ()> {
        let name = self.read_string_constant();
        let key = unsafe { (*name).content.clone() };
        let module = self.current_module();
        let module_name = unsafe { (*module).name.clone() };

        let qualified = format!("{}::{}", module_name, key);
        let def = self
            .natives
            .get(&qualified)
            .or_else(|| self.natives.get(&format!("*::{}", key)));

        match def {
            Some(def) => {
                let (arity, vararg, function) = (def.arity, def.vararg, def.function);
                self.maybe_collect();
                let native = self.manager.alloc_native(
                    key,
                    arity,
                    vararg,
                    vec![],
                    module,
                    function,
                );
                self.push(make_object_value(native as *mut Object));
                Ok(())
            }
            None => self.throw(
                self.core.name_exception,
                &format!("No native registered for '{}'.", key),
            ),
        }
    }

    fn op_import_module(&mut self) -> Result<(), ()> {
        let name = self.read_string_constant();

        // Re-import is a cache hit that only rebinds names.
        if let Some(module_value) = self.modules.get(name) {
            self.push(module_value);
            return Ok(());
        }

        let module_name = unsafe { (*name).content.clone() };
        let Some(resolver) = self.resolver.as_mut() else {
            return self.throw(
                self.core.file_not_found_exception,
                &format!("Cannot resolve module '{}'.", module_name),
            );
        };
        let Some(source) = resolver(&module_name) else {
            return self.throw(
                self.core.file_not_found_exception,
                &format!("Cannot resolve module '{}'.", module_name),
            );
        };

        let stmts = match Parser::new(&source).parse() {
            Ok(stmts) => stmts,
            Err(errors) => {
                let first = errors
                    .first()
                    .map(|error| error.to_string())
                    .unwrap_or_default();
                return self.throw(
                    self.core.exception,
                    &format!("Cannot compile module '{}': {}", module_name, first),
                );
            }
        };

        let module = self.manager.alloc_module(module_name.clone());
        self.modules
            .put(name, make_object_value(module as *mut Object));

        let function =
            match Compiler::new(&mut self.manager, &mut self.intern, module).compile(&stmts) {
                Ok(function) => function,
                Err(errors) => {
                    self.modules.delete(name);
                    let first = errors
                        .first()
                        .map(|error| error.to_string())
                        .unwrap_or_default();
                    return self.throw(
                        self.core.exception,
                        &format!("Cannot compile module '{}': {}", module_name, first),
                    );
                }
            };

        let closure = self.manager.alloc_closure(function);
        self.push(make_object_value(closure as *mut Object));
        let callee = self.peek_steps(0);
        // The module body runs as an ordinary frame; its return value is the
        // module object, landing exactly where the import expects it.
        self.call_value(callee, 0)
    }

    fn op_import_name(&mut self) -> Result<(), ()> {
        let name = self.read_string_constant();
        let module_value = self.peek_steps(0);
        let module = unsafe { (*as_object(&module_value)).as_module() };
        match module.globals.get(name) {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => {
                let module_name = module.name.clone();
                let text = unsafe { (*name).content.clone() };
                self.throw(
                    self.core.name_exception,
                    &format!("Module '{}' has no name '{}'.", module_name, text),
                )
            }
        }
    }
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;
    use crate::debug;
    use crate::value::print_value;

    pub fn trace_execution(vm: &VM) {
        if vm.frames.is_empty() {
            return;
        }
        print!("{: >10}", "");
        for slot in &vm.stack[0..vm.stack_top_pos] {
            print!(" [ ");
            print_value(slot);
            print!(" ]");
        }
        println!();
        debug::disassemble_instruction(vm.current_chunk(), vm.frames.last().unwrap().ip);
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod debug_feature {
    use super::*;

    pub fn trace_execution(_vm: &VM) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> String {
        let mut vm = VM::new();
        vm.capture_output();
        let result = vm.evaluate("main", source);
        assert_eq!(
            result,
            InterpretResult::InterpretOk,
            "program failed: {:?}",
            vm.error_message()
        );
        vm.take_output()
    }

    fn run_error(source: &str) -> (InterpretResult, Option<String>) {
        let mut vm = VM::new();
        vm.capture_output();
        let result = vm.evaluate("main", source);
        (result, vm.error_message())
    }

    #[test]
    fn test_arithmetic_print() {
        assert_eq!(run_ok("print(1+2*3)"), "7\n");
    }

    #[test]
    fn test_default_arguments() {
        assert_eq!(
            run_ok("fun f(a, b=10) return a+b end; print(f(5))"),
            "15\n"
        );
        assert_eq!(
            run_ok("fun f(a, b=10) return a+b end; print(f(5, 1))"),
            "6\n"
        );
    }

    #[test]
    fn test_list_mutation_and_foreach() {
        assert_eq!(
            run_ok("var l=[1,2,3]; l.add(4); for var i in l do print(i) end"),
            "1\n2\n3\n4\n"
        );
    }

    #[test]
    fn test_super_dispatch() {
        assert_eq!(
            run_ok(
                "class A fun m() return 1 end end \
                 class B is A fun m() return super.m()+1 end end \
                 print(B().m())"
            ),
            "2\n"
        );
    }

    #[test]
    fn test_try_except_binds_exception() {
        assert_eq!(
            run_ok("try raise Exception(\"boom\") except Exception as e print(e.err) end"),
            "boom\n"
        );
    }

    #[test]
    fn test_closure_counter() {
        assert_eq!(
            run_ok(
                "fun mk() var x=0; fun inc() x+=1; return x end return inc end; \
                 var c=mk(); print(c()); print(c())"
            ),
            "1\n2\n"
        );
    }

    #[test]
    fn test_method_lookup_walks_chain() {
        assert_eq!(
            run_ok(
                "class A fun m() return 41 end end \
                 class B is A end \
                 class C is B end \
                 print(C().m() + 1)"
            ),
            "42\n"
        );
    }

    #[test]
    fn test_arity_too_few_raises() {
        assert_eq!(
            run_ok(
                "fun f(a, b) return a end \
                 try f(1) except TypeException as e print(\"caught\") end"
            ),
            "caught\n"
        );
    }

    #[test]
    fn test_arity_too_many_raises() {
        let (result, message) = run_error("fun f(a) return a end f(1, 2)");
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert!(message.unwrap().contains("TypeException"));
    }

    #[test]
    fn test_varargs_collect_surplus() {
        assert_eq!(
            run_ok("fun f(a, ...rest) return #rest end print(f(1, 2, 3, 4))"),
            "3\n"
        );
        assert_eq!(
            run_ok("fun f(...rest) return #rest end print(f())"),
            "0\n"
        );
    }

    #[test]
    fn test_missing_global_raises_name_exception() {
        assert_eq!(
            run_ok("try print(missing) except NameException as e print(\"name\") end"),
            "name\n"
        );
    }

    #[test]
    fn test_missing_method_raises_method_exception() {
        assert_eq!(
            run_ok(
                "class A end \
                 try A().nope() except MethodException as e print(\"method\") end"
            ),
            "method\n"
        );
    }

    #[test]
    fn test_index_out_of_range_catchable() {
        assert_eq!(
            run_ok(
                "var l = [1] \
                 try print(l[3]) except InvalidArgException as e print(\"range\") end"
            ),
            "range\n"
        );
    }

    #[test]
    fn test_ensure_runs_on_both_paths() {
        assert_eq!(
            run_ok(
                "try print(\"body\") ensure print(\"ensure\") end \
                 try raise Exception(\"x\") except Exception as e print(\"caught\") \
                 ensure print(\"ensure2\") end"
            ),
            "body\nensure\ncaught\nensure2\n"
        );
    }

    #[test]
    fn test_ensure_reraises_unhandled() {
        assert_eq!(
            run_ok(
                "fun f() try raise Exception(\"inner\") ensure print(\"cleanup\") end end \
                 try f() except Exception as e print(e.err) end"
            ),
            "cleanup\ninner\n"
        );
    }

    #[test]
    fn test_while_break_continue() {
        assert_eq!(
            run_ok(
                "var i = 0 \
                 while true do \
                   i += 1 \
                   if i == 2 then continue end \
                   if i > 3 then break end \
                   print(i) \
                 end"
            ),
            "1\n3\n"
        );
    }

    #[test]
    fn test_classic_for_loop() {
        assert_eq!(
            run_ok("for(var i = 0; i < 3; i += 1) do print(i) end"),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn test_ternary_and_compound_assignment() {
        assert_eq!(run_ok("var x = 1 > 2 ? \"a\" : \"b\"; print(x)"), "b\n");
        assert_eq!(
            run_ok("var l = [1, 2]; l[0] += 10; print(l[0])"),
            "11\n"
        );
        assert_eq!(
            run_ok(
                "class P end var p = P() p.x = 1 p.x += 2 print(p.x)"
            ),
            "3\n"
        );
    }

    #[test]
    fn test_string_concat_and_compare() {
        assert_eq!(run_ok("print(\"st\" + \"ri\" + \"ng\")"), "string\n");
        assert_eq!(run_ok("print(\"a\" < \"b\")"), "true\n");
        assert_eq!(run_ok("print(\"x\" == \"x\")"), "true\n");
    }

    #[test]
    fn test_is_operator() {
        assert_eq!(
            run_ok(
                "class A end class B is A end \
                 print(B() is A) print(A() is B) print(1 is Number)"
            ),
            "true\nfalse\ntrue\n"
        );
    }

    #[test]
    fn test_operator_method_dispatch() {
        assert_eq!(
            run_ok(
                "class Vec fun new(x) this.x = x end \
                 fun __add__(other) return Vec(this.x + other.x) end end \
                 print((Vec(1) + Vec(2)).x)"
            ),
            "3\n"
        );
    }

    #[test]
    fn test_reflected_operator_dispatch() {
        assert_eq!(
            run_ok(
                "class Wrap fun new(x) this.x = x end \
                 fun __radd__(other) return other + this.x end end \
                 print(1 + Wrap(2))"
            ),
            "3\n"
        );
    }

    #[test]
    fn test_tuple_literal_and_length() {
        assert_eq!(run_ok("var t = (1, 2, 3); print(#t); print(t[1])"), "3\n2\n");
    }

    #[test]
    fn test_range_iteration() {
        assert_eq!(
            run_ok("for var i in Range(3) do print(i) end"),
            "0\n1\n2\n"
        );
        assert_eq!(
            run_ok("for var i in Range(1, 7, 2) do print(i) end"),
            "1\n3\n5\n"
        );
    }

    #[test]
    fn test_string_iteration() {
        assert_eq!(run_ok("for var c in \"ab\" do print(c) end"), "a\nb\n");
    }

    #[test]
    fn test_anonymous_function() {
        assert_eq!(
            run_ok("var f = fun(a, b) return a * b end; print(f(6, 7))"),
            "42\n"
        );
    }

    #[test]
    fn test_bound_method_value() {
        assert_eq!(
            run_ok(
                "class A fun new() this.v = 5 end fun get() return this.v end end \
                 var m = A().get; print(m())"
            ),
            "5\n"
        );
    }

    #[test]
    fn test_module_import_with_resolver() {
        let mut vm = VM::new();
        vm.capture_output();
        vm.set_module_resolver(|name| {
            if name == "math" {
                Some("fun double(x) return x * 2 end var tau = 6.28".to_string())
            } else {
                None
            }
        });
        let result = vm.evaluate(
            "main",
            "import math; print(math.tau); import math for double; print(double(21))",
        );
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.take_output(), "6.28\n42\n");
    }

    #[test]
    fn test_missing_module_is_catchable() {
        assert_eq!(
            run_ok(
                "try import nowhere except FileNotFoundException as e print(\"missing\") end"
            ),
            "missing\n"
        );
    }

    #[test]
    fn test_unhandled_exception_produces_trace() {
        let mut vm = VM::new();
        vm.capture_output();
        let result = vm.evaluate(
            "main",
            "fun inner() raise Exception(\"deep\") end fun outer() inner() end outer()",
        );
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        let trace = vm.stack_trace_text().expect("trace recorded");
        assert!(trace.contains("main.inner()"));
        assert!(trace.contains("main.outer()"));
        assert!(trace.contains("main.<main>()"));
        assert!(vm.error_message().unwrap().contains("deep"));
    }

    #[test]
    fn test_interning_is_pointer_stable() {
        let mut vm = VM::new();
        let a = vm.intern_string("stable");
        let b = vm.intern_string("stable");
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_forced_gc_preserves_behavior() {
        let mut vm = VM::new();
        vm.capture_output();
        let result = vm.evaluate(
            "main",
            "var keep = [] for(var i = 0; i < 50; i += 1) do keep.add(\"s\" + \"uffix\") end",
        );
        assert_eq!(result, InterpretResult::InterpretOk);
        let before = vm.manager.object_count();
        vm.collect_garbage();
        let after = vm.manager.object_count();
        assert!(after <= before);

        // The module and its globals survive and stay usable.
        let result = vm.evaluate("main", "print(#keep)");
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.take_output(), "50\n");
    }

    #[test]
    fn test_upvalue_close_preserves_value() {
        assert_eq!(
            run_ok(
                "var fns = [] \
                 for(var i = 0; i < 3; i += 1) do \
                   var v = i * 10 \
                   fns.add(fun() return v end) \
                 end \
                 print(fns[0]()) print(fns[1]()) print(fns[2]())"
            ),
            "0\n10\n20\n"
        );
    }

    #[test]
    fn test_repl_style_module_reuse() {
        let mut vm = VM::new();
        vm.capture_output();
        assert_eq!(vm.evaluate("main", "var x = 41"), InterpretResult::InterpretOk);
        assert_eq!(vm.evaluate("main", "print(x + 1)"), InterpretResult::InterpretOk);
        assert_eq!(vm.take_output(), "42\n");
    }

    #[test]
    fn test_division_by_zero_raises() {
        assert_eq!(
            run_ok("try print(1/0) except TypeException as e print(\"div\") end"),
            "div\n"
        );
    }

    #[test]
    fn test_truthiness_of_zero_and_empty_string() {
        assert_eq!(run_ok("print(0 ? \"t\" : \"f\")"), "t\n");
        assert_eq!(run_ok("print(\"\" ? \"t\" : \"f\")"), "t\n");
        assert_eq!(run_ok("print(null ? \"t\" : \"f\")"), "f\n");
        assert_eq!(run_ok("print(false ? \"t\" : \"f\")"), "f\n");
    }

    #[test]
    fn test_number_formatting_round_trip() {
        assert_eq!(run_ok("print(7.0)"), "7\n");
        assert_eq!(run_ok("print(2.5)"), "2.5\n");
        assert_eq!(run_ok("print(0x10)"), "16\n");
    }

    #[test]
    fn test_print_containers() {
        assert_eq!(run_ok("print([1, \"a\"])"), "[1, \"a\"]\n");
        assert_eq!(run_ok("print((1, 2))"), "(1, 2)\n");
    }

    #[test]
    fn test_halt_flag_raises_termination() {
        let mut vm = VM::new();
        vm.capture_output();
        vm.set_halt(true);
        let result = vm.evaluate("main", "while true do end");
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert!(vm
            .error_message()
            .unwrap()
            .contains("TerminationException"));
    }
}
