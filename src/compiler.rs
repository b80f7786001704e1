use crate::ast::{BinaryOp, Expr, FuncDecl, NativeDecl, Stmt, UnaryOp};
use crate::chunk::{Chunk, HandlerDesc, HandlerKind, OpCode};
use crate::error::CompileError;
use crate::objects::object::Object;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_module::ObjectModule;
use crate::objects::object_string::copy_string;
use crate::table::InternTable;
use crate::value::{
    make_bool_value, make_null_value, make_number_value, make_object_value, Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

struct LoopCtx {
    continue_target: usize,
    scope_depth: i32,
    open_tries: usize,
    break_jumps: Vec<usize>,
}

struct ClassCompiler {
    has_superclass: bool,
}

/// Per-function compilation context: the in-progress function object, its
/// locals pinned to stack slots, the upvalue descriptors recorded while
/// resolving enclosing contexts, and loop/try bookkeeping for
/// `break`/`continue` emission.
struct FunctionCompiler {
    function: *mut ObjectFunction,
    function_type: FunctionType,
    locals: Vec<Local>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    open_tries: Vec<u8>,
}

impl FunctionCompiler {
    fn new(function: *mut ObjectFunction, function_type: FunctionType) -> Self {
        let slot_zero = Local {
            // Methods see the receiver in slot zero; plain functions keep it
            // for the callee itself.
            name: if matches!(function_type, FunctionType::Method | FunctionType::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            is_captured: false,
        };
        FunctionCompiler {
            function,
            function_type,
            locals: vec![slot_zero],
            upvalues: vec![],
            scope_depth: 0,
            loops: vec![],
            open_tries: vec![],
        }
    }
}

/// Walks the AST emitting bytecode into a fresh chunk per function.
pub struct Compiler<'a> {
    compilers: Vec<FunctionCompiler>,
    classes: Vec<ClassCompiler>,
    manager: &'a mut ObjectManager,
    intern: &'a mut InternTable,
    module: *mut ObjectModule,
    errors: Vec<CompileError>,
    line: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(
        manager: &'a mut ObjectManager,
        intern: &'a mut InternTable,
        module: *mut ObjectModule,
    ) -> Compiler<'a> {
        Compiler {
            compilers: vec![],
            classes: vec![],
            manager,
            intern,
            module,
            errors: vec![],
            line: 1,
        }
    }

    /// Compiles a module body into its top-level function.
    pub fn compile(mut self, stmts: &[Stmt]) -> Result<*mut ObjectFunction, Vec<CompileError>> {
        self.init_compiler(FunctionType::Script, "<main>");
        for stmt in stmts {
            self.statement(stmt);
        }
        let (function, _) = self.end_compiler();

        if self.errors.is_empty() {
            Ok(function)
        } else {
            Err(self.errors)
        }
    }

    // ---- context plumbing ----

    fn current_compiler(&self) -> &FunctionCompiler {
        self.compilers.last().expect("no active function compiler")
    }

    fn current_compiler_mut(&mut self) -> &mut FunctionCompiler {
        self.compilers
            .last_mut()
            .expect("no active function compiler")
    }

    fn current_function(&self) -> *mut ObjectFunction {
        self.current_compiler().function
    }

    fn current_chunk(&self) -> &Chunk {
        unsafe { &(*self.current_function()).chunk }
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        unsafe { &mut (*self.current_function()).chunk }
    }

    fn init_compiler(&mut self, function_type: FunctionType, name: &str) {
        let function = self
            .manager
            .alloc_function(0, name.to_string(), self.module);
        self.compilers
            .push(FunctionCompiler::new(function, function_type));
    }

    fn end_compiler(&mut self) -> (*mut ObjectFunction, Vec<Upvalue>) {
        self.emit_return();

        debug_feature::disassemble_chunk(self);

        let ctx = self.compilers.pop().expect("no active function compiler");
        unsafe {
            (*ctx.function).upvalue_count = ctx.upvalues.len();
        }
        (ctx.function, ctx.upvalues)
    }

    // ---- emission helpers ----

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line;
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.to_byte());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_with_operand(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        match self.current_compiler().function_type {
            // An initializer always hands back the receiver.
            FunctionType::Initializer => self.emit_with_operand(OpCode::GetLocal, 0),
            // A module body evaluates to its module object.
            FunctionType::Script => self.emit_op(OpCode::PushModule),
            _ => self.emit_op(OpCode::Null),
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().find_constant(&value) {
            return index as u8;
        }

        let index = self.current_chunk_mut().add_constant(value);
        if index > u8::MAX.into() {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_with_operand(OpCode::Constant, index);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = copy_string(self.manager, self.intern, name);
        self.make_constant(make_object_value(string as *mut Object))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes of the jump itself.
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX.into() {
            self.error("Too much code to jump over.");
        }

        let chunk = self.current_chunk_mut();
        chunk.write_by_offset(offset, ((jump >> 8) & 0xff) as u8);
        chunk.write_by_offset(offset + 1, (jump & 0xff) as u8);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);

        // +2 skips the operand of the Loop instruction itself.
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX.into() {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // ---- scopes and variables ----

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;
        loop {
            let compiler = self.current_compiler();
            let Some(local) = compiler.locals.last() else {
                break;
            };
            if local.depth <= compiler.scope_depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_compiler_mut().locals.pop();
        }
    }

    /// Emits the pops for every local deeper than `depth` without touching
    /// the compile-time locals list; used for `break`/`continue`.
    fn discard_locals_to(&mut self, depth: i32) {
        let flags: Vec<bool> = self
            .current_compiler()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| local.is_captured)
            .collect();
        for captured in flags {
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &str) {
        if self.current_compiler().locals.len() >= u8::MAX as usize + 1 {
            self.error("Too many local variables in function.");
            return;
        }
        // depth -1 marks the variable as declared but not yet usable.
        self.current_compiler_mut().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_local(&mut self, name: &str) {
        let compiler = self.current_compiler();
        let scope_depth = compiler.scope_depth;
        let mut duplicate = false;
        for local in compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.current_compiler().scope_depth;
        if scope_depth == 0 {
            return;
        }
        if let Some(local) = self.current_compiler_mut().locals.last_mut() {
            local.depth = scope_depth;
        }
    }

    /// Declares the variable; for globals returns the name-constant index to
    /// hand to `define_variable`.
    fn parse_variable_named(&mut self, name: &str) -> Option<u8> {
        if self.current_compiler().scope_depth > 0 {
            self.declare_local(name);
            None
        } else {
            Some(self.identifier_constant(name))
        }
    }

    fn define_variable(&mut self, global: Option<u8>) {
        match global {
            Some(index) => self.emit_with_operand(OpCode::DefineGlobal, index),
            None => self.mark_initialized(),
        }
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &str) -> i32 {
        let compiler = &self.compilers[compiler_index];
        let mut uninitialized = false;
        let mut found = -1;
        for (index, local) in compiler.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = index as i32;
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn resolve_upvalue(&mut self, compiler_index: usize, name: &str) -> i32 {
        if compiler_index == 0 {
            return -1;
        }

        let local = self.resolve_local(compiler_index - 1, name);
        if local != -1 {
            self.compilers[compiler_index - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(compiler_index, local as u8, true);
        }

        let upvalue = self.resolve_upvalue(compiler_index - 1, name);
        if upvalue != -1 {
            return self.add_upvalue(compiler_index, upvalue as u8, false);
        }

        -1
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: u8, is_local: bool) -> i32 {
        let compiler = &mut self.compilers[compiler_index];
        for (existing_index, upvalue) in compiler.upvalues.iter().enumerate() {
            if upvalue.is_local == is_local && upvalue.index == index {
                return existing_index as i32;
            }
        }
        if compiler.upvalues.len() >= u8::MAX as usize + 1 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        compiler.upvalues.push(Upvalue { index, is_local });
        (compiler.upvalues.len() - 1) as i32
    }

    fn named_variable(&mut self, name: &str, set: bool) {
        let compiler_index = self.compilers.len() - 1;
        let mut arg = self.resolve_local(compiler_index, name);
        let (get_op, set_op);
        if arg != -1 {
            get_op = OpCode::GetLocal;
            set_op = OpCode::SetLocal;
        } else {
            arg = self.resolve_upvalue(compiler_index, name);
            if arg != -1 {
                get_op = OpCode::GetUpvalue;
                set_op = OpCode::SetUpvalue;
            } else {
                arg = self.identifier_constant(name) as i32;
                get_op = OpCode::GetGlobal;
                set_op = OpCode::SetGlobal;
            }
        }

        let op = if set { set_op } else { get_op };
        self.emit_with_operand(op, arg as u8);
    }

    // ---- statements ----

    fn statement(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(expr) => {
                self.expression(expr);
                self.emit_op(OpCode::Pop);
            }
            Stmt::VarDecl { line, name, init } => {
                self.line = *line;
                let global = self.parse_variable_named(name);
                match init {
                    Some(expr) => self.expression(expr),
                    None => self.emit_op(OpCode::Null),
                }
                self.define_variable(global);
            }
            Stmt::FuncDecl(func) => {
                self.line = func.line;
                let global = self.parse_variable_named(&func.name);
                // A local function can recurse into itself.
                self.mark_initialized();
                self.function(func, FunctionType::Function);
                self.define_variable(global);
            }
            Stmt::NativeDecl(native) => {
                self.line = native.line;
                self.native_decl(native, None);
            }
            Stmt::ClassDecl {
                line,
                name,
                superclass,
                methods,
                native_methods,
            } => {
                self.line = *line;
                self.class_decl(name, superclass.as_ref(), methods, native_methods);
            }
            Stmt::Block { line, stmts } => {
                self.line = *line;
                self.begin_scope();
                for stmt in stmts {
                    self.statement(stmt);
                }
                self.end_scope();
            }
            Stmt::If {
                line,
                cond,
                then_branch,
                else_branch,
            } => {
                self.line = *line;
                self.if_stmt(cond, then_branch, else_branch.as_deref());
            }
            Stmt::While { line, cond, body } => {
                self.line = *line;
                self.while_stmt(cond, body);
            }
            Stmt::For {
                line,
                init,
                cond,
                act,
                body,
            } => {
                self.line = *line;
                self.for_stmt(init.as_deref(), cond.as_ref(), act.as_ref(), body);
            }
            Stmt::ForEach {
                line,
                var_name,
                iterable,
                body,
            } => {
                self.line = *line;
                self.foreach_stmt(var_name, iterable, body);
            }
            Stmt::Return { line, value } => {
                self.line = *line;
                self.return_stmt(value.as_ref());
            }
            Stmt::Import {
                line,
                module,
                as_name,
                names,
            } => {
                self.line = *line;
                self.import_stmt(module, as_name.as_deref(), names);
            }
            Stmt::Try {
                line,
                block,
                handlers,
                ensure,
            } => {
                self.line = *line;
                self.try_stmt(block, handlers, ensure.as_deref());
            }
            Stmt::Raise { line, exc } => {
                self.line = *line;
                self.expression(exc);
                self.emit_op(OpCode::Raise);
            }
            Stmt::Break { line } => {
                self.line = *line;
                self.break_stmt();
            }
            Stmt::Continue { line } => {
                self.line = *line;
                self.continue_stmt();
            }
        }
    }

    fn function(&mut self, decl: &FuncDecl, function_type: FunctionType) {
        self.init_compiler(function_type, &decl.name);
        self.begin_scope();

        for param in &decl.params {
            self.declare_local(param);
            self.mark_initialized();
        }
        if decl.params.len() > u8::MAX as usize {
            self.error("Can't have more than 255 parameters.");
        }
        unsafe {
            (*self.current_function()).arity = decl.params.len() as u8;
        }

        if let Some(vararg_name) = &decl.vararg {
            self.declare_local(vararg_name);
            self.mark_initialized();
            unsafe {
                (*self.current_function()).vararg = true;
            }
        }

        for default in &decl.defaults {
            match self.literal_value(default) {
                Some(value) => unsafe {
                    (*self.current_function()).defaults.push(value);
                },
                None => self.error("Default arguments must be constant literals."),
            }
        }

        for stmt in &decl.body {
            self.statement(stmt);
        }

        let (function, upvalues) = self.end_compiler();
        let index = self.make_constant(make_object_value(function as *mut Object));
        self.emit_with_operand(OpCode::Closure, index);
        for upvalue in &upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn literal_value(&mut self, expr: &Expr) -> Option<Value> {
        match expr {
            Expr::NumLit { value, .. } => Some(make_number_value(*value)),
            Expr::BoolLit { value, .. } => Some(make_bool_value(*value)),
            Expr::NullLit { .. } => Some(make_null_value()),
            Expr::StrLit { value, .. } => {
                let string = copy_string(self.manager, self.intern, value);
                Some(make_object_value(string as *mut Object))
            }
            _ => None,
        }
    }

    fn native_decl(&mut self, native: &NativeDecl, class_name: Option<&str>) {
        match class_name {
            Some(class_name) => {
                // Class-scope natives resolve through a "Class.method" key.
                let key = format!("{}.{}", class_name, native.name);
                let key_const = {
                    let string = copy_string(self.manager, self.intern, &key);
                    self.make_constant(make_object_value(string as *mut Object))
                };
                let name_const = self.identifier_constant(&native.name);
                self.emit_with_operand(OpCode::NativeLookup, key_const);
                self.emit_with_operand(OpCode::DefMethod, name_const);
            }
            None => {
                let global = self.parse_variable_named(&native.name);
                self.mark_initialized();
                let key_const = self.identifier_constant(&native.name);
                self.emit_with_operand(OpCode::NativeLookup, key_const);
                self.define_variable(global);
            }
        }
    }

    fn class_decl(
        &mut self,
        name: &str,
        superclass: Option<&Expr>,
        methods: &[FuncDecl],
        native_methods: &[NativeDecl],
    ) {
        let name_const = self.identifier_constant(name);
        let global = self.parse_variable_named(name);
        self.emit_with_operand(OpCode::Class, name_const);
        self.define_variable(global);

        self.classes.push(ClassCompiler {
            has_superclass: superclass.is_some(),
        });

        if let Some(superclass_expr) = superclass {
            if let Expr::VarLit { name: sup_name, .. } = superclass_expr {
                if sup_name == name {
                    self.error("A class can't inherit from itself.");
                }
            }
            self.begin_scope();
            self.expression(superclass_expr);
            self.declare_local("super");
            self.mark_initialized();

            self.named_variable(name, false);
            self.emit_op(OpCode::Subclass);
        }

        self.named_variable(name, false);
        for method in methods {
            self.line = method.line;
            let method_const = self.identifier_constant(&method.name);
            let function_type = if method.name == "new" {
                FunctionType::Initializer
            } else {
                FunctionType::Method
            };
            self.function(method, function_type);
            self.emit_with_operand(OpCode::DefMethod, method_const);
        }
        for native in native_methods {
            self.line = native.line;
            self.native_decl(native, Some(name));
        }
        self.emit_op(OpCode::Pop);

        if superclass.is_some() {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn if_stmt(&mut self, cond: &Expr, then_branch: &[Stmt], else_branch: Option<&[Stmt]>) {
        self.expression(cond);

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.begin_scope();
        for stmt in then_branch {
            self.statement(stmt);
        }
        self.end_scope();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if let Some(else_branch) = else_branch {
            self.begin_scope();
            for stmt in else_branch {
                self.statement(stmt);
            }
            self.end_scope();
        }
        self.patch_jump(else_jump);
    }

    fn while_stmt(&mut self, cond: &Expr, body: &[Stmt]) {
        let loop_start = self.current_chunk().len();
        self.expression(cond);

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.push_loop(loop_start);
        self.begin_scope();
        for stmt in body {
            self.statement(stmt);
        }
        self.end_scope();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.pop_loop();
    }

    fn for_stmt(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        act: Option<&Expr>,
        body: &[Stmt],
    ) {
        self.begin_scope();
        if let Some(init) = init {
            self.statement(init);
        }

        let mut loop_start = self.current_chunk().len();
        let exit_jump = match cond {
            Some(cond) => {
                self.expression(cond);
                let jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop);
                Some(jump)
            }
            None => None,
        };

        if let Some(act) = act {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression(act);
            self.emit_op(OpCode::Pop);
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.push_loop(loop_start);
        self.begin_scope();
        for stmt in body {
            self.statement(stmt);
        }
        self.end_scope();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.pop_loop();
        self.end_scope();
    }

    /// `for var x in e` drives the iteration protocol: `__iter__(state)`
    /// yields the next state (falsy to stop) and `__next__(state)` the
    /// element. Hidden dot-named locals hold the iterable and the state.
    fn foreach_stmt(&mut self, var_name: &str, iterable: &Expr, body: &[Stmt]) {
        self.begin_scope();

        self.expression(iterable);
        self.declare_local(".expr");
        self.mark_initialized();
        let expr_slot = (self.current_compiler().locals.len() - 1) as u8;

        self.emit_op(OpCode::Null);
        self.declare_local(".iter");
        self.mark_initialized();
        let iter_slot = (self.current_compiler().locals.len() - 1) as u8;

        let iter_const = self.identifier_constant("__iter__");
        let next_const = self.identifier_constant("__next__");

        let loop_start = self.current_chunk().len();

        self.emit_with_operand(OpCode::GetLocal, expr_slot);
        self.emit_with_operand(OpCode::GetLocal, iter_slot);
        self.emit_with_operand(OpCode::Invoke, iter_const);
        self.emit_byte(1);
        self.emit_with_operand(OpCode::SetLocal, iter_slot);

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.push_loop(loop_start);
        self.begin_scope();
        self.emit_with_operand(OpCode::GetLocal, expr_slot);
        self.emit_with_operand(OpCode::GetLocal, iter_slot);
        self.emit_with_operand(OpCode::Invoke, next_const);
        self.emit_byte(1);
        self.declare_local(var_name);
        self.mark_initialized();

        for stmt in body {
            self.statement(stmt);
        }
        self.end_scope();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.pop_loop();

        self.end_scope();
    }

    fn push_loop(&mut self, continue_target: usize) {
        let scope_depth = self.current_compiler().scope_depth;
        let open_tries = self.current_compiler().open_tries.len();
        self.current_compiler_mut().loops.push(LoopCtx {
            continue_target,
            scope_depth,
            open_tries,
            break_jumps: vec![],
        });
    }

    fn pop_loop(&mut self) {
        let ctx = self
            .current_compiler_mut()
            .loops
            .pop()
            .expect("loop context underflow");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_stmt(&mut self) {
        let Some(ctx) = self.current_compiler().loops.last() else {
            self.error("Can't use 'break' outside of a loop.");
            return;
        };
        let depth = ctx.scope_depth;
        let tries_floor = ctx.open_tries;

        self.discard_locals_to(depth);
        let open: Vec<u8> = self.current_compiler().open_tries[tries_floor..]
            .iter()
            .rev()
            .copied()
            .collect();
        for index in open {
            self.emit_with_operand(OpCode::PopTry, index);
        }

        let jump = self.emit_jump(OpCode::Jump);
        self.current_compiler_mut()
            .loops
            .last_mut()
            .expect("loop context underflow")
            .break_jumps
            .push(jump);
    }

    fn continue_stmt(&mut self) {
        let Some(ctx) = self.current_compiler().loops.last() else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        let depth = ctx.scope_depth;
        let tries_floor = ctx.open_tries;
        let target = ctx.continue_target;

        self.discard_locals_to(depth);
        let open: Vec<u8> = self.current_compiler().open_tries[tries_floor..]
            .iter()
            .rev()
            .copied()
            .collect();
        for index in open {
            self.emit_with_operand(OpCode::PopTry, index);
        }
        self.emit_loop(target);
    }

    fn return_stmt(&mut self, value: Option<&Expr>) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        match value {
            Some(expr) => {
                if self.current_compiler().function_type == FunctionType::Initializer {
                    self.error("Can't return a value from an initializer.");
                }
                self.expression(expr);
                self.emit_op(OpCode::Return);
            }
            None => self.emit_return(),
        }
    }

    fn import_stmt(&mut self, module: &str, as_name: Option<&str>, names: &[String]) {
        let module_const = {
            let string = copy_string(self.manager, self.intern, module);
            self.make_constant(make_object_value(string as *mut Object))
        };
        self.emit_with_operand(OpCode::ImportModule, module_const);

        if names.is_empty() {
            let binding = as_name
                .map(str::to_string)
                .unwrap_or_else(|| module.rsplit('.').next().unwrap_or(module).to_string());
            let binding_const = self.identifier_constant(&binding);
            self.emit_op(OpCode::Dup);
            self.emit_with_operand(OpCode::DefineGlobal, binding_const);
        } else {
            for name in names {
                let name_const = self.identifier_constant(name);
                self.emit_with_operand(OpCode::ImportName, name_const);
                self.emit_with_operand(OpCode::DefineGlobal, name_const);
            }
        }
        self.emit_op(OpCode::ImportEnd);
    }

    fn try_stmt(
        &mut self,
        block: &[Stmt],
        handlers: &[crate::ast::ExceptClause],
        ensure: Option<&[Stmt]>,
    ) {
        self.begin_scope();

        // Hidden locals: the exception bound for the except chain and the
        // pending cause re-raised after an ensure block.
        self.emit_op(OpCode::Null);
        self.declare_local(".exc");
        self.mark_initialized();
        let exc_slot = (self.current_compiler().locals.len() - 1) as u8;

        self.emit_op(OpCode::Null);
        self.declare_local(".cause");
        self.mark_initialized();
        let cause_slot = (self.current_compiler().locals.len() - 1) as u8;

        if self.current_compiler().locals.len() > u8::MAX as usize {
            self.error("Too many local variables around 'try'.");
        }
        let stack_slots = self.current_compiler().locals.len() as u8;
        let has_except = !handlers.is_empty();

        let ensure_index = ensure.map(|_| {
            self.setup_handler(HandlerKind::Ensure, cause_slot, stack_slots)
        });
        let except_index =
            has_except.then(|| self.setup_handler(HandlerKind::Except, exc_slot, stack_slots));

        self.begin_scope();
        for stmt in block {
            self.statement(stmt);
        }
        self.end_scope();

        if let Some(except_index) = except_index {
            self.close_handler(except_index);

            let skip_chain = self.emit_jump(OpCode::Jump);
            let handler_pc = self.current_chunk().len();
            self.current_chunk_mut().handlers[except_index as usize].handler_pc = handler_pc;

            let mut end_jumps = vec![];
            for clause in handlers {
                self.line = clause.line;
                self.emit_with_operand(OpCode::GetLocal, exc_slot);
                self.expression(&clause.class_expr);
                self.emit_op(OpCode::Is);

                let miss_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop);

                self.begin_scope();
                if let Some(var_name) = &clause.var_name {
                    self.emit_with_operand(OpCode::GetLocal, exc_slot);
                    self.declare_local(var_name);
                    self.mark_initialized();
                }
                for stmt in &clause.body {
                    self.statement(stmt);
                }
                self.end_scope();
                end_jumps.push(self.emit_jump(OpCode::Jump));

                self.patch_jump(miss_jump);
                self.emit_op(OpCode::Pop);
            }

            // No clause matched: keep unwinding.
            self.emit_with_operand(OpCode::GetLocal, exc_slot);
            self.emit_op(OpCode::Raise);

            self.patch_jump(skip_chain);
            for jump in end_jumps {
                self.patch_jump(jump);
            }
        }

        if let Some(ensure_index) = ensure_index {
            self.close_handler(ensure_index);
            let handler_pc = self.current_chunk().len();
            self.current_chunk_mut().handlers[ensure_index as usize].handler_pc = handler_pc;

            self.begin_scope();
            for stmt in ensure.unwrap_or_default() {
                self.statement(stmt);
            }
            self.end_scope();

            // Re-raise the pending exception, if the protected region left one.
            self.emit_with_operand(OpCode::GetLocal, cause_slot);
            let done_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            self.emit_with_operand(OpCode::GetLocal, cause_slot);
            self.emit_op(OpCode::Raise);
            self.patch_jump(done_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn setup_handler(&mut self, kind: HandlerKind, slot: u8, stack_slots: u8) -> u8 {
        let index = self.current_chunk_mut().add_handler(HandlerDesc {
            kind,
            start: 0,
            end: 0,
            handler_pc: 0,
            slot,
            stack_slots,
        });
        if index > u8::MAX.into() {
            self.error("Too many try blocks in one function.");
            return 0;
        }
        let index = index as u8;
        self.emit_with_operand(OpCode::SetupTry, index);
        let start = self.current_chunk().len();
        self.current_chunk_mut().handlers[index as usize].start = start;
        self.current_compiler_mut().open_tries.push(index);
        index
    }

    fn close_handler(&mut self, index: u8) {
        let end = self.current_chunk().len();
        self.current_chunk_mut().handlers[index as usize].end = end;
        self.emit_with_operand(OpCode::PopTry, index);
        self.current_compiler_mut().open_tries.pop();
    }

    // ---- expressions ----

    fn expression(&mut self, expr: &Expr) {
        self.line = expr.line();
        match expr {
            Expr::NumLit { value, .. } => {
                self.emit_constant(make_number_value(*value));
            }
            Expr::BoolLit { value, .. } => {
                self.emit_op(if *value { OpCode::True } else { OpCode::False });
            }
            Expr::NullLit { .. } => self.emit_op(OpCode::Null),
            Expr::StrLit { value, .. } => {
                let string = copy_string(self.manager, self.intern, value);
                let constant = make_object_value(string as *mut Object);
                self.emit_constant(constant);
            }
            Expr::VarLit { name, .. } => self.named_variable(name, false),
            Expr::ThisLit { .. } => {
                if self.classes.is_empty() {
                    self.error("Can't use 'this' outside of a class.");
                    return;
                }
                self.named_variable("this", false);
            }
            Expr::SuperLit { name, .. } => {
                if !self.check_super_usable() {
                    return;
                }
                let name_const = self.identifier_constant(name);
                self.named_variable("this", false);
                self.named_variable("super", false);
                self.emit_with_operand(OpCode::GetSuper, name_const);
            }
            Expr::Binary {
                op, left, right, ..
            } => self.binary(*op, left, right),
            Expr::Unary { op, operand, .. } => {
                self.expression(operand);
                match op {
                    UnaryOp::Neg => self.emit_op(OpCode::Negate),
                    UnaryOp::Not => self.emit_op(OpCode::Not),
                    UnaryOp::Length => self.emit_op(OpCode::Length),
                }
            }
            Expr::Assign { target, value, .. } => self.assign(target, value),
            Expr::CompoundAssign {
                op, target, value, ..
            } => self.compound_assign(*op, target, value),
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
                ..
            } => {
                self.expression(cond);
                let else_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop);
                self.expression(then_expr);
                let end_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(else_jump);
                self.emit_op(OpCode::Pop);
                self.expression(else_expr);
                self.patch_jump(end_jump);
            }
            Expr::Call { callee, args, .. } => self.call(callee, args),
            Expr::Access { object, name, .. } => {
                self.expression(object);
                let name_const = self.identifier_constant(name);
                self.emit_with_operand(OpCode::GetField, name_const);
            }
            Expr::Index { object, index, .. } => {
                self.expression(object);
                self.expression(index);
                self.emit_op(OpCode::GetIndex);
            }
            Expr::ArrLit { elements, .. } => {
                if elements.len() > u8::MAX as usize {
                    self.error("Too many elements in list literal.");
                }
                for element in elements {
                    self.expression(element);
                }
                self.emit_with_operand(OpCode::BuildList, elements.len() as u8);
            }
            Expr::TupleLit { elements, .. } => {
                if elements.len() > u8::MAX as usize {
                    self.error("Too many elements in tuple literal.");
                }
                for element in elements {
                    self.expression(element);
                }
                self.emit_with_operand(OpCode::BuildTuple, elements.len() as u8);
            }
            Expr::AnonFunc { func, .. } => self.function(func, FunctionType::Function),
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) {
        if op == BinaryOp::And {
            self.expression(left);
            let jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            self.expression(right);
            self.patch_jump(jump);
            return;
        }
        if op == BinaryOp::Or {
            self.expression(left);
            let jump = self.emit_jump(OpCode::JumpIfTrue);
            self.emit_op(OpCode::Pop);
            self.expression(right);
            self.patch_jump(jump);
            return;
        }

        self.expression(left);
        self.expression(right);
        self.emit_binary_op(op);
    }

    fn emit_binary_op(&mut self, op: BinaryOp) {
        match op {
            BinaryOp::Add => self.emit_op(OpCode::Add),
            BinaryOp::Sub => self.emit_op(OpCode::Subtract),
            BinaryOp::Mul => self.emit_op(OpCode::Multiply),
            BinaryOp::Div => self.emit_op(OpCode::Divide),
            BinaryOp::Mod => self.emit_op(OpCode::Modulo),
            BinaryOp::Pow => self.emit_op(OpCode::Pow),
            BinaryOp::Eq => self.emit_op(OpCode::Equal),
            BinaryOp::Neq => self.emit_ops(OpCode::Equal, OpCode::Not),
            BinaryOp::Gt => self.emit_op(OpCode::Greater),
            BinaryOp::Ge => self.emit_op(OpCode::GreaterEqual),
            BinaryOp::Lt => self.emit_op(OpCode::Less),
            BinaryOp::Le => self.emit_op(OpCode::LessEqual),
            BinaryOp::Is => self.emit_op(OpCode::Is),
            BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit ops emit jumps"),
        }
    }

    fn assign(&mut self, target: &Expr, value: &Expr) {
        match target {
            Expr::VarLit { name, .. } => {
                self.expression(value);
                self.named_variable(name, true);
            }
            Expr::Access { object, name, .. } => {
                self.expression(object);
                self.expression(value);
                let name_const = self.identifier_constant(name);
                self.emit_with_operand(OpCode::SetField, name_const);
            }
            Expr::Index { object, index, .. } => {
                self.expression(object);
                self.expression(index);
                self.expression(value);
                self.emit_op(OpCode::SetIndex);
            }
            _ => self.error("Invalid assignment target."),
        }
    }

    fn compound_assign(&mut self, op: BinaryOp, target: &Expr, value: &Expr) {
        match target {
            Expr::VarLit { name, .. } => {
                self.named_variable(name, false);
                self.expression(value);
                self.emit_binary_op(op);
                self.named_variable(name, true);
            }
            Expr::Access { object, name, .. } => {
                let name_const = self.identifier_constant(name);
                self.expression(object);
                self.emit_op(OpCode::Dup);
                self.emit_with_operand(OpCode::GetField, name_const);
                self.expression(value);
                self.emit_binary_op(op);
                self.emit_with_operand(OpCode::SetField, name_const);
            }
            Expr::Index { object, index, .. } => {
                self.expression(object);
                self.expression(index);
                self.emit_op(OpCode::Dup2);
                self.emit_op(OpCode::GetIndex);
                self.expression(value);
                self.emit_binary_op(op);
                self.emit_op(OpCode::SetIndex);
            }
            _ => self.error("Invalid assignment target."),
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr]) {
        if args.len() > u8::MAX as usize {
            self.error("Can't have more than 255 arguments.");
        }

        match callee {
            Expr::SuperLit { name, .. } => {
                if !self.check_super_usable() {
                    return;
                }
                let name_const = self.identifier_constant(name);
                self.named_variable("this", false);
                for arg in args {
                    self.expression(arg);
                }
                self.named_variable("super", false);
                self.emit_with_operand(OpCode::SuperInvoke, name_const);
                self.emit_byte(args.len() as u8);
            }
            Expr::Access { object, name, .. } => {
                self.expression(object);
                for arg in args {
                    self.expression(arg);
                }
                let name_const = self.identifier_constant(name);
                self.emit_with_operand(OpCode::Invoke, name_const);
                self.emit_byte(args.len() as u8);
            }
            _ => {
                self.expression(callee);
                for arg in args {
                    self.expression(arg);
                }
                self.emit_with_operand(OpCode::Call, args.len() as u8);
            }
        }
    }

    fn check_super_usable(&mut self) -> bool {
        match self.classes.last().map(|class| class.has_superclass) {
            None => {
                self.error("Can't use 'super' outside of a class.");
                false
            }
            Some(false) => {
                self.error("Can't use 'super' in a class with no superclass.");
                false
            }
            Some(true) => true,
        }
    }

    fn error(&mut self, message: &str) {
        self.errors
            .push(CompileError::new(self.line, "", message));
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use super::*;
    use crate::debug;

    pub fn disassemble_chunk(compiler: &Compiler) {
        if compiler.errors.is_empty() {
            let function = compiler.current_function();
            let name = unsafe {
                if (*function).name.is_empty() {
                    "<anonymous>"
                } else {
                    (*function).name.as_str()
                }
            };
            debug::disassemble_chunk(compiler.current_chunk(), name);
        }
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::*;

    pub fn disassemble_chunk(_compiler: &Compiler) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    struct CompiledModule {
        manager: ObjectManager,
        #[allow(dead_code)]
        intern: InternTable,
        function: *mut ObjectFunction,
    }

    fn compile_source(source: &str) -> Result<CompiledModule, Vec<CompileError>> {
        let stmts = Parser::new(source).parse()?;
        let mut manager = ObjectManager::new();
        let mut intern = InternTable::new();
        let module = manager.alloc_module("test".to_string());
        let function = Compiler::new(&mut manager, &mut intern, module).compile(&stmts)?;
        Ok(CompiledModule {
            manager,
            intern,
            function,
        })
    }

    fn opcodes(compiled: &CompiledModule) -> Vec<u8> {
        unsafe { (*compiled.function).chunk.code.clone() }
    }

    #[test]
    fn test_arithmetic_emission() {
        let compiled = compile_source("1 + 2 * 3").expect("compiles");
        let code = opcodes(&compiled);
        let expected = vec![
            OpCode::Constant.to_byte(),
            0,
            OpCode::Constant.to_byte(),
            1,
            OpCode::Constant.to_byte(),
            2,
            OpCode::Multiply.to_byte(),
            OpCode::Add.to_byte(),
            OpCode::Pop.to_byte(),
            OpCode::PushModule.to_byte(),
            OpCode::Return.to_byte(),
        ];
        assert_eq!(code, expected);
        assert_eq!(compiled.manager.object_count(), 2); // module + function
    }

    #[test]
    fn test_constant_dedup() {
        let compiled = compile_source("1 + 1").expect("compiles");
        unsafe {
            assert_eq!((*compiled.function).chunk.constants.len(), 1);
        }
    }

    #[test]
    fn test_closure_emits_upvalue_pairs() {
        let compiled = compile_source(
            "fun mk() var x = 0 fun inc() x += 1 return x end return inc end",
        )
        .expect("compiles");
        let code = opcodes(&compiled);
        assert!(code.contains(&OpCode::Closure.to_byte()));
        unsafe {
            // The inner function is a constant of the outer one.
            let outer = (*compiled.function)
                .chunk
                .iter_constants()
                .find_map(|c| {
                    if crate::value::is_object(c) {
                        let obj = crate::value::as_object(c);
                        if (*obj).kind == crate::objects::object::ObjectKind::ObjFunction {
                            return Some(obj as *mut ObjectFunction);
                        }
                    }
                    None
                })
                .expect("outer function constant");
            let inner = (*outer)
                .chunk
                .iter_constants()
                .find_map(|c| {
                    if crate::value::is_object(c) {
                        let obj = crate::value::as_object(c);
                        if (*obj).kind == crate::objects::object::ObjectKind::ObjFunction {
                            return Some(obj as *mut ObjectFunction);
                        }
                    }
                    None
                })
                .expect("inner function constant");
            assert_eq!((*inner).upvalue_count, 1);
        }
    }

    #[test]
    fn test_defaults_recorded_on_function() {
        let compiled = compile_source("fun f(a, b = 10) return a end").expect("compiles");
        unsafe {
            let function = (*compiled.function)
                .chunk
                .iter_constants()
                .find_map(|c| {
                    if crate::value::is_object(c) {
                        let obj = crate::value::as_object(c);
                        if (*obj).kind == crate::objects::object::ObjectKind::ObjFunction {
                            return Some(obj as *mut ObjectFunction);
                        }
                    }
                    None
                })
                .expect("function constant");
            assert_eq!((*function).arity, 2);
            assert_eq!((*function).defaults.len(), 1);
            assert_eq!((*function).required_args(), 1);
        }
    }

    #[test]
    fn test_try_emits_handler_descriptors() {
        let compiled = compile_source(
            "try raise Exception(\"x\") except Exception as e e ensure 1 end",
        )
        .expect("compiles");
        unsafe {
            let handlers = &(*compiled.function).chunk.handlers;
            assert_eq!(handlers.len(), 2);
            assert!(handlers.iter().any(|h| h.kind == HandlerKind::Ensure));
            assert!(handlers.iter().any(|h| h.kind == HandlerKind::Except));
            for handler in handlers {
                assert!(handler.end > handler.start);
                assert!(handler.handler_pc >= handler.end);
            }
        }
    }

    #[test]
    fn test_break_outside_loop_errors() {
        let errors = match compile_source("break") {
            Ok(_) => panic!("should fail"),
            Err(errors) => errors,
        };
        assert!(errors.iter().any(|e| e.message.contains("break")));
    }

    #[test]
    fn test_non_literal_default_errors() {
        let errors = match compile_source("fun f(a = 1 + 2) return a end") {
            Ok(_) => panic!("should fail"),
            Err(errors) => errors,
        };
        assert!(errors
            .iter()
            .any(|e| e.message.contains("constant literals")));
    }

    #[test]
    fn test_this_outside_class_errors() {
        let errors = match compile_source("this") {
            Ok(_) => panic!("should fail"),
            Err(errors) => errors,
        };
        assert!(errors.iter().any(|e| e.message.contains("this")));
    }

    #[test]
    fn test_top_level_return_errors() {
        let errors = match compile_source("return 1") {
            Ok(_) => panic!("should fail"),
            Err(errors) => errors,
        };
        assert!(errors
            .iter()
            .any(|e| e.message.contains("top-level")));
    }
}
