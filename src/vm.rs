// File: src/vm.rs
//
// Stack virtual machine for Ape bytecode.
// Executes against the GC heap with a frame stack, a side stack for maps
// under construction, operator overload dispatch for map operands, one-shot
// recover frames for runtime errors, periodic sweeps and an optional
// execution deadline.

use crate::bytecode::{CompilationResult, Opcode, OPCODE_MAX};
use crate::errors::{CompileResult, ErrorKind, Position, Reported, SharedErrors, Traceback};
use crate::heap::{FunctionData, Heap, NativeFn, ObjectPayload};
use crate::symbols::SharedGlobalStore;
use crate::value::{compare_values, stringify, Value, ValueType};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const VM_STACK_SIZE: usize = 2048;
pub const VM_MAX_FRAMES: usize = 2048;
pub const VM_THIS_STACK_SIZE: usize = 2048;
pub const VM_MAX_GLOBALS: usize = 512;

/// The deadline is sampled once per this many instructions.
const TIME_CHECK_INTERVAL: u32 = 1000;

/// Conventional method names consulted before reporting a type error on an
/// operation whose operands include a map.
static OPERATOR_OVERLOAD_NAMES: Lazy<Vec<(Opcode, &'static str)>> = Lazy::new(|| {
    vec![
        (Opcode::Add, "__operator_add__"),
        (Opcode::Sub, "__operator_sub__"),
        (Opcode::Mul, "__operator_mul__"),
        (Opcode::Div, "__operator_div__"),
        (Opcode::Mod, "__operator_mod__"),
        (Opcode::Or, "__operator_or__"),
        (Opcode::Xor, "__operator_xor__"),
        (Opcode::And, "__operator_and__"),
        (Opcode::Lshift, "__operator_lshift__"),
        (Opcode::Rshift, "__operator_rshift__"),
        (Opcode::Minus, "__operator_minus__"),
        (Opcode::Bang, "__operator_bang__"),
        (Opcode::Compare, "__cmp__"),
    ]
});

/// Per-call activation record. The frame holds its own reference to the
/// function's bytecode so instruction fetch does not touch the heap.
struct Frame {
    function: Value,
    comp_result: Rc<CompilationResult>,
    ip: usize,
    base_pointer: usize,
    recover_ip: Option<usize>,
    is_recovering: bool,
}

enum StepResult {
    Continue,
    /// The outermost frame returned.
    Halt,
}

enum Callee {
    Script { comp_result: Rc<CompilationResult>, num_args: usize, name: String },
    Native { name: String, func: NativeFn },
}

pub struct Vm {
    heap: Rc<RefCell<Heap>>,
    errors: SharedErrors,
    global_store: SharedGlobalStore,
    globals: Vec<Value>,
    stack: Vec<Value>,
    sp: usize,
    this_stack: Vec<Value>,
    this_sp: usize,
    frames: Vec<Frame>,
    last_popped: Value,
    running: bool,
    /// Interned key strings for overload lookup, indexed by opcode byte.
    operator_overload_keys: Vec<Value>,
    max_exec_time: Option<Duration>,
    /// Position of the instruction currently executing, for diagnostics.
    current_position: Position,
}

impl Vm {
    pub fn new(
        heap: Rc<RefCell<Heap>>,
        errors: SharedErrors,
        global_store: SharedGlobalStore,
    ) -> Self {
        let mut operator_overload_keys = vec![Value::Null; OPCODE_MAX];
        {
            let mut heap = heap.borrow_mut();
            for (opcode, name) in OPERATOR_OVERLOAD_NAMES.iter() {
                operator_overload_keys[*opcode as usize] = heap.alloc_string(*name);
            }
        }
        Vm {
            heap,
            errors,
            global_store,
            globals: Vec::new(),
            stack: vec![Value::Null; VM_STACK_SIZE],
            sp: 0,
            this_stack: vec![Value::Null; VM_THIS_STACK_SIZE],
            this_sp: 0,
            frames: Vec::new(),
            last_popped: Value::Null,
            running: false,
            operator_overload_keys,
            max_exec_time: None,
            current_position: Position::invalid(),
        }
    }

    pub fn set_max_execution_time(&mut self, max_exec_time: Option<Duration>) {
        self.max_exec_time = max_exec_time;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn last_popped(&self) -> Value {
        self.last_popped
    }

    pub fn heap(&self) -> &Rc<RefCell<Heap>> {
        &self.heap
    }

    pub fn reset(&mut self) {
        self.sp = 0;
        self.this_sp = 0;
        self.frames.clear();
    }

    /// Reports a runtime error at the current instruction's position.
    /// Native functions use this to fail; the error propagates like any
    /// other runtime error, including through recover frames.
    pub fn runtime_error<T>(&mut self, message: impl Into<String>) -> CompileResult<T> {
        self.error(ErrorKind::Runtime, message)
    }

    fn error<T>(&mut self, kind: ErrorKind, message: impl Into<String>) -> CompileResult<T> {
        let position = self.current_position.clone();
        self.errors.borrow_mut().add(kind, position, message);
        Err(Reported)
    }

    /// Runs a compiled program: a synthetic `main` function wrapping the
    /// result is pushed and executed until the frame stack empties or an
    /// unrecovered error is raised.
    pub fn run(&mut self, constants: &[Value], comp_result: Rc<CompilationResult>) -> bool {
        let old_this_sp = self.this_sp;
        let old_frames_count = self.frames.len();
        let main_fn = self.heap.borrow_mut().alloc_function(FunctionData {
            name: "main".to_string(),
            comp_result,
            num_locals: 0,
            num_args: 0,
            free_vals: Vec::new(),
        });
        if self.stack_push(main_fn).is_err() {
            return false;
        }
        let res = self.execute_function(main_fn, constants);
        while self.frames.len() > old_frames_count {
            self.pop_frame();
        }
        self.this_sp = old_this_sp;
        res
    }

    fn execute_function(&mut self, function: Value, constants: &[Value]) -> bool {
        if self.running {
            let _ = self.error::<()>(ErrorKind::User, "VM is already executing code");
            return false;
        }
        let Some(Callee::Script { comp_result, num_args, .. }) = self.callee_of(function) else {
            return false;
        };
        let frame = Frame {
            function,
            comp_result,
            ip: 0,
            base_pointer: self.sp - num_args,
            recover_ip: None,
            is_recovering: false,
        };
        if self.push_frame(frame).is_err() {
            return false;
        }

        self.running = true;
        self.last_popped = Value::Null;

        let deadline = self.max_exec_time.map(|limit| (Instant::now() + limit, limit));
        let mut time_check_counter = 0u32;

        loop {
            let Some(frame) = self.frames.last() else {
                break;
            };
            if frame.ip >= frame.comp_result.bytecode.len() {
                break;
            }
            let instruction_ip = frame.ip;
            self.current_position = frame
                .comp_result
                .src_positions
                .get(instruction_ip)
                .cloned()
                .unwrap_or_else(Position::invalid);
            let opcode_byte = self.fetch_u8();
            let step_res = match Opcode::try_from(opcode_byte) {
                Ok(opcode) => self.execute_opcode(opcode, constants),
                Err(_) => self.error(
                    ErrorKind::Runtime,
                    format!("unknown opcode: 0x{:x}", opcode_byte),
                ),
            };

            if let Some((deadline, limit)) = deadline {
                time_check_counter += 1;
                if time_check_counter > TIME_CHECK_INTERVAL {
                    time_check_counter = 0;
                    if Instant::now() > deadline {
                        let _ = self.error::<()>(
                            ErrorKind::Timeout,
                            format!("execution took more than {} ms", limit.as_millis()),
                        );
                    }
                }
            }

            if !self.errors.borrow().is_empty() {
                if !self.try_recover() {
                    break;
                }
            } else if matches!(step_res, Ok(StepResult::Halt)) {
                break;
            }

            if self.heap.borrow().should_sweep() {
                self.run_gc(constants);
            }
        }

        if !self.errors.borrow().is_empty() {
            let mut addition = Traceback::new();
            self.traceback_append_from_vm(&mut addition);
            let mut errors = self.errors.borrow_mut();
            if let Some(error) = errors.last_mut() {
                let traceback = error.traceback.get_or_insert_with(Traceback::new);
                traceback.items.extend(addition.items);
            }
        }

        self.run_gc(constants);
        self.running = false;
        self.errors.borrow().is_empty()
    }

    /// Scans for the innermost armed, non-recovering frame; unwinds to it,
    /// pushes the error as a value and redirects execution to the recover
    /// handler. Only a single pending runtime error is recoverable.
    fn try_recover(&mut self) -> bool {
        let recoverable = {
            let errors = self.errors.borrow();
            errors.count() == 1
                && errors.last().map(|error| error.kind == ErrorKind::Runtime).unwrap_or(false)
        };
        if !recoverable {
            return false;
        }
        let Some(recover_frame_ix) = self
            .frames
            .iter()
            .rposition(|frame| frame.recover_ip.is_some() && !frame.is_recovering)
        else {
            return false;
        };
        let Some(mut error) = self.errors.borrow_mut().take_last() else {
            return false;
        };
        let traceback = error.traceback.get_or_insert_with(Traceback::new);
        self.traceback_append_from_vm(traceback);
        let traceback = error.traceback.take();

        while self.frames.len() > recover_frame_ix + 1 {
            self.pop_frame();
        }
        let error_value = self.heap.borrow_mut().alloc_error(error.message.clone());
        if let Value::Object(obj) = error_value {
            if let ObjectPayload::Error(data) = self.heap.borrow_mut().payload_mut(obj) {
                data.traceback = traceback;
            }
        }
        let _ = self.stack_push(error_value);
        let frame = self.frames.last_mut().expect("recover frame vanished");
        frame.ip = frame.recover_ip.expect("recover frame lost its handler");
        frame.is_recovering = true;
        self.errors.borrow_mut().clear();
        true
    }

    fn traceback_append_from_vm(&self, traceback: &mut Traceback) {
        for frame in self.frames.iter().rev() {
            let name = {
                let heap = self.heap.borrow();
                match frame.function {
                    Value::Object(obj) => match heap.payload(obj) {
                        ObjectPayload::Function(data) => data.name.clone(),
                        _ => String::new(),
                    },
                    _ => String::new(),
                }
            };
            let last_ix = frame.comp_result.src_positions.len().saturating_sub(1);
            let position = frame
                .comp_result
                .src_positions
                .get(frame.ip.min(last_ix))
                .cloned()
                .unwrap_or_else(Position::invalid);
            traceback.append(&name, position);
        }
    }

    // === Dispatch ===

    fn execute_opcode(&mut self, opcode: Opcode, constants: &[Value]) -> CompileResult<StepResult> {
        match opcode {
            Opcode::Constant => {
                let constant_ix = self.fetch_u16() as usize;
                let Some(constant) = constants.get(constant_ix).copied() else {
                    return self.runtime_error(format!("constant at {} not found", constant_ix));
                };
                self.stack_push(constant)?;
            }
            Opcode::Number => {
                let bits = self.fetch_u64();
                self.stack_push(Value::Number(f64::from_bits(bits)))?;
            }
            Opcode::True => self.stack_push(Value::Bool(true))?,
            Opcode::False => self.stack_push(Value::Bool(false))?,
            Opcode::Null => self.stack_push(Value::Null)?,
            Opcode::Pop => {
                self.stack_pop();
            }
            Opcode::Dup => {
                let value = self.stack_get(0);
                self.stack_push(value)?;
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Or
            | Opcode::Xor
            | Opcode::And
            | Opcode::Lshift
            | Opcode::Rshift => {
                let right = self.stack_pop();
                let left = self.stack_pop();
                self.execute_arithmetic(opcode, left, right)?;
            }
            Opcode::Compare | Opcode::CompareEq => {
                let right = self.stack_pop();
                let left = self.stack_pop();
                let overloaded = self.try_overload_operator(left, right, Opcode::Compare)?;
                if !overloaded {
                    let (res, orderable) = {
                        let heap = self.heap.borrow();
                        compare_values(&heap, left, right)
                    };
                    if orderable || opcode == Opcode::CompareEq {
                        self.stack_push(Value::Number(res))?;
                    } else {
                        let (left_type, right_type) = self.operand_type_names(left, right);
                        return self.runtime_error(format!(
                            "cannot compare {} and {}",
                            left_type, right_type
                        ));
                    }
                }
            }
            Opcode::Equal | Opcode::NotEqual | Opcode::GreaterThan | Opcode::GreaterThanEqual => {
                let value = self.stack_pop();
                let comparison_res = value.to_number();
                let res = match opcode {
                    Opcode::Equal => comparison_res.abs() < f64::EPSILON,
                    Opcode::NotEqual => comparison_res.abs() >= f64::EPSILON,
                    Opcode::GreaterThan => comparison_res > 0.0,
                    _ => comparison_res > 0.0 || comparison_res.abs() < f64::EPSILON,
                };
                self.stack_push(Value::Bool(res))?;
            }
            Opcode::Minus => {
                let operand = self.stack_pop();
                if let Value::Number(n) = operand {
                    self.stack_push(Value::Number(-n))?;
                } else {
                    let overloaded =
                        self.try_overload_operator(operand, Value::Null, Opcode::Minus)?;
                    if !overloaded {
                        let type_name = self.type_name_of(operand);
                        return self.runtime_error(format!(
                            "invalid operand type for MINUS, got {}",
                            type_name
                        ));
                    }
                }
            }
            Opcode::Bang => {
                let operand = self.stack_pop();
                match operand {
                    Value::Bool(b) => self.stack_push(Value::Bool(!b))?,
                    Value::Null => self.stack_push(Value::Bool(true))?,
                    _ => {
                        let overloaded =
                            self.try_overload_operator(operand, Value::Null, Opcode::Bang)?;
                        if !overloaded {
                            self.stack_push(Value::Bool(false))?;
                        }
                    }
                }
            }
            Opcode::Jump => {
                let target = self.fetch_u16() as usize;
                self.current_frame().ip = target;
            }
            Opcode::JumpIfFalse => {
                let target = self.fetch_u16() as usize;
                let test = self.stack_pop();
                if !test.to_bool() {
                    self.current_frame().ip = target;
                }
            }
            Opcode::JumpIfTrue => {
                let target = self.fetch_u16() as usize;
                let test = self.stack_pop();
                if test.to_bool() {
                    self.current_frame().ip = target;
                }
            }
            Opcode::DefineModuleGlobal | Opcode::SetModuleGlobal => {
                let ix = self.fetch_u16() as usize;
                let value = self.stack_pop();
                self.set_global(ix, value)?;
            }
            Opcode::GetModuleGlobal => {
                let ix = self.fetch_u16() as usize;
                let value = self.globals.get(ix).copied().unwrap_or(Value::Null);
                self.stack_push(value)?;
            }
            Opcode::GetApeGlobal => {
                let ix = self.fetch_u16() as usize;
                let value = self.global_store.borrow().get_object_at(ix);
                match value {
                    Some(value) => self.stack_push(value)?,
                    None => {
                        return self.runtime_error(format!("global value {} not found", ix));
                    }
                }
            }
            Opcode::DefineLocal | Opcode::SetLocal => {
                let pos = self.fetch_u8() as usize;
                let base_pointer = self.current_frame().base_pointer;
                let value = self.stack_pop();
                self.stack[base_pointer + pos] = value;
            }
            Opcode::GetLocal => {
                let pos = self.fetch_u8() as usize;
                let base_pointer = self.current_frame().base_pointer;
                let value = self.stack[base_pointer + pos];
                self.stack_push(value)?;
            }
            Opcode::Array => {
                let count = self.fetch_u16() as usize;
                let items = self.stack[self.sp - count..self.sp].to_vec();
                let array = self.heap.borrow_mut().alloc_array(items);
                self.set_sp(self.sp - count);
                self.stack_push(array)?;
            }
            Opcode::MapStart => {
                self.fetch_u16();
                let map = self.heap.borrow_mut().alloc_map();
                self.this_stack_push(map)?;
            }
            Opcode::MapEnd => {
                let kvp_count = self.fetch_u16() as usize;
                let items_count = kvp_count * 2;
                let map = self.this_stack_pop();
                let Value::Object(map_obj) = map else {
                    return self.runtime_error("map under construction vanished");
                };
                for i in (0..items_count).step_by(2) {
                    let key = self.stack[self.sp - items_count + i];
                    let value = self.stack[self.sp - items_count + i + 1];
                    if !self.heap.borrow_mut().map_set(map_obj, key, value) {
                        let key_type = self.type_name_of(key);
                        return self
                            .runtime_error(format!("key of type {} is not hashable", key_type));
                    }
                }
                self.set_sp(self.sp - items_count);
                self.stack_push(map)?;
            }
            Opcode::GetThis => {
                let value = self.this_stack_get(0);
                self.stack_push(value)?;
            }
            Opcode::GetIndex => {
                let index = self.stack_pop();
                let left = self.stack_pop();
                self.execute_get_index(left, index)?;
            }
            Opcode::SetIndex => {
                let index = self.stack_pop();
                let left = self.stack_pop();
                let new_value = self.stack_pop();
                self.execute_set_index(left, index, new_value)?;
            }
            Opcode::GetValueAt => {
                let index = self.stack_pop();
                let left = self.stack_pop();
                self.execute_get_value_at(left, index)?;
            }
            Opcode::Len => {
                let value = self.stack_pop();
                let len = {
                    let heap = self.heap.borrow();
                    match value {
                        Value::Object(obj) => match heap.payload(obj) {
                            ObjectPayload::Array(items) => Some(items.len()),
                            ObjectPayload::Map(map) => Some(map.len()),
                            ObjectPayload::Str(s) => Some(s.value.chars().count()),
                            _ => None,
                        },
                        _ => None,
                    }
                };
                match len {
                    Some(len) => self.stack_push(Value::Number(len as f64))?,
                    None => {
                        let type_name = self.type_name_of(value);
                        return self.runtime_error(format!("cannot get length of {}", type_name));
                    }
                }
            }
            Opcode::Call => {
                let num_args = self.fetch_u8() as usize;
                let callee = self.stack_get(num_args);
                self.call_value(callee, num_args)?;
            }
            Opcode::ReturnValue => {
                let res = self.stack_pop();
                if !self.pop_frame() {
                    return Ok(StepResult::Halt);
                }
                self.stack_push(res)?;
            }
            Opcode::Return => {
                if !self.pop_frame() {
                    return Ok(StepResult::Halt);
                }
                self.stack_push(Value::Null)?;
            }
            Opcode::Function => {
                let constant_ix = self.fetch_u16() as usize;
                let num_free = self.fetch_u8() as usize;
                let Some(constant) = constants.get(constant_ix).copied() else {
                    return self.runtime_error(format!("constant {} not found", constant_ix));
                };
                let prototype = {
                    let heap = self.heap.borrow();
                    match constant {
                        Value::Object(obj) => match heap.payload(obj) {
                            ObjectPayload::Function(data) => Some((
                                data.name.clone(),
                                Rc::clone(&data.comp_result),
                                data.num_locals,
                                data.num_args,
                            )),
                            _ => None,
                        },
                        _ => None,
                    }
                };
                let Some((name, comp_result, num_locals, num_args)) = prototype else {
                    let type_name = self.type_name_of(constant);
                    return self.runtime_error(format!("{} is not a function", type_name));
                };
                let free_vals = self.stack[self.sp - num_free..self.sp].to_vec();
                let function = self.heap.borrow_mut().alloc_function(FunctionData {
                    name,
                    comp_result,
                    num_locals,
                    num_args,
                    free_vals,
                });
                self.set_sp(self.sp - num_free);
                self.stack_push(function)?;
            }
            Opcode::GetFree => {
                let free_ix = self.fetch_u8() as usize;
                let function = self.current_frame().function;
                let value = {
                    let heap = self.heap.borrow();
                    match function {
                        Value::Object(obj) => match heap.payload(obj) {
                            ObjectPayload::Function(data) => {
                                data.free_vals.get(free_ix).copied().unwrap_or(Value::Null)
                            }
                            _ => Value::Null,
                        },
                        _ => Value::Null,
                    }
                };
                self.stack_push(value)?;
            }
            Opcode::SetFree => {
                let free_ix = self.fetch_u8() as usize;
                let value = self.stack_pop();
                let function = self.current_frame().function;
                if let Value::Object(obj) = function {
                    if let ObjectPayload::Function(data) = self.heap.borrow_mut().payload_mut(obj)
                    {
                        if free_ix < data.free_vals.len() {
                            data.free_vals[free_ix] = value;
                        }
                    }
                }
            }
            Opcode::CurrentFunction => {
                let function = self.current_frame().function;
                self.stack_push(function)?;
            }
            Opcode::SetRecover => {
                let recover_ip = self.fetch_u16() as usize;
                self.current_frame().recover_ip = Some(recover_ip);
            }
            Opcode::None => {
                return self.runtime_error("unknown opcode: 0x0");
            }
        }
        Ok(StepResult::Continue)
    }

    // === Operations ===

    fn execute_arithmetic(&mut self, opcode: Opcode, left: Value, right: Value) -> CompileResult {
        // one null operand coerces to 0 next to a numeric partner; two
        // nulls fall through to overloads / the type error
        let numeric =
            left.is_numeric() && right.is_numeric() && !(left.is_null() && right.is_null());
        if numeric {
            let left_val = left.to_number();
            let right_val = right.to_number();
            let left_int = left_val as i64;
            let right_int = right_val as i64;
            let res = match opcode {
                Opcode::Add => left_val + right_val,
                Opcode::Sub => left_val - right_val,
                Opcode::Mul => left_val * right_val,
                Opcode::Div => left_val / right_val,
                Opcode::Mod => {
                    if right_int == 0 {
                        f64::NAN
                    } else {
                        (left_int % right_int) as f64
                    }
                }
                Opcode::Or => (left_int | right_int) as f64,
                Opcode::Xor => (left_int ^ right_int) as f64,
                Opcode::And => (left_int & right_int) as f64,
                Opcode::Lshift => left_int.wrapping_shl(right_int as u32 & 63) as f64,
                _ => left_int.wrapping_shr(right_int as u32 & 63) as f64,
            };
            self.stack_push(Value::Number(res))?;
            return Ok(());
        }

        let (left_type, right_type) = {
            let heap = self.heap.borrow();
            (left.value_type(&heap), right.value_type(&heap))
        };
        if left_type == ValueType::String && right_type == ValueType::String && opcode == Opcode::Add
        {
            let concatenated = {
                let heap = self.heap.borrow();
                let (Value::Object(a), Value::Object(b)) = (left, right) else { unreachable!() };
                let left_str = heap.string_value(a).unwrap_or_default();
                let right_str = heap.string_value(b).unwrap_or_default();
                if left_str.is_empty() {
                    None
                } else if right_str.is_empty() {
                    None
                } else {
                    Some(format!("{}{}", left_str, right_str))
                }
            };
            let value = match concatenated {
                Some(s) => self.heap.borrow_mut().alloc_string(s),
                // one side is empty; the other is already the result
                None => {
                    let heap = self.heap.borrow();
                    let Value::Object(a) = left else { unreachable!() };
                    if heap.string_value(a).unwrap_or_default().is_empty() {
                        right
                    } else {
                        left
                    }
                }
            };
            self.stack_push(value)?;
            return Ok(());
        }
        if left_type == ValueType::Array && opcode == Opcode::Add {
            // append in place; the array itself is the result
            if let Value::Object(obj) = left {
                if let ObjectPayload::Array(items) = self.heap.borrow_mut().payload_mut(obj) {
                    items.push(right);
                }
            }
            self.stack_push(left)?;
            return Ok(());
        }
        // string next to a non-string stringifies the partner; maps keep
        // their chance at an overload instead
        if opcode == Opcode::Add
            && (left_type == ValueType::String || right_type == ValueType::String)
            && left_type != ValueType::Map
            && right_type != ValueType::Map
        {
            let concatenated = {
                let heap = self.heap.borrow();
                format!("{}{}", stringify(&heap, left), stringify(&heap, right))
            };
            let value = self.heap.borrow_mut().alloc_string(concatenated);
            self.stack_push(value)?;
            return Ok(());
        }

        let overloaded = self.try_overload_operator(left, right, opcode)?;
        if !overloaded {
            let (left_type, right_type) = self.operand_type_names(left, right);
            return self.runtime_error(format!(
                "invalid operand types for {}, got {} and {}",
                opcode.name(),
                left_type,
                right_type
            ));
        }
        Ok(())
    }

    /// Looks up the conventionally named callable on either map operand and
    /// invokes it in place of the failed operation. Returns whether an
    /// overload was found.
    fn try_overload_operator(
        &mut self,
        left: Value,
        right: Value,
        opcode: Opcode,
    ) -> CompileResult<bool> {
        let key = self.operator_overload_keys[opcode as usize];
        if key.is_null() {
            return Ok(false);
        }
        let callee = {
            let heap = self.heap.borrow();
            let map_lookup = |value: Value| -> Option<Value> {
                let Value::Object(obj) = value else { return None };
                if !matches!(heap.payload(obj), ObjectPayload::Map(_)) {
                    return None;
                }
                heap.map_get(obj, key).filter(|callee| callee.is_callable(&heap))
            };
            map_lookup(left).or_else(|| map_lookup(right))
        };
        let Some(callee) = callee else {
            return Ok(false);
        };
        let num_operands = if matches!(opcode, Opcode::Minus | Opcode::Bang) { 1 } else { 2 };
        self.stack_push(callee)?;
        self.stack_push(left)?;
        if num_operands == 2 {
            self.stack_push(right)?;
        }
        self.call_value(callee, num_operands)?;
        Ok(true)
    }

    fn callee_of(&self, callee: Value) -> Option<Callee> {
        let heap = self.heap.borrow();
        let Value::Object(obj) = callee else { return None };
        match heap.payload(obj) {
            ObjectPayload::Function(data) => Some(Callee::Script {
                comp_result: Rc::clone(&data.comp_result),
                num_args: data.num_args,
                name: data.name.clone(),
            }),
            ObjectPayload::Native(data) => {
                Some(Callee::Native { name: data.name.clone(), func: Rc::clone(&data.func) })
            }
            _ => None,
        }
    }

    fn call_value(&mut self, callee: Value, num_args: usize) -> CompileResult {
        match self.callee_of(callee) {
            Some(Callee::Script { comp_result, num_args: expected_args, name }) => {
                if num_args != expected_args {
                    return self.runtime_error(format!(
                        "invalid number of arguments to \"{}\", expected {}, got {}",
                        name, expected_args, num_args
                    ));
                }
                let frame = Frame {
                    function: callee,
                    comp_result,
                    ip: 0,
                    base_pointer: self.sp - num_args,
                    recover_ip: None,
                    is_recovering: false,
                };
                self.push_frame(frame)
            }
            Some(Callee::Native { name, func }) => self.call_native(name, func, num_args),
            None => {
                let type_name = self.type_name_of(callee);
                self.runtime_error(format!("{} object is not callable", type_name))
            }
        }
    }

    fn call_native(&mut self, name: String, func: NativeFn, num_args: usize) -> CompileResult {
        let args = self.stack[self.sp - num_args..self.sp].to_vec();
        let res = func(self, &args);
        if !self.errors.borrow().is_empty() {
            // `crash` keeps its own position and traceback
            if name != "crash" {
                let position = self.current_position.clone();
                let mut errors = self.errors.borrow_mut();
                if let Some(error) = errors.last_mut() {
                    error.position = position;
                    let mut traceback = Traceback::new();
                    traceback.append(&name, Position::invalid());
                    error.traceback = Some(traceback);
                }
            }
            return Err(Reported);
        }
        if let Value::Object(obj) = res {
            let is_error = {
                let heap = self.heap.borrow();
                matches!(heap.payload(obj), ObjectPayload::Error(_))
            };
            if is_error {
                let mut traceback = Traceback::new();
                // the error builtin is reported at its call site, not as a
                // frame of its own
                if name != "error" {
                    traceback.append(&name, Position::invalid());
                }
                self.traceback_append_from_vm(&mut traceback);
                if let ObjectPayload::Error(data) = self.heap.borrow_mut().payload_mut(obj) {
                    if data.traceback.is_none() {
                        data.traceback = Some(traceback);
                    }
                }
            }
        }
        self.set_sp(self.sp - num_args - 1);
        self.stack_push(res)
    }

    fn execute_get_index(&mut self, left: Value, index: Value) -> CompileResult {
        enum Outcome {
            Push(Value),
            Char(char),
            Fail(String),
        }
        let outcome = {
            let heap = self.heap.borrow();
            match left {
                Value::Object(obj) => match heap.payload(obj) {
                    ObjectPayload::Array(items) => match index {
                        Value::Number(n) => {
                            let mut ix = n as i64;
                            if ix < 0 {
                                // negative indices count from the end
                                ix += items.len() as i64;
                            }
                            if ix >= 0 && (ix as usize) < items.len() {
                                Outcome::Push(items[ix as usize])
                            } else {
                                Outcome::Push(Value::Null)
                            }
                        }
                        _ => Outcome::Fail(format!(
                            "cannot index ARRAY with {}",
                            index.type_name(&heap)
                        )),
                    },
                    ObjectPayload::Map(_) => {
                        Outcome::Push(heap.map_get(obj, index).unwrap_or(Value::Null))
                    }
                    ObjectPayload::Str(s) => match index {
                        Value::Number(n) => {
                            let ix = n as i64;
                            match usize::try_from(ix).ok().and_then(|ix| s.value.chars().nth(ix)) {
                                Some(ch) => Outcome::Char(ch),
                                None => Outcome::Push(Value::Null),
                            }
                        }
                        _ => Outcome::Fail(format!(
                            "cannot index STRING with {}",
                            index.type_name(&heap)
                        )),
                    },
                    _ => Outcome::Fail(format!("type {} is not indexable", left.type_name(&heap))),
                },
                _ => Outcome::Fail(format!("type {} is not indexable", left.type_name(&heap))),
            }
        };
        match outcome {
            Outcome::Push(value) => self.stack_push(value),
            Outcome::Char(ch) => {
                let value = self.heap.borrow_mut().alloc_string(ch.to_string());
                self.stack_push(value)
            }
            Outcome::Fail(message) => self.runtime_error(message),
        }
    }

    fn execute_set_index(&mut self, left: Value, index: Value, new_value: Value) -> CompileResult {
        let left_type = {
            let heap = self.heap.borrow();
            left.value_type(&heap)
        };
        match left_type {
            ValueType::Array => {
                let Value::Number(n) = index else {
                    let index_type = self.type_name_of(index);
                    return self.runtime_error(format!("cannot index ARRAY with {}", index_type));
                };
                let ix = n as i64;
                if ix < 0 {
                    return self.runtime_error("setting array item failed (out of bounds?)");
                }
                let Value::Object(obj) = left else { unreachable!() };
                if let ObjectPayload::Array(items) = self.heap.borrow_mut().payload_mut(obj) {
                    let ix = ix as usize;
                    if ix >= items.len() {
                        // writes past the end grow the array with nulls
                        items.resize(ix + 1, Value::Null);
                    }
                    items[ix] = new_value;
                }
                Ok(())
            }
            ValueType::Map => {
                let Value::Object(obj) = left else { unreachable!() };
                if !self.heap.borrow_mut().map_set(obj, index, new_value) {
                    let key_type = self.type_name_of(index);
                    return self
                        .runtime_error(format!("key of type {} is not hashable", key_type));
                }
                Ok(())
            }
            _ => {
                let type_name = self.type_name_of(left);
                self.runtime_error(format!("type {} is not indexable", type_name))
            }
        }
    }

    fn execute_get_value_at(&mut self, left: Value, index: Value) -> CompileResult {
        let Value::Number(n) = index else {
            let (left_type, index_type) = self.operand_type_names(left, index);
            return self.runtime_error(format!("cannot index {} with {}", left_type, index_type));
        };
        let ix = n as i64;
        let left_type = {
            let heap = self.heap.borrow();
            left.value_type(&heap)
        };
        match left_type {
            ValueType::Array => {
                let value = {
                    let heap = self.heap.borrow();
                    let Value::Object(obj) = left else { unreachable!() };
                    match heap.payload(obj) {
                        ObjectPayload::Array(items) if ix >= 0 => {
                            items.get(ix as usize).copied().unwrap_or(Value::Null)
                        }
                        _ => Value::Null,
                    }
                };
                self.stack_push(value)
            }
            ValueType::Map => {
                let Value::Object(obj) = left else { unreachable!() };
                let entry = if ix >= 0 {
                    self.heap.borrow().map_entry_at(obj, ix as usize)
                } else {
                    None
                };
                let res = match entry {
                    // map iteration yields {key, value} pairs
                    Some((key, value)) => {
                        let mut heap = self.heap.borrow_mut();
                        let pair = heap.alloc_map();
                        let Value::Object(pair_obj) = pair else { unreachable!() };
                        let key_str = heap.alloc_string("key");
                        let value_str = heap.alloc_string("value");
                        heap.map_set(pair_obj, key_str, key);
                        heap.map_set(pair_obj, value_str, value);
                        pair
                    }
                    None => Value::Null,
                };
                self.stack_push(res)
            }
            ValueType::String => {
                let ch = {
                    let heap = self.heap.borrow();
                    let Value::Object(obj) = left else { unreachable!() };
                    match heap.payload(obj) {
                        ObjectPayload::Str(s) if ix >= 0 => s.value.chars().nth(ix as usize),
                        _ => None,
                    }
                };
                let res = match ch {
                    Some(ch) => self.heap.borrow_mut().alloc_string(ch.to_string()),
                    None => Value::Null,
                };
                self.stack_push(res)
            }
            _ => {
                let type_name = self.type_name_of(left);
                self.runtime_error(format!("type {} is not indexable", type_name))
            }
        }
    }

    // === Stacks and frames ===

    fn fetch_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no frame");
        let byte = frame.comp_result.bytecode[frame.ip];
        frame.ip += 1;
        byte
    }

    fn fetch_u16(&mut self) -> u16 {
        ((self.fetch_u8() as u16) << 8) | self.fetch_u8() as u16
    }

    fn fetch_u64(&mut self) -> u64 {
        let mut res = 0u64;
        for _ in 0..8 {
            res = (res << 8) | self.fetch_u8() as u64;
        }
        res
    }

    fn current_frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no frame")
    }

    fn stack_push(&mut self, value: Value) -> CompileResult {
        if self.sp >= VM_STACK_SIZE {
            return self.runtime_error("stack overflow");
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn stack_pop(&mut self) -> Value {
        if self.sp == 0 {
            return Value::Null;
        }
        self.sp -= 1;
        let res = self.stack[self.sp];
        self.last_popped = res;
        res
    }

    fn stack_get(&self, nth_item: usize) -> Value {
        let ix = self.sp - 1 - nth_item;
        self.stack[ix]
    }

    /// Growing the stack pointer clears the new region, so freshly reserved
    /// locals read as null and never leak stale values to the collector.
    fn set_sp(&mut self, new_sp: usize) {
        if new_sp > self.sp {
            for slot in &mut self.stack[self.sp..new_sp] {
                *slot = Value::Null;
            }
        }
        self.sp = new_sp;
    }

    fn this_stack_push(&mut self, value: Value) -> CompileResult {
        if self.this_sp >= VM_THIS_STACK_SIZE {
            return self.runtime_error("this stack overflow");
        }
        self.this_stack[self.this_sp] = value;
        self.this_sp += 1;
        Ok(())
    }

    fn this_stack_pop(&mut self) -> Value {
        if self.this_sp == 0 {
            return Value::Null;
        }
        self.this_sp -= 1;
        self.this_stack[self.this_sp]
    }

    fn this_stack_get(&self, nth_item: usize) -> Value {
        if self.this_sp == 0 {
            return Value::Null;
        }
        self.this_stack[self.this_sp - 1 - nth_item]
    }

    fn push_frame(&mut self, frame: Frame) -> CompileResult {
        if self.frames.len() >= VM_MAX_FRAMES {
            return self.runtime_error("frame stack overflow");
        }
        let num_locals = {
            let heap = self.heap.borrow();
            match frame.function {
                Value::Object(obj) => match heap.payload(obj) {
                    ObjectPayload::Function(data) => data.num_locals,
                    _ => 0,
                },
                _ => 0,
            }
        };
        let new_sp = frame.base_pointer + num_locals;
        self.frames.push(frame);
        self.set_sp(new_sp);
        Ok(())
    }

    fn pop_frame(&mut self) -> bool {
        if let Some(frame) = self.frames.last() {
            let new_sp = frame.base_pointer.saturating_sub(1);
            self.set_sp(new_sp);
        }
        self.frames.pop();
        !self.frames.is_empty()
    }

    fn set_global(&mut self, ix: usize, value: Value) -> CompileResult {
        if ix >= VM_MAX_GLOBALS {
            return self.runtime_error("global write out of range");
        }
        if ix >= self.globals.len() {
            self.globals.resize(ix + 1, Value::Null);
        }
        self.globals[ix] = value;
        Ok(())
    }

    fn type_name_of(&self, value: Value) -> String {
        let heap = self.heap.borrow();
        value.type_name(&heap).to_string()
    }

    fn operand_type_names(&self, left: Value, right: Value) -> (String, String) {
        let heap = self.heap.borrow();
        (left.type_name(&heap).to_string(), right.type_name(&heap).to_string())
    }

    // === Garbage collection ===

    fn run_gc(&mut self, constants: &[Value]) {
        let mut heap = self.heap.borrow_mut();
        heap.unmark_all();
        heap.mark_values(self.global_store.borrow().objects());
        heap.mark_values(constants);
        heap.mark_values(&self.globals);
        for frame in &self.frames {
            heap.mark_value(frame.function);
        }
        let (live_stack, live_this_stack) = (&self.stack[..self.sp], &self.this_stack[..self.this_sp]);
        heap.mark_values(live_stack);
        heap.mark_values(live_this_stack);
        heap.mark_value(self.last_popped);
        heap.mark_values(&self.operator_overload_keys);
        heap.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, FileReadFn, SharedFileRead};
    use crate::errors::ErrorList;
    use crate::symbols::GlobalStore;

    fn try_run(code: &str) -> (Vm, bool, SharedErrors) {
        let errors = ErrorList::shared();
        let heap = Rc::new(RefCell::new(Heap::new()));
        let global_store = GlobalStore::shared();
        let file_read: SharedFileRead =
            Rc::new(RefCell::new(Box::new(|_: &str| None) as FileReadFn));
        let mut compiler =
            Compiler::new(errors.clone(), heap.clone(), global_store.clone(), file_read);
        let comp_result = compiler.compile_source(code, None).expect("compilation failed");
        let mut vm = Vm::new(heap, errors.clone(), global_store);
        let ok = vm.run(compiler.constants(), comp_result);
        (vm, ok, errors)
    }

    fn run_source(code: &str) -> (Vm, Value) {
        let (vm, ok, errors) = try_run(code);
        assert!(
            ok,
            "execution failed: {:?}",
            errors.borrow().iter().map(|e| e.message.clone()).collect::<Vec<_>>()
        );
        let res = vm.last_popped();
        (vm, res)
    }

    fn run_number(code: &str) -> f64 {
        let (_, res) = run_source(code);
        match res {
            Value::Number(n) => n,
            other => panic!("expected number, got {:?}", other),
        }
    }

    #[test]
    fn test_stack_is_balanced_after_run() {
        let (vm, _) = run_source("var a = 1; a + 2;");
        assert_eq!(vm.sp, 0);
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run_number("2 + 3 * 4;"), 14.0);
        assert_eq!(run_number("10 / 4;"), 2.5);
        assert_eq!(run_number("7 % 3;"), 1.0);
        assert_eq!(run_number("1 << 4;"), 16.0);
        assert_eq!(run_number("6 & 3;"), 2.0);
        assert_eq!(run_number("6 | 3;"), 7.0);
        assert_eq!(run_number("6 ^ 3;"), 5.0);
    }

    #[test]
    fn test_null_coerces_to_zero_next_to_numbers() {
        assert_eq!(run_number("null + 5;"), 5.0);
        assert_eq!(run_number("5 - null;"), 5.0);
    }

    #[test]
    fn test_comparisons() {
        let (_, res) = run_source("1 < 2;");
        assert_eq!(res, Value::Bool(true));
        let (_, res) = run_source("2 <= 1;");
        assert_eq!(res, Value::Bool(false));
        let (_, res) = run_source("\"abc\" == \"abc\";");
        assert_eq!(res, Value::Bool(true));
    }

    #[test]
    fn test_calls_and_locals() {
        assert_eq!(run_number("function add(a, b) { return a + b; } add(2, 3);"), 5.0);
    }

    #[test]
    fn test_wrong_arity_is_a_runtime_error() {
        let (_, ok, errors) = try_run("function f(a) { return a; } f(1, 2);");
        assert!(!ok);
        assert!(errors.borrow().last().unwrap().message.contains("invalid number of arguments"));
    }

    #[test]
    fn test_closure_captures_and_mutation() {
        assert_eq!(
            run_number("function make(x) { return function(y) { return x + y; }; } make(10)(7);"),
            17.0
        );
        assert_eq!(
            run_number(
                "function counter() { var n = 0; return function() { n = n + 1; return n; }; } \
                 const c = counter(); c(); c(); c();"
            ),
            3.0
        );
    }

    #[test]
    fn test_while_for_break_continue() {
        assert_eq!(
            run_number("var s = 0; var i = 0; while (i < 5) { i = i + 1; s = s + i; } s;"),
            15.0
        );
        assert_eq!(
            run_number(
                "var s = 0; for (var i = 0; i < 10; i++) { if (i == 3) { continue; } \
                 if (i == 6) { break; } s = s + i; } s;"
            ),
            12.0
        );
    }

    #[test]
    fn test_arrays_and_negative_indexing() {
        assert_eq!(run_number("var a = [1, 2, 3]; a[-1];"), 3.0);
        let (_, res) = run_source("var a = [1]; a[5];");
        assert_eq!(res, Value::Null);
        assert_eq!(run_number("var a = [1, 2]; a[0] = 9; a[0];"), 9.0);
        // writes past the end grow the array with nulls
        assert_eq!(run_number("var a = []; a[2] = 7; a[2];"), 7.0);
        let (_, res) = run_source("var a = []; a[2] = 7; a[1];");
        assert_eq!(res, Value::Null);
    }

    #[test]
    fn test_array_add_appends_in_place() {
        assert_eq!(run_number("var a = [1]; a + 2; a[1];"), 2.0);
    }

    #[test]
    fn test_string_indexing_and_concat() {
        let (vm, res) = run_source("var s = \"abc\"; s[1];");
        let Value::Object(obj) = res else { panic!("expected string") };
        assert_eq!(vm.heap().borrow().string_value(obj), Some("b"));
        let (vm, res) = run_source("\"n = \" + 4;");
        let Value::Object(obj) = res else { panic!("expected string") };
        assert_eq!(vm.heap().borrow().string_value(obj), Some("n = 4"));
    }

    #[test]
    fn test_map_literals_and_indexing() {
        assert_eq!(run_number("var m = { a: 1, \"b\": 2 }; m.a + m[\"b\"];"), 3.0);
        assert_eq!(run_number("var m = {}; m[1] = 10; m[1];"), 10.0);
    }

    #[test]
    fn test_foreach_over_array_and_map() {
        assert_eq!(run_number("var s = 0; for (x in [1, 2, 3]) { s = s + x; } s;"), 6.0);
        assert_eq!(
            run_number("var m = { a: 1, b: 2 }; var s = 0; for (k in m) { s = s + m[k.key]; } s;"),
            3.0
        );
    }

    #[test]
    fn test_ternary_and_logical_short_circuit() {
        assert_eq!(run_number("true ? 1 : 2;"), 1.0);
        assert_eq!(run_number("false ? 1 : 2;"), 2.0);
        // the right side of a short-circuited && must not run
        assert_eq!(
            run_number("var hits = 0; function f() { hits = hits + 1; return true; } \
                        false && f(); hits;"),
            0.0
        );
        assert_eq!(
            run_number("var hits = 0; function f() { hits = hits + 1; return true; } \
                        true || f(); hits;"),
            0.0
        );
    }

    #[test]
    fn test_operator_overloading() {
        assert_eq!(
            run_number(
                "var M = {}; M[\"__operator_add__\"] = function(x, y) { return 42; }; M + 1;"
            ),
            42.0
        );
        // `M < 5` compiles as `5 > M`; __cmp__ receives (5, M)
        assert_eq!(
            run_number(
                "var M = { __cmp__: function(x, y) { return 1; } }; \
                 if (M < 5) { 1; } else { 2; }"
            ),
            1.0
        );
    }

    #[test]
    fn test_recover_catches_runtime_error() {
        let (vm, ok, errors) = try_run(
            "function f() { recover (e) { return 99; } var x = null[0]; return 0; } f();",
        );
        assert!(ok, "recover should swallow the error");
        assert!(errors.borrow().is_empty());
        assert_eq!(vm.last_popped(), Value::Number(99.0));
    }

    #[test]
    fn test_error_inside_recover_body_propagates() {
        let (_, ok, errors) =
            try_run("function f() { recover (e) { return null[0]; } var x = null[0]; return 0; } f();");
        assert!(!ok);
        assert_eq!(errors.borrow().count(), 1);
    }

    #[test]
    fn test_unrecovered_error_carries_traceback() {
        let (_, ok, errors) = try_run("function g() { return null[0]; } function f() { return g(); } f();");
        assert!(!ok);
        let errors = errors.borrow();
        let traceback = errors.last().unwrap().traceback.as_ref().expect("no traceback");
        let names: Vec<&str> =
            traceback.items.iter().map(|item| item.function_name.as_str()).collect();
        assert_eq!(names, vec!["g", "f", "main"]);
    }

    #[test]
    fn test_gc_stress_survives_loop_allocation() {
        // enough string allocations to force several sweeps mid-run
        let (vm, res) = run_source(
            "var s = \"\"; for (var i = 0; i < 500; i++) { s = s + \"x\"; } s[499];",
        );
        let Value::Object(obj) = res else { panic!("expected string") };
        assert_eq!(vm.heap().borrow().string_value(obj), Some("x"));
    }

    #[test]
    fn test_timeout_raises_timeout_error() {
        let errors = ErrorList::shared();
        let heap = Rc::new(RefCell::new(Heap::new()));
        let global_store = GlobalStore::shared();
        let file_read: SharedFileRead =
            Rc::new(RefCell::new(Box::new(|_: &str| None) as FileReadFn));
        let mut compiler =
            Compiler::new(errors.clone(), heap.clone(), global_store.clone(), file_read);
        let comp_result =
            compiler.compile_source("while (true) {}", None).expect("compilation failed");
        let mut vm = Vm::new(heap, errors.clone(), global_store);
        vm.set_max_execution_time(Some(Duration::from_millis(20)));
        let ok = vm.run(compiler.constants(), comp_result);
        assert!(!ok);
        assert_eq!(errors.borrow().last().unwrap().kind, ErrorKind::Timeout);
    }
}
