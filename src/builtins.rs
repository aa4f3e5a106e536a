// File: src/builtins.rs
//
// Core native functions for the Ape runtime.
// These cover the surface the language itself leans on: template strings
// call `tostring`, the scenarios iterate with `keys` and `range`, and
// `error`/`crash` exercise the recoverable-error machinery. Natives receive
// the VM and an argument slice and return a single value; failures go
// through the shared error list.

use crate::context::{SharedFileWrite, SharedStdout};
use crate::compiler::SharedFileRead;
use crate::heap::{Heap, NativeFn, ObjectPayload};
use crate::symbols::SharedGlobalStore;
use crate::value::{stringify, Value, ValueType};
use crate::vm::Vm;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

pub fn register_builtins(
    heap: &Rc<RefCell<Heap>>,
    global_store: &SharedGlobalStore,
    stdout: SharedStdout,
    file_read: SharedFileRead,
    file_write: SharedFileWrite,
) {
    let print_stdout = stdout.clone();
    register(heap, global_store, "println", move |vm, args| {
        let text = join_args(vm, args);
        let mut out = stdout.borrow_mut();
        let _ = writeln!(out, "{}", text);
        Value::Null
    });
    register(heap, global_store, "print", move |vm, args| {
        let text = join_args(vm, args);
        let mut out = print_stdout.borrow_mut();
        let _ = write!(out, "{}", text);
        let _ = out.flush();
        Value::Null
    });

    register(heap, global_store, "len", |vm, args| {
        if args.len() != 1 {
            return arg_count_error(vm, "len", 1, args.len());
        }
        let len = {
            let heap = vm.heap().borrow();
            match args[0] {
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
            Some(len) => Value::Number(len as f64),
            None => {
                let type_name = type_name(vm, args[0]);
                let _ = vm.runtime_error::<()>(format!("cannot get length of {}", type_name));
                Value::Null
            }
        }
    });

    register(heap, global_store, "tostring", |vm, args| {
        if args.len() != 1 {
            return arg_count_error(vm, "tostring", 1, args.len());
        }
        let text = {
            let heap = vm.heap().borrow();
            stringify(&heap, args[0])
        };
        vm.heap().borrow_mut().alloc_string(text)
    });

    register(heap, global_store, "to_num", |vm, args| {
        if args.len() != 1 {
            return arg_count_error(vm, "to_num", 1, args.len());
        }
        match args[0] {
            Value::Number(n) => Value::Number(n),
            Value::Bool(b) => Value::Number(if b { 1.0 } else { 0.0 }),
            Value::Null => Value::Number(0.0),
            Value::Object(obj) => {
                let parsed = {
                    let heap = vm.heap().borrow();
                    heap.string_value(obj).and_then(|s| s.trim().parse::<f64>().ok())
                };
                match parsed {
                    Some(n) => Value::Number(n),
                    None => {
                        let type_name = type_name(vm, args[0]);
                        let _ = vm
                            .runtime_error::<()>(format!("cannot convert {} to number", type_name));
                        Value::Null
                    }
                }
            }
        }
    });

    register(heap, global_store, "range", |vm, args| {
        let parts: Option<Vec<f64>> = args
            .iter()
            .map(|arg| match arg {
                Value::Number(n) => Some(*n),
                _ => None,
            })
            .collect();
        let Some(parts) = parts else {
            let _ = vm.runtime_error::<()>("invalid arguments to range, expected numbers");
            return Value::Null;
        };
        let (start, end, step) = match parts.as_slice() {
            [end] => (0.0, *end, 1.0),
            [start, end] => (*start, *end, 1.0),
            [start, end, step] => (*start, *end, *step),
            _ => {
                let _ = vm.runtime_error::<()>(format!(
                    "invalid number of arguments to \"range\", expected 1 to 3, got {}",
                    args.len()
                ));
                return Value::Null;
            }
        };
        if step == 0.0 {
            let _ = vm.runtime_error::<()>("range step cannot be 0");
            return Value::Null;
        }
        let mut items = Vec::new();
        let mut current = start;
        while (step > 0.0 && current < end) || (step < 0.0 && current > end) {
            items.push(Value::Number(current));
            current += step;
        }
        vm.heap().borrow_mut().alloc_array(items)
    });

    register(heap, global_store, "append", |vm, args| {
        if args.len() != 2 {
            return arg_count_error(vm, "append", 2, args.len());
        }
        let Value::Object(obj) = args[0] else {
            let type_name = type_name(vm, args[0]);
            let _ = vm.runtime_error::<()>(format!("cannot append to {}", type_name));
            return Value::Null;
        };
        let new_len = {
            let mut heap = vm.heap().borrow_mut();
            match heap.payload_mut(obj) {
                ObjectPayload::Array(items) => {
                    items.push(args[1]);
                    Some(items.len())
                }
                _ => None,
            }
        };
        match new_len {
            Some(new_len) => Value::Number(new_len as f64),
            None => {
                let type_name = type_name(vm, args[0]);
                let _ = vm.runtime_error::<()>(format!("cannot append to {}", type_name));
                Value::Null
            }
        }
    });

    register(heap, global_store, "keys", |vm, args| {
        if args.len() != 1 {
            return arg_count_error(vm, "keys", 1, args.len());
        }
        let Value::Object(obj) = args[0] else {
            let type_name = type_name(vm, args[0]);
            let _ = vm.runtime_error::<()>(format!("cannot get keys of {}", type_name));
            return Value::Null;
        };
        let keys = {
            let heap = vm.heap().borrow();
            match heap.payload(obj) {
                ObjectPayload::Map(_) => Some(heap.map_keys(obj)),
                _ => None,
            }
        };
        match keys {
            Some(keys) => vm.heap().borrow_mut().alloc_array(keys),
            None => {
                let type_name = type_name(vm, args[0]);
                let _ = vm.runtime_error::<()>(format!("cannot get keys of {}", type_name));
                Value::Null
            }
        }
    });

    // error builds a recoverable error value; crash raises immediately
    register(heap, global_store, "error", |vm, args| {
        let message = args.first().map(|arg| to_text(vm, *arg)).unwrap_or_default();
        vm.heap().borrow_mut().alloc_error(message)
    });
    register(heap, global_store, "crash", |vm, args| {
        let message = args.first().map(|arg| to_text(vm, *arg)).unwrap_or_default();
        let _ = vm.runtime_error::<()>(message);
        Value::Null
    });

    register(heap, global_store, "assert", |vm, args| {
        if args.len() != 1 {
            return arg_count_error(vm, "assert", 1, args.len());
        }
        if !args[0].to_bool() {
            let _ = vm.runtime_error::<()>("assertion failed");
            return Value::Null;
        }
        Value::Bool(true)
    });

    register(heap, global_store, "is_error", |vm, args| {
        if args.len() != 1 {
            return arg_count_error(vm, "is_error", 1, args.len());
        }
        let heap = vm.heap().borrow();
        Value::Bool(args[0].value_type(&heap) == ValueType::Error)
    });

    register(heap, global_store, "deep_copy", |vm, args| {
        if args.len() != 1 {
            return arg_count_error(vm, "deep_copy", 1, args.len());
        }
        vm.heap().borrow_mut().deep_copy(args[0])
    });

    register(heap, global_store, "read_file", move |vm, args| {
        if args.len() != 1 {
            return arg_count_error(vm, "read_file", 1, args.len());
        }
        let Some(path) = string_arg(vm, args[0]) else {
            let _ = vm.runtime_error::<()>("invalid argument to read_file, expected a path");
            return Value::Null;
        };
        match (*file_read.borrow())(&path) {
            Some(contents) => vm.heap().borrow_mut().alloc_string(contents),
            None => {
                let _ = vm.runtime_error::<()>(format!("reading file '{}' failed", path));
                Value::Null
            }
        }
    });

    register(heap, global_store, "write_file", move |vm, args| {
        if args.len() != 2 {
            return arg_count_error(vm, "write_file", 2, args.len());
        }
        let Some(path) = string_arg(vm, args[0]) else {
            let _ = vm.runtime_error::<()>("invalid argument to write_file, expected a path");
            return Value::Null;
        };
        let data = to_text(vm, args[1]);
        let ok = (*file_write.borrow())(&path, &data);
        if !ok {
            let _ = vm.runtime_error::<()>(format!("writing file '{}' failed", path));
            return Value::Null;
        }
        Value::Number(data.len() as f64)
    });
}

fn register(
    heap: &Rc<RefCell<Heap>>,
    global_store: &SharedGlobalStore,
    name: &str,
    func: impl Fn(&mut Vm, &[Value]) -> Value + 'static,
) {
    let native: NativeFn = Rc::new(func);
    let value = heap.borrow_mut().alloc_native(name, native);
    global_store.borrow_mut().set(name, value);
}

fn join_args(vm: &Vm, args: &[Value]) -> String {
    let heap = vm.heap().borrow();
    args.iter().map(|arg| stringify(&heap, *arg)).collect::<Vec<_>>().join(" ")
}

fn to_text(vm: &Vm, value: Value) -> String {
    let heap = vm.heap().borrow();
    stringify(&heap, value)
}

fn type_name(vm: &Vm, value: Value) -> String {
    let heap = vm.heap().borrow();
    value.type_name(&heap).to_string()
}

fn string_arg(vm: &Vm, value: Value) -> Option<String> {
    let heap = vm.heap().borrow();
    match value {
        Value::Object(obj) => heap.string_value(obj).map(|s| s.to_string()),
        _ => None,
    }
}

fn arg_count_error(vm: &mut Vm, name: &str, expected: usize, got: usize) -> Value {
    let _ = vm.runtime_error::<()>(format!(
        "invalid number of arguments to \"{}\", expected {}, got {}",
        name, expected, got
    ));
    Value::Null
}
