// File: src/runtime/natives.rs
//
// Native function registry and the built-in natives for Strand.
// Natives are registered under `(class name, function name)`; module-level
// functions live under `Global`. A native is synchronous, asynchronous
// (completes a `Completion` possibly from another thread), or one of the
// fiber intrinsics the VM implements itself.

use crate::runtime::async_bridge::{spawn_task, Completion, HostValue};
use crate::runtime::context::{ErrorKind, RuntimeContext};
use crate::runtime::object::{Instance, MapKey, Storage};
use crate::value::Value;
use ahash::AHashMap;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const GLOBAL_MODULE: &str = "Global";

/// What a native sees of the VM
pub struct NativeCtx<'a> {
    pub ctx: &'a RuntimeContext,
    pub out: &'a mut dyn Write,
}

pub type SyncNative = fn(&mut NativeCtx, &Value, &[Value]) -> Value;
pub type AsyncNative = fn(&mut NativeCtx, &Value, &[Value], Completion);

/// Natives that need to switch fibers, implemented inside the VM loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    FiberNew,
    FiberCall,
    FiberIsDone,
}

#[derive(Clone, Copy)]
pub enum NativeKind {
    Sync(SyncNative),
    Async(AsyncNative),
    Intrinsic(Intrinsic),
}

pub struct NativeFunction {
    pub class_name: String,
    pub name: String,
    /// Maximum argument count, receiver excluded
    pub arity: u8,
    /// Arguments from this index on may be omitted
    pub optional_start: u8,
    /// Defaults for parameters `optional_start..arity`
    pub defaults: Vec<Value>,
    pub kind: NativeKind,
}

impl NativeFunction {
    pub fn new(class_name: &str, name: &str, arity: u8, kind: NativeKind) -> Self {
        Self {
            class_name: class_name.to_string(),
            name: name.to_string(),
            arity,
            optional_start: arity,
            defaults: Vec::new(),
            kind,
        }
    }

    pub fn sync(class_name: &str, name: &str, arity: u8, f: SyncNative) -> Self {
        Self::new(class_name, name, arity, NativeKind::Sync(f))
    }

    pub fn asynchronous(class_name: &str, name: &str, arity: u8, f: AsyncNative) -> Self {
        Self::new(class_name, name, arity, NativeKind::Async(f))
    }

    /// Trailing parameters take these defaults when omitted
    pub fn with_defaults(mut self, defaults: Vec<Value>) -> Self {
        self.optional_start = self.arity.saturating_sub(defaults.len() as u8);
        self.defaults = defaults;
        self
    }

    pub fn accepts(&self, argc: usize) -> bool {
        argc >= self.optional_start as usize && argc <= self.arity as usize
    }

    /// Pads `args` with defaults up to the full arity
    pub fn fill_defaults(&self, args: &mut Vec<Value>) {
        let start = args.len();
        for i in start..self.arity as usize {
            let default = i
                .checked_sub(self.optional_start as usize)
                .and_then(|d| self.defaults.get(d))
                .cloned()
                .unwrap_or_default();
            args.push(default);
        }
    }
}

/// `(class name, function name) -> native`
#[derive(Default)]
pub struct NativeRegistry {
    modules: AHashMap<String, AHashMap<String, Rc<NativeFunction>>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, native: NativeFunction) {
        self.modules
            .entry(native.class_name.clone())
            .or_default()
            .insert(native.name.clone(), Rc::new(native));
    }

    pub fn lookup(&self, class_name: &str, name: &str) -> Option<Rc<NativeFunction>> {
        self.modules.get(class_name)?.get(name).cloned()
    }

    /// All natives of one class, sorted by name
    pub fn functions(&self, class_name: &str) -> Vec<Rc<NativeFunction>> {
        let mut natives: Vec<_> = self
            .modules
            .get(class_name)
            .map(|module| module.values().cloned().collect())
            .unwrap_or_default();
        natives.sort_by(|a, b| a.name.cmp(&b.name));
        natives
    }
}

/// The crate's fixed registration table
pub fn register_builtins(registry: &mut NativeRegistry) {
    registry.register(NativeFunction::sync(GLOBAL_MODULE, "print", 1, global_print).with_defaults(vec![Value::str("")]));
    registry.register(NativeFunction::sync(GLOBAL_MODULE, "str", 1, global_str));
    registry.register(NativeFunction::sync(GLOBAL_MODULE, "len", 1, global_len));
    registry.register(NativeFunction::sync(GLOBAL_MODULE, "typeOf", 1, global_type_of));
    registry.register(NativeFunction::new(GLOBAL_MODULE, "Fiber", 1, NativeKind::Intrinsic(Intrinsic::FiberNew)));

    registry.register(NativeFunction::sync("Object", "lock", 0, object_lock));
    registry.register(NativeFunction::sync("Object", "isLocked", 0, object_is_locked));

    registry.register(NativeFunction::sync("List", "add", 1, list_add));
    registry.register(NativeFunction::sync("List", "get", 1, list_get));
    registry.register(NativeFunction::sync("List", "set", 2, list_set));
    registry.register(NativeFunction::sync("List", "size", 0, collection_size));
    registry.register(NativeFunction::sync("List", "clear", 0, collection_clear));
    registry.register(NativeFunction::sync("List", "merge", 1, collection_merge));

    registry.register(NativeFunction::sync("Map", "put", 2, map_put));
    registry.register(NativeFunction::sync("Map", "get", 1, map_get));
    registry.register(NativeFunction::sync("Map", "keys", 0, map_keys));
    registry.register(NativeFunction::sync("Map", "containsKey", 1, map_contains_key));
    registry.register(NativeFunction::sync("Map", "size", 0, collection_size));
    registry.register(NativeFunction::sync("Map", "clear", 0, collection_clear));
    registry.register(NativeFunction::sync("Map", "merge", 1, collection_merge));

    registry.register(NativeFunction::sync("String", "size", 0, string_size));
    registry.register(NativeFunction::sync("String", "upper", 0, string_upper));
    registry.register(NativeFunction::sync("String", "lower", 0, string_lower));

    registry.register(NativeFunction::sync("Exception", "init", 1, exception_init).with_defaults(vec![Value::Nil]));

    registry.register(
        NativeFunction::new("Fiber", "call", 1, NativeKind::Intrinsic(Intrinsic::FiberCall)).with_defaults(vec![Value::Nil]),
    );
    registry.register(NativeFunction::new("Fiber", "isDone", 0, NativeKind::Intrinsic(Intrinsic::FiberIsDone)));

    registry.register(NativeFunction::sync("File", "read", 1, file_read));
    registry.register(NativeFunction::sync("File", "write", 2, file_write));
    registry.register(NativeFunction::asynchronous("File", "readAsync", 1, file_read_async));

    registry.register(NativeFunction::asynchronous("Sys", "sleep", 1, sys_sleep));
    registry.register(NativeFunction::sync("Sys", "clock", 0, sys_clock));
}

fn illegal(cx: &NativeCtx, message: impl Into<String>) -> Value {
    cx.ctx.error(ErrorKind::IllegalArgument, message)
}

fn global_print(cx: &mut NativeCtx, _receiver: &Value, args: &[Value]) -> Value {
    match writeln!(cx.out, "{}", args[0]) {
        Ok(()) => Value::Nil,
        Err(err) => cx.ctx.error(ErrorKind::Io, err.to_string()),
    }
}

fn global_str(_cx: &mut NativeCtx, _receiver: &Value, args: &[Value]) -> Value {
    Value::Str(Rc::from(args[0].to_string()))
}

fn global_len(cx: &mut NativeCtx, _receiver: &Value, args: &[Value]) -> Value {
    match &args[0] {
        Value::Str(s) => Value::Int(s.chars().count() as i64),
        Value::Range(a, b) => Value::Int((b - a).max(0)),
        Value::Instance(inst) => match &inst.borrow().storage {
            Storage::List(items) => Value::Int(items.len() as i64),
            Storage::Map(entries) => Value::Int(entries.len() as i64),
            Storage::Plain => illegal(cx, "len() expects a string, list, map or range"),
        },
        other => illegal(cx, format!("len() does not apply to {}", other.type_name())),
    }
}

fn global_type_of(cx: &mut NativeCtx, _receiver: &Value, args: &[Value]) -> Value {
    Value::Str(Rc::clone(&cx.ctx.class_of(&args[0]).name))
}

fn object_lock(_cx: &mut NativeCtx, receiver: &Value, _args: &[Value]) -> Value {
    if let Value::Instance(inst) = receiver {
        inst.borrow_mut().lock();
    }
    receiver.clone()
}

fn object_is_locked(_cx: &mut NativeCtx, receiver: &Value, _args: &[Value]) -> Value {
    match receiver {
        Value::Instance(inst) => Value::bool(inst.borrow().is_locked()),
        // Every other value is immutable
        _ => Value::Int(1),
    }
}

/// Runs `f` over the receiver's storage, enforcing the lock for mutations
fn with_storage<F>(cx: &NativeCtx, receiver: &Value, mutates: bool, f: F) -> Value
where
    F: FnOnce(&mut Instance) -> Result<Value, String>,
{
    let Value::Instance(inst) = receiver else {
        return illegal(cx, format!("expected a collection receiver, got {}", receiver.type_name()));
    };
    let mut instance = inst.borrow_mut();
    if mutates && instance.is_locked() {
        return cx.ctx.locked_error(&instance.class.name);
    }
    match f(&mut instance) {
        Ok(value) => value,
        Err(message) => illegal(cx, message),
    }
}

fn list_index(index: &Value, len: usize) -> Result<usize, String> {
    match index.as_int() {
        Some(i) if i >= 0 && (i as usize) < len => Ok(i as usize),
        Some(i) => Err(format!("index {} out of bounds for length {}", i, len)),
        None => Err(format!("list index must be an Int, got {}", index.type_name())),
    }
}

fn list_add(cx: &mut NativeCtx, receiver: &Value, args: &[Value]) -> Value {
    with_storage(cx, receiver, true, |inst| match &mut inst.storage {
        Storage::List(items) => {
            items.push(args[0].clone());
            Ok(Value::Nil)
        }
        _ => Err("add() requires a list".to_string()),
    })
}

fn list_get(cx: &mut NativeCtx, receiver: &Value, args: &[Value]) -> Value {
    with_storage(cx, receiver, false, |inst| match &inst.storage {
        Storage::List(items) => Ok(items[list_index(&args[0], items.len())?].clone()),
        _ => Err("get() requires a list".to_string()),
    })
}

fn list_set(cx: &mut NativeCtx, receiver: &Value, args: &[Value]) -> Value {
    with_storage(cx, receiver, true, |inst| match &mut inst.storage {
        Storage::List(items) => {
            let index = list_index(&args[0], items.len())?;
            items[index] = args[1].clone();
            Ok(args[1].clone())
        }
        _ => Err("set() requires a list".to_string()),
    })
}

fn collection_size(cx: &mut NativeCtx, receiver: &Value, _args: &[Value]) -> Value {
    with_storage(cx, receiver, false, |inst| match &inst.storage {
        Storage::List(items) => Ok(Value::Int(items.len() as i64)),
        Storage::Map(entries) => Ok(Value::Int(entries.len() as i64)),
        Storage::Plain => Err("size() requires a list or map".to_string()),
    })
}

fn collection_clear(cx: &mut NativeCtx, receiver: &Value, _args: &[Value]) -> Value {
    with_storage(cx, receiver, true, |inst| {
        match &mut inst.storage {
            Storage::List(items) => items.clear(),
            Storage::Map(entries) => entries.clear(),
            Storage::Plain => return Err("clear() requires a list or map".to_string()),
        }
        Ok(Value::Nil)
    })
}

fn collection_merge(cx: &mut NativeCtx, receiver: &Value, args: &[Value]) -> Value {
    let Value::Instance(other) = &args[0] else {
        return illegal(cx, format!("merge() expects a collection, got {}", args[0].type_name()));
    };
    // Snapshot first so a collection can be merged into itself
    let snapshot = other.borrow().storage.clone();
    merge_storage(cx, receiver, snapshot)
}

fn merge_storage(cx: &NativeCtx, receiver: &Value, source: Storage) -> Value {
    with_storage(cx, receiver, true, |inst| {
        match (&mut inst.storage, source) {
            (Storage::List(items), Storage::List(extra)) => items.extend(extra),
            (Storage::Map(entries), Storage::Map(extra)) => entries.extend(extra),
            _ => return Err("merge() requires two collections of the same kind".to_string()),
        }
        Ok(Value::Nil)
    })
}

fn map_key(value: &Value) -> Result<MapKey, String> {
    MapKey::from_value(value).ok_or_else(|| format!("map keys must be Int or String, got {}", value.type_name()))
}

fn map_put(cx: &mut NativeCtx, receiver: &Value, args: &[Value]) -> Value {
    with_storage(cx, receiver, true, |inst| match &mut inst.storage {
        Storage::Map(entries) => {
            entries.insert(map_key(&args[0])?, args[1].clone());
            Ok(args[1].clone())
        }
        _ => Err("put() requires a map".to_string()),
    })
}

fn map_get(cx: &mut NativeCtx, receiver: &Value, args: &[Value]) -> Value {
    with_storage(cx, receiver, false, |inst| match &inst.storage {
        Storage::Map(entries) => Ok(entries.get(&map_key(&args[0])?).cloned().unwrap_or_default()),
        _ => Err("get() requires a map".to_string()),
    })
}

fn map_contains_key(cx: &mut NativeCtx, receiver: &Value, args: &[Value]) -> Value {
    with_storage(cx, receiver, false, |inst| match &inst.storage {
        Storage::Map(entries) => Ok(Value::bool(entries.contains_key(&map_key(&args[0])?))),
        _ => Err("containsKey() requires a map".to_string()),
    })
}

fn map_keys(cx: &mut NativeCtx, receiver: &Value, _args: &[Value]) -> Value {
    with_storage(cx, receiver, false, |inst| match &inst.storage {
        Storage::Map(entries) => Ok(cx.ctx.new_list(entries.keys().map(MapKey::to_value).collect())),
        _ => Err("keys() requires a map".to_string()),
    })
}

fn string_receiver<'v>(cx: &NativeCtx, receiver: &'v Value) -> Result<&'v str, Value> {
    match receiver {
        Value::Str(s) => Ok(s),
        other => Err(illegal(cx, format!("expected a String receiver, got {}", other.type_name()))),
    }
}

fn string_size(cx: &mut NativeCtx, receiver: &Value, _args: &[Value]) -> Value {
    match string_receiver(cx, receiver) {
        Ok(s) => Value::Int(s.chars().count() as i64),
        Err(err) => err,
    }
}

fn string_upper(cx: &mut NativeCtx, receiver: &Value, _args: &[Value]) -> Value {
    match string_receiver(cx, receiver) {
        Ok(s) => Value::Str(Rc::from(s.to_uppercase())),
        Err(err) => err,
    }
}

fn string_lower(cx: &mut NativeCtx, receiver: &Value, _args: &[Value]) -> Value {
    match string_receiver(cx, receiver) {
        Ok(s) => Value::Str(Rc::from(s.to_lowercase())),
        Err(err) => err,
    }
}

fn exception_init(cx: &mut NativeCtx, receiver: &Value, args: &[Value]) -> Value {
    with_storage(cx, receiver, true, |inst| {
        inst.fields.insert(Rc::from("message"), args[0].clone());
        Ok(Value::Nil)
    })
}

fn path_arg(cx: &NativeCtx, value: &Value) -> Result<String, Value> {
    match value {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(illegal(cx, format!("expected a path string, got {}", other.type_name()))),
    }
}

fn file_read(cx: &mut NativeCtx, _receiver: &Value, args: &[Value]) -> Value {
    let path = match path_arg(cx, &args[0]) {
        Ok(path) => path,
        Err(err) => return err,
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => Value::Str(Rc::from(text)),
        Err(err) => cx.ctx.error(ErrorKind::Io, format!("{}: {}", path, err)),
    }
}

fn file_write(cx: &mut NativeCtx, _receiver: &Value, args: &[Value]) -> Value {
    let path = match path_arg(cx, &args[0]) {
        Ok(path) => path,
        Err(err) => return err,
    };
    let text = args[1].to_string();
    match std::fs::write(&path, text.as_bytes()) {
        Ok(()) => Value::Int(text.len() as i64),
        Err(err) => cx.ctx.error(ErrorKind::Io, format!("{}: {}", path, err)),
    }
}

fn file_read_async(cx: &mut NativeCtx, _receiver: &Value, args: &[Value], completion: Completion) {
    let path = match path_arg(cx, &args[0]) {
        Ok(path) => path,
        Err(_) => {
            completion.complete(HostValue::Error {
                kind: ErrorKind::IllegalArgument,
                message: format!("expected a path string, got {}", args[0].type_name()),
            });
            return;
        }
    };
    spawn_task(completion, async move {
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => HostValue::Str(text),
            Err(err) => HostValue::Error { kind: ErrorKind::Io, message: format!("{}: {}", path, err) },
        }
    });
}

fn sys_sleep(_cx: &mut NativeCtx, _receiver: &Value, args: &[Value], completion: Completion) {
    let millis = match &args[0] {
        Value::Int(ms) => (*ms).max(0) as u64,
        Value::Double(ms) if *ms > 0.0 => *ms as u64,
        _ => 0,
    };
    spawn_task(completion, async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        HostValue::Nil
    });
}

static CLOCK_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds since the first clock reading in this process
fn sys_clock(_cx: &mut NativeCtx, _receiver: &Value, _args: &[Value]) -> Value {
    Value::Double(CLOCK_START.elapsed().as_secs_f64())
}

/// Builds a map instance from ordered entries
pub fn new_map(ctx: &RuntimeContext, entries: IndexMap<MapKey, Value>) -> Value {
    let instance = Instance::with_storage(Rc::clone(&ctx.classes.map), Storage::Map(entries));
    Value::Instance(Rc::new(RefCell::new(instance)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(ctx: &RuntimeContext, class: &str, name: &str, receiver: &Value, args: Vec<Value>) -> (Value, String) {
        let native = ctx.natives.lookup(class, name).expect("native registered");
        let NativeKind::Sync(f) = native.kind else { panic!("expected a sync native") };
        let mut args = args;
        native.fill_defaults(&mut args);
        let mut out = Vec::new();
        let result = f(&mut NativeCtx { ctx, out: &mut out }, receiver, &args);
        (result, String::from_utf8(out).unwrap())
    }

    fn is_error(value: &Value, class: &str) -> bool {
        matches!(value, Value::Instance(inst) if &*inst.borrow().class.name == class)
    }

    #[test]
    fn test_print_uses_default_argument() {
        let ctx = RuntimeContext::new();
        let (_, out) = call(&ctx, GLOBAL_MODULE, "print", &Value::Nil, vec![]);
        assert_eq!(out, "\n");
        let (_, out) = call(&ctx, GLOBAL_MODULE, "print", &Value::Nil, vec![Value::Double(2.0)]);
        assert_eq!(out, "2.0\n");
    }

    #[test]
    fn test_locked_list_rejects_every_mutation() {
        let ctx = RuntimeContext::new();
        let list = ctx.new_list(vec![Value::Int(1)]);
        call(&ctx, "Object", "lock", &list, vec![]);

        for (name, args) in [
            ("add", vec![Value::Int(2)]),
            ("set", vec![Value::Int(0), Value::Int(9)]),
            ("clear", vec![]),
            ("merge", vec![ctx.new_list(vec![Value::Int(3)])]),
        ] {
            let (result, _) = call(&ctx, "List", name, &list, args);
            assert!(is_error(&result, "MutabilityLockException"), "{} should be rejected", name);
        }
        assert_eq!(list.to_string(), "[1]");
    }

    #[test]
    fn test_list_bounds_error_is_a_value() {
        let ctx = RuntimeContext::new();
        let list = ctx.new_list(vec![]);
        let (result, _) = call(&ctx, "List", "get", &list, vec![Value::Int(3)]);
        assert!(is_error(&result, "IllegalArgumentException"));
    }

    #[test]
    fn test_map_natives() {
        let ctx = RuntimeContext::new();
        let map = new_map(&ctx, IndexMap::new());
        call(&ctx, "Map", "put", &map, vec![Value::str("a"), Value::Int(1)]);
        let (has, _) = call(&ctx, "Map", "containsKey", &map, vec![Value::str("a")]);
        assert!(matches!(has, Value::Int(1)));
        let (keys, _) = call(&ctx, "Map", "keys", &map, vec![]);
        assert_eq!(keys.to_string(), "[\"a\"]");
        let (bad, _) = call(&ctx, "Map", "put", &map, vec![Value::Nil, Value::Int(1)]);
        assert!(is_error(&bad, "IllegalArgumentException"));
    }

    #[test]
    fn test_file_read_missing_is_io_exception() {
        let ctx = RuntimeContext::new();
        let (result, _) = call(&ctx, "File", "read", &Value::Nil, vec![Value::str("/definitely/not/here.sd")]);
        assert!(is_error(&result, "IOException"));
    }

    #[test]
    fn test_optional_start_from_defaults() {
        let native = NativeFunction::sync("T", "f", 3, global_str).with_defaults(vec![Value::Int(7)]);
        assert_eq!(native.optional_start, 2);
        assert!(native.accepts(2) && native.accepts(3));
        assert!(!native.accepts(1) && !native.accepts(4));
    }
}
