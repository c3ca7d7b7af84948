// File: src/runtime/context.rs
//
// Per-VM runtime context: the well-known classes (Object, the error classes,
// the classes describing built-in value kinds) and the native registry.
// Owned by one VM instance and passed to every component that needs it,
// so separate VMs never share class tables.

use crate::compiler::GlobalScope;
use crate::runtime::natives::{register_builtins, NativeFunction, NativeRegistry, GLOBAL_MODULE};
use crate::runtime::object::{Instance, SClass, Storage, StorageKind};
use crate::value::{BoundNative, Value};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Language-level error categories, each backed by a well-known class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Exception,
    Io,
    MutabilityLock,
    IllegalArgument,
}

/// Classes the runtime itself relies on
pub struct WellKnownClasses {
    pub object: Rc<SClass>,
    pub exception: Rc<SClass>,
    pub io_exception: Rc<SClass>,
    pub mutability_lock_exception: Rc<SClass>,
    pub illegal_argument_exception: Rc<SClass>,
    pub list: Rc<SClass>,
    pub map: Rc<SClass>,
    pub int: Rc<SClass>,
    pub double: Rc<SClass>,
    pub string: Rc<SClass>,
    pub nil: Rc<SClass>,
    pub function: Rc<SClass>,
    pub fiber: Rc<SClass>,
    pub range: Rc<SClass>,
    pub class: Rc<SClass>,
    pub file: Rc<SClass>,
    pub sys: Rc<SClass>,
}

impl WellKnownClasses {
    fn new() -> Self {
        let object = Rc::new(SClass::builtin("Object", None, StorageKind::Plain));
        let plain = |name: &str| Rc::new(SClass::builtin(name, Some(&object), StorageKind::Plain));

        let exception = Rc::new(
            SClass::builtin("Exception", Some(&object), StorageKind::Plain).with_field("message", Value::Nil),
        );
        let error = |name: &str| Rc::new(SClass::builtin(name, Some(&exception), StorageKind::Plain));

        Self {
            io_exception: error("IOException"),
            mutability_lock_exception: error("MutabilityLockException"),
            illegal_argument_exception: error("IllegalArgumentException"),
            list: Rc::new(SClass::builtin("List", Some(&object), StorageKind::List)),
            map: Rc::new(SClass::builtin("Map", Some(&object), StorageKind::Map)),
            int: plain("Int"),
            double: plain("Double"),
            string: plain("String"),
            nil: plain("Nil"),
            function: plain("Function"),
            fiber: plain("Fiber"),
            range: plain("Range"),
            class: plain("Class"),
            file: plain("File"),
            sys: plain("Sys"),
            exception,
            object,
        }
    }

    fn all(&self) -> Vec<&Rc<SClass>> {
        vec![
            &self.object,
            &self.exception,
            &self.io_exception,
            &self.mutability_lock_exception,
            &self.illegal_argument_exception,
            &self.list,
            &self.map,
            &self.int,
            &self.double,
            &self.string,
            &self.nil,
            &self.function,
            &self.fiber,
            &self.range,
            &self.class,
            &self.file,
            &self.sys,
        ]
    }
}

pub struct RuntimeContext {
    pub classes: WellKnownClasses,
    pub natives: NativeRegistry,
    globals: IndexMap<String, Value>,
}

impl RuntimeContext {
    /// Context with the built-in classes and natives registered
    pub fn new() -> Self {
        let mut natives = NativeRegistry::new();
        register_builtins(&mut natives);
        let mut ctx = Self { classes: WellKnownClasses::new(), natives, globals: IndexMap::new() };
        ctx.rebuild_globals();
        ctx
    }

    /// Registers a host native and refreshes the global table
    pub fn register_native(&mut self, native: NativeFunction) {
        self.natives.register(native);
        self.rebuild_globals();
    }

    /// Binds an extra global name visible to compiled code
    pub fn define_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    /// Classes are bound last: `Fiber` names the class, whose construction
    /// the VM routes to the `Global.Fiber` native.
    fn rebuild_globals(&mut self) {
        for native in self.natives.functions(GLOBAL_MODULE) {
            self.globals.insert(
                native.name.clone(),
                Value::Native(Rc::new(BoundNative { receiver: Value::Nil, native })),
            );
        }
        for class in self.classes.all() {
            self.globals.insert(class.name.to_string(), Value::Class(Rc::clone(class)));
        }
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// The class describing a value (`x is C` and native dispatch use it)
    pub fn class_of(&self, value: &Value) -> Rc<SClass> {
        let class = match value {
            Value::Nil => &self.classes.nil,
            Value::Int(_) => &self.classes.int,
            Value::Double(_) => &self.classes.double,
            Value::Str(_) => &self.classes.string,
            Value::Closure(_) | Value::Method(_) | Value::Native(_) => &self.classes.function,
            Value::Class(_) => &self.classes.class,
            Value::Instance(inst) => return Rc::clone(&inst.borrow().class),
            Value::Fiber(_) => &self.classes.fiber,
            Value::Range(..) => &self.classes.range,
        };
        Rc::clone(class)
    }

    pub fn error_class(&self, kind: ErrorKind) -> &Rc<SClass> {
        match kind {
            ErrorKind::Exception => &self.classes.exception,
            ErrorKind::Io => &self.classes.io_exception,
            ErrorKind::MutabilityLock => &self.classes.mutability_lock_exception,
            ErrorKind::IllegalArgument => &self.classes.illegal_argument_exception,
        }
    }

    /// Builds a locked error instance carrying `message`
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) -> Value {
        let message: String = message.into();
        tracing::debug!(?kind, %message, "language error value");
        let mut instance = Instance::new(Rc::clone(self.error_class(kind)));
        instance.fields.insert(Rc::from("message"), Value::Str(Rc::from(message)));
        instance.lock();
        Value::Instance(Rc::new(RefCell::new(instance)))
    }

    pub fn locked_error(&self, class_name: &str) -> Value {
        self.error(ErrorKind::MutabilityLock, format!("{} is locked and cannot be modified", class_name))
    }

    /// Finds a registered native on the class or its ancestors, then on Object
    pub fn find_native(&self, class: &SClass, name: &str) -> Option<Rc<NativeFunction>> {
        let mut found = None;
        class.for_each_ancestor(&mut |ancestor| {
            if ancestor.builtin {
                found = self.natives.lookup(&ancestor.name, name);
            }
            found.is_some()
        });
        found.or_else(|| self.natives.lookup(&self.classes.object.name, name))
    }

    /// Builds a list instance
    pub fn new_list(&self, items: Vec<Value>) -> Value {
        let instance = Instance::with_storage(Rc::clone(&self.classes.list), Storage::List(items));
        Value::Instance(Rc::new(RefCell::new(instance)))
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalScope for RuntimeContext {
    fn is_global(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    fn global_names(&self) -> Vec<String> {
        self.globals.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_are_locked_instances() {
        let ctx = RuntimeContext::new();
        let err = ctx.error(ErrorKind::MutabilityLock, "nope");
        let Value::Instance(inst) = &err else { panic!("expected an instance") };
        let inst = inst.borrow();
        assert!(inst.is_locked());
        assert!(inst.is_error());
        assert!(inst.class.check_is(&ctx.classes.exception));
        assert_eq!(err.to_string(), "MutabilityLockException: nope");
    }

    #[test]
    fn test_class_of_builtin_values() {
        let ctx = RuntimeContext::new();
        assert!(Rc::ptr_eq(&ctx.class_of(&Value::Int(1)), &ctx.classes.int));
        assert!(Rc::ptr_eq(&ctx.class_of(&Value::str("s")), &ctx.classes.string));
        assert!(ctx.class_of(&Value::Nil).check_is(&ctx.classes.object));
    }

    #[test]
    fn test_globals_include_classes_and_natives() {
        let ctx = RuntimeContext::new();
        assert!(ctx.is_global("print"));
        assert!(ctx.is_global("Exception"));
        assert!(ctx.is_global("Fiber"));
        assert!(!ctx.is_global("undefined_thing"));
    }

    #[test]
    fn test_find_native_walks_ancestors() {
        let ctx = RuntimeContext::new();
        assert!(ctx.find_native(&ctx.classes.list, "add").is_some());
        assert!(ctx.find_native(&ctx.classes.list, "lock").is_some());
        assert!(ctx.find_native(&ctx.classes.int, "add").is_none());
    }
}
