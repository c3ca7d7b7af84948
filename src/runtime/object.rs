// File: src/runtime/object.rs
//
// Class and instance model for Strand.
// Classes support multiple superclasses and mixins, cache their overriding
// `get`/`set` accessors once the declaration completes, and answer ancestry
// queries over the superclass DAG. Instances carry a one-way mutability lock
// that every mutating operation must honor.

use crate::bytecode::ClassKind;
use crate::fiber::Closure;
use crate::value::Value;
use ahash::AHashSet;
use indexmap::IndexMap;
use once_cell::unsync::OnceCell;
use std::fmt;
use std::rc::Rc;

/// Arity (excluding the receiver) an overriding getter must have
pub const GETTER_ARITY: u8 = 1;
/// Arity (excluding the receiver) an overriding setter must have
pub const SETTER_ARITY: u8 = 2;

/// Backing storage of a class's instances, inherited by subclasses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Plain,
    List,
    Map,
}

pub struct SClass {
    pub name: Rc<str>,
    pub kind: ClassKind,
    /// Declared members: field initial values and methods
    pub fields: IndexMap<Rc<str>, Value>,
    pub superclasses: IndexMap<Rc<str>, Rc<SClass>>,
    pub mixins: IndexMap<Rc<str>, Rc<SClass>>,
    pub storage: StorageKind,
    /// Registered by the runtime rather than declared by a script
    pub builtin: bool,
    cached_get: OnceCell<Option<Rc<Closure>>>,
    cached_set: OnceCell<Option<Rc<Closure>>>,
}

impl SClass {
    pub fn new(
        name: Rc<str>,
        kind: ClassKind,
        fields: IndexMap<Rc<str>, Value>,
        superclasses: Vec<Rc<SClass>>,
        mixins: Vec<Rc<SClass>>,
    ) -> Self {
        let storage = superclasses
            .iter()
            .chain(mixins.iter())
            .map(|class| class.storage)
            .find(|storage| *storage != StorageKind::Plain)
            .unwrap_or(StorageKind::Plain);

        Self {
            name,
            kind,
            fields,
            superclasses: superclasses.into_iter().map(|c| (Rc::clone(&c.name), c)).collect(),
            mixins: mixins.into_iter().map(|c| (Rc::clone(&c.name), c)).collect(),
            storage,
            builtin: false,
            cached_get: OnceCell::new(),
            cached_set: OnceCell::new(),
        }
    }

    /// A runtime-provided class with no members of its own
    pub fn builtin(name: &str, superclass: Option<&Rc<SClass>>, storage: StorageKind) -> Self {
        let mut class = SClass::new(
            Rc::from(name),
            ClassKind::Regular,
            IndexMap::new(),
            superclass.into_iter().cloned().collect(),
            Vec::new(),
        );
        class.storage = storage;
        class.builtin = true;
        class
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(Rc::from(name), value);
        self
    }

    /// Computes the cached accessor overrides. Runs once per class; later
    /// calls (and the lazy accessors below) reuse the cached result.
    pub fn finalize_declr(&self) {
        let getter = self.overridden_get();
        let setter = self.overridden_set();
        tracing::debug!(
            class = %self.name,
            getter = getter.is_some(),
            setter = setter.is_some(),
            "class declaration finalized"
        );
    }

    pub fn overridden_get(&self) -> Option<Rc<Closure>> {
        self.cached_get
            .get_or_init(|| self.find_override("get", GETTER_ARITY, SClass::overridden_get))
            .clone()
    }

    pub fn overridden_set(&self) -> Option<Rc<Closure>> {
        self.cached_set
            .get_or_init(|| self.find_override("set", SETTER_ARITY, SClass::overridden_set))
            .clone()
    }

    fn find_override(
        &self,
        name: &str,
        arity: u8,
        inherited: fn(&SClass) -> Option<Rc<Closure>>,
    ) -> Option<Rc<Closure>> {
        if let Some(Value::Closure(closure)) = self.fields.get(name) {
            if closure.function.is_method && closure.function.arity == arity {
                return Some(Rc::clone(closure));
            }
        }
        self.superclasses
            .values()
            .chain(self.mixins.values())
            .find_map(|parent| inherited(parent))
    }

    /// Reflexive ancestry test over declared superclasses (mixins excluded)
    pub fn check_is(&self, other: &SClass) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let mut visited = AHashSet::new();
        self.search_ancestors(other, &mut visited)
    }

    fn search_ancestors(&self, target: &SClass, visited: &mut AHashSet<*const SClass>) -> bool {
        for parent in self.superclasses.values() {
            let ptr = Rc::as_ptr(parent);
            if !visited.insert(ptr) {
                continue;
            }
            if std::ptr::eq(ptr, target) || parent.search_ancestors(target, visited) {
                return true;
            }
        }
        false
    }

    /// Resolves a member: own fields, then superclasses depth-first, then mixins
    pub fn find_member(&self, name: &str) -> Option<Value> {
        let mut visited = AHashSet::new();
        self.find_member_in(name, &mut visited)
    }

    fn find_member_in(&self, name: &str, visited: &mut AHashSet<*const SClass>) -> Option<Value> {
        if let Some(value) = self.fields.get(name) {
            return Some(value.clone());
        }
        for parent in self.superclasses.values().chain(self.mixins.values()) {
            if visited.insert(Rc::as_ptr(parent)) {
                if let Some(value) = parent.find_member_in(name, visited) {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Visits this class and every ancestor (superclasses before mixins), once each
    pub fn for_each_ancestor<'a>(&'a self, visit: &mut dyn FnMut(&'a SClass) -> bool) -> bool {
        let mut visited: AHashSet<*const SClass> = AHashSet::new();
        let mut pending: Vec<&'a SClass> = vec![self];
        while let Some(class) = pending.pop() {
            if !visited.insert(class as *const SClass) {
                continue;
            }
            if visit(class) {
                return true;
            }
            for parent in class.mixins.values().rev().chain(class.superclasses.values().rev()) {
                pending.push(parent);
            }
        }
        false
    }

    /// Copies non-callable field defaults, mixins and superclasses first, own last
    fn collect_instance_fields(&self, out: &mut IndexMap<Rc<str>, Value>) {
        for parent in self.mixins.values().chain(self.superclasses.values()) {
            parent.collect_instance_fields(out);
        }
        for (name, value) in &self.fields {
            if !value.is_callable() {
                out.insert(Rc::clone(name), value.clone());
            }
        }
    }
}

impl fmt::Debug for SClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SClass")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("superclasses", &self.superclasses.keys().collect::<Vec<_>>())
            .field("mixins", &self.mixins.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Map keys: integers and strings
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Int(i64),
    Str(Rc<str>),
}

impl MapKey {
    pub fn from_value(value: &Value) -> Option<MapKey> {
        match value {
            Value::Int(n) => Some(MapKey::Int(*n)),
            Value::Str(s) => Some(MapKey::Str(Rc::clone(s))),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Int(n) => Value::Int(*n),
            MapKey::Str(s) => Value::Str(Rc::clone(s)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Storage {
    Plain,
    List(Vec<Value>),
    Map(IndexMap<MapKey, Value>),
}

#[derive(Debug)]
pub struct Instance {
    pub class: Rc<SClass>,
    mutable: bool,
    pub fields: IndexMap<Rc<str>, Value>,
    pub storage: Storage,
}

impl Instance {
    pub fn new(class: Rc<SClass>) -> Self {
        let mut fields = IndexMap::new();
        class.collect_instance_fields(&mut fields);
        let storage = match class.storage {
            StorageKind::Plain => Storage::Plain,
            StorageKind::List => Storage::List(Vec::new()),
            StorageKind::Map => Storage::Map(IndexMap::new()),
        };
        Self { class, mutable: true, fields, storage }
    }

    pub fn with_storage(class: Rc<SClass>, storage: Storage) -> Self {
        let mut instance = Instance::new(class);
        instance.storage = storage;
        instance
    }

    /// One-way: there is no unlock
    pub fn lock(&mut self) {
        self.mutable = false;
    }

    pub fn is_locked(&self) -> bool {
        !self.mutable
    }

    /// Whether this instance derives from the runtime's Exception class
    pub fn is_error(&self) -> bool {
        self.class.for_each_ancestor(&mut |class| class.builtin && &*class.name == "Exception")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{DebugInfo, Function};

    fn method(name: &str, arity: u8) -> Value {
        let function = Function {
            name: name.into(),
            arity,
            optional_params_start: arity,
            default_values: vec![],
            is_method: true,
            upvalues: vec![],
            code: vec![],
            constants: vec![],
            debug: DebugInfo::default(),
        };
        Value::Closure(Rc::new(Closure::new(Rc::new(function), vec![])))
    }

    fn class(name: &str, fields: Vec<(&str, Value)>, supers: Vec<Rc<SClass>>) -> Rc<SClass> {
        let fields = fields.into_iter().map(|(k, v)| (Rc::from(k), v)).collect();
        Rc::new(SClass::new(Rc::from(name), ClassKind::Regular, fields, supers, vec![]))
    }

    #[test]
    fn test_getter_inherited_from_first_overriding_superclass() {
        let a = class("A", vec![("x", Value::Int(1))], vec![]);
        let b = class("B", vec![("get", method("get", 1))], vec![]);
        let c = class("C", vec![], vec![Rc::clone(&a), Rc::clone(&b)]);
        c.finalize_declr();

        let getter = c.overridden_get().expect("C should inherit B's getter");
        let Some(Value::Closure(expected)) = b.fields.get("get") else { panic!("B.get missing") };
        assert!(Rc::ptr_eq(&getter, expected));
        assert!(c.overridden_set().is_none());
    }

    #[test]
    fn test_wrong_arity_accessor_is_ignored() {
        let a = class("A", vec![("get", method("get", 2)), ("set", method("set", 1))], vec![]);
        a.finalize_declr();
        assert!(a.overridden_get().is_none());
        assert!(a.overridden_set().is_none());
    }

    #[test]
    fn test_check_is_handles_diamonds() {
        let root = class("Root", vec![], vec![]);
        let left = class("Left", vec![], vec![Rc::clone(&root)]);
        let right = class("Right", vec![], vec![Rc::clone(&root)]);
        let bottom = class("Bottom", vec![], vec![Rc::clone(&left), Rc::clone(&right)]);
        let unrelated = class("D", vec![], vec![]);

        assert!(bottom.check_is(&bottom));
        assert!(bottom.check_is(&root));
        assert!(bottom.check_is(&right));
        assert!(!bottom.check_is(&unrelated));
        assert!(!root.check_is(&bottom));
    }

    #[test]
    fn test_find_member_through_diamond() {
        let root = class("Root", vec![("shared", Value::Int(7))], vec![]);
        let left = class("Left", vec![], vec![Rc::clone(&root)]);
        let right = class("Right", vec![("side", Value::Int(3))], vec![Rc::clone(&root)]);
        let bottom = class("Bottom", vec![], vec![left, right]);

        assert!(matches!(bottom.find_member("shared"), Some(Value::Int(7))));
        assert!(matches!(bottom.find_member("side"), Some(Value::Int(3))));
        assert!(bottom.find_member("missing").is_none());
    }

    #[test]
    fn test_instance_fields_follow_hierarchy() {
        let base = class("Base", vec![("x", Value::Int(1)), ("y", Value::Int(2))], vec![]);
        let derived = class("Derived", vec![("y", Value::Int(20)), ("m", method("m", 0))], vec![base]);
        let instance = Instance::new(derived);
        let names: Vec<&str> = instance.fields.keys().map(|k| &**k).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert!(matches!(instance.fields.get("y"), Some(Value::Int(20))));
    }

    #[test]
    fn test_lock_is_one_way() {
        let mut instance = Instance::new(class("A", vec![], vec![]));
        assert!(!instance.is_locked());
        instance.lock();
        assert!(instance.is_locked());
    }
}
