//! Type Tag Registry (spec §4.2): the mapping between built-in classes and
//! their small dense integer ids, plus the table of user-defined classes
//! reachable by internal name, with drift detection against a checkpoint
//! taken from a different build of the runtime.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::descriptor::ClassDescriptor;
use crate::error::CheckpointFormatError;
use crate::value::{InstanceValue, RuntimeValue};

/// Registry of built-in classes (densely allocated small ids, assigned at
/// registration time in the order the host registers them) and
/// script-defined classes (keyed by internal name, as produced by the
/// compiler's name-mangling).
pub struct TypeRegistry {
    builtin_id_by_name: RefCell<IndexMap<String, u32>>,
    builtin_name_by_id: RefCell<IndexMap<u32, String>>,
    next_builtin_id: Cell<u32>,
    user_classes: RefCell<IndexMap<String, Rc<ClassDescriptor>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            builtin_id_by_name: RefCell::new(IndexMap::new()),
            builtin_name_by_id: RefCell::new(IndexMap::new()),
            next_builtin_id: Cell::new(0),
            user_classes: RefCell::new(IndexMap::new()),
        }
    }

    /// Registers a built-in class, returning its assigned id. Idempotent:
    /// re-registering the same name returns the previously assigned id
    /// rather than allocating a new one.
    pub fn register_builtin(&self, name: impl Into<String>) -> u32 {
        let name = name.into();
        if let Some(&id) = self.builtin_id_by_name.borrow().get(&name) {
            return id;
        }
        let id = self.next_builtin_id.get();
        self.next_builtin_id.set(id + 1);
        self.builtin_id_by_name
            .borrow_mut()
            .insert(name.clone(), id);
        self.builtin_name_by_id.borrow_mut().insert(id, name);
        id
    }

    pub fn builtin_id(&self, name: &str) -> Option<u32> {
        self.builtin_id_by_name.borrow().get(name).copied()
    }

    pub fn builtin_name(&self, id: u32) -> Option<String> {
        self.builtin_name_by_id.borrow().get(&id).cloned()
    }

    /// Registers (or replaces) a user-defined class descriptor under its
    /// internal (mangled) name.
    pub fn register_user_class(&self, descriptor: Rc<ClassDescriptor>) {
        self.user_classes
            .borrow_mut()
            .insert(descriptor.internal_name.clone(), descriptor);
    }

    /// Removes a user class registration — used by tests exercising
    /// checkpoint restore against a registry that no longer knows about a
    /// class it once did.
    pub fn deregister_user_class(&self, internal_name: &str) -> Option<Rc<ClassDescriptor>> {
        self.user_classes.borrow_mut().shift_remove(internal_name)
    }

    pub fn lookup_user_class(&self, internal_name: &str) -> Option<Rc<ClassDescriptor>> {
        self.user_classes.borrow().get(internal_name).cloned()
    }

    /// Acts as the user-class factory: builds a fresh, field-defaulted
    /// instance of the named class, for the codec's two-phase restore to
    /// populate.
    pub fn instantiate_shell(&self, internal_name: &str) -> Option<RuntimeValue> {
        let class = self.lookup_user_class(internal_name)?;
        let mut fields = IndexMap::new();
        for name in class.fields.keys() {
            fields.insert(name.clone(), RuntimeValue::Null);
        }
        Some(RuntimeValue::Instance(Rc::new(InstanceValue {
            class,
            fields: RefCell::new(fields),
        })))
    }

    /// A stable hash of the built-in class-id table, written into every
    /// checkpoint so restore can detect the host rebuilt with a different
    /// set of built-ins registered in a different order (spec §9 "registry
    /// drift" open question — this crate's default policy is to reject
    /// rather than attempt remapping).
    pub fn drift_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for (name, id) in self.builtin_id_by_name.borrow().iter() {
            hasher.update(name.as_bytes());
            hasher.update(0u8.to_ne_bytes());
            hasher.update(id.to_le_bytes());
        }
        hasher.finalize().into()
    }

    /// Verifies a checkpoint's recorded drift hash against this registry's
    /// current state, raising a terminal `CheckpointFormatError` on
    /// mismatch rather than attempting any kind of best-effort remap.
    pub fn verify_drift_hash(&self, expected: &[u8; 32], offset: usize) -> Result<(), CheckpointFormatError> {
        let actual = self.drift_hash();
        if &actual != expected {
            return Err(CheckpointFormatError::new(
                offset,
                "built-in class registry does not match the one recorded in this checkpoint",
            ));
        }
        Ok(())
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[test]
    fn builtin_ids_are_dense_and_idempotent() {
        let registry = TypeRegistry::new();
        let a = registry.register_builtin("List");
        let b = registry.register_builtin("Map");
        let a_again = registry.register_builtin("List");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(a, a_again);
    }

    #[test]
    fn drift_hash_changes_when_builtin_set_changes() {
        let registry = TypeRegistry::new();
        registry.register_builtin("List");
        let before = registry.drift_hash();
        registry.register_builtin("Map");
        let after = registry.drift_hash();
        assert_ne!(before, after);
    }

    #[test]
    fn verify_drift_hash_rejects_mismatch() {
        let registry = TypeRegistry::new();
        registry.register_builtin("List");
        let stale = [0u8; 32];
        assert!(registry.verify_drift_hash(&stale, 12).is_err());
        let current = registry.drift_hash();
        assert!(registry.verify_drift_hash(&current, 12).is_ok());
    }

    #[test]
    fn instantiate_shell_defaults_all_declared_fields_to_null() {
        let registry = TypeRegistry::new();
        let mut fields = indexmap::IndexMap::new();
        fields.insert("x".to_string(), crate::value::TypeTag::Int);
        let class = Rc::new(ClassDescriptor {
            declared_name: "Point".to_string(),
            fully_qualified_name: "Point".to_string(),
            package: String::new(),
            internal_name: "Point".to_string(),
            is_interface: false,
            base_class: RefCell::new(None),
            interfaces: vec![],
            fields,
            mandatory_fields: vec![],
            methods: RefCell::new(IndexMap::new()),
            static_fields: RefCell::new(IndexMap::new()),
            inner_classes: RefCell::new(IndexMap::new()),
            enclosing_class: RefCell::new(None),
            is_script_defined: true,
            cyclic: Cell::new(false),
        });
        registry.register_user_class(class);
        let shell = registry.instantiate_shell("Point").unwrap();
        match shell {
            RuntimeValue::Instance(inst) => {
                assert_eq!(inst.fields.borrow().get("x"), Some(&RuntimeValue::Null));
            }
            _ => panic!("expected instance"),
        }
    }
}
