//! Method Handle Model (spec §4.3): four variants of a serializable callable
//! reference, each able to encode its own identity and reacquire the
//! underlying invocable on restore.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::descriptor::FunctionDescriptor;
use crate::error::{CheckpointFormatError, InternalError};
use crate::value::RuntimeValue;

/// A plain handle to a field on a built-in or user class holding a
/// pre-stored invocable (spec §4.3 "Plain handle").
#[derive(Debug, Clone)]
pub struct PlainHandle {
    pub owning_class: ClassRef,
    pub handle_field: String,
}

/// A handle into one of the lazy-iterator-variant classes (spec §4.3
/// "Iterator handle").
#[derive(Debug, Clone)]
pub struct IteratorHandle {
    pub iterator_variant_tag: u32,
    pub handle_field: String,
}

/// A handle identified by `(owner-type-or-none, name)`, resolved through the
/// context registry on restore (spec §4.3 "Wrapper handle").
#[derive(Debug, Clone)]
pub struct WrapperHandle {
    pub owner_type: Option<String>,
    pub function_name: String,
}

/// A handle that's been partially applied to a receiver. `bind_to` produces
/// one of these without mutating the source handle.
#[derive(Debug, Clone)]
pub struct BoundHandle {
    pub inner: Box<MethodHandle>,
    pub receiver: RuntimeValue,
}

#[derive(Debug, Clone)]
pub enum ClassRef {
    BuiltinId(u32),
    Named(String),
}

/// A serializable callable reference. Never carries a raw function pointer —
/// each variant carries enough identity to look the same invocable up again
/// after restore (spec §9 "Method handles with re-resolution").
#[derive(Debug, Clone)]
pub enum MethodHandle {
    Plain(PlainHandle),
    Iterator(IteratorHandle),
    Wrapper(WrapperHandle),
    Bound(Rc<BoundHandle>),
}

impl MethodHandle {
    /// Binds `receiver` as the first argument, returning a new handle. The
    /// original handle is untouched (spec: "`bind_to(receiver)` yields a new
    /// bound variant without mutating the original").
    pub fn bind_to(&self, receiver: RuntimeValue) -> MethodHandle {
        MethodHandle::Bound(Rc::new(BoundHandle {
            inner: Box::new(self.clone()),
            receiver,
        }))
    }

    /// Resolves this handle against the given registries, producing the
    /// underlying invocable descriptor. `Bound` handles resolve lazily —
    /// only the innermost non-bound handle needs registry lookup; the bind
    /// itself is materialized on first call via `resolved_receiver`.
    pub fn resolve(&self, registry: &HandleRegistry) -> Result<Rc<FunctionDescriptor>, InternalError> {
        match self {
            MethodHandle::Plain(h) => registry.lookup_plain(h),
            MethodHandle::Iterator(h) => registry.lookup_iterator(h),
            MethodHandle::Wrapper(h) => registry.lookup_wrapper(h),
            MethodHandle::Bound(b) => b.inner.resolve(registry),
        }
    }

    /// For a (possibly nested) `Bound` handle, the receiver that will be
    /// supplied as the first argument once the handle is invoked.
    pub fn resolved_receiver(&self) -> Option<RuntimeValue> {
        match self {
            MethodHandle::Bound(b) => Some(b.receiver.clone()),
            _ => None,
        }
    }
}

/// Registry keyed by `(owner-type-or-none, name)` and by
/// `(built-in-class-id, field-name)`, used to re-resolve method handles on
/// restore (spec §6 "Class/function registration", §9).
#[derive(Default)]
pub struct HandleRegistry {
    wrapper_by_name: RefCell<HashMap<(Option<String>, String), Rc<FunctionDescriptor>>>,
    plain_by_field: RefCell<HashMap<(ClassRefKey, String), Rc<FunctionDescriptor>>>,
    iterator_by_field: RefCell<HashMap<(u32, String), Rc<FunctionDescriptor>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ClassRefKey {
    Builtin(u32),
    Named(String),
}

impl From<&ClassRef> for ClassRefKey {
    fn from(c: &ClassRef) -> Self {
        match c {
            ClassRef::BuiltinId(id) => ClassRefKey::Builtin(*id),
            ClassRef::Named(n) => ClassRefKey::Named(n.clone()),
        }
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&self, owner_type: Option<String>, spec: Rc<FunctionDescriptor>) {
        self.wrapper_by_name
            .borrow_mut()
            .insert((owner_type, spec.name.clone()), spec);
    }

    pub fn deregister_function(&self, owner_type: &Option<String>, name: &str) {
        self.wrapper_by_name
            .borrow_mut()
            .remove(&(owner_type.clone(), name.to_string()));
    }

    pub fn register_plain(&self, owner: ClassRef, field: String, spec: Rc<FunctionDescriptor>) {
        self.plain_by_field
            .borrow_mut()
            .insert(((&owner).into(), field), spec);
    }

    pub fn register_iterator_handle(
        &self,
        variant_tag: u32,
        field: String,
        spec: Rc<FunctionDescriptor>,
    ) {
        self.iterator_by_field
            .borrow_mut()
            .insert((variant_tag, field), spec);
    }

    fn lookup_wrapper(&self, h: &WrapperHandle) -> Result<Rc<FunctionDescriptor>, InternalError> {
        self.wrapper_by_name
            .borrow()
            .get(&(h.owner_type.clone(), h.function_name.clone()))
            .cloned()
            .ok_or_else(|| {
                InternalError::new(format!(
                    "no registered function for owner={:?} name={}",
                    h.owner_type, h.function_name
                ))
            })
    }

    fn lookup_plain(&self, h: &PlainHandle) -> Result<Rc<FunctionDescriptor>, InternalError> {
        self.plain_by_field
            .borrow()
            .get(&((&h.owning_class).into(), h.handle_field.clone()))
            .cloned()
            .ok_or_else(|| {
                InternalError::new(format!(
                    "no registered plain handle for field {}",
                    h.handle_field
                ))
            })
    }

    fn lookup_iterator(&self, h: &IteratorHandle) -> Result<Rc<FunctionDescriptor>, InternalError> {
        self.iterator_by_field
            .borrow()
            .get(&(h.iterator_variant_tag, h.handle_field.clone()))
            .cloned()
            .ok_or_else(|| {
                InternalError::new(format!(
                    "no registered iterator handle for variant {} field {}",
                    h.iterator_variant_tag, h.handle_field
                ))
            })
    }
}

/// Converts a missing registry entry detected during checkpoint restore
/// (rather than live resolution) into the terminal format error.
pub fn missing_on_restore(offset: usize, what: &str) -> CheckpointFormatError {
    CheckpointFormatError::new(offset, format!("method handle target missing: {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Asyncness;
    use crate::value::TypeTag;

    fn dummy_fn(name: &str) -> Rc<FunctionDescriptor> {
        Rc::new(FunctionDescriptor {
            owner_type: None,
            first_arg_type: None,
            name: name.to_string(),
            return_type: TypeTag::Int,
            param_names: vec![],
            param_types: vec![],
            mandatory_count: 0,
            is_var_args: false,
            implementing_class: None,
            method_ref: String::new(),
            inline_emitter: None,
            is_static: true,
            is_init: false,
            is_wrapper: true,
            asyncness: Asyncness::No,
            async_arg_indices: vec![],
        })
    }

    #[test]
    fn wrapper_handle_round_trips_through_registry() {
        let registry = HandleRegistry::new();
        registry.register_function(None, dummy_fn("blockingAdd"));
        let handle = MethodHandle::Wrapper(WrapperHandle {
            owner_type: None,
            function_name: "blockingAdd".to_string(),
        });
        let resolved = handle.resolve(&registry).unwrap();
        assert_eq!(resolved.name, "blockingAdd");
    }

    #[test]
    fn bind_to_does_not_mutate_original() {
        let base = MethodHandle::Wrapper(WrapperHandle {
            owner_type: None,
            function_name: "f".to_string(),
        });
        let bound = base.bind_to(RuntimeValue::Int(42));
        assert!(bound.resolved_receiver().is_some());
        assert!(base.resolved_receiver().is_none());
    }
}
