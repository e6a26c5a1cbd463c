//! Class and Function descriptors (spec §3 "Class Descriptor" / "Function
//! Descriptor", §4.7).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::value::TypeTag;

/// Three-valued async-ness: the compiler may not always know statically
/// whether a function can suspend (spec §3 "Function Descriptor").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asyncness {
    Unknown,
    Yes,
    No,
}

#[derive(Debug, Clone)]
pub struct FieldType {
    pub name: String,
    pub type_tag: TypeTag,
}

/// A script-defined or registered class/type.
#[derive(Debug)]
pub struct ClassDescriptor {
    pub declared_name: String,
    pub fully_qualified_name: String,
    pub package: String,
    pub internal_name: String,
    pub is_interface: bool,
    /// `None` = no base class; cyclic inheritance collapses this to `None`
    /// too (see `cyclic` flag) so downstream lookups degrade gracefully.
    pub base_class: RefCell<Option<Rc<ClassDescriptor>>>,
    pub interfaces: Vec<Rc<ClassDescriptor>>,
    /// Ordered so restore reproduces declaration order.
    pub fields: IndexMap<String, TypeTag>,
    pub mandatory_fields: Vec<String>,
    pub methods: RefCell<IndexMap<String, Rc<FunctionDescriptor>>>,
    pub static_fields: RefCell<IndexMap<String, crate::value::RuntimeValue>>,
    pub inner_classes: RefCell<IndexMap<String, Rc<ClassDescriptor>>>,
    pub enclosing_class: RefCell<Option<Rc<ClassDescriptor>>>,
    pub is_script_defined: bool,
    /// Set once cyclic inheritance is detected for this class (spec §9 open
    /// question: "the source marks the cycle ... reimplementation should
    /// preserve that shape").
    pub cyclic: Cell<bool>,
}

#[derive(Debug)]
pub struct FunctionDescriptor {
    /// Absent for global functions.
    pub owner_type: Option<Rc<ClassDescriptor>>,
    /// May differ from `owner_type` when the receiver is coerced (e.g. a
    /// built-in method implemented against a supertype).
    pub first_arg_type: Option<TypeTag>,
    pub name: String,
    pub return_type: TypeTag,
    pub param_names: Vec<String>,
    pub param_types: Vec<TypeTag>,
    pub mandatory_count: usize,
    pub is_var_args: bool,
    pub implementing_class: Option<String>,
    pub method_ref: String,
    pub inline_emitter: Option<String>,
    pub is_static: bool,
    pub is_init: bool,
    pub is_wrapper: bool,
    pub asyncness: Asyncness,
    pub async_arg_indices: Vec<usize>,
}

/// Error raised when declaring a method/field/static-field name that
/// collides with another member of the same kind-group in the class or its
/// inheritance chain (spec §3 invariant, §4.7).
#[derive(Debug, Clone, thiserror::Error)]
#[error("member '{name}' already declared on class '{class}' or an ancestor")]
pub struct MemberCollision {
    pub class: String,
    pub name: String,
}

impl ClassDescriptor {
    /// Walks the base-class chain (stopping at the first cyclic class,
    /// which reports no base) collecting field/static-field/method names to
    /// check for a collision, per the "collision checks consult the full
    /// inheritance chain" invariant.
    fn chain_names(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let mut fields = Vec::new();
        let mut statics = Vec::new();
        let mut methods = Vec::new();

        fields.extend(self.fields.keys().cloned());
        statics.extend(self.static_fields.borrow().keys().cloned());
        methods.extend(self.methods.borrow().keys().cloned());

        let mut next = self.base_class.borrow().clone();
        while let Some(base) = next {
            fields.extend(base.fields.keys().cloned());
            statics.extend(base.static_fields.borrow().keys().cloned());
            methods.extend(base.methods.borrow().keys().cloned());
            next = base.base_class.borrow().clone();
        }
        (fields, statics, methods)
    }

    /// Registers a method, rejecting a name already used by a field or
    /// static field anywhere in the inheritance chain.
    pub fn register_method(&self, desc: Rc<FunctionDescriptor>) -> Result<(), MemberCollision> {
        let (fields, statics, _methods) = self.chain_names();
        if fields.iter().any(|f| f == &desc.name) || statics.iter().any(|s| s == &desc.name) {
            return Err(MemberCollision {
                class: self.declared_name.clone(),
                name: desc.name.clone(),
            });
        }
        self.methods.borrow_mut().insert(desc.name.clone(), desc);
        Ok(())
    }

    /// Method lookup walking declared methods, then inherited, then
    /// returning `None` so the caller can fall back to globally-registered
    /// methods (spec §4.7).
    pub fn lookup_method(&self, name: &str) -> Option<Rc<FunctionDescriptor>> {
        if let Some(m) = self.methods.borrow().get(name) {
            return Some(m.clone());
        }
        let mut next = self.base_class.borrow().clone();
        while let Some(base) = next {
            if let Some(m) = base.methods.borrow().get(name) {
                return Some(m.clone());
            }
            next = base.base_class.borrow().clone();
        }
        None
    }

    /// Detects a cycle in the base-class chain starting from `self` using a
    /// small `petgraph` digraph over the (bounded) chain of candidate bases.
    /// On detection, sets `cyclic` and severs `base_class` to `None` so
    /// downstream base-class queries return absent rather than looping
    /// (spec §9 open question).
    pub fn check_and_break_cycle(self_rc: &Rc<ClassDescriptor>) {
        let mut graph: DiGraph<(), ()> = DiGraph::new();
        let mut idx_of: HashMap<*const ClassDescriptor, petgraph::graph::NodeIndex> =
            HashMap::new();
        let mut cur = Some(self_rc.clone());
        let mut prev = None;
        while let Some(c) = cur {
            let ptr = Rc::as_ptr(&c);
            if let Some(&idx) = idx_of.get(&ptr) {
                if let Some(p) = prev {
                    graph.add_edge(p, idx, ());
                }
                break;
            }
            let idx = graph.add_node(());
            idx_of.insert(ptr, idx);
            if let Some(p) = prev {
                graph.add_edge(p, idx, ());
            }
            prev = Some(idx);
            cur = c.base_class.borrow().clone();
        }
        if is_cyclic_directed(&graph) {
            self_rc.cyclic.set(true);
            *self_rc.base_class.borrow_mut() = None;
        }
    }
}

/// Fixed fallback order for method lookup by runtime receiver type
/// (spec §4.7): exact type → object-array for arrays → iterator-protocol
/// for list/map/string/numeric/array → numeric-super → catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFallback {
    ExactType,
    ObjectArray,
    IteratorProtocol,
    NumericSuper,
    CatchAll,
}

pub fn fallback_order_for(tag: TypeTag) -> Vec<LookupFallback> {
    use LookupFallback::*;
    match tag {
        TypeTag::Array => vec![ExactType, ObjectArray, IteratorProtocol, CatchAll],
        TypeTag::List | TypeTag::Map | TypeTag::String => {
            vec![ExactType, IteratorProtocol, CatchAll]
        }
        TypeTag::Int | TypeTag::Long | TypeTag::Double | TypeTag::Decimal | TypeTag::Byte => {
            vec![ExactType, NumericSuper, CatchAll]
        }
        _ => vec![ExactType, CatchAll],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_class(name: &str, fields: IndexMap<String, TypeTag>) -> Rc<ClassDescriptor> {
        Rc::new(ClassDescriptor {
            declared_name: name.to_string(),
            fully_qualified_name: name.to_string(),
            package: String::new(),
            internal_name: name.to_string(),
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
        })
    }

    #[test]
    fn method_collides_with_field_rejected() {
        let mut fields = IndexMap::new();
        fields.insert("x".to_string(), TypeTag::Int);
        let class = leaf_class("Point", fields);
        let desc = Rc::new(FunctionDescriptor {
            owner_type: Some(class.clone()),
            first_arg_type: None,
            name: "x".to_string(),
            return_type: TypeTag::Int,
            param_names: vec![],
            param_types: vec![],
            mandatory_count: 0,
            is_var_args: false,
            implementing_class: None,
            method_ref: String::new(),
            inline_emitter: None,
            is_static: false,
            is_init: false,
            is_wrapper: false,
            asyncness: Asyncness::No,
            async_arg_indices: vec![],
        });
        assert!(class.register_method(desc).is_err());
    }

    #[test]
    fn cyclic_inheritance_breaks_and_flags() {
        let a = leaf_class("A", IndexMap::new());
        let b = leaf_class("B", IndexMap::new());
        *a.base_class.borrow_mut() = Some(b.clone());
        *b.base_class.borrow_mut() = Some(a.clone());
        ClassDescriptor::check_and_break_cycle(&a);
        assert!(a.cyclic.get());
        assert!(a.base_class.borrow().is_none());
    }
}
