//! The runtime value graph: every node a checkpoint can reach.
//!
//! `RuntimeValue` is the in-memory representation of anything a script can
//! hold — from an inline `bool` to a cyclic `List`. Shareable/mutable nodes
//! are `Rc<RefCell<_>>` so the codec can track identity by pointer and
//! reproduce shared-reference topology (including cycles) on restore.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use rust_decimal::Decimal;

use crate::descriptor::ClassDescriptor;
use crate::continuation::ContinuationFrame;
use crate::handle::MethodHandle;
use crate::iterator::LazyIterator;

/// Closed enumeration of runtime type categories (spec §3).
///
/// Ordinals are format-versioned: never reorder existing entries, only
/// append. `NUMBER`, `ANY`, and `UNKNOWN` are supertype tags used by
/// descriptors and method-lookup fallback (§4.7); no `RuntimeValue` is ever
/// directly tagged with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Null = 0,
    Boolean = 1,
    Byte = 2,
    Int = 3,
    Long = 4,
    Double = 5,
    Decimal = 6,
    String = 7,
    StringBuffer = 8,
    List = 9,
    Map = 10,
    Instance = 11,
    Function = 12,
    Array = 13,
    HeapLocal = 14,
    Iterator = 15,
    Continuation = 16,
    Matcher = 17,
    Builtin = 18,
    Class = 19,
    Number = 20,
    Any = 21,
    Unknown = 22,
}

impl TypeTag {
    pub fn from_ordinal(ord: u8) -> Option<Self> {
        use TypeTag::*;
        Some(match ord {
            0 => Null,
            1 => Boolean,
            2 => Byte,
            3 => Int,
            4 => Long,
            5 => Double,
            6 => Decimal,
            7 => String,
            8 => StringBuffer,
            9 => List,
            10 => Map,
            11 => Instance,
            12 => Function,
            13 => Array,
            14 => HeapLocal,
            15 => Iterator,
            16 => Continuation,
            17 => Matcher,
            18 => Builtin,
            19 => Class,
            20 => Number,
            21 => Any,
            22 => Unknown,
            _ => return None,
        })
    }
}

/// Dense element type for a typed primitive array (spec §4.1 "Arrays").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayElemType {
    Bool,
    Byte,
    Int,
    Long,
    Double,
    Object,
}

/// A fixed-shape array value. Primitive element kinds use dense packed
/// storage (booleans eight-per-byte, bytes copy-block, ints/longs
/// variable-length per element, doubles raw 64-bit) per §4.1; object arrays
/// hold boxed `RuntimeValue`s.
#[derive(Debug, Clone)]
pub enum ArrayData {
    Bool(Rc<RefCell<Vec<bool>>>),
    Byte(Rc<RefCell<Vec<u8>>>),
    Int(Rc<RefCell<Vec<i32>>>),
    Long(Rc<RefCell<Vec<i64>>>),
    Double(Rc<RefCell<Vec<f64>>>),
    Object(Rc<RefCell<Vec<RuntimeValue>>>),
}

#[derive(Debug, Clone)]
pub struct ArrayValue {
    pub elem_type: ArrayElemType,
    /// Number of dimensions; `data` holds the flattened leaf elements for a
    /// 1-D array, or nested `Object` arrays for higher dimensions.
    pub dims: u8,
    pub data: ArrayData,
}

impl ArrayValue {
    pub fn identity_ptr(&self) -> *const () {
        match &self.data {
            ArrayData::Bool(r) => Rc::as_ptr(r) as *const (),
            ArrayData::Byte(r) => Rc::as_ptr(r) as *const (),
            ArrayData::Int(r) => Rc::as_ptr(r) as *const (),
            ArrayData::Long(r) => Rc::as_ptr(r) as *const (),
            ArrayData::Double(r) => Rc::as_ptr(r) as *const (),
            ArrayData::Object(r) => Rc::as_ptr(r) as *const (),
        }
    }
}

/// Live state for a regex-split matcher (backs the `StringSplit` iterator).
#[derive(Debug)]
pub struct MatcherState {
    pub subject: Rc<str>,
    pub pattern: String,
    pub modifiers: String,
    pub last_end: usize,
    pub regex: regex::Regex,
}

/// A built-in instance not otherwise modeled by a dedicated variant — a
/// bag of named fields tagged with the owning built-in class id.
#[derive(Debug)]
pub struct BuiltinValue {
    pub builtin_class_id: u32,
    pub fields: RefCell<IndexMap<String, RuntimeValue>>,
}

/// A script-defined object instance.
#[derive(Debug)]
pub struct InstanceValue {
    pub class: Rc<ClassDescriptor>,
    pub fields: RefCell<IndexMap<String, RuntimeValue>>,
}

/// The runtime value graph node. Cloning is cheap (reference clone) for every
/// shareable variant; primitives clone by value.
#[derive(Debug, Clone)]
pub enum RuntimeValue {
    Null,
    Bool(bool),
    Byte(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Decimal),
    Str(Rc<str>),
    StringBuffer(Rc<RefCell<String>>),
    List(Rc<RefCell<Vec<RuntimeValue>>>),
    Map(Rc<RefCell<IndexMap<RuntimeValue, RuntimeValue>>>),
    Instance(Rc<InstanceValue>),
    Function(MethodHandle),
    Array(ArrayValue),
    HeapLocal(Rc<RefCell<RuntimeValue>>),
    Iterator(Rc<RefCell<LazyIterator>>),
    Continuation(Rc<RefCell<ContinuationFrame>>),
    Matcher(Rc<RefCell<MatcherState>>),
    Builtin(Rc<BuiltinValue>),
    Class(Rc<ClassDescriptor>),
}

impl RuntimeValue {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            RuntimeValue::Null => TypeTag::Null,
            RuntimeValue::Bool(_) => TypeTag::Boolean,
            RuntimeValue::Byte(_) => TypeTag::Byte,
            RuntimeValue::Int(_) => TypeTag::Int,
            RuntimeValue::Long(_) => TypeTag::Long,
            RuntimeValue::Double(_) => TypeTag::Double,
            RuntimeValue::Decimal(_) => TypeTag::Decimal,
            RuntimeValue::Str(_) => TypeTag::String,
            RuntimeValue::StringBuffer(_) => TypeTag::StringBuffer,
            RuntimeValue::List(_) => TypeTag::List,
            RuntimeValue::Map(_) => TypeTag::Map,
            RuntimeValue::Instance(_) => TypeTag::Instance,
            RuntimeValue::Function(_) => TypeTag::Function,
            RuntimeValue::Array(_) => TypeTag::Array,
            RuntimeValue::HeapLocal(_) => TypeTag::HeapLocal,
            RuntimeValue::Iterator(_) => TypeTag::Iterator,
            RuntimeValue::Continuation(_) => TypeTag::Continuation,
            RuntimeValue::Matcher(_) => TypeTag::Matcher,
            RuntimeValue::Builtin(_) => TypeTag::Builtin,
            RuntimeValue::Class(_) => TypeTag::Class,
        }
    }

    /// Whether this value is shareable (carries an object id in the wire
    /// format) as opposed to inlined by value. Mirrors §4.1's "non-shareable
    /// primitives are written inline" rule.
    pub fn is_shareable(&self) -> bool {
        !matches!(
            self,
            RuntimeValue::Null
                | RuntimeValue::Bool(_)
                | RuntimeValue::Byte(_)
                | RuntimeValue::Int(_)
                | RuntimeValue::Long(_)
                | RuntimeValue::Double(_)
                | RuntimeValue::Decimal(_)
        )
    }

    /// Pointer identity for shareable values; `None` for inline primitives.
    /// Strings are treated as value-like for sharing purposes (§4.1's
    /// "two-phase restore" note on strings), so they report no identity.
    pub fn identity_ptr(&self) -> Option<*const ()> {
        match self {
            // Strings compare *by value* (`runtime_eq`), but the codec still
            // assigns them an object id/offset entry per spec §4.1 ("every
            // object but the non-shareable primitives"), so they need a
            // pointer for the writer's identity map.
            RuntimeValue::Str(r) => Some(Rc::as_ptr(r) as *const ()),
            RuntimeValue::StringBuffer(r) => Some(Rc::as_ptr(r) as *const ()),
            RuntimeValue::List(r) => Some(Rc::as_ptr(r) as *const ()),
            RuntimeValue::Map(r) => Some(Rc::as_ptr(r) as *const ()),
            RuntimeValue::Instance(r) => Some(Rc::as_ptr(r) as *const () as *const ()),
            RuntimeValue::Array(a) => Some(a.identity_ptr()),
            RuntimeValue::HeapLocal(r) => Some(Rc::as_ptr(r) as *const ()),
            RuntimeValue::Iterator(r) => Some(Rc::as_ptr(r) as *const ()),
            RuntimeValue::Continuation(r) => Some(Rc::as_ptr(r) as *const ()),
            RuntimeValue::Matcher(r) => Some(Rc::as_ptr(r) as *const ()),
            RuntimeValue::Builtin(r) => Some(Rc::as_ptr(r) as *const () as *const ()),
            RuntimeValue::Class(r) => Some(Rc::as_ptr(r) as *const () as *const ()),
            _ => None,
        }
    }

    /// Truthiness used by `filter()` with no closure and by branch opcodes.
    pub fn is_truthy(&self) -> bool {
        match self {
            RuntimeValue::Null => false,
            RuntimeValue::Bool(b) => *b,
            RuntimeValue::Byte(b) => *b != 0,
            RuntimeValue::Int(n) => *n != 0,
            RuntimeValue::Long(n) => *n != 0,
            RuntimeValue::Double(n) => *n != 0.0,
            RuntimeValue::Str(s) => !s.is_empty(),
            RuntimeValue::List(l) => !l.borrow().is_empty(),
            RuntimeValue::Map(m) => !m.borrow().is_empty(),
            _ => true,
        }
    }
}

/// The runtime's equality rule (spec §4.6 "Unique", §8 invariant 5):
/// primitives and strings compare by value; every other shareable node
/// compares by reference identity. This is what `Unique` uses for its
/// look-behind comparison and what `Map` keys use for lookup.
pub fn runtime_eq(a: &RuntimeValue, b: &RuntimeValue) -> bool {
    use RuntimeValue::*;
    match (a, b) {
        (Null, Null) => true,
        (Bool(x), Bool(y)) => x == y,
        (Byte(x), Byte(y)) => x == y,
        (Int(x), Int(y)) => x == y,
        (Long(x), Long(y)) => x == y,
        (Double(x), Double(y)) => x.to_bits() == y.to_bits(),
        (Decimal(x), Decimal(y)) => x == y,
        (Str(x), Str(y)) => x == y,
        // Numeric cross-type comparisons used pervasively by branching code.
        (Int(x), Long(y)) | (Long(y), Int(x)) => *x as i64 == *y,
        (Int(x), Double(y)) | (Double(y), Int(x)) => *x as f64 == *y,
        (Long(x), Double(y)) | (Double(y), Long(x)) => *x as f64 == *y,
        _ => match (a.identity_ptr(), b.identity_ptr()) {
            (Some(pa), Some(pb)) => pa == pb,
            _ => false,
        },
    }
}

impl PartialEq for RuntimeValue {
    fn eq(&self, other: &Self) -> bool {
        runtime_eq(self, other)
    }
}
impl Eq for RuntimeValue {}

impl std::hash::Hash for RuntimeValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        use RuntimeValue::*;
        match self {
            Null => 0u8.hash(state),
            Bool(b) => b.hash(state),
            Byte(b) => b.hash(state),
            Int(n) => (*n as i64).hash(state),
            Long(n) => n.hash(state),
            Double(n) => n.to_bits().hash(state),
            Decimal(d) => d.to_string().hash(state),
            Str(s) => s.hash(state),
            other => {
                if let Some(ptr) = other.identity_ptr() {
                    (ptr as usize).hash(state);
                } else {
                    0xFFu8.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeValue::Null => write!(f, "null"),
            RuntimeValue::Bool(b) => write!(f, "{b}"),
            RuntimeValue::Byte(b) => write!(f, "{b}"),
            RuntimeValue::Int(n) => write!(f, "{n}"),
            RuntimeValue::Long(n) => write!(f, "{n}"),
            RuntimeValue::Double(n) => write!(f, "{n}"),
            RuntimeValue::Decimal(d) => write!(f, "{d}"),
            RuntimeValue::Str(s) => write!(f, "{s}"),
            other => write!(f, "<{:?}>", other.type_tag()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_compare_by_value() {
        assert!(runtime_eq(&RuntimeValue::Int(3), &RuntimeValue::Int(3)));
        assert!(!runtime_eq(&RuntimeValue::Int(3), &RuntimeValue::Int(4)));
        assert!(runtime_eq(&RuntimeValue::Int(3), &RuntimeValue::Long(3)));
    }

    #[test]
    fn lists_compare_by_identity() {
        let a = RuntimeValue::List(Rc::new(RefCell::new(vec![RuntimeValue::Int(1)])));
        let b = RuntimeValue::List(Rc::new(RefCell::new(vec![RuntimeValue::Int(1)])));
        assert!(!runtime_eq(&a, &b));
        let c = a.clone();
        assert!(runtime_eq(&a, &c));
    }

    #[test]
    fn truthiness_matches_spec_filter_default() {
        assert!(!RuntimeValue::Null.is_truthy());
        assert!(!RuntimeValue::Int(0).is_truthy());
        assert!(RuntimeValue::Int(1).is_truthy());
        assert!(!RuntimeValue::Str(Rc::from("")).is_truthy());
    }
}
