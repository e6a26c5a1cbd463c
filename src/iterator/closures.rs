//! Registry mapping a stable closure name to the actual Rust closure it
//! names, mirroring the `HandleRegistry` pattern in `handle.rs`: the codec
//! never serializes a closure body, only the name, and re-resolves the real
//! callable here on restore (spec §4.6 "for closure-driven transformers: the
//! source-id and offset plus the closure handle").

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::InternalError;

use super::{Closure, FlatMapClosure, PredicateClosure, StreamClosure};

#[derive(Default)]
pub struct ClosureRegistry {
    maps: RefCell<HashMap<String, Closure>>,
    predicates: RefCell<HashMap<String, PredicateClosure>>,
    flat_maps: RefCell<HashMap<String, FlatMapClosure>>,
    streams: RefCell<HashMap<String, StreamClosure>>,
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_map(&self, name: impl Into<String>, closure: Closure) {
        self.maps.borrow_mut().insert(name.into(), closure);
    }

    pub fn register_predicate(&self, name: impl Into<String>, closure: PredicateClosure) {
        self.predicates.borrow_mut().insert(name.into(), closure);
    }

    pub fn register_flat_map(&self, name: impl Into<String>, closure: FlatMapClosure) {
        self.flat_maps.borrow_mut().insert(name.into(), closure);
    }

    pub fn register_stream(&self, name: impl Into<String>, closure: StreamClosure) {
        self.streams.borrow_mut().insert(name.into(), closure);
    }

    pub fn lookup_map(&self, name: &str) -> Result<Closure, InternalError> {
        self.maps
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| InternalError::new(format!("no registered map closure named {name}")))
    }

    pub fn lookup_predicate(&self, name: &str) -> Result<PredicateClosure, InternalError> {
        self.predicates
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| InternalError::new(format!("no registered predicate closure named {name}")))
    }

    pub fn lookup_flat_map(&self, name: &str) -> Result<FlatMapClosure, InternalError> {
        self.flat_maps
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| InternalError::new(format!("no registered flat-map closure named {name}")))
    }

    pub fn lookup_stream(&self, name: &str) -> Result<StreamClosure, InternalError> {
        self.streams
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| InternalError::new(format!("no registered stream closure named {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RuntimeValue;

    #[test]
    fn round_trips_a_named_predicate() {
        let registry = ClosureRegistry::new();
        registry.register_predicate(
            "isOdd",
            Rc::new(|v| {
                let RuntimeValue::Int(n) = v else { return Ok(false) };
                Ok(n % 2 == 1)
            }),
        );
        let looked_up = registry.lookup_predicate("isOdd").unwrap();
        assert!(looked_up(&RuntimeValue::Int(3)).unwrap());
        assert!(!looked_up(&RuntimeValue::Int(4)).unwrap());
    }
}
