//! Lazy Iterator Family (spec §4.6): a polymorphic set of sources and
//! transformers sharing a `has_next` / `next` contract, each able to
//! describe and restore its own mid-iteration state for a checkpoint.
//!
//! Simplification from the literal spec prose: a transformer closure here is
//! a plain synchronous Rust closure (`Rc<dyn Fn(...) -> Result<...>>`).
//! The spec describes closures that may themselves suspend via the
//! Continuation mechanism, wrapping the transformer's own state in a new
//! frame at `location + 1`. None of this crate's own closures ever suspend,
//! so that wrapping step is not exercised; the `location` state machine is
//! still implemented and checkpointed faithfully for every transformer, so a
//! host that does supply a suspending closure has the state layout it needs
//! to build that wrapping on top. Recorded in DESIGN.md.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::EngineError;
use crate::value::{ArrayData, ArrayValue, MatcherState, RuntimeValue};

mod closures;
pub use closures::ClosureRegistry;

pub type Closure = Rc<dyn Fn(&RuntimeValue) -> Result<RuntimeValue, EngineError>>;
pub type PredicateClosure = Rc<dyn Fn(&RuntimeValue) -> Result<bool, EngineError>>;
pub type FlatMapClosure = Rc<dyn Fn(&RuntimeValue) -> Result<LazyIterator, EngineError>>;
pub type StreamClosure = Rc<dyn Fn() -> Result<RuntimeValue, EngineError>>;

/// Format version written into every iterator's checkpoint self-description
/// (spec §4.6 "a declared format version for self-describing restore").
pub const ITERATOR_FORMAT_VERSION: u32 = 1;

pub struct ListSourceState {
    pub source: Rc<RefCell<Vec<RuntimeValue>>>,
    pub index: usize,
}

pub struct MapEntriesSourceState {
    pub source: Rc<RefCell<IndexMap<RuntimeValue, RuntimeValue>>>,
    pub index: usize,
    pub start_count: usize,
}

pub struct ArraySourceState {
    pub source: ArrayValue,
    pub index: usize,
}

pub struct RangeSourceState {
    pub current: i64,
    pub end: i64,
    pub step: i64,
}

pub struct CharsSourceState {
    pub source: Rc<str>,
    pub index: usize,
}

pub struct StringSplitState {
    pub matcher: MatcherState,
    pub find_next: bool,
    pub has_next_cached: Option<bool>,
    pub last: bool,
}

pub struct FilterState {
    pub source: Box<LazyIterator>,
    pub closure: Option<PredicateClosure>,
    /// Stable name the closure was registered under, carried purely for
    /// checkpoint identity (spec §4.6); re-resolved through a
    /// `ClosureRegistry` on restore. `None` for "no closure" (truthiness
    /// filter), which needs no re-resolution.
    pub closure_name: Option<String>,
    pub lookahead: Option<RuntimeValue>,
    pub has_lookahead: bool,
    pub location: u32,
}

pub struct MapState {
    pub source: Box<LazyIterator>,
    pub closure: Closure,
    pub closure_name: String,
    pub with_index: bool,
    pub index: u64,
    pub location: u32,
}

pub struct FlatMapState {
    pub source: Box<LazyIterator>,
    pub closure: FlatMapClosure,
    pub closure_name: String,
    pub inner: Option<Box<LazyIterator>>,
    pub location: u32,
}

pub struct UniqueState {
    pub source: Box<LazyIterator>,
    pub previous: Option<RuntimeValue>,
    pub first: bool,
    pub location: u32,
}

pub struct LimitState {
    pub source: Box<LazyIterator>,
    pub n: u64,
    pub emitted: u64,
}

pub struct NegativeLimitState {
    pub source: Box<LazyIterator>,
    pub n_abs: usize,
    pub buffer: VecDeque<RuntimeValue>,
    pub source_exhausted: bool,
}

pub struct SkipState {
    pub source: Box<LazyIterator>,
    pub n: u64,
    pub skipped: u64,
}

pub struct NegativeSkipState {
    pub source: Box<LazyIterator>,
    pub n_abs: usize,
    pub buffer: VecDeque<RuntimeValue>,
    pub source_exhausted: bool,
}

pub struct GroupedState {
    pub source: Box<LazyIterator>,
    pub size: usize,
}

pub struct TransposeState {
    pub sources: Vec<LazyIterator>,
}

pub struct StreamState {
    pub closure: StreamClosure,
    pub closure_name: String,
    pub cached_next: Option<RuntimeValue>,
    pub done: bool,
}

/// Tagged union of every iterator variant (spec §4.6). Ordinals are
/// format-versioned the same way `TypeTag` ordinals are: append only.
pub enum LazyIterator {
    ListSource(ListSourceState),
    MapEntriesSource(MapEntriesSourceState),
    ArraySource(ArraySourceState),
    RangeSource(RangeSourceState),
    CharsSource(CharsSourceState),
    StringSplit(StringSplitState),
    Filter(FilterState),
    Map(MapState),
    FlatMap(FlatMapState),
    Unique(UniqueState),
    Limit(LimitState),
    NegativeLimit(NegativeLimitState),
    Skip(SkipState),
    NegativeSkip(NegativeSkipState),
    Grouped(GroupedState),
    Transpose(TransposeState),
    Stream(StreamState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IteratorVariant {
    ListSource = 0,
    MapEntriesSource = 1,
    ArraySource = 2,
    RangeSource = 3,
    CharsSource = 4,
    StringSplit = 5,
    Filter = 6,
    Map = 7,
    FlatMap = 8,
    Unique = 9,
    Limit = 10,
    NegativeLimit = 11,
    Skip = 12,
    NegativeSkip = 13,
    Grouped = 14,
    Transpose = 15,
    Stream = 16,
}

impl LazyIterator {
    pub fn variant(&self) -> IteratorVariant {
        use IteratorVariant::*;
        match self {
            LazyIterator::ListSource(_) => ListSource,
            LazyIterator::MapEntriesSource(_) => MapEntriesSource,
            LazyIterator::ArraySource(_) => ArraySource,
            LazyIterator::RangeSource(_) => RangeSource,
            LazyIterator::CharsSource(_) => CharsSource,
            LazyIterator::StringSplit(_) => StringSplit,
            LazyIterator::Filter(_) => Filter,
            LazyIterator::Map(_) => Map,
            LazyIterator::FlatMap(_) => FlatMap,
            LazyIterator::Unique(_) => Unique,
            LazyIterator::Limit(_) => Limit,
            LazyIterator::NegativeLimit(_) => NegativeLimit,
            LazyIterator::Skip(_) => Skip,
            LazyIterator::NegativeSkip(_) => NegativeSkip,
            LazyIterator::Grouped(_) => Grouped,
            LazyIterator::Transpose(_) => Transpose,
            LazyIterator::Stream(_) => Stream,
        }
    }

    pub fn list_source(source: Rc<RefCell<Vec<RuntimeValue>>>) -> Self {
        LazyIterator::ListSource(ListSourceState { source, index: 0 })
    }

    pub fn range_source(start: i64, end: i64, step: i64) -> Self {
        LazyIterator::RangeSource(RangeSourceState {
            current: start,
            end,
            step,
        })
    }

    pub fn filter(
        source: LazyIterator,
        closure: Option<PredicateClosure>,
        closure_name: Option<String>,
    ) -> Self {
        LazyIterator::Filter(FilterState {
            source: Box::new(source),
            closure,
            closure_name,
            lookahead: None,
            has_lookahead: false,
            location: 0,
        })
    }

    pub fn map(source: LazyIterator, closure: Closure, closure_name: String, with_index: bool) -> Self {
        LazyIterator::Map(MapState {
            source: Box::new(source),
            closure,
            closure_name,
            with_index,
            index: 0,
            location: 0,
        })
    }

    pub fn unique(source: LazyIterator) -> Self {
        LazyIterator::Unique(UniqueState {
            source: Box::new(source),
            previous: None,
            first: true,
            location: 0,
        })
    }

    pub fn limit(source: LazyIterator, n: u64) -> Self {
        LazyIterator::Limit(LimitState {
            source: Box::new(source),
            n,
            emitted: 0,
        })
    }

    pub fn negative_limit(source: LazyIterator, n_abs: usize) -> Self {
        LazyIterator::NegativeLimit(NegativeLimitState {
            source: Box::new(source),
            n_abs,
            buffer: VecDeque::new(),
            source_exhausted: false,
        })
    }

    pub fn skip(source: LazyIterator, n: u64) -> Self {
        LazyIterator::Skip(SkipState {
            source: Box::new(source),
            n,
            skipped: 0,
        })
    }

    pub fn negative_skip(source: LazyIterator, n_abs: usize) -> Self {
        LazyIterator::NegativeSkip(NegativeSkipState {
            source: Box::new(source),
            n_abs,
            buffer: VecDeque::new(),
            source_exhausted: false,
        })
    }

    pub fn grouped(source: LazyIterator, size: usize) -> Self {
        LazyIterator::Grouped(GroupedState {
            source: Box::new(source),
            size,
        })
    }

    pub fn transpose(sources: Vec<LazyIterator>) -> Self {
        LazyIterator::Transpose(TransposeState { sources })
    }

    /// `has_next()` may be called repeatedly without an intervening `next()`
    /// and must return the same answer each time (spec §8 invariant 4).
    pub fn has_next(&mut self) -> Result<bool, EngineError> {
        match self {
            LazyIterator::ListSource(s) => Ok(s.index < s.source.borrow().len()),
            LazyIterator::MapEntriesSource(s) => {
                Ok(s.index < s.source.borrow().len().min(s.start_count))
            }
            LazyIterator::ArraySource(s) => Ok(s.index < array_len(&s.source)),
            LazyIterator::RangeSource(s) => Ok(if s.step > 0 {
                s.current < s.end
            } else {
                s.current > s.end
            }),
            LazyIterator::CharsSource(s) => Ok(s.index < s.source.chars().count()),
            LazyIterator::StringSplit(s) => string_split_has_next(s),
            LazyIterator::Filter(s) => filter_has_next(s),
            LazyIterator::Map(s) => s.source.has_next(),
            LazyIterator::FlatMap(s) => flat_map_has_next(s),
            LazyIterator::Unique(s) => unique_has_next(s),
            LazyIterator::Limit(s) => Ok(s.emitted < s.n && s.source.has_next()?),
            LazyIterator::NegativeLimit(s) => negative_limit_has_next(s),
            LazyIterator::Skip(s) => {
                skip_ahead(s)?;
                s.source.has_next()
            }
            LazyIterator::NegativeSkip(s) => negative_skip_has_next(s),
            LazyIterator::Grouped(s) => s.source.has_next(),
            LazyIterator::Transpose(s) => {
                let mut any = false;
                for it in s.sources.iter_mut() {
                    if it.has_next()? {
                        any = true;
                    }
                }
                Ok(any)
            }
            LazyIterator::Stream(s) => stream_has_next(s),
        }
    }

    /// Advances the logical position by exactly one (one group for
    /// `Grouped`, one tuple for `Transpose`) and returns the emitted value.
    pub fn next(&mut self) -> Result<RuntimeValue, EngineError> {
        match self {
            LazyIterator::ListSource(s) => {
                let v = s.source.borrow()[s.index].clone();
                s.index += 1;
                Ok(v)
            }
            LazyIterator::MapEntriesSource(s) => {
                let (k, v) = s
                    .source
                    .borrow()
                    .get_index(s.index)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .expect("has_next guarantees an entry at this index");
                s.index += 1;
                Ok(RuntimeValue::List(Rc::new(RefCell::new(vec![k, v]))))
            }
            LazyIterator::ArraySource(s) => {
                let v = array_get(&s.source, s.index);
                s.index += 1;
                Ok(v)
            }
            LazyIterator::RangeSource(s) => {
                let v = s.current;
                s.current += s.step;
                Ok(RuntimeValue::Long(v))
            }
            LazyIterator::CharsSource(s) => {
                let ch = s
                    .source
                    .chars()
                    .nth(s.index)
                    .expect("has_next guarantees a char at this index");
                s.index += 1;
                Ok(RuntimeValue::Str(Rc::from(ch.to_string())))
            }
            LazyIterator::StringSplit(s) => string_split_next(s),
            LazyIterator::Filter(s) => filter_next(s),
            LazyIterator::Map(s) => map_next(s),
            LazyIterator::FlatMap(s) => flat_map_next(s),
            LazyIterator::Unique(s) => unique_next(s),
            LazyIterator::Limit(s) => {
                let v = s.source.next()?;
                s.emitted += 1;
                Ok(v)
            }
            LazyIterator::NegativeLimit(s) => negative_limit_next(s),
            LazyIterator::Skip(s) => {
                skip_ahead(s)?;
                s.source.next()
            }
            LazyIterator::NegativeSkip(s) => negative_skip_next(s),
            LazyIterator::Grouped(s) => grouped_next(s),
            LazyIterator::Transpose(s) => transpose_next(s),
            LazyIterator::Stream(s) => stream_next(s),
        }
    }
}

fn array_len(a: &ArrayValue) -> usize {
    match &a.data {
        ArrayData::Bool(r) => r.borrow().len(),
        ArrayData::Byte(r) => r.borrow().len(),
        ArrayData::Int(r) => r.borrow().len(),
        ArrayData::Long(r) => r.borrow().len(),
        ArrayData::Double(r) => r.borrow().len(),
        ArrayData::Object(r) => r.borrow().len(),
    }
}

fn array_get(a: &ArrayValue, index: usize) -> RuntimeValue {
    match &a.data {
        ArrayData::Bool(r) => RuntimeValue::Bool(r.borrow()[index]),
        ArrayData::Byte(r) => RuntimeValue::Byte(r.borrow()[index]),
        ArrayData::Int(r) => RuntimeValue::Int(r.borrow()[index]),
        ArrayData::Long(r) => RuntimeValue::Long(r.borrow()[index]),
        ArrayData::Double(r) => RuntimeValue::Double(r.borrow()[index]),
        ArrayData::Object(r) => r.borrow()[index].clone(),
    }
}

fn string_split_has_next(s: &mut StringSplitState) -> Result<bool, EngineError> {
    if let Some(cached) = s.has_next_cached {
        return Ok(cached);
    }
    let has_more = !s.last;
    s.has_next_cached = Some(has_more);
    Ok(has_more)
}

fn string_split_next(s: &mut StringSplitState) -> Result<RuntimeValue, EngineError> {
    s.has_next_cached = None;
    let subject = s.matcher.subject.clone();
    if s.last {
        return Err(crate::error::InternalError::new("StringSplit exhausted").into());
    }
    match s.matcher.regex.find_at(&subject, s.matcher.last_end) {
        Some(m) if s.find_next => {
            let piece = subject[s.matcher.last_end..m.start()].to_string();
            s.matcher.last_end = m.end().max(m.start() + 1);
            if s.matcher.last_end >= subject.len() {
                s.last = true;
            }
            Ok(RuntimeValue::Str(Rc::from(piece)))
        }
        _ => {
            let piece = subject[s.matcher.last_end..].to_string();
            s.last = true;
            Ok(RuntimeValue::Str(Rc::from(piece)))
        }
    }
}

fn filter_has_next(s: &mut FilterState) -> Result<bool, EngineError> {
    if s.has_lookahead {
        return Ok(true);
    }
    while s.source.has_next()? {
        let candidate = s.source.next()?;
        let keep = match &s.closure {
            Some(f) => f(&candidate)?,
            None => candidate.is_truthy(),
        };
        if keep {
            s.lookahead = Some(candidate);
            s.has_lookahead = true;
            return Ok(true);
        }
    }
    Ok(false)
}

fn filter_next(s: &mut FilterState) -> Result<RuntimeValue, EngineError> {
    if !s.has_lookahead {
        filter_has_next(s)?;
    }
    s.has_lookahead = false;
    s.lookahead
        .take()
        .ok_or_else(|| crate::error::InternalError::new("Filter.next() called with nothing buffered").into())
}

fn map_next(s: &mut MapState) -> Result<RuntimeValue, EngineError> {
    let v = s.source.next()?;
    let mapped = (s.closure)(&v)?;
    if s.with_index {
        let idx = s.index;
        s.index += 1;
        Ok(RuntimeValue::List(Rc::new(RefCell::new(vec![
            mapped,
            RuntimeValue::Long(idx as i64),
        ]))))
    } else {
        Ok(mapped)
    }
}

fn flat_map_has_next(s: &mut FlatMapState) -> Result<bool, EngineError> {
    loop {
        if let Some(inner) = &mut s.inner {
            if inner.has_next()? {
                return Ok(true);
            }
            s.inner = None;
        }
        if !s.source.has_next()? {
            return Ok(false);
        }
        let elem = s.source.next()?;
        s.inner = Some(Box::new((s.closure)(&elem)?));
    }
}

fn flat_map_next(s: &mut FlatMapState) -> Result<RuntimeValue, EngineError> {
    if !flat_map_has_next(s)? {
        return Err(crate::error::InternalError::new("FlatMap.next() called at end of iteration").into());
    }
    s.inner
        .as_mut()
        .expect("flat_map_has_next populates inner when it returns true")
        .next()
}

fn unique_has_next(s: &mut UniqueState) -> Result<bool, EngineError> {
    s.source.has_next()
}

fn unique_next(s: &mut UniqueState) -> Result<RuntimeValue, EngineError> {
    loop {
        let candidate = s.source.next()?;
        let emit = s.first || !crate::value::runtime_eq(&candidate, s.previous.as_ref().unwrap());
        if emit {
            s.previous = Some(candidate.clone());
            s.first = false;
            return Ok(candidate);
        }
        if !s.source.has_next()? {
            return Ok(candidate);
        }
    }
}

fn negative_limit_has_next(s: &mut NegativeLimitState) -> Result<bool, EngineError> {
    negative_limit_pump(s)?;
    Ok(s.buffer.len() > s.n_abs)
}

fn negative_limit_pump(s: &mut NegativeLimitState) -> Result<(), EngineError> {
    while s.buffer.len() <= s.n_abs && !s.source_exhausted {
        if s.source.has_next()? {
            s.buffer.push_back(s.source.next()?);
        } else {
            s.source_exhausted = true;
        }
    }
    Ok(())
}

fn negative_limit_next(s: &mut NegativeLimitState) -> Result<RuntimeValue, EngineError> {
    negative_limit_pump(s)?;
    s.buffer
        .pop_front()
        .ok_or_else(|| crate::error::InternalError::new("NegativeLimit.next() called at end of iteration").into())
}

fn skip_ahead(s: &mut SkipState) -> Result<(), EngineError> {
    while s.skipped < s.n && s.source.has_next()? {
        s.source.next()?;
        s.skipped += 1;
    }
    Ok(())
}

fn negative_skip_has_next(s: &mut NegativeSkipState) -> Result<bool, EngineError> {
    negative_skip_pump(s)?;
    Ok(!s.buffer.is_empty())
}

fn negative_skip_pump(s: &mut NegativeSkipState) -> Result<(), EngineError> {
    if s.source_exhausted {
        return Ok(());
    }
    while s.source.has_next()? {
        s.buffer.push_back(s.source.next()?);
        if s.buffer.len() > s.n_abs {
            s.buffer.pop_front();
        }
    }
    s.source_exhausted = true;
    Ok(())
}

fn negative_skip_next(s: &mut NegativeSkipState) -> Result<RuntimeValue, EngineError> {
    negative_skip_pump(s)?;
    s.buffer
        .pop_front()
        .ok_or_else(|| crate::error::InternalError::new("NegativeSkip.next() called at end of iteration").into())
}

fn grouped_next(s: &mut GroupedState) -> Result<RuntimeValue, EngineError> {
    let mut group = Vec::with_capacity(s.size);
    while group.len() < s.size && s.source.has_next()? {
        group.push(s.source.next()?);
    }
    Ok(RuntimeValue::List(Rc::new(RefCell::new(group))))
}

fn transpose_next(s: &mut TransposeState) -> Result<RuntimeValue, EngineError> {
    let mut row = Vec::with_capacity(s.sources.len());
    for it in s.sources.iter_mut() {
        if it.has_next()? {
            row.push(it.next()?);
        } else {
            row.push(RuntimeValue::Null);
        }
    }
    Ok(RuntimeValue::List(Rc::new(RefCell::new(row))))
}

fn stream_has_next(s: &mut StreamState) -> Result<bool, EngineError> {
    if s.done {
        return Ok(false);
    }
    if s.cached_next.is_none() {
        let v = (s.closure)()?;
        if matches!(v, RuntimeValue::Null) {
            s.done = true;
            return Ok(false);
        }
        s.cached_next = Some(v);
    }
    Ok(true)
}

fn stream_next(s: &mut StreamState) -> Result<RuntimeValue, EngineError> {
    if s.cached_next.is_none() && !stream_has_next(s)? {
        return Err(crate::error::InternalError::new("Stream.next() called at end of iteration").into());
    }
    s.cached_next
        .take()
        .ok_or_else(|| crate::error::InternalError::new("Stream.next() called at end of iteration").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(values: Vec<i32>) -> LazyIterator {
        LazyIterator::list_source(Rc::new(RefCell::new(
            values.into_iter().map(RuntimeValue::Int).collect(),
        )))
    }

    fn drain(mut it: LazyIterator) -> Vec<RuntimeValue> {
        let mut out = Vec::new();
        while it.has_next().unwrap() {
            out.push(it.next().unwrap());
        }
        out
    }

    #[test]
    fn limit_zero_is_empty() {
        let it = LazyIterator::limit(list_of(vec![1, 2, 3]), 0);
        assert!(drain(it).is_empty());
    }

    #[test]
    fn skip_past_end_is_empty() {
        let it = LazyIterator::skip(list_of(vec![1, 2]), 10);
        assert!(drain(it).is_empty());
    }

    #[test]
    fn map_then_filter_matches_mid_consume_scenario() {
        let source = list_of(vec![10, 20, 30, 40, 50]);
        let mapped = LazyIterator::map(
            source,
            Rc::new(|v| {
                let RuntimeValue::Int(n) = v else { unreachable!() };
                Ok(RuntimeValue::Int(n + 1))
            }),
            "incr".to_string(),
            false,
        );
        let mut filtered = LazyIterator::filter(
            mapped,
            Some(Rc::new(|v| {
                let RuntimeValue::Int(n) = v else { unreachable!() };
                Ok(n % 2 == 1)
            })),
            Some("isOdd".to_string()),
        );
        assert!(filtered.has_next().unwrap());
        let first = filtered.next().unwrap();
        assert_eq!(first, RuntimeValue::Int(11));
        let rest = drain(filtered);
        assert_eq!(
            rest,
            vec![
                RuntimeValue::Int(21),
                RuntimeValue::Int(31),
                RuntimeValue::Int(41),
                RuntimeValue::Int(51),
            ]
        );
    }

    #[test]
    fn grouped_includes_final_partial_group() {
        let it = LazyIterator::grouped(list_of(vec![1, 2, 3, 4, 5]), 2);
        let groups = drain(it);
        assert_eq!(groups.len(), 3);
        let RuntimeValue::List(last) = &groups[2] else { unreachable!() };
        assert_eq!(last.borrow().len(), 1);
    }

    #[test]
    fn transpose_pads_ragged_rows_with_null() {
        let it = LazyIterator::transpose(vec![list_of(vec![1, 2]), list_of(vec![3, 4, 5])]);
        let rows = drain(it);
        assert_eq!(rows.len(), 3);
        let RuntimeValue::List(last) = &rows[2] else { unreachable!() };
        assert_eq!(last.borrow()[0], RuntimeValue::Null);
        assert_eq!(last.borrow()[1], RuntimeValue::Int(5));
    }

    #[test]
    fn unique_drops_consecutive_duplicates() {
        let it = LazyIterator::unique(list_of(vec![1, 1, 2, 2, 2, 3, 1]));
        let out = drain(it);
        assert_eq!(
            out,
            vec![
                RuntimeValue::Int(1),
                RuntimeValue::Int(2),
                RuntimeValue::Int(3),
                RuntimeValue::Int(1),
            ]
        );
    }

    #[test]
    fn negative_limit_drops_last_n_elements() {
        let it = LazyIterator::negative_limit(list_of(vec![1, 2, 3, 4, 5]), 2);
        let out = drain(it);
        assert_eq!(out, vec![RuntimeValue::Int(1), RuntimeValue::Int(2), RuntimeValue::Int(3)]);
    }

    #[test]
    fn negative_skip_keeps_only_last_n_elements() {
        let it = LazyIterator::negative_skip(list_of(vec![1, 2, 3, 4, 5]), 2);
        let out = drain(it);
        assert_eq!(out, vec![RuntimeValue::Int(4), RuntimeValue::Int(5)]);
    }

    #[test]
    fn has_next_is_idempotent_without_advancing() {
        let mut it = list_of(vec![1, 2]);
        assert!(it.has_next().unwrap());
        assert!(it.has_next().unwrap());
        assert_eq!(it.next().unwrap(), RuntimeValue::Int(1));
    }
}
