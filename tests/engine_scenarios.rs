//! Integration tests exercising the suspension/resumption engine end to
//! end: iterator state surviving a checkpoint round trip mid-consumption,
//! and a continuation chain carrying a blocking suspension through to its
//! final arithmetic result.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use susprun_core::async_task::AsyncTask;
use susprun_core::codec;
use susprun_core::continuation::{resume_chain, suspend_blocking, ContinuationFrame, ResumeTable, RunOutcome, StepOutcome};
use susprun_core::handle::{HandleRegistry, MethodHandle, WrapperHandle};
use susprun_core::iterator::{ClosureRegistry, LazyIterator};
use susprun_core::registry::TypeRegistry;
use susprun_core::runtime_state::RuntimeStateSnapshot;
use susprun_core::scheduler::{LocalScheduler, Scheduler};
use susprun_core::value::RuntimeValue;

fn list_of(values: Vec<i32>) -> LazyIterator {
    LazyIterator::list_source(Rc::new(RefCell::new(
        values.into_iter().map(RuntimeValue::Int).collect(),
    )))
}

fn resume_handle(name: &str) -> MethodHandle {
    MethodHandle::Wrapper(WrapperHandle {
        owner_type: None,
        function_name: name.to_string(),
    })
}

/// Source `[10,20,30,40,50]` mapped by `+1` then filtered for odd values,
/// advanced once, checkpointed, restored, and driven to completion. The
/// restored iterator must continue exactly where the original left off.
#[test]
fn iterator_mid_consume_checkpoint_round_trips_remaining_elements() {
    let registry = TypeRegistry::new();
    let closures = ClosureRegistry::new();
    closures.register_map(
        "incr",
        Rc::new(|v| {
            let RuntimeValue::Int(n) = v else { unreachable!() };
            Ok(RuntimeValue::Int(n + 1))
        }),
    );
    closures.register_predicate(
        "isOdd",
        Rc::new(|v| {
            let RuntimeValue::Int(n) = v else { unreachable!() };
            Ok(n % 2 == 1)
        }),
    );

    let mapped = LazyIterator::map(
        list_of(vec![10, 20, 30, 40, 50]),
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

    let root = RuntimeValue::Iterator(Rc::new(RefCell::new(filtered)));
    let bytes = codec::checkpoint(&root, &registry);
    let restored = codec::restore(&bytes, &registry, &closures).unwrap();

    let RuntimeValue::Iterator(restored_it) = restored else {
        panic!("expected an iterator");
    };
    let mut remaining = Vec::new();
    while restored_it.borrow_mut().has_next().unwrap() {
        remaining.push(restored_it.borrow_mut().next().unwrap());
    }
    assert_eq!(
        remaining,
        vec![
            RuntimeValue::Int(21),
            RuntimeValue::Int(31),
            RuntimeValue::Int(41),
            RuntimeValue::Int(51),
        ]
    );
}

/// A script computing `3 + blocking() + 5` suspends mid-expression on the
/// blocking call; the call returns `7` off-thread, and resumption must
/// produce `15`.
#[tokio::test]
async fn blocking_suspend_resumes_to_correct_arithmetic_result() {
    let table = ResumeTable::new();
    table.register(
        "compute",
        Rc::new(|frame: &mut ContinuationFrame| -> StepOutcome {
            match frame.method_location {
                1 => {
                    let n = match &frame.result {
                        Some(Ok(RuntimeValue::Long(n))) => *n,
                        _ => panic!("expected a successful long result from the blocking call"),
                    };
                    StepOutcome::Done(RuntimeValue::Long(3 + n + 5))
                }
                other => panic!("unexpected resume location {other}"),
            }
        }),
    );

    let task = AsyncTask::blocking(
        "test.script",
        12,
        vec![],
        RuntimeStateSnapshot::default(),
        Rc::new(|_data| {
            std::thread::sleep(Duration::from_millis(10));
            Ok(RuntimeValue::Long(7))
        }),
    );
    let leaf = suspend_blocking(resume_handle("compute"), 1, vec![], task);

    let async_task = susprun_core::continuation::find_async_task(&leaf)
        .expect("the leaf frame carries the async task it suspended with");
    let scheduler = LocalScheduler::default();
    let result = match async_task {
        AsyncTask::Blocking(b) => scheduler.schedule_blocking(b).await,
        _ => panic!("expected a blocking task"),
    };

    let handle_registry = HandleRegistry::new();
    let outcome = resume_chain(leaf, result, &table, &handle_registry);
    match outcome {
        RunOutcome::Completed(RuntimeValue::Long(n)) => assert_eq!(n, 15),
        RunOutcome::Completed(other) => panic!("expected Long(15), got {other:?}"),
        RunOutcome::Suspended(_) => panic!("expected completion, got another suspension"),
        RunOutcome::Failed(e) => panic!("resume chain failed: {e}"),
    }
}
