//! Teardown ordering across nested lifetimes.

use lifetimes::test_utils::init_test_logging;
use lifetimes::{Lifetime, LifetimeDefinition, LifetimeStatus, test_complete, test_phase};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let push = move |value: u32| -> Box<dyn FnOnce() + Send> {
        let sink = Arc::clone(&sink);
        Box::new(move || sink.lock().push(value))
    };
    (log, push)
}

#[test]
fn nested_lifetime_unwinds_between_parent_entries() {
    init_test_logging();
    test_phase!("nested_lifetime_unwinds_between_parent_entries");

    let (log, push) = recorder();
    let parent = LifetimeDefinition::new();
    parent.lifetime().on_termination(push(1)).unwrap();
    let nested = parent.lifetime().create_nested();
    nested.lifetime().on_termination(push(2)).unwrap();
    parent.lifetime().on_termination(push(3)).unwrap();

    parent.terminate().unwrap();

    assert_eq!(*log.lock(), vec![3, 2, 1]);
    assert_eq!(nested.status(), LifetimeStatus::Terminated);
    test_complete!("nested_lifetime_unwinds_between_parent_entries");
}

#[test]
fn deep_nesting_unwinds_innermost_last_registered_first() {
    init_test_logging();
    test_phase!("deep_nesting_unwinds_innermost_last_registered_first");

    let (log, push) = recorder();
    let root = LifetimeDefinition::new();
    let mut current = root.lifetime();
    let mut nested = Vec::new();
    for depth in 0..5 {
        current.on_termination(push(depth * 10)).unwrap();
        let child = current.create_nested();
        current.on_termination(push(depth * 10 + 1)).unwrap();
        current = child.lifetime();
        nested.push(child);
    }

    root.terminate().unwrap();

    assert_eq!(
        *log.lock(),
        vec![1, 11, 21, 31, 41, 40, 30, 20, 10, 0],
        "each level releases its later entry, then its child, then its earlier entry"
    );
    assert!(nested.iter().all(|def| def.status() == LifetimeStatus::Terminated));
    test_complete!("deep_nesting_unwinds_innermost_last_registered_first");
}

#[test]
fn terminating_child_first_leaves_parent_order_intact() {
    init_test_logging();
    test_phase!("terminating_child_first_leaves_parent_order_intact");

    let (log, push) = recorder();
    let parent = LifetimeDefinition::new();
    parent.lifetime().on_termination(push(1)).unwrap();
    let child = parent.lifetime().create_nested();
    child.lifetime().on_termination(push(2)).unwrap();
    parent.lifetime().on_termination(push(3)).unwrap();

    child.terminate().unwrap();
    assert_eq!(*log.lock(), vec![2]);

    parent.terminate().unwrap();
    assert_eq!(*log.lock(), vec![2, 3, 1]);
    test_complete!("terminating_child_first_leaves_parent_order_intact");
}

#[test]
fn terminate_is_idempotent() {
    init_test_logging();
    test_phase!("terminate_is_idempotent");

    let runs = Arc::new(AtomicUsize::new(0));
    let def = LifetimeDefinition::new();
    let counter = Arc::clone(&runs);
    def.lifetime()
        .on_termination(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    for _ in 0..3 {
        def.terminate().unwrap();
    }
    let future = def.terminate_async().unwrap();
    assert!(future.is_complete());

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    test_complete!("terminate_is_idempotent");
}

#[test]
fn panicking_action_does_not_stop_unwinding() {
    init_test_logging();
    test_phase!("panicking_action_does_not_stop_unwinding");

    let (log, push) = recorder();
    let def = LifetimeDefinition::new();
    def.lifetime().on_termination(push(1)).unwrap();
    def.lifetime()
        .on_termination(|| panic!("cleanup failed"))
        .unwrap();
    def.lifetime().on_termination(push(3)).unwrap();

    def.terminate().unwrap();

    assert_eq!(*log.lock(), vec![3, 1]);
    assert_eq!(def.status(), LifetimeStatus::Terminated);
    test_complete!("panicking_action_does_not_stop_unwinding");
}

#[test]
fn action_terminating_its_own_lifetime_runs_once() {
    init_test_logging();
    test_phase!("action_terminating_its_own_lifetime_runs_once");

    let runs = Arc::new(AtomicUsize::new(0));
    let def = LifetimeDefinition::new();
    let reentrant = def.clone();
    let counter = Arc::clone(&runs);
    def.lifetime()
        .on_termination(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            reentrant.terminate().unwrap();
            let _ = reentrant.terminate_async().unwrap();
        })
        .unwrap();

    def.terminate().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(def.status(), LifetimeStatus::Terminated);
    test_complete!("action_terminating_its_own_lifetime_runs_once");
}

#[test]
fn action_terminating_an_ancestor_does_not_rerun_cleanup() {
    init_test_logging();
    test_phase!("action_terminating_an_ancestor_does_not_rerun_cleanup");

    let (log, push) = recorder();
    let parent = LifetimeDefinition::new();
    parent.lifetime().on_termination(push(1)).unwrap();
    let child = parent.lifetime().create_nested();
    let ancestor = parent.clone();
    let sink = Arc::clone(&log);
    child
        .lifetime()
        .on_termination(move || {
            sink.lock().push(2);
            ancestor.terminate().unwrap();
        })
        .unwrap();

    parent.terminate().unwrap();

    assert_eq!(*log.lock(), vec![2, 1]);
    test_complete!("action_terminating_an_ancestor_does_not_rerun_cleanup");
}

#[test]
fn registrations_are_rejected_once_terminated() {
    init_test_logging();
    test_phase!("registrations_are_rejected_once_terminated");

    let def = LifetimeDefinition::new();
    let lifetime = def.lifetime();
    def.terminate().unwrap();

    assert!(lifetime.on_termination(|| {}).is_err());
    assert!(!lifetime.try_on_termination(|| {}));
    assert!(!lifetime.try_keep_alive(vec![1_u8, 2, 3]));
    let nested = lifetime.create_nested();
    assert_eq!(nested.status(), LifetimeStatus::Terminated);
    test_complete!("registrations_are_rejected_once_terminated");
}

#[test]
fn using_terminates_even_when_the_body_panics() {
    init_test_logging();
    test_phase!("using_terminates_even_when_the_body_panics");

    let captured = Arc::new(Mutex::new(None::<Lifetime>));
    let slot = Arc::clone(&captured);
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
        Lifetime::using::<()>(|lifetime| {
            *slot.lock() = Some(lifetime.clone());
            panic!("body failed");
        });
    }));

    assert!(outcome.is_err());
    let lifetime = captured.lock().take().unwrap();
    assert_eq!(lifetime.status(), LifetimeStatus::Terminated);
    test_complete!("using_terminates_even_when_the_body_panics");
}
