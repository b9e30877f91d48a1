//! Termination racing registrations and guarded executions across threads.

use lifetimes::test_utils::{block_on, init_test_logging};
use lifetimes::{
    ExecutionResult, LifetimeDefinition, LifetimeStatus, test_complete, test_phase, test_section,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const THREADS: usize = 10;
const PER_THREAD: usize = 1000;

#[test]
fn concurrent_registrations_all_run_exactly_once() {
    init_test_logging();
    test_phase!("concurrent_registrations_all_run_exactly_once");

    let def = LifetimeDefinition::new();
    let seen = Arc::new(Mutex::new(Vec::with_capacity(THREADS * PER_THREAD)));
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for t in 0..THREADS {
            let lifetime = def.lifetime();
            let seen = Arc::clone(&seen);
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let seen = Arc::clone(&seen);
                    lifetime
                        .on_termination(move || seen.lock().push(t * PER_THREAD + i))
                        .unwrap();
                }
            });
        }
    });

    def.terminate().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), THREADS * PER_THREAD);
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), THREADS * PER_THREAD, "no duplicates");
    test_complete!("concurrent_registrations_all_run_exactly_once", runs = seen.len());
}

#[test]
fn registrations_racing_termination_are_never_lost() {
    init_test_logging();
    test_phase!("registrations_racing_termination_are_never_lost");

    for round in 0..20 {
        test_section!(format!("round {round}"));
        let def = LifetimeDefinition::new();
        let accepted = Arc::new(AtomicUsize::new(0));
        let executed = Arc::new(AtomicUsize::new(0));
        let barrier = Barrier::new(THREADS + 1);

        thread::scope(|scope| {
            for _ in 0..THREADS {
                let lifetime = def.lifetime();
                let accepted = Arc::clone(&accepted);
                let executed = Arc::clone(&executed);
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    for _ in 0..PER_THREAD / 10 {
                        let executed = Arc::clone(&executed);
                        if lifetime.try_on_termination(move || {
                            executed.fetch_add(1, Ordering::SeqCst);
                        }) {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
            barrier.wait();
            def.terminate().unwrap();
        });

        assert_eq!(def.status(), LifetimeStatus::Terminated);
        assert_eq!(
            executed.load(Ordering::SeqCst),
            accepted.load(Ordering::SeqCst),
            "every accepted registration runs exactly once"
        );
    }
    test_complete!("registrations_racing_termination_are_never_lost");
}

#[test]
fn concurrent_async_termination_unwinds_once() {
    init_test_logging();
    test_phase!("concurrent_async_termination_unwinds_once");

    let def = LifetimeDefinition::new();
    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let runs = Arc::clone(&runs);
        def.lifetime()
            .on_termination(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    let barrier = Barrier::new(THREADS);

    let futures: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let def = def.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    def.terminate_async().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for future in futures {
        block_on(future);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 100);
    assert_eq!(def.status(), LifetimeStatus::Terminated);
    test_complete!("concurrent_async_termination_unwinds_once");
}

#[test]
fn concurrent_sync_termination_waits_for_the_unwinding_thread() {
    init_test_logging();
    test_phase!("concurrent_sync_termination_waits_for_the_unwinding_thread");

    let def = LifetimeDefinition::new();
    let released = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&released);
    def.lifetime()
        .on_termination(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
    let barrier = Barrier::new(4);

    thread::scope(|scope| {
        for _ in 0..4 {
            let def = def.clone();
            let released = Arc::clone(&released);
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                def.terminate().unwrap();
                assert!(
                    released.load(Ordering::SeqCst),
                    "terminate returns only after the stack has unwound"
                );
            });
        }
    });
    test_complete!("concurrent_sync_termination_waits_for_the_unwinding_thread");
}

#[test]
fn termination_waits_for_running_executions() {
    init_test_logging();
    test_phase!("termination_waits_for_running_executions");

    let def = LifetimeDefinition::new();
    let lifetime = def.lifetime();
    let finished = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(Barrier::new(2));

    let flag = Arc::clone(&finished);
    let seen = Arc::clone(&observed);
    def.lifetime()
        .on_termination(move || seen.store(flag.load(Ordering::SeqCst), Ordering::SeqCst))
        .unwrap();

    let worker = {
        let finished = Arc::clone(&finished);
        let entered = Arc::clone(&entered);
        thread::spawn(move || {
            lifetime.execute(|| {
                entered.wait();
                thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
            })
        })
    };

    entered.wait();
    def.terminate().unwrap();

    assert!(worker.join().unwrap().is_ok());
    assert!(
        observed.load(Ordering::SeqCst),
        "cleanup ran after the guarded execution finished"
    );
    test_complete!("termination_waits_for_running_executions");
}

#[test]
fn executions_racing_termination_never_overlap_cleanup() {
    init_test_logging();
    test_phase!("executions_racing_termination_never_overlap_cleanup");

    let def = LifetimeDefinition::new();
    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cleaned);
    def.lifetime()
        .on_termination(move || flag.store(true, Ordering::SeqCst))
        .unwrap();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let succeeded = Arc::new(AtomicUsize::new(0));
    let canceled = Arc::new(AtomicUsize::new(0));
    let barrier = Barrier::new(THREADS + 1);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let lifetime = def.lifetime();
            let cleaned = Arc::clone(&cleaned);
            let overlaps = Arc::clone(&overlaps);
            let succeeded = Arc::clone(&succeeded);
            let canceled = Arc::clone(&canceled);
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for _ in 0..PER_THREAD {
                    let cleaned = Arc::clone(&cleaned);
                    let overlaps = Arc::clone(&overlaps);
                    match lifetime.try_execute(
                        move || {
                            if cleaned.load(Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                        },
                        false,
                    ) {
                        ExecutionResult::Succeed(()) => succeeded.fetch_add(1, Ordering::SeqCst),
                        ExecutionResult::Canceled(_) => canceled.fetch_add(1, Ordering::SeqCst),
                        ExecutionResult::FailedNotCanceled(failure) => {
                            unreachable!("unexpected failure: {failure}")
                        }
                    };
                }
            });
        }
        barrier.wait();
        thread::sleep(Duration::from_millis(1));
        def.terminate().unwrap();
    });

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(
        succeeded.load(Ordering::SeqCst) + canceled.load(Ordering::SeqCst),
        THREADS * PER_THREAD
    );
    test_complete!(
        "executions_racing_termination_never_overlap_cleanup",
        succeeded = succeeded.load(Ordering::SeqCst),
        canceled = canceled.load(Ordering::SeqCst),
    );
}

#[test]
fn nested_creation_racing_termination_leaves_no_live_children() {
    init_test_logging();
    test_phase!("nested_creation_racing_termination_leaves_no_live_children");

    let def = LifetimeDefinition::new();
    let children = Arc::new(Mutex::new(Vec::new()));
    let barrier = Barrier::new(THREADS + 1);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let lifetime = def.lifetime();
            let children = Arc::clone(&children);
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for _ in 0..100 {
                    let child = lifetime.create_nested();
                    children.lock().push(child);
                }
            });
        }
        barrier.wait();
        def.terminate().unwrap();
    });

    let children = children.lock();
    assert_eq!(children.len(), THREADS * 100);
    assert!(
        children
            .iter()
            .all(|child| child.status() == LifetimeStatus::Terminated),
        "children created during termination end terminated"
    );
    test_complete!("nested_creation_racing_termination_leaves_no_live_children");
}

#[test]
fn cancellation_tokens_requested_concurrently_fire_together() {
    init_test_logging();
    test_phase!("cancellation_tokens_requested_concurrently_fire_together");

    let def = LifetimeDefinition::new();
    let barrier = Barrier::new(THREADS + 1);
    let tokens = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let lifetime = def.lifetime();
            let barrier = &barrier;
            let tokens = &tokens;
            scope.spawn(move || {
                barrier.wait();
                let token = lifetime.to_cancellation_token();
                tokens.lock().push(token);
            });
        }
        barrier.wait();
        def.terminate().unwrap();
    });

    let tokens = tokens.into_inner();
    assert_eq!(tokens.len(), THREADS);
    assert!(tokens.iter().all(lifetimes::CancellationToken::is_cancelled));
    test_complete!("cancellation_tokens_requested_concurrently_fire_together");
}

#[test]
fn sync_termination_waits_for_parked_async_unwinding() {
    init_test_logging();
    test_phase!("sync_termination_waits_for_parked_async_unwinding");

    let parent = LifetimeDefinition::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&order);
    parent
        .lifetime()
        .on_termination(move || log.lock().push("parent"))
        .unwrap();
    let child = parent.lifetime().create_nested();
    let log = Arc::clone(&order);
    child
        .lifetime()
        .on_termination(move || log.lock().push("child"))
        .unwrap();

    let entered = Barrier::new(2);
    let leave = Arc::new(AtomicBool::new(false));
    let returned = Arc::new(AtomicBool::new(false));

    thread::scope(|scope| {
        let child_lifetime = child.lifetime();
        let entered = &entered;
        let worker_leave = Arc::clone(&leave);
        scope.spawn(move || {
            child_lifetime
                .execute(|| {
                    entered.wait();
                    while !worker_leave.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                })
                .unwrap();
        });
        entered.wait();

        let future = parent.terminate_async().unwrap();
        assert!(!future.is_complete(), "unwinding parks on the busy child");

        test_section!("sync terminate while parked");
        let terminator = {
            let parent = parent.clone();
            let order = Arc::clone(&order);
            let returned = Arc::clone(&returned);
            scope.spawn(move || {
                parent.terminate().unwrap();
                returned.store(true, Ordering::SeqCst);
                (parent.status(), order.lock().clone())
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(
            !returned.load(Ordering::SeqCst),
            "terminate must not return while the parent is still unwinding"
        );
        leave.store(true, Ordering::SeqCst);

        let (status, seen) = terminator.join().unwrap();
        assert_eq!(status, LifetimeStatus::Terminated);
        assert_eq!(seen, vec!["child", "parent"]);
    });
    test_complete!("sync_termination_waits_for_parked_async_unwinding");
}
