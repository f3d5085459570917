//! Pool contract, checked against every strategy.

use std::{
    num::NonZeroUsize,
    sync::{mpsc, Arc, Barrier},
    thread,
    time::{Duration, Instant},
};

use slotpool::{
    sim::{Conn, Dialer, SimError},
    CancelToken, Error, Pool, PoolConfig, PoolExt, Resource, SharedPool, Strategy,
};
use tracing_subscriber::EnvFilter;

/// Time after which a blocked call is considered stuck.
const STUCK: Duration = Duration::from_millis(150);
/// Upper bound for a call which is expected to return.
const PROMPT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn make_pool(strategy: Strategy, size: usize) -> (SharedPool<Conn, SimError>, Dialer) {
    init_logging();
    let dialer = Dialer::new();
    let size = NonZeroUsize::new(size).expect("pool size must be positive");
    let pool = PoolConfig::with_size(size)
        .strategy(strategy)
        .name(format!("test-{strategy}"))
        .build(dialer.clone());
    (pool, dialer)
}

/// Serial acquire and release reuses a single resource.
fn serial_reuse(strategy: Strategy) {
    let (pool, dialer) = make_pool(strategy, 3);
    for _ in 0..10 {
        let conn = pool.acquire().unwrap();
        assert_eq!(conn.id(), 0);
        pool.release(conn);
    }
    assert_eq!(dialer.ledger().dialed(), 1);
    let state = pool.state();
    assert_eq!(state.idle, 1);
    assert_eq!(state.in_use, 0);
    assert_eq!(state.max_size, 3);
}

/// Concurrent callers create no more resources than they hold at once.
fn no_over_creation(strategy: Strategy) {
    const CALLERS: usize = 3;
    const ROUNDS: usize = 4;
    let (pool, dialer) = make_pool(strategy, 5);
    let barrier = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let conn = pool.acquire().unwrap();
                    // Everyone holds a resource at this point.
                    barrier.wait();
                    pool.release(conn);
                    // Everyone has released before anyone acquires again.
                    barrier.wait();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(dialer.ledger().dialed(), CALLERS as u64);
    assert_eq!(pool.state().idle, CALLERS);
}

/// With a single slot, second caller waits for the first one to release.
fn blocks_until_released(strategy: Strategy) {
    let (pool, _dialer) = make_pool(strategy, 1);
    let conn = pool.acquire().unwrap();
    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            let res = pool.acquire().map(|c| c.id());
            tx.send(res).unwrap();
        })
    };
    assert!(rx.recv_timeout(STUCK).is_err());
    pool.release(conn);
    assert_eq!(rx.recv_timeout(PROMPT).unwrap().unwrap(), 0);
    waiter.join().unwrap();
}

/// Fired cancellation does not consume a slot.
fn cancel_does_not_leak(strategy: Strategy) {
    let (pool, _dialer) = make_pool(strategy, 2);
    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    let started = Instant::now();
    assert!(matches!(
        pool.acquire_with(&CancelToken::cancelled()),
        Err(Error::Cancelled)
    ));
    assert!(started.elapsed() < STUCK);
    assert!(matches!(pool.try_acquire(), Err(Error::WouldBlock)));
    let started = Instant::now();
    assert!(matches!(
        pool.acquire_timeout(Duration::from_millis(50)),
        Err(Error::Cancelled)
    ));
    assert!(started.elapsed() >= Duration::from_millis(50));
    pool.release(first);
    let third = pool.acquire_with(&CancelToken::cancelled()).unwrap();
    assert_eq!(pool.state().in_use, 2);
    pool.release(second);
    pool.release(third);
    assert_eq!(pool.state().in_use, 0);
}

/// Manual cancellation wakes a blocked caller.
fn cancel_wakes_waiter(strategy: Strategy) {
    let (pool, _dialer) = make_pool(strategy, 1);
    let conn = pool.acquire().unwrap();
    let token = CancelToken::new();
    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = pool.clone();
        let token = token.clone();
        thread::spawn(move || {
            tx.send(pool.acquire_with(&token).map(|c| c.id())).unwrap();
        })
    };
    assert!(rx.recv_timeout(STUCK).is_err());
    token.cancel();
    assert!(matches!(
        rx.recv_timeout(PROMPT).unwrap(),
        Err(Error::Cancelled)
    ));
    waiter.join().unwrap();
    pool.release(conn);
    assert!(pool.try_acquire().is_ok());
}

/// Shutdown waits for every acquired resource, then closes everything.
fn shutdown_drains_and_blocks(strategy: Strategy) {
    let (pool, dialer) = make_pool(strategy, 2);
    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    let (tx, rx) = mpsc::channel();
    let closer = {
        let pool = pool.clone();
        thread::spawn(move || {
            pool.shutdown();
            tx.send(()).unwrap();
        })
    };
    assert!(rx.recv_timeout(STUCK).is_err());
    pool.release(first);
    assert!(rx.recv_timeout(STUCK).is_err());
    pool.release(second);
    rx.recv_timeout(PROMPT).unwrap();
    closer.join().unwrap();

    let ledger = dialer.ledger();
    assert_eq!(ledger.dialed(), 2);
    assert_eq!(ledger.closed(), 2);
    assert!(ledger.double_closed().is_empty());
    let state = pool.state();
    assert!(state.closed);
    assert_eq!(state.idle, 0);
    assert!(matches!(pool.acquire(), Err(Error::PoolClosed)));
    assert!(matches!(pool.try_acquire(), Err(Error::PoolClosed)));
}

/// Idle resources are closed by shutdown without waiting.
fn shutdown_closes_idle(strategy: Strategy) {
    let (pool, dialer) = make_pool(strategy, 3);
    let conns: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
    for conn in conns {
        pool.release(conn);
    }
    assert_eq!(pool.state().idle, 3);
    pool.shutdown();
    let ledger = dialer.ledger();
    assert_eq!(ledger.closed(), 3);
    assert!(ledger.double_closed().is_empty());
    assert_eq!(pool.state().idle, 0);
}

/// Shutdown wakes callers blocked on an exhausted pool.
fn shutdown_wakes_waiters(strategy: Strategy) {
    let (pool, dialer) = make_pool(strategy, 1);
    let conn = pool.acquire().unwrap();
    let (tx, rx) = mpsc::channel();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                tx.send(pool.acquire().map(|c| c.id())).unwrap();
            })
        })
        .collect();
    assert!(rx.recv_timeout(STUCK).is_err());
    let closer = {
        let pool = pool.clone();
        thread::spawn(move || pool.shutdown())
    };
    for _ in 0..3 {
        assert!(matches!(
            rx.recv_timeout(PROMPT).unwrap(),
            Err(Error::PoolClosed)
        ));
    }
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert!(!closer.is_finished());
    pool.release(conn);
    closer.join().unwrap();
    assert_eq!(dialer.ledger().close_count(0), 1);
}

/// Broken resources are closed and never handed out again.
fn broken_discarded(strategy: Strategy) {
    let (pool, dialer) = make_pool(strategy, 1);
    let mut conn = pool.acquire().unwrap();
    assert_eq!(conn.id(), 0);
    conn.mark_broken();
    pool.release(conn);
    let ledger = dialer.ledger();
    assert_eq!(ledger.close_count(0), 1);
    assert_eq!(pool.state().idle, 0);
    let conn = pool.acquire().unwrap();
    assert_eq!(conn.id(), 1);
    assert!(!conn.is_closed());
    pool.release(conn);
    assert_eq!(ledger.dialed(), 2);
}

/// Failed creation gives the slot back.
fn creation_failure_returns_slot(strategy: Strategy) {
    let (pool, dialer) = make_pool(strategy, 2);
    dialer.refuse(true);
    for _ in 0..5 {
        match pool.acquire() {
            Err(Error::Create(SimError::Refused)) => {}
            other => panic!("unexpected acquisition result: {other:?}"),
        }
    }
    assert_eq!(pool.state().in_use, 0);
    dialer.refuse(false);
    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    assert!(matches!(pool.try_acquire(), Err(Error::WouldBlock)));
    pool.release(first);
    pool.release(second);
}

/// Failed creation wakes a caller waiting for the claimed slot.
fn creation_failure_wakes_waiter(strategy: Strategy) {
    let (pool, dialer) = make_pool(strategy, 1);
    dialer.refuse(true);
    dialer.set_delay(Duration::from_millis(200));
    let failing = {
        let pool = pool.clone();
        thread::spawn(move || pool.acquire().map(|c| c.id()))
    };
    // Let the first caller claim the only slot, then queue up behind it.
    thread::sleep(Duration::from_millis(50));
    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            tx.send(pool.acquire_timeout(PROMPT).map(|c| c.id())).unwrap();
        })
    };
    thread::sleep(Duration::from_millis(50));
    dialer.refuse(false);
    dialer.set_delay(Duration::ZERO);
    assert!(matches!(
        failing.join().unwrap(),
        Err(Error::Create(SimError::Refused))
    ));
    assert_eq!(rx.recv_timeout(PROMPT).unwrap().unwrap(), 0);
    waiter.join().unwrap();
}

/// Shutdown may be called repeatedly and concurrently.
fn idempotent_shutdown(strategy: Strategy) {
    let (pool, dialer) = make_pool(strategy, 2);
    let conn = pool.acquire().unwrap();
    let closers: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || pool.shutdown())
        })
        .collect();
    thread::sleep(STUCK);
    pool.release(conn);
    for closer in closers {
        closer.join().unwrap();
    }
    pool.shutdown();
    pool.shutdown();
    let ledger = dialer.ledger();
    assert_eq!(ledger.closed(), 1);
    assert!(ledger.double_closed().is_empty());
}

/// Live resources never exceed pool size under contention.
fn capacity_under_contention(strategy: Strategy) {
    const SIZE: usize = 3;
    let (pool, dialer) = make_pool(strategy, SIZE);
    let ledger = dialer.ledger();
    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let pool = pool.clone();
            let ledger = ledger.clone();
            thread::spawn(move || {
                for round in 0..100 {
                    let mut conn = pool.acquire().unwrap();
                    let live = (ledger.dialed() as usize).saturating_sub(ledger.closed());
                    assert!(live <= SIZE, "{live} live resources in pool of {SIZE}");
                    if (worker + round) % 7 == 0 {
                        conn.mark_broken();
                    }
                    pool.release(conn);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    pool.shutdown();
    assert_eq!(ledger.dialed() as usize, ledger.closed());
    assert!(ledger.double_closed().is_empty());
}

/// Guard releases on drop, detached resources stay acquired.
fn guard_release(strategy: Strategy) {
    let (pool, _dialer) = make_pool(strategy, 1);
    {
        let conn = pool.get().unwrap();
        assert_eq!(conn.id(), 0);
        assert!(matches!(pool.try_acquire(), Err(Error::WouldBlock)));
    }
    let conn = pool.get_timeout(PROMPT).unwrap().detach();
    assert!(matches!(
        pool.get_with(&CancelToken::cancelled()),
        Err(Error::Cancelled)
    ));
    pool.release(conn);
    assert_eq!(pool.state().idle, 1);
}

/// Configured timeout bounds plain acquisition.
fn configured_timeout(strategy: Strategy) {
    init_logging();
    let pool = PoolConfig::with_size(NonZeroUsize::MIN)
        .strategy(strategy)
        .acquire_timeout(Duration::from_millis(50))
        .build(Dialer::new());
    assert_eq!(pool.strategy(), strategy);
    assert_eq!(pool.name(), "default");
    let conn = pool.acquire().unwrap();
    assert!(matches!(pool.acquire(), Err(Error::Cancelled)));
    pool.release(conn);
    assert!(pool.acquire().is_ok());
}

macro_rules! contract {
    ($($test:ident),* $(,)?) => {
        mod condvar {
            $(
                #[test]
                fn $test() {
                    super::$test(super::Strategy::Condvar);
                }
            )*
        }

        mod semaphore {
            $(
                #[test]
                fn $test() {
                    super::$test(super::Strategy::Semaphore);
                }
            )*
        }

        mod token {
            $(
                #[test]
                fn $test() {
                    super::$test(super::Strategy::Token);
                }
            )*
        }
    };
}

contract!(
    serial_reuse,
    no_over_creation,
    blocks_until_released,
    cancel_does_not_leak,
    cancel_wakes_waiter,
    shutdown_drains_and_blocks,
    shutdown_closes_idle,
    shutdown_wakes_waiters,
    broken_discarded,
    creation_failure_returns_slot,
    creation_failure_wakes_waiter,
    idempotent_shutdown,
    capacity_under_contention,
    guard_release,
    configured_timeout,
);
