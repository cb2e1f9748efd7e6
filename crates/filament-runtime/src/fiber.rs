//! Stackful fibers
//!
//! A `Fiber` is a schedulable unit: an owned guard-paged stack, a saved
//! machine context, a user callback and a lifecycle state. `resume`
//! transfers control into the fiber; `yield_now` transfers control back
//! to either the thread-main fiber or the worker's scheduler fiber,
//! selected by `run_in_scheduler`.
//!
//! Each OS thread lazily materializes a *thread-main* fiber for its
//! original stack the first time `Fiber::current()` runs there. The
//! thread-main fiber owns no stack buffer and never terminates.

use crate::arch::{self, Registers};
use crate::stack::Stack;
use crate::tls;
use filament_core::kerror;
use filament_core::state::FiberState;
use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Default usable stack size per fiber
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// A cooperatively-scheduled execution context with its own stack
pub struct Fiber {
    id: u64,
    /// Yield target selector: scheduler fiber (true) or thread main (false)
    run_in_scheduler: bool,
    state: AtomicU8,
    panicked: AtomicBool,
    regs: UnsafeCell<Registers>,
    /// None only for thread-main fibers
    stack: Option<Stack>,
    /// Cleared before the terminating yield so a self-referential closure
    /// cannot outlive the fiber
    cb: Mutex<Option<FiberFn>>,
    /// Back-reference to the owning Arc, for installing this fiber as
    /// the thread's current one on resume
    me: OnceLock<Weak<Fiber>>,
}

// A fiber is Running on at most one thread at a time; `regs` is only
// touched by the thread performing the switch, and `cb` is mutex-guarded.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `cb` on a fresh stack.
    ///
    /// `stack_size == 0` selects [`DEFAULT_STACK_SIZE`]. With
    /// `run_in_scheduler` set, `yield_now` returns control to the
    /// worker's scheduler fiber instead of the thread-main fiber.
    pub fn new(
        cb: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let stack = Stack::new(size).expect("fiber stack allocation failed");

        let fiber = Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler,
            state: AtomicU8::new(FiberState::Ready as u8),
            panicked: AtomicBool::new(false),
            regs: UnsafeCell::new(Registers::zeroed()),
            stack: Some(stack),
            cb: Mutex::new(Some(Box::new(cb))),
            me: OnceLock::new(),
        };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        unsafe {
            arch::init_context(
                fiber.regs.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_entry as usize,
                0,
            );
        }
        let fiber = Arc::new(fiber);
        let _ = fiber.me.set(Arc::downgrade(&fiber));
        fiber
    }

    /// The implicit fiber for an OS thread's original stack
    fn new_main() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler: false,
            state: AtomicU8::new(FiberState::Running as u8),
            panicked: AtomicBool::new(false),
            regs: UnsafeCell::new(Registers::zeroed()),
            stack: None,
            cb: Mutex::new(None),
            me: OnceLock::new(),
        });
        let _ = fiber.me.set(Arc::downgrade(&fiber));
        fiber
    }

    /// The fiber currently executing on this thread.
    ///
    /// On first use per thread this installs the thread-main fiber into
    /// the per-thread registers (`current`, `thread_main`, and the
    /// `scheduler_fiber` default).
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current() {
            return f;
        }
        let main = Fiber::new_main();
        tls::set_current(main.clone());
        tls::set_thread_main(main.clone());
        if tls::scheduler_fiber().is_none() {
            tls::set_scheduler_fiber(Some(main.clone()));
        }
        main
    }

    /// The current fiber if this thread has one
    pub fn try_current() -> Option<Arc<Fiber>> {
        tls::current()
    }

    /// Id of the current fiber, `u64::MAX` when the thread has none yet
    pub fn current_id() -> u64 {
        tls::current().map(|f| f.id).unwrap_or(u64::MAX)
    }

    /// Number of live fibers across the process (thread-main included)
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the callback panicked; the fiber still terminated normally
    pub fn panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Rearm a terminated fiber with a new callback, reusing its stack.
    ///
    /// Only legal in `Term` state on a fiber that owns a stack.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) {
        assert!(
            self.stack.is_some() && self.state() == FiberState::Term,
            "reset() requires a terminated fiber with an owned stack"
        );
        *self.cb.lock().unwrap() = Some(Box::new(cb));
        self.panicked.store(false, Ordering::Release);

        unsafe {
            arch::init_context(
                self.regs.get(),
                self.stack.as_ref().unwrap().top(),
                fiber_entry as usize,
                0,
            );
        }
        self.set_state(FiberState::Ready);
    }

    /// Make this fiber the current one on the calling thread.
    ///
    /// Control returns to the caller only when the fiber yields or
    /// terminates. The caller's context is saved into the parent slot the
    /// fiber will later yield to.
    pub fn resume(&self) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume() on a fiber that is not READY"
        );
        self.set_state(FiberState::Running);

        // Materialize the thread registers before the first switch
        let _ = Fiber::current();
        let parent = self.parent_fiber();
        let me = self
            .me
            .get()
            .and_then(|w| w.upgrade())
            .expect("resume() on a fiber with no live handle");
        debug_assert!(!Arc::ptr_eq(&parent, &me), "fiber cannot resume itself");

        tls::set_current(me);
        unsafe {
            arch::context_switch(parent.regs.get(), self.regs.get());
        }
    }

    /// Give up the thread: switch back to the parent context.
    ///
    /// A `Running` fiber becomes `Ready` (stack preserved, resumable); a
    /// `Term` fiber stays terminated and is never switched into again.
    pub fn yield_now(&self) {
        let state = self.state();
        assert!(
            state == FiberState::Running || state == FiberState::Term,
            "yield_now() on a fiber that is not running"
        );
        if state != FiberState::Term {
            self.set_state(FiberState::Ready);
        }

        let parent = self.parent_fiber();
        tls::set_current(parent.clone());
        unsafe {
            arch::context_switch(self.regs.get(), parent.regs.get());
        }
    }

    fn parent_fiber(&self) -> Arc<Fiber> {
        let parent = if self.run_in_scheduler {
            tls::scheduler_fiber()
        } else {
            tls::thread_main()
        };
        parent.expect("no parent context on this thread")
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Entry point of every non-main fiber.
///
/// Runs the callback (panics contained), clears it, marks the fiber
/// terminated, drops its own strong handle and performs the terminating
/// yield. The resumer's handle keeps the fiber alive until control is
/// back on the parent stack.
extern "C" fn fiber_entry(_arg: usize) {
    let curr = Fiber::current();

    let cb = curr.cb.lock().unwrap().take();
    if let Some(cb) = cb {
        if catch_unwind(AssertUnwindSafe(cb)).is_err() {
            curr.panicked.store(true, Ordering::Release);
            kerror!("fiber {}: callback panicked", curr.id());
        }
    }
    curr.set_state(FiberState::Term);

    let raw = Arc::as_ptr(&curr);
    drop(curr);
    // Safety: the caller of resume() still holds a strong handle; the
    // fiber outlives this final switch.
    unsafe { (*raw).yield_now() };
    unreachable!("terminated fiber was resumed");
}

/// Yield the current fiber, or the OS thread when none is running
pub fn yield_now() {
    if let Some(f) = tls::current() {
        let is_main = tls::thread_main()
            .map(|m| Arc::ptr_eq(&m, &f))
            .unwrap_or(false);
        if !is_main {
            f.yield_now();
            return;
        }
    }
    std::thread::yield_now();
}
