//! Per-thread fiber registers
//!
//! Three slots per OS thread, all needed in constant time by
//! `resume`/`yield`:
//! - `current`: the fiber presently executing on this thread
//! - `thread_main`: the implicit fiber for the thread's original stack
//! - `scheduler_fiber`: where `yield` lands when `run_in_scheduler` is
//!   set; defaults to `thread_main`

use crate::fiber::Fiber;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

#[inline]
pub(crate) fn current() -> Option<Arc<Fiber>> {
    CURRENT.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_current(f: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn thread_main() -> Option<Arc<Fiber>> {
    THREAD_MAIN.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_thread_main(f: Arc<Fiber>) {
    THREAD_MAIN.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_scheduler_fiber(f: Option<Arc<Fiber>>) {
    SCHEDULER.with(|c| *c.borrow_mut() = f);
}
