//! The readiness reactor (`IoManager`)
//!
//! Extends the scheduler with an edge-triggered epoll instance and timed
//! wakeups. Per fd and event kind, at most one waiter (a fiber or a
//! callback) can be armed; when readiness arrives the idle loop moves
//! the waiter onto the scheduler queue and disarms the event, so event
//! registration is one-shot.
//!
//! Cross-thread wakes go through a self-pipe: the read end sits in the
//! epoll set edge-triggered, `tickle` writes one byte, and the idle loop
//! drains the pipe to EAGAIN so coalesced tickles cost one wakeup.

use crate::config::RuntimeConfig;
use crate::fiber::Fiber;
use crate::scheduler::{Schedule, ScheduleTask, Scheduler, ANY_THREAD};
use crate::timer::{Timer, TimerCallback, TimerManager};
use filament_core::error::{ReactorError, RtResult};
use filament_core::state::FiberState;
use filament_core::{kdebug, kerror, kwarn};
use std::cell::RefCell;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

/// Readiness interest bits; values coincide with EPOLLIN/EPOLLOUT
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Event) -> bool {
        !other.is_empty() && self.0 & other.0 == other.0
    }
}

impl BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;
    fn not(self) -> Event {
        Event(!self.0)
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (true, true) => write!(f, "READ|WRITE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

/// One armed waiter: the scheduler that will receive the wake, and
/// exactly one of a fiber or a callback
#[derive(Default)]
struct EventContext {
    scheduler: Weak<IoManager>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl EventContext {
    fn is_armed(&self) -> bool {
        self.fiber.is_some() || self.cb.is_some()
    }

    fn reset(&mut self) {
        *self = EventContext::default();
    }
}

struct FdState {
    /// Bits currently registered with the multiplexer for this fd
    events: Event,
    read: EventContext,
    write: EventContext,
}

/// Per-fd event bookkeeping; one entry per slot of the dense vector
pub(crate) struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            state: Mutex::new(FdState {
                events: Event::NONE,
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }

    fn event_context<'a>(state: &'a mut FdState, event: Event) -> &'a mut EventContext {
        if event == Event::READ {
            &mut state.read
        } else if event == Event::WRITE {
            &mut state.write
        } else {
            panic!("unsupported event {:?}", event)
        }
    }

    /// Move the armed waiter onto its scheduler's queue and disarm.
    ///
    /// The payload is moved, never copied, and the slot is cleared right
    /// away: an armed EventContext is the one strong reference that
    /// could keep a waiting fiber alive past its wake.
    fn trigger_event(&self, state: &mut FdState, event: Event) {
        assert!(
            state.events.contains(event),
            "triggering an event that is not registered"
        );
        state.events = state.events & !event;

        let ctx = Self::event_context(state, event);
        let scheduler = ctx.scheduler.upgrade();
        let fiber = ctx.fiber.take();
        let cb = ctx.cb.take();
        ctx.reset();

        let Some(iom) = scheduler else {
            kwarn!("fd {}: waiter dropped, reactor is gone", self.fd);
            return;
        };
        if let Some(cb) = cb {
            iom.schedule(ScheduleTask::call_boxed(cb, ANY_THREAD));
        } else if let Some(fiber) = fiber {
            iom.schedule(ScheduleTask::fiber(fiber, ANY_THREAD));
        }
        iom.pending_events.fetch_sub(1, Ordering::SeqCst);
    }
}

thread_local! {
    static CURRENT_IOM: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

/// The I/O manager: scheduler + timers + epoll readiness multiplexing
pub struct IoManager {
    sched: Scheduler,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// Self-pipe; [0] read end (edge-triggered in the epoll set), [1]
    /// write end used by `tickle`
    tickle_fds: [RawFd; 2],
    /// Number of armed event bits across all FdContexts
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Back-reference to the owning Arc, planted into EventContexts and
    /// handed to worker threads
    self_weak: OnceLock<Weak<IoManager>>,
}

impl IoManager {
    /// Create a reactor and start its workers immediately.
    ///
    /// `threads`/`use_caller`/`name` as for [`Scheduler::new`].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RtResult<Arc<IoManager>> {
        Self::with_config(threads, use_caller, name, RuntimeConfig::from_env())
    }

    /// Create a reactor with an explicit configuration
    pub fn with_config(
        threads: usize,
        use_caller: bool,
        name: &str,
        config: RuntimeConfig,
    ) -> RtResult<Arc<IoManager>> {
        let sched = Scheduler::embedded(threads, use_caller, name, config);

        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(ReactorError::Setup(errno()));
        }

        let mut tickle_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(tickle_fds.as_mut_ptr()) } != 0 {
            let e = errno();
            unsafe { libc::close(epfd) };
            return Err(ReactorError::Setup(e));
        }

        // Read end non-blocking: the drain loop reads to EAGAIN
        let rt = unsafe { libc::fcntl(tickle_fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        assert_eq!(rt, 0, "failed to set tickle pipe non-blocking");

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32 | libc::EPOLLET as u32,
            u64: tickle_fds[0] as u64,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fds[0], &mut ev) };
        if rt != 0 {
            let e = errno();
            unsafe {
                libc::close(epfd);
                libc::close(tickle_fds[0]);
                libc::close(tickle_fds[1]);
            }
            return Err(ReactorError::Setup(e));
        }

        let iom = Arc::new(IoManager {
            sched,
            timers: TimerManager::new(),
            epfd,
            tickle_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
            self_weak: OnceLock::new(),
        });
        let _ = iom.self_weak.set(Arc::downgrade(&iom));

        Self::context_resize(&mut iom.fd_contexts.write().unwrap(), 32);

        // A new earliest timer must shorten an epoll wait already in
        // flight somewhere.
        let weak = Arc::downgrade(&iom);
        iom.timers.set_front_notifier(move || {
            if let Some(iom) = weak.upgrade() {
                iom.tickle();
            }
        });

        iom.bind_thread();
        iom.start();
        kdebug!("{}: reactor started (epfd {})", iom.sched.name(), epfd);
        Ok(iom)
    }

    /// The reactor bound to the calling thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOM.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
    }

    /// Number of armed event bits across all fds
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// The timer set driven by this reactor's idle loop
    pub fn timer_manager(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// Add a timer firing in `ms` milliseconds (see [`TimerManager::add_timer`])
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Add a condition timer (see [`TimerManager::add_condition_timer`])
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    fn context_resize(contexts: &mut Vec<Arc<FdContext>>, size: usize) {
        for fd in contexts.len()..size {
            contexts.push(Arc::new(FdContext::new(fd as RawFd)));
        }
    }

    fn fd_context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        {
            let contexts = self.fd_contexts.read().unwrap();
            if (fd as usize) < contexts.len() {
                return Some(contexts[fd as usize].clone());
            }
        }
        if !create {
            return None;
        }
        let mut contexts = self.fd_contexts.write().unwrap();
        let target = std::cmp::max(fd as usize * 3 / 2, fd as usize + 1);
        Self::context_resize(&mut contexts, target);
        Some(contexts[fd as usize].clone())
    }

    /// Register interest in `event` on `fd`.
    ///
    /// With a callback the callback is scheduled on readiness; without
    /// one the *current fiber* is captured as the waiter (it must be
    /// Running, and the caller is expected to yield right after).
    /// Fails with `AlreadyArmed` if the bit is registered already.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> RtResult<()> {
        let fd_ctx = self
            .fd_context(fd, true)
            .ok_or(ReactorError::BadDescriptor)?;
        let mut state = fd_ctx.state.lock().unwrap();

        if state.events.contains(event) {
            kerror!(
                "{}: add_event fd {} {:?}: already armed",
                self.sched.name(),
                fd,
                event
            );
            return Err(ReactorError::AlreadyArmed);
        }

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | state.events.bits() | event.bits(),
            u64: Arc::as_ptr(&fd_ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            let e = errno();
            kerror!(
                "{}: add_event fd {} {:?}: epoll_ctl failed, errno {}",
                self.sched.name(),
                fd,
                event,
                e
            );
            return Err(ReactorError::Multiplexer(e));
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        state.events |= event;

        let ctx = FdContext::event_context(&mut state, event);
        debug_assert!(!ctx.is_armed());
        ctx.scheduler = self.weak_self();
        match cb {
            Some(cb) => ctx.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    FiberState::Running,
                    "add_event without a callback must run inside a fiber"
                );
                ctx.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Remove interest in `event` on `fd` without dispatching the armed
    /// waiter. Returns whether anything was removed.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut state = fd_ctx.state.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }

        let left = state.events & !event;
        if !self.reprogram(fd, Arc::as_ptr(&fd_ctx) as u64, left) {
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        state.events = left;
        FdContext::event_context(&mut state, event).reset();
        true
    }

    /// Remove interest in `event` on `fd` and dispatch the armed waiter
    /// immediately (the hook's timeout path).
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut state = fd_ctx.state.lock().unwrap();
        if !state.events.contains(event) {
            return false;
        }

        let left = state.events & !event;
        if !self.reprogram(fd, Arc::as_ptr(&fd_ctx) as u64, left) {
            return false;
        }

        fd_ctx.trigger_event(&mut state, event);
        true
    }

    /// Dispatch every armed waiter on `fd` and drop the fd from the
    /// multiplexer (hooked `close` calls this).
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(fd_ctx) = self.fd_context(fd, false) else {
            return false;
        };
        let mut state = fd_ctx.state.lock().unwrap();
        if state.events.is_empty() {
            return false;
        }

        let mut ep = libc::epoll_event {
            events: 0,
            u64: Arc::as_ptr(&fd_ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ep) } != 0 {
            kerror!(
                "{}: cancel_all fd {}: epoll_ctl failed, errno {}",
                self.sched.name(),
                fd,
                errno()
            );
            return false;
        }

        if state.events.contains(Event::READ) {
            fd_ctx.trigger_event(&mut state, Event::READ);
        }
        if state.events.contains(Event::WRITE) {
            fd_ctx.trigger_event(&mut state, Event::WRITE);
        }
        assert!(state.events.is_empty());
        true
    }

    fn weak_self(&self) -> Weak<IoManager> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    /// MOD the fd's interest mask down to `left`, or DEL it entirely.
    /// `data` is the FdContext pointer planted in the epoll entry.
    fn reprogram(&self, fd: RawFd, data: u64, left: Event) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: data,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            kerror!(
                "{}: fd {}: epoll_ctl failed, errno {}",
                self.sched.name(),
                fd,
                errno()
            );
            return false;
        }
        true
    }
}

impl Schedule for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    fn self_arc(&self) -> Arc<IoManager> {
        self.weak_self().upgrade().expect("reactor already dropped")
    }

    /// Wake one epoll-waiting worker via the self-pipe. Skipped when no
    /// worker is idle; duplicate tickles coalesce at the read end.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rt = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const _, 1) };
        assert_eq!(rt, 1, "tickle write failed");
    }

    /// Stoppable only once the scheduler is drained, no event bit is
    /// armed and no timer is pending.
    fn stopping(&self) -> bool {
        self.timers.next_timeout() == u64::MAX
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    fn bind_thread(&self) {
        CURRENT_IOM.with(|c| *c.borrow_mut() = Some(self.weak_self()));
    }

    /// The reactor idle fiber: wait on epoll (capped by the next timer
    /// deadline), convert readiness into scheduled waiters, drain
    /// expired timers, yield back to the dispatch loop.
    fn idle(&self) {
        let max_events = self.sched.config().max_events;
        let wait_cap = self.sched.config().max_idle_wait_ms;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; max_events];

        loop {
            if self.stopping() {
                kdebug!("{}: idle exits", self.sched.name());
                break;
            }

            let mut rt;
            loop {
                let next = self.timers.next_timeout().min(wait_cap);
                rt = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), max_events as i32, next as i32)
                };
                if rt < 0 && errno() == libc::EINTR {
                    continue;
                }
                break;
            }
            if rt < 0 {
                kerror!("{}: epoll_wait failed, errno {}", self.sched.name(), errno());
                rt = 0;
            }

            for ev in events.iter_mut().take(rt as usize) {
                if ev.u64 == self.tickle_fds[0] as u64 {
                    // Edge-triggered: drain every coalesced tickle byte
                    let mut dummy = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            dummy.as_mut_ptr() as *mut _,
                            dummy.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                // Safety: the pointer was planted by add_event and the
                // FdContext vector only grows; entries live as long as
                // the reactor.
                let fd_ctx = unsafe { &*(ev.u64 as *const FdContext) };
                let mut state = fd_ctx.state.lock().unwrap();

                // Error/hangup surfaces as readiness on whatever the fd
                // actually has registered, so waiters observe it.
                if ev.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    ev.events |=
                        (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & state.events.bits();
                }

                let mut real = Event::NONE;
                if ev.events & libc::EPOLLIN as u32 != 0 {
                    real |= Event::READ;
                }
                if ev.events & libc::EPOLLOUT as u32 != 0 {
                    real |= Event::WRITE;
                }
                real = real & state.events;
                if real.is_empty() {
                    continue;
                }

                let left = state.events & !real;
                if !self.reprogram(fd_ctx.fd, ev.u64, left) {
                    continue;
                }

                if real.contains(Event::READ) {
                    fd_ctx.trigger_event(&mut state, Event::READ);
                }
                if real.contains(Event::WRITE) {
                    fd_ctx.trigger_event(&mut state, Event::WRITE);
                }
            }

            let mut cbs: Vec<TimerCallback> = Vec::new();
            self.timers.collect_expired(&mut cbs);
            for cb in cbs {
                self.schedule(ScheduleTask::call(move || cb(), ANY_THREAD));
            }

            Fiber::current().yield_now();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Workers hold strong handles while their dispatch loops run, so
        // by the time Drop executes the pool is already joined.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
        }
        (fds[0], fds[1])
    }

    fn close_pair(r: RawFd, w: RawFd) {
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_event_bit_ops() {
        let both = Event::READ | Event::WRITE;
        assert!(both.contains(Event::READ));
        assert!(both.contains(Event::WRITE));
        assert_eq!(both & !Event::READ, Event::WRITE);
        assert!(!(Event::NONE.contains(Event::READ)));
        assert_eq!(format!("{:?}", both), "READ|WRITE");
    }

    #[test]
    fn test_readiness_schedules_callback() {
        let iom = IoManager::new(2, false, "reactor-cb").unwrap();
        let (r, w) = nonblocking_pipe();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(r, Event::READ, Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        assert_eq!(iom.pending_event_count(), 1);

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);

        // Readiness -> trigger -> scheduler queue -> worker
        for _ in 0..200 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        close_pair(r, w);
    }

    #[test]
    fn test_already_armed_rejected() {
        let iom = IoManager::new(1, false, "reactor-armed").unwrap();
        let (r, w) = nonblocking_pipe();

        iom.add_event(r, Event::READ, Some(Box::new(|| {}))).unwrap();
        let err = iom
            .add_event(r, Event::READ, Some(Box::new(|| {})))
            .unwrap_err();
        assert_eq!(err, ReactorError::AlreadyArmed);

        // Distinct bits on the same fd are independent
        iom.add_event(r, Event::WRITE, Some(Box::new(|| {}))).unwrap();
        assert_eq!(iom.pending_event_count(), 2);

        assert!(iom.cancel_all(r));
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();
        close_pair(r, w);
    }

    #[test]
    fn test_del_event_does_not_dispatch() {
        let iom = IoManager::new(1, false, "reactor-del").unwrap();
        let (r, w) = nonblocking_pipe();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(r, Event::READ, Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        assert!(iom.del_event(r, Event::READ));
        assert_eq!(iom.pending_event_count(), 0);
        assert!(!iom.del_event(r, Event::READ));

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        iom.stop();
        close_pair(r, w);
    }

    #[test]
    fn test_cancel_event_dispatches_without_readiness() {
        let iom = IoManager::new(1, false, "reactor-cancel").unwrap();
        let (r, w) = nonblocking_pipe();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(r, Event::READ, Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        // No byte ever written; cancel fires the stored callback anyway
        assert!(iom.cancel_event(r, Event::READ));
        for _ in 0..200 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        close_pair(r, w);
    }

    #[test]
    fn test_timer_fires_through_idle_loop() {
        let iom = IoManager::new(1, false, "reactor-timer").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_timer(
            30,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        for _ in 0..200 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        iom.stop();
    }

    #[test]
    fn test_stop_waits_for_pending_timer() {
        let iom = IoManager::new(1, false, "reactor-stop").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_timer(
            50,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        // stop() drains: the timer is still pending, so the reactor
        // cannot stop before it fires.
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
