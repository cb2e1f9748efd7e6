//! M:N fiber scheduler
//!
//! A pool of worker OS threads drains a single mutex-protected FIFO of
//! [`ScheduleTask`]s. Tasks are either fibers (resumed in place) or
//! callbacks (wrapped into a fresh fiber). Tasks may carry a thread
//! affinity (kernel tid); a worker that skips a pinned task raises a
//! tickle so the pinned task's home thread polls soon.
//!
//! With `use_caller`, the constructing thread itself participates: the
//! dispatch loop for that thread runs inside a dedicated *scheduler
//! fiber* which `stop()` resumes so the caller drains the queue before
//! the workers are joined.
//!
//! The reactor specializes this scheduler by overriding [`Schedule`]'s
//! `tickle`/`idle`/`stopping` hooks, the same seams the dispatch loop
//! calls here.

use crate::config::RuntimeConfig;
use crate::fiber::Fiber;
use crate::{hook, tls};
use filament_core::state::FiberState;
use filament_core::{kdebug, kwarn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Affinity wildcard: any worker may take the task
pub const ANY_THREAD: libc::pid_t = -1;

/// Nap length of the base idle fiber (the reactor replaces this with an
/// epoll wait)
const IDLE_NAP: Duration = Duration::from_millis(10);

/// Kernel tid of the calling thread
pub(crate) fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

/// One unit of schedulable work: a fiber or a callback, plus an optional
/// thread affinity. Consumed exactly once; dispatch clears the slot so
/// its strong references drop.
pub struct ScheduleTask {
    payload: TaskPayload,
    thread: libc::pid_t,
}

impl ScheduleTask {
    /// Schedule an existing fiber, optionally pinned to a kernel tid
    pub fn fiber(fiber: Arc<Fiber>, thread: libc::pid_t) -> Self {
        Self {
            payload: TaskPayload::Fiber(fiber),
            thread,
        }
    }

    /// Schedule a callback; the dispatch loop wraps it in a fresh fiber
    pub fn call(f: impl FnOnce() + Send + 'static, thread: libc::pid_t) -> Self {
        Self {
            payload: TaskPayload::Call(Box::new(f)),
            thread,
        }
    }

    pub(crate) fn call_boxed(f: Box<dyn FnOnce() + Send + 'static>, thread: libc::pid_t) -> Self {
        Self {
            payload: TaskPayload::Call(f),
            thread,
        }
    }
}

struct SchedulerInner {
    tasks: VecDeque<ScheduleTask>,
    threads: Vec<JoinHandle<()>>,
    thread_ids: Vec<libc::pid_t>,
}

/// Worker-thread pool plus the shared FIFO task queue
pub struct Scheduler {
    name: String,
    config: RuntimeConfig,
    inner: Mutex<SchedulerInner>,
    /// OS threads to spawn (excludes the caller when `use_caller`)
    thread_count: usize,
    use_caller: bool,
    /// The caller's dispatch-loop fiber; resumed by `stop()`
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    root_thread: AtomicI32,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    started: AtomicBool,
    stop_requested: AtomicBool,
    /// Fully stopped: workers joined, new work is rejected
    stopped: AtomicBool,
    /// Back-reference to the owning Arc (unset when embedded in a
    /// specializing scheduler such as the reactor)
    self_weak: OnceLock<Weak<Scheduler>>,
}

impl Scheduler {
    /// Create a scheduler with `threads` participants.
    ///
    /// When `use_caller` is set, one participant is the constructing
    /// thread (it joins the work during `stop()`), so `threads - 1` OS
    /// threads are spawned.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_config(threads, use_caller, name, RuntimeConfig::from_env())
    }

    /// Create a scheduler with an explicit configuration
    pub fn with_config(
        threads: usize,
        use_caller: bool,
        name: &str,
        config: RuntimeConfig,
    ) -> Arc<Scheduler> {
        let sched = Arc::new(Self::embedded(threads, use_caller, name, config));
        let _ = sched.self_weak.set(Arc::downgrade(&sched));
        sched
    }

    /// Build the bare scheduler state, for standalone use or embedding
    /// in a specializing scheduler (which supplies its own `self_arc`).
    pub(crate) fn embedded(
        threads: usize,
        use_caller: bool,
        name: &str,
        config: RuntimeConfig,
    ) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one thread");
        config.validate().expect("invalid runtime configuration");

        Scheduler {
            name: name.to_string(),
            config,
            inner: Mutex::new(SchedulerInner {
                tasks: VecDeque::new(),
                threads: Vec::new(),
                thread_ids: Vec::new(),
            }),
            thread_count: threads - use_caller as usize,
            use_caller,
            caller_fiber: Mutex::new(None),
            root_thread: AtomicI32::new(ANY_THREAD),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            self_weak: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Kernel tids of all participants (caller thread first when present).
    ///
    /// Valid after `start()`; use these to pin tasks.
    pub fn thread_ids(&self) -> Vec<libc::pid_t> {
        self.inner.lock().unwrap().thread_ids.clone()
    }

    /// Whether any worker currently sits in its idle fiber
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count.load(Ordering::Acquire) > 0
    }

    /// Stop was requested (drain may still be in progress)
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Termination condition: stop requested, queue drained, nothing active
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.inner.lock().unwrap().tasks.is_empty()
            && self.active_count.load(Ordering::Acquire) == 0
    }
}

/// The scheduler behavior seam.
///
/// `schedule`/`start`/`stop` and the dispatch loop are provided;
/// `tickle`/`idle`/`stopping`/`bind_thread` are the overridable hooks the
/// reactor specializes.
pub trait Schedule: Send + Sync + Sized + 'static {
    /// The embedded base scheduler
    fn scheduler(&self) -> &Scheduler;

    /// A strong handle to self, handed to worker threads and the caller
    /// fiber by `start()`
    fn self_arc(&self) -> Arc<Self>;

    /// Wake one sleeping worker. The base scheduler's idle fiber polls on
    /// its own, so this is a no-op; the reactor writes its self-pipe.
    fn tickle(&self) {}

    /// Whether the dispatch loops may terminate
    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Per-thread setup before a dispatch loop starts
    fn bind_thread(&self) {}

    /// Body of the per-worker idle fiber. Runs whenever the queue has no
    /// eligible task; must yield regularly and return once `stopping()`.
    fn idle(&self) {
        while !self.stopping() {
            std::thread::sleep(IDLE_NAP);
            Fiber::current().yield_now();
        }
    }

    /// Push a task. Returns whether a wake was emitted (the queue was
    /// empty, so idle workers may be sleeping).
    fn schedule(&self, task: ScheduleTask) -> bool {
        let sched = self.scheduler();
        if sched.stopped.load(Ordering::Acquire) {
            kwarn!("{}: schedule() after stop, task dropped", sched.name);
            return false;
        }
        let need_tickle;
        {
            let mut inner = sched.inner.lock().unwrap();
            need_tickle = inner.tasks.is_empty();
            inner.tasks.push_back(task);
        }
        if need_tickle {
            self.tickle();
        }
        need_tickle
    }

    /// Schedule a fiber for resumption, optionally pinned to a tid
    fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: libc::pid_t) -> bool {
        self.schedule(ScheduleTask::fiber(fiber, thread))
    }

    /// Schedule a callback, optionally pinned to a tid
    fn schedule_call<F>(&self, f: F, thread: libc::pid_t) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(ScheduleTask::call(f, thread))
    }

    /// Spawn the worker threads. Idempotent; returns once every worker
    /// has reported its tid.
    fn start(&self) {
        let sched = self.scheduler();
        if sched.stop_requested.load(Ordering::Acquire) {
            kwarn!("{}: start() on a stopped scheduler", sched.name);
            return;
        }
        if sched.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.self_arc();

        if sched.use_caller {
            // The caller becomes a participant: its dispatch loop lives in
            // a dedicated fiber that stop() resumes, and yields from task
            // fibers on this thread land in that loop.
            sched.root_thread.store(gettid(), Ordering::Release);
            let _ = Fiber::current();

            let weak = Arc::downgrade(&this);
            let caller = Fiber::new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        run(sched);
                    }
                },
                sched.config.stack_size,
                false,
            );
            tls::set_scheduler_fiber(Some(caller.clone()));
            *sched.caller_fiber.lock().unwrap() = Some(caller);
            sched
                .inner
                .lock()
                .unwrap()
                .thread_ids
                .push(sched.root_thread.load(Ordering::Acquire));
            self.bind_thread();
        }

        let (tid_tx, tid_rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(sched.thread_count);
        for i in 0..sched.thread_count {
            let this = Arc::clone(&this);
            let tx = tid_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_{}", sched.name, i))
                .spawn(move || {
                    let _ = tx.send(gettid());
                    run(this);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        drop(tid_tx);

        let mut inner = sched.inner.lock().unwrap();
        for _ in 0..sched.thread_count {
            if let Ok(tid) = tid_rx.recv() {
                inner.thread_ids.push(tid);
            }
        }
        inner.threads.extend(handles);
        kdebug!(
            "{}: started with {} worker thread(s), use_caller={}",
            sched.name,
            sched.thread_count,
            sched.use_caller
        );
    }

    /// Request shutdown, let the caller fiber drain, join the workers.
    fn stop(&self) {
        if self.stopping() {
            return;
        }
        let sched = self.scheduler();
        sched.stop_requested.store(true, Ordering::Release);

        for _ in 0..sched.thread_count {
            self.tickle();
        }

        let caller = sched.caller_fiber.lock().unwrap().clone();
        if caller.is_some() {
            self.tickle();
        }
        if let Some(caller) = caller {
            // The caller thread now runs its dispatch loop to completion.
            if caller.state() == FiberState::Ready {
                caller.resume();
            }
            kdebug!("{}: caller dispatch loop finished", sched.name);
        }

        let threads = {
            let mut inner = sched.inner.lock().unwrap();
            std::mem::take(&mut inner.threads)
        };
        for handle in threads {
            let _ = handle.join();
        }
        sched.stopped.store(true, Ordering::Release);
        kdebug!("{}: stopped", sched.name);
    }
}

impl Schedule for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }

    fn self_arc(&self) -> Arc<Scheduler> {
        self.self_weak
            .get()
            .and_then(|w| w.upgrade())
            .expect("scheduler must be created with Scheduler::new")
    }
}

/// The dispatch loop, one per participating thread.
///
/// Scans the queue for the first task whose affinity is `ANY_THREAD` or
/// this thread's tid; raises a tickle when a pinned task was skipped or
/// work remains after the take. With no eligible task it resumes the
/// idle fiber; once the idle fiber terminates the loop breaks.
pub(crate) fn run<S: Schedule>(sched: Arc<S>) {
    let thread_id = gettid();
    kdebug!(
        "{}: dispatch loop running on thread {}",
        sched.scheduler().name,
        thread_id
    );

    sched.bind_thread();
    hook::set_enabled(true);
    let _ = Fiber::current();

    let stack_size = sched.scheduler().config.stack_size;
    let idle_sched = Arc::clone(&sched);
    let idle_fiber = Fiber::new(move || idle_sched.idle(), stack_size, true);

    loop {
        let mut task: Option<TaskPayload> = None;
        let mut tickle_me = false;
        {
            let base = sched.scheduler();
            let mut inner = base.inner.lock().unwrap();
            let mut found = None;
            for (i, t) in inner.tasks.iter().enumerate() {
                if t.thread != ANY_THREAD && t.thread != thread_id {
                    // Pinned elsewhere: leave it, make sure its home
                    // thread gets woken.
                    tickle_me = true;
                    continue;
                }
                found = Some(i);
                break;
            }
            if let Some(i) = found {
                task = inner.tasks.remove(i).map(|t| t.payload);
                base.active_count.fetch_add(1, Ordering::SeqCst);
                tickle_me = tickle_me || !inner.tasks.is_empty();
            }
        }
        if tickle_me {
            sched.tickle();
        }

        match task {
            Some(TaskPayload::Fiber(fiber)) => {
                if fiber.state() != FiberState::Term {
                    fiber.resume();
                }
                sched.scheduler().active_count.fetch_sub(1, Ordering::SeqCst);
            }
            Some(TaskPayload::Call(cb)) => {
                let fiber = Fiber::new(cb, stack_size, true);
                fiber.resume();
                sched.scheduler().active_count.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    kdebug!(
                        "{}: dispatch loop ends on thread {}",
                        sched.scheduler().name,
                        thread_id
                    );
                    break;
                }
                sched.scheduler().idle_count.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                sched.scheduler().idle_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
