//! # filament - stackful fiber runtime
//!
//! Multiplexes many cooperative fibers onto a small pool of worker
//! threads and drives them with an edge-triggered readiness reactor.
//! Application code written in a blocking style runs cooperatively: the
//! hook layer turns blocking socket calls into fiber yields.
//!
//! ## Features
//!
//! - **Stackful fibers**: explicit resume/yield, reusable stacks, ~128 KiB
//!   guard-paged stack per fiber
//! - **M:N scheduler**: FIFO dispatch, optional caller-thread
//!   participation, advisory thread pinning
//! - **Reactor**: one epoll instance + self-pipe wakeups, one-shot
//!   readiness events bound to fibers or callbacks
//! - **Timers**: system-clock timer set with clock-rollback detection
//!   and condition timers
//! - **Syscall hook**: sleep/socket/read/write families that yield the
//!   fiber instead of blocking the OS thread
//!
//! ## Quick Start
//!
//! ```ignore
//! use filament::{hook, IoManager, Schedule, ANY_THREAD};
//!
//! fn main() {
//!     let iom = IoManager::new(4, false, "io").unwrap();
//!
//!     iom.schedule_call(|| {
//!         // Blocking style, cooperative execution: this fiber yields
//!         // while the worker thread keeps serving others.
//!         let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!         /* bind/listen/accept/recv/send via hook::* */
//!         hook::sleep(1);
//!         hook::close(fd);
//!     }, ANY_THREAD);
//!
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     application fibers                     │
//! │          hook::{sleep, connect, recv, send, close}         │
//! └────────────────────────────────────────────────────────────┘
//!               │ EAGAIN: arm event (+timer), yield
//!               ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │  IoManager = Scheduler + TimerManager + epoll + self-pipe  │
//! └────────────────────────────────────────────────────────────┘
//!        │ FIFO queue                  │ idle fiber
//!        ▼                             ▼
//!  ┌───────────┐  ┌───────────┐  ┌────────────────────┐
//!  │  worker   │  │  worker   │  │ epoll_wait(≤ next  │
//!  │ dispatch  │  │ dispatch  │  │ timer, ≤ 5000 ms)  │
//!  └───────────┘  └───────────┘  └────────────────────┘
//! ```

// Core types
pub use filament_core::error::{FiberError, ReactorError, RtResult};
pub use filament_core::state::FiberState;
pub use filament_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};
pub use filament_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};

// Runtime surface
pub use filament_runtime::config::{ConfigError, RuntimeConfig};
pub use filament_runtime::fd::{FdMeta, FdTable, TimeoutKind};
pub use filament_runtime::fiber::{yield_now, Fiber, DEFAULT_STACK_SIZE};
pub use filament_runtime::hook;
pub use filament_runtime::reactor::{Event, IoManager};
pub use filament_runtime::scheduler::{Schedule, ScheduleTask, Scheduler, ANY_THREAD};
pub use filament_runtime::timer::{Timer, TimerManager};
