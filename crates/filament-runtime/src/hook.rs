//! Yielding syscall wrappers
//!
//! Blocking-style socket and sleep calls that suspend the calling fiber
//! instead of the OS thread. Each wrapper mirrors its POSIX namesake:
//! results and errors travel through the return value and errno.
//!
//! Hooking is per thread (`set_enabled`); the dispatch loop enables it
//! on every worker. A call falls through to the raw syscall when
//! hooking is off, the fd is unknown to the [`FdTable`], the fd is not
//! a socket, or the application asked for non-blocking mode itself.
//!
//! The I/O template: issue the real (non-blocking) syscall; on EINTR
//! retry; on EAGAIN arm a one-shot readiness interest (plus a condition
//! timer when an SO_RCVTIMEO/SO_SNDTIMEO style timeout is set) and
//! yield. On resume either the readiness fired (retry the syscall) or
//! the timer cancelled the event (fail with ETIMEDOUT).

use crate::fd::{FdTable, TimeoutKind};
use crate::fiber::Fiber;
use crate::reactor::{Event, IoManager};
use crate::scheduler::{Schedule, ANY_THREAD};
use filament_core::kerror;
use libc::{c_int, c_uint, c_ulong, c_void, socklen_t};
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether hooked calls yield on this thread
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Enable or disable hooking for the calling thread
pub fn set_enabled(flag: bool) {
    HOOK_ENABLED.with(|c| c.set(flag));
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e };
}

/// Shared between a suspended I/O call and its timeout timer
struct TimerInfo {
    /// 0 while live; ETIMEDOUT once the timer cancelled the wait
    cancelled: AtomicI32,
}

/// The I/O template shared by every read/write-family wrapper.
///
/// `f` performs the raw syscall and is retried until it either
/// completes, fails hard, or the per-direction timeout expires.
fn do_io<F>(fd: c_int, name: &'static str, event: Event, timeout_kind: TimeoutKind, mut f: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_enabled() {
        return f();
    }
    let Some(ctx) = FdTable::instance().get(fd, false) else {
        return f();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return f();
    }

    let timeout = ctx.timeout(timeout_kind);
    let tinfo = Arc::new(TimerInfo {
        cancelled: AtomicI32::new(0),
    });

    loop {
        let mut n = f();
        while n == -1 && errno() == libc::EINTR {
            n = f();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block: hand the wait to the reactor
        let Some(iom) = IoManager::current() else {
            return f();
        };

        let timer = if timeout != u64::MAX {
            let winfo = Arc::downgrade(&tinfo);
            let weak_iom = Arc::downgrade(&iom);
            let cond = Arc::downgrade(&tinfo);
            Some(iom.add_condition_timer(
                timeout,
                move || {
                    let Some(t) = winfo.upgrade() else {
                        return;
                    };
                    if t.cancelled.load(Ordering::Acquire) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                    if let Some(iom) = weak_iom.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                },
                cond,
                false,
            ))
        } else {
            None
        };

        // No callback: the current fiber is the wakeup target
        match iom.add_event(fd, event, None) {
            Err(e) => {
                kerror!("{}: add_event({}, {:?}) failed: {}", name, fd, event, e);
                if let Some(t) = &timer {
                    t.cancel();
                }
                set_errno(libc::EINVAL);
                return -1;
            }
            Ok(()) => {
                Fiber::current().yield_now();

                // Resumed by readiness or by the timer's cancel_event;
                // the timer is dead weight either way.
                if let Some(t) = &timer {
                    t.cancel();
                }
                if tinfo.cancelled.load(Ordering::Acquire) == libc::ETIMEDOUT {
                    set_errno(libc::ETIMEDOUT);
                    return -1;
                }
            }
        }
    }
}

// ── Sleep family ──

/// Suspend the calling fiber for `seconds`. Never blocks the OS thread.
pub fn sleep(seconds: c_uint) -> c_uint {
    let Some(iom) = (if is_enabled() { IoManager::current() } else { None }) else {
        return unsafe { libc::sleep(seconds) };
    };
    sleep_ms(&iom, seconds as u64 * 1000);
    0
}

/// Microsecond sleep, millisecond granularity
pub fn usleep(usec: libc::useconds_t) -> c_int {
    let Some(iom) = (if is_enabled() { IoManager::current() } else { None }) else {
        return unsafe { libc::usleep(usec) };
    };
    sleep_ms(&iom, usec as u64 / 1000);
    0
}

/// Nanosecond sleep, millisecond granularity; `rem` is never filled
/// because the hooked version is not interruptible by signals.
pub fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    let Some(iom) = (if is_enabled() { IoManager::current() } else { None }) else {
        return unsafe { libc::nanosleep(req, rem) };
    };
    let req = unsafe { &*req };
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(&iom, ms);
    0
}

fn sleep_ms(iom: &Arc<IoManager>, ms: u64) {
    let fiber = Fiber::current();
    let weak = Arc::downgrade(iom);
    let target = fiber.clone();
    iom.add_timer(
        ms,
        move || {
            if let Some(iom) = weak.upgrade() {
                iom.schedule_fiber(target.clone(), ANY_THREAD);
            }
        },
        false,
    );
    fiber.yield_now();
}

// ── Socket lifecycle ──

/// `socket(2)`; the new fd is installed in the [`FdTable`] (and thereby
/// forced kernel-non-blocking).
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !is_enabled() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        kerror!("socket() failed: errno {}", errno());
        return fd;
    }
    FdTable::instance().get(fd, true);
    fd
}

/// `connect(2)` with an explicit timeout in milliseconds
/// (`u64::MAX` waits forever).
pub fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_enabled() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(ctx) = FdTable::instance().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    } else if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // In progress: the socket turns writable once the handshake settles
    let Some(iom) = IoManager::current() else {
        return n;
    };

    let tinfo = Arc::new(TimerInfo {
        cancelled: AtomicI32::new(0),
    });
    let timer = if timeout_ms != u64::MAX {
        let winfo = Arc::downgrade(&tinfo);
        let weak_iom = Arc::downgrade(&iom);
        let cond = Arc::downgrade(&tinfo);
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(t) = winfo.upgrade() else {
                    return;
                };
                if t.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                if let Some(iom) = weak_iom.upgrade() {
                    iom.cancel_event(fd, Event::WRITE);
                }
            },
            cond,
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            Fiber::current().yield_now();
            if let Some(t) = &timer {
                t.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            kerror!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // The wait only says "settled"; SO_ERROR says how.
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut _ as *mut c_void,
            &mut len,
        )
    } == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// `connect(2)` using the configured default connect timeout
pub fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    let timeout = IoManager::current()
        .map(|iom| iom.scheduler().config().connect_timeout_ms)
        .unwrap_or(u64::MAX);
    connect_with_timeout(fd, addr, addrlen, timeout)
}

/// `accept(2)`; the accepted fd is installed in the [`FdTable`]
pub fn accept(sockfd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(sockfd, "accept", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(sockfd, addr, addrlen) as isize
    }) as c_int;
    if fd >= 0 {
        FdTable::instance().get(fd, true);
    }
    fd
}

// ── Read family ──

pub fn read(fd: c_int, buf: &mut [u8]) -> isize {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

pub fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(sockfd: c_int, buf: &mut [u8], flags: c_int) -> isize {
    do_io(sockfd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(sockfd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

pub fn recvfrom(
    sockfd: c_int,
    buf: &mut [u8],
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    do_io(sockfd, "recvfrom", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(
            sockfd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags,
            src_addr,
            addrlen,
        )
    })
}

pub fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> isize {
    do_io(sockfd, "recvmsg", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(sockfd, msg, flags)
    })
}

// ── Write family ──

pub fn write(fd: c_int, buf: &[u8]) -> isize {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

pub fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(sockfd: c_int, buf: &[u8], flags: c_int) -> isize {
    do_io(sockfd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(sockfd, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

pub fn sendto(
    sockfd: c_int,
    buf: &[u8],
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> isize {
    do_io(sockfd, "sendto", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendto(
            sockfd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            flags,
            dest_addr,
            addrlen,
        )
    })
}

pub fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> isize {
    do_io(sockfd, "sendmsg", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendmsg(sockfd, msg, flags)
    })
}

// ── Teardown and fd control ──

/// `close(2)`: any armed waiter on the fd fires once (observing the
/// closure), the FdTable entry is dropped, then the real close runs.
pub fn close(fd: c_int) -> c_int {
    if !is_enabled() {
        return unsafe { libc::close(fd) };
    }
    if FdTable::instance().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        FdTable::instance().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl(2)` for the int-argument commands.
///
/// `F_SETFL` records the application's intended blocking mode while the
/// kernel fd stays non-blocking; `F_GETFL` reports the application's
/// view, not the kernel state. Everything else passes through (`arg` is
/// ignored by the kernel for the no-argument get commands).
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let ctx = FdTable::instance().get(fd, false);
            let Some(ctx) = ctx.filter(|c| !c.is_closed() && c.is_socket()) else {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            };
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            // What actually reaches the kernel follows the system flag
            let arg = if ctx.sys_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            let ctx = FdTable::instance().get(fd, false);
            let Some(ctx) = ctx.filter(|c| !c.is_closed() && c.is_socket()) else {
                return flags;
            };
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl(2)`; `FIONBIO` updates the user-visible blocking mode the same
/// way `F_SETFL` does.
pub fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO {
        let user_nonblock = unsafe { *(arg as *mut c_int) } != 0;
        if let Some(ctx) = FdTable::instance().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { libc::ioctl(fd, request, arg) }
}

/// `getsockopt(2)`: pure delegate
pub fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(sockfd, level, optname, optval, optlen) }
}

/// `setsockopt(2)`; `SO_RCVTIMEO`/`SO_SNDTIMEO` are captured into the
/// [`FdTable`] in milliseconds (and still forwarded to the kernel).
pub fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = FdTable::instance().get(sockfd, false) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
    }
    unsafe { libc::setsockopt(sockfd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_for(cond: impl Fn() -> bool, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn socketpair() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        let rt = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_sleep_suspends_fiber_not_thread() {
        let iom = IoManager::new(1, false, "hook-sleep").unwrap();

        let elapsed_ms = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let (e, d) = (elapsed_ms.clone(), done.clone());
        iom.schedule_call(
            move || {
                let t0 = Instant::now();
                assert_eq!(sleep(1), 0);
                e.store(t0.elapsed().as_millis() as usize, Ordering::SeqCst);
                d.store(true, Ordering::SeqCst);
            },
            ANY_THREAD,
        );

        // The single worker must stay available while the fiber sleeps;
        // this also exercises the tickle path (the worker sits in
        // epoll_wait until the self-pipe pokes it).
        std::thread::sleep(Duration::from_millis(100));
        let other = Arc::new(AtomicBool::new(false));
        let o = other.clone();
        iom.schedule_call(
            move || {
                o.store(true, Ordering::SeqCst);
            },
            ANY_THREAD,
        );
        assert!(wait_for(|| other.load(Ordering::SeqCst), 1000));
        assert!(!done.load(Ordering::SeqCst));

        assert!(wait_for(|| done.load(Ordering::SeqCst), 3000));
        assert!(elapsed_ms.load(Ordering::SeqCst) >= 1000);
        iom.stop();
    }

    #[test]
    fn test_echo_over_loopback() {
        let iom = IoManager::new(2, false, "hook-echo").unwrap();
        let (port_tx, port_rx) = mpsc::channel::<u16>();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();

        iom.schedule_call(
            move || {
                let listen_fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                assert!(listen_fd >= 0);
                let yes: c_int = 1;
                unsafe {
                    libc::setsockopt(
                        listen_fd,
                        libc::SOL_SOCKET,
                        libc::SO_REUSEADDR,
                        &yes as *const _ as *const c_void,
                        std::mem::size_of::<c_int>() as socklen_t,
                    );
                }

                let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                addr.sin_family = libc::AF_INET as u16;
                addr.sin_port = 0;
                addr.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
                let rt = unsafe {
                    libc::bind(
                        listen_fd,
                        &addr as *const _ as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                    )
                };
                assert_eq!(rt, 0);
                assert_eq!(unsafe { libc::listen(listen_fd, 16) }, 0);

                let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                let mut len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
                unsafe {
                    libc::getsockname(
                        listen_fd,
                        &mut bound as *mut _ as *mut libc::sockaddr,
                        &mut len,
                    );
                }
                port_tx.send(u16::from_be(bound.sin_port)).unwrap();

                // accept/recv/send all written blocking-style; each one
                // yields the fiber instead of the worker thread.
                let client = accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut());
                assert!(client >= 0);

                let mut buf = [0u8; 16];
                let n = recv(client, &mut buf, 0);
                assert_eq!(n, 4);
                assert_eq!(&buf[..4], b"PING");

                assert_eq!(send(client, b"PONG", 0), 4);
                assert_eq!(close(client), 0);
                assert_eq!(close(listen_fd), 0);
                d.store(true, Ordering::SeqCst);
            },
            ANY_THREAD,
        );

        let port = port_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        use std::io::{Read, Write};
        stream.write_all(b"PING").unwrap();
        let mut resp = [0u8; 4];
        stream.read_exact(&mut resp).unwrap();
        assert_eq!(&resp, b"PONG");
        // Server closed the connection: clean EOF
        let mut rest = [0u8; 1];
        assert_eq!(stream.read(&mut rest).unwrap(), 0);

        assert!(wait_for(|| done.load(Ordering::SeqCst), 5000));
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();
    }

    #[test]
    fn test_recv_timeout_then_success() {
        let iom = IoManager::new(1, false, "hook-timeout").unwrap();
        let (a, b) = socketpair();
        // The hook only yields for descriptors it knows about
        FdTable::instance().get(a, true);

        let stage = Arc::new(AtomicUsize::new(0));
        let elapsed_ms = Arc::new(AtomicUsize::new(0));
        let (s, e) = (stage.clone(), elapsed_ms.clone());
        iom.schedule_call(
            move || {
                let tv = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 250_000,
                };
                let rt = setsockopt(
                    a,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const _ as *const c_void,
                    std::mem::size_of::<libc::timeval>() as socklen_t,
                );
                assert_eq!(rt, 0);

                let mut buf = [0u8; 8];
                let t0 = Instant::now();
                let n = recv(a, &mut buf, 0);
                e.store(t0.elapsed().as_millis() as usize, Ordering::SeqCst);
                assert_eq!(n, -1);
                assert_eq!(errno(), libc::ETIMEDOUT);
                s.store(1, Ordering::SeqCst);

                // fd is still usable after the timeout
                let n = recv(a, &mut buf, 0);
                assert_eq!(n, 5);
                assert_eq!(&buf[..5], b"hello");
                s.store(2, Ordering::SeqCst);
            },
            ANY_THREAD,
        );

        assert!(wait_for(|| stage.load(Ordering::SeqCst) == 1, 5000));
        let ms = elapsed_ms.load(Ordering::SeqCst);
        assert!((150..=600).contains(&ms), "timeout took {} ms", ms);

        assert_eq!(
            unsafe { libc::write(b, b"hello".as_ptr() as *const c_void, 5) },
            5
        );
        assert!(wait_for(|| stage.load(Ordering::SeqCst) == 2, 5000));
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        FdTable::instance().del(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let iom = IoManager::new(1, false, "hook-close").unwrap();
        let (a, b) = socketpair();
        FdTable::instance().get(a, true);

        let reader_done = Arc::new(AtomicBool::new(false));
        let r = reader_done.clone();
        iom.schedule_call(
            move || {
                let mut buf = [0u8; 4];
                let n = recv(a, &mut buf, 0);
                // Woken by close: the retry observes the closed
                // descriptor (EOF or bad descriptor).
                assert!(n <= 0, "recv after close returned {}", n);
                r.store(true, Ordering::SeqCst);
            },
            ANY_THREAD,
        );

        // Let the reader block first
        std::thread::sleep(Duration::from_millis(100));
        assert!(!reader_done.load(Ordering::SeqCst));
        iom.schedule_call(
            move || {
                assert_eq!(close(a), 0);
            },
            ANY_THREAD,
        );

        assert!(wait_for(|| reader_done.load(Ordering::SeqCst), 5000));
        // No FdContext left armed
        assert_eq!(iom.pending_event_count(), 0);
        assert!(FdTable::instance().get(a, false).is_none());

        iom.stop();
        unsafe { libc::close(b) };
    }

    #[test]
    fn test_connect_to_listening_socket() {
        let iom = IoManager::new(1, false, "hook-connect").unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        iom.schedule_call(
            move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                assert!(fd >= 0);
                let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                addr.sin_family = libc::AF_INET as u16;
                addr.sin_port = port.to_be();
                addr.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
                let rt = connect(
                    fd,
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                );
                assert_eq!(rt, 0);
                assert_eq!(close(fd), 0);
                d.store(true, Ordering::SeqCst);
            },
            ANY_THREAD,
        );

        let (conn, _) = listener.accept().unwrap();
        assert!(wait_for(|| done.load(Ordering::SeqCst), 5000));
        drop(conn);
        iom.stop();
    }

    #[test]
    fn test_fcntl_reports_user_view() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        FdTable::instance().get(fd, true);

        // Application asks for blocking mode
        assert_ne!(fcntl(fd, libc::F_SETFL, 0), -1);
        // The kernel fd stays non-blocking regardless...
        assert_ne!(unsafe { libc::fcntl(fd, libc::F_GETFL) } & libc::O_NONBLOCK, 0);
        // ...but the application sees the mode it asked for
        assert_eq!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);

        assert_ne!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK), -1);
        assert_ne!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);

        FdTable::instance().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_ioctl_fionbio_tracks_user_intent() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let meta = FdTable::instance().get(fd, true).unwrap();
        assert!(!meta.user_nonblock());

        let mut on: c_int = 1;
        assert_ne!(ioctl(fd, libc::FIONBIO, &mut on as *mut _ as *mut c_void), -1);
        assert!(meta.user_nonblock());

        let mut off: c_int = 0;
        assert_ne!(ioctl(fd, libc::FIONBIO, &mut off as *mut _ as *mut c_void), -1);
        assert!(!meta.user_nonblock());

        FdTable::instance().del(fd);
        unsafe { libc::close(fd) };
    }
}

