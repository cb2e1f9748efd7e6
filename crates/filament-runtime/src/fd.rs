//! Per-fd metadata for the syscall hook
//!
//! The hook consults this table to decide whether a descriptor gets the
//! yielding treatment. Entries are created lazily on first lookup with
//! `auto_create`; sockets are forced into kernel non-blocking mode at
//! that point so a hooked call can never block the OS thread. The
//! user-visible blocking mode is tracked separately (`user_nonblock`)
//! and only controls whether the hook bypasses its yielding logic.

use filament_core::ktrace;
use std::sync::{Arc, Mutex, OnceLock};

/// Which per-direction timeout a hooked call consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

#[derive(Debug)]
struct FdMetaState {
    initialized: bool,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: bool,
    closed: bool,
    /// Milliseconds; `u64::MAX` means no timeout
    recv_timeout_ms: u64,
    send_timeout_ms: u64,
}

/// Metadata for one file descriptor
pub struct FdMeta {
    fd: i32,
    state: Mutex<FdMetaState>,
}

impl FdMeta {
    fn new(fd: i32) -> FdMeta {
        let meta = FdMeta {
            fd,
            state: Mutex::new(FdMetaState {
                initialized: false,
                is_socket: false,
                sys_nonblock: false,
                user_nonblock: false,
                closed: false,
                recv_timeout_ms: u64::MAX,
                send_timeout_ms: u64::MAX,
            }),
        };
        meta.init();
        meta
    }

    /// Probe the descriptor and, for sockets, force the kernel fd into
    /// non-blocking mode.
    fn init(&self) {
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            return;
        }

        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut statbuf) } == -1 {
            state.initialized = false;
            state.is_socket = false;
        } else {
            state.initialized = true;
            state.is_socket = (statbuf.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        }

        if state.is_socket {
            let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            state.sys_nonblock = true;
            ktrace!("fd {}: socket, forced non-blocking", self.fd);
        } else {
            state.sys_nonblock = false;
        }
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_init(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    pub fn is_socket(&self) -> bool {
        self.state.lock().unwrap().is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn sys_nonblock(&self) -> bool {
        self.state.lock().unwrap().sys_nonblock
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.state.lock().unwrap().sys_nonblock = v;
    }

    /// The blocking mode the application asked for, not what the kernel
    /// fd is actually in
    pub fn user_nonblock(&self) -> bool {
        self.state.lock().unwrap().user_nonblock
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.state.lock().unwrap().user_nonblock = v;
    }

    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        let state = self.state.lock().unwrap();
        match kind {
            TimeoutKind::Recv => state.recv_timeout_ms,
            TimeoutKind::Send => state.send_timeout_ms,
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        let mut state = self.state.lock().unwrap();
        match kind {
            TimeoutKind::Recv => state.recv_timeout_ms = ms,
            TimeoutKind::Send => state.send_timeout_ms = ms,
        }
    }

    fn mark_closed(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// Process-wide fd metadata table, dense vector keyed by fd
pub struct FdTable {
    slots: Mutex<Vec<Option<Arc<FdMeta>>>>,
}

static FD_TABLE: OnceLock<FdTable> = OnceLock::new();

impl FdTable {
    /// The process-wide table
    pub fn instance() -> &'static FdTable {
        FD_TABLE.get_or_init(|| FdTable {
            slots: Mutex::new(vec![None; 64]),
        })
    }

    /// Look up metadata for `fd`. With `auto_create` a missing entry is
    /// probed and installed (growing the table geometrically).
    pub fn get(&self, fd: i32, auto_create: bool) -> Option<Arc<FdMeta>> {
        if fd < 0 {
            return None;
        }
        let mut slots = self.slots.lock().unwrap();
        let idx = fd as usize;

        if idx < slots.len() {
            if let Some(meta) = &slots[idx] {
                return Some(meta.clone());
            }
            if !auto_create {
                return None;
            }
        } else if !auto_create {
            return None;
        }

        if idx >= slots.len() {
            let new_len = std::cmp::max(idx * 3 / 2, idx + 1);
            slots.resize(new_len, None);
        }
        let meta = Arc::new(FdMeta::new(fd));
        slots[idx] = Some(meta.clone());
        Some(meta)
    }

    /// Drop the entry for `fd` (hooked `close` calls this)
    pub fn del(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.lock().unwrap();
        let idx = fd as usize;
        if idx < slots.len() {
            if let Some(meta) = slots[idx].take() {
                meta.mark_closed();
            }
        }
    }
}
