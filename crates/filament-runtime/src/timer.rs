//! Timed wakeups on the system clock
//!
//! A [`TimerManager`] keeps pending timers ordered by absolute fire time
//! (ties broken by insertion order) and hands expired callbacks to the
//! reactor's idle loop. Cancellation removes the entry eagerly, so
//! `has_timer`/`next_timeout` reflect cancellations immediately.
//!
//! The system clock can move. The only correction applied is for a
//! backward jump of more than one hour between successive
//! `collect_expired` calls; that round treats every pending timer as
//! expired. Forward jumps and small backward jumps are not corrected,
//! so recurring timers may fire late.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, SystemTime};

/// Shared, re-runnable timer callback (recurring timers fire it many times)
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Backward clock jumps beyond this window flush the whole timer set
const ROLLOVER_WINDOW: Duration = Duration::from_millis(60 * 60 * 1000);

/// Ordering key: absolute fire time, then insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    next: SystemTime,
    seq: u64,
}

struct TimerState {
    /// Period in milliseconds
    ms: u64,
    /// Absolute next fire time
    next: SystemTime,
    /// Insertion sequence of the live map entry
    seq: u64,
    /// None once cancelled or fired (one-shot)
    cb: Option<TimerCallback>,
}

/// A pending timed wakeup
///
/// While a timer sits in the manager's set its callback is non-null;
/// `cancel` nulls the callback and removes the entry.
pub struct Timer {
    recurring: bool,
    state: Mutex<TimerState>,
    manager: Weak<TimerManager>,
    /// Back-reference to the owning Arc, for reinsertion into the set
    me: OnceLock<Weak<Timer>>,
}

impl Timer {
    /// Cancel the timer: the callback will never fire. Idempotent after
    /// the first success.
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write().unwrap();
        let mut st = self.state.lock().unwrap();
        if st.cb.is_none() {
            return false;
        }
        st.cb = None;
        inner.timers.remove(&TimerKey {
            next: st.next,
            seq: st.seq,
        });
        true
    }

    /// Restart the countdown: next fire time becomes now + period
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let Some(me) = self.me.get().and_then(|w| w.upgrade()) else {
            return false;
        };
        let mut inner = mgr.inner.write().unwrap();
        let mut st = self.state.lock().unwrap();
        if st.cb.is_none() {
            return false;
        }
        if inner
            .timers
            .remove(&TimerKey {
                next: st.next,
                seq: st.seq,
            })
            .is_none()
        {
            return false;
        }
        st.next = SystemTime::now() + Duration::from_millis(st.ms);
        st.seq = inner.next_seq();
        inner.timers.insert(
            TimerKey {
                next: st.next,
                seq: st.seq,
            },
            me,
        );
        true
    }

    /// Change the period.
    ///
    /// With `from_now` the countdown restarts from the current time;
    /// otherwise the original start point is kept and only the period
    /// changes. A no-op (returning true) when the period is unchanged
    /// and `from_now` is false.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        {
            let st = self.state.lock().unwrap();
            if ms == st.ms && !from_now {
                return true;
            }
        }
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let Some(me) = self.me.get().and_then(|w| w.upgrade()) else {
            return false;
        };

        let at_front;
        {
            let mut inner = mgr.inner.write().unwrap();
            let mut st = self.state.lock().unwrap();
            if st.cb.is_none() {
                return false;
            }
            if inner
                .timers
                .remove(&TimerKey {
                    next: st.next,
                    seq: st.seq,
                })
                .is_none()
            {
                return false;
            }
            let now = SystemTime::now();
            let start = if from_now {
                now
            } else {
                st.next
                    .checked_sub(Duration::from_millis(st.ms))
                    .unwrap_or(now)
            };
            st.ms = ms;
            st.next = start + Duration::from_millis(ms);
            st.seq = inner.next_seq();
            let key = TimerKey {
                next: st.next,
                seq: st.seq,
            };
            inner.timers.insert(key, me);
            at_front = mgr.front_latch(&inner, key);
        }
        if at_front {
            mgr.notify_front();
        }
        true
    }
}

struct TimerMapInner {
    timers: BTreeMap<TimerKey, Arc<Timer>>,
    seq: u64,
    /// Clock sample of the previous collect_expired round
    prev_time: SystemTime,
}

impl TimerMapInner {
    fn next_seq(&mut self) -> u64 {
        let s = self.seq;
        self.seq += 1;
        s
    }
}

/// Ordered set of pending timers
pub struct TimerManager {
    inner: RwLock<TimerMapInner>,
    /// Back-reference to the owning Arc, planted into timers
    self_weak: OnceLock<Weak<TimerManager>>,
    /// Front-insert notification latch: set when the owner was poked,
    /// cleared by `next_timeout`. Keeps duplicate wakeups down to one
    /// per idle-loop iteration.
    tickled: AtomicBool,
    /// Invoked (outside the lock) when a new earliest timer appears
    on_front: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        let mgr = Arc::new(TimerManager {
            inner: RwLock::new(TimerMapInner {
                timers: BTreeMap::new(),
                seq: 0,
                prev_time: SystemTime::now(),
            }),
            self_weak: OnceLock::new(),
            tickled: AtomicBool::new(false),
            on_front: OnceLock::new(),
        });
        let _ = mgr.self_weak.set(Arc::downgrade(&mgr));
        mgr
    }

    /// Install the front-insert hook (the reactor's tickle). One shot.
    pub fn set_front_notifier(&self, f: impl Fn() + Send + Sync + 'static) {
        let _ = self.on_front.set(Box::new(f));
    }

    /// Add a timer firing in `ms` milliseconds; recurring timers
    /// reschedule themselves on every fire.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.add_timer_cb(ms, Arc::new(cb) as TimerCallback, recurring)
    }

    /// Add a timer whose callback only runs while `cond` is still
    /// upgradable; once the condition owner is gone the fire is elided.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn add_timer_cb(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let next = SystemTime::now() + Duration::from_millis(ms);
        let timer = Arc::new(Timer {
            recurring,
            state: Mutex::new(TimerState {
                ms,
                next,
                seq: 0,
                cb: Some(cb),
            }),
            manager: self.self_weak.get().cloned().unwrap_or_default(),
            me: OnceLock::new(),
        });
        let _ = timer.me.set(Arc::downgrade(&timer));

        let at_front;
        {
            let mut inner = self.inner.write().unwrap();
            let mut st = timer.state.lock().unwrap();
            st.seq = inner.next_seq();
            let key = TimerKey {
                next: st.next,
                seq: st.seq,
            };
            inner.timers.insert(key, timer.clone());
            at_front = self.front_latch(&inner, key);
        }
        if at_front {
            self.notify_front();
        }
        timer
    }

    /// Milliseconds until the earliest timer: 0 when overdue, `u64::MAX`
    /// when the set is empty. Clears the notification latch.
    pub fn next_timeout(&self) -> u64 {
        self.tickled.store(false, Ordering::Release);
        let inner = self.inner.read().unwrap();
        let Some((key, _)) = inner.timers.first_key_value() else {
            return u64::MAX;
        };
        match key.next.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining.as_millis() as u64,
            Err(_) => 0,
        }
    }

    /// Whether any timer is pending
    pub fn has_timer(&self) -> bool {
        !self.inner.read().unwrap().timers.is_empty()
    }

    /// Drain expired timers into `cbs`, in non-decreasing fire order.
    ///
    /// A backward clock jump larger than one hour since the previous
    /// round expires everything. Recurring timers are reinserted with
    /// next = now + period; one-shot timers release their callback.
    pub fn collect_expired(&self, cbs: &mut Vec<TimerCallback>) {
        let now = SystemTime::now();
        let mut inner = self.inner.write().unwrap();
        let rollover = Self::detect_rollover(&mut inner, now);

        let mut requeue = Vec::new();
        loop {
            let expired = match inner.timers.first_key_value() {
                None => break,
                Some((key, _)) => rollover || key.next <= now,
            };
            if !expired {
                break;
            }
            let (_, timer) = inner.timers.pop_first().unwrap();
            let mut st = timer.state.lock().unwrap();
            let Some(cb) = st.cb.clone() else {
                continue;
            };
            cbs.push(cb);
            if timer.recurring {
                st.next = now + Duration::from_millis(st.ms);
                drop(st);
                requeue.push(timer);
            } else {
                st.cb = None;
            }
        }

        // Reinsert after the drain so a zero-period recurring timer
        // cannot respin inside this round.
        for timer in requeue {
            let mut st = timer.state.lock().unwrap();
            st.seq = inner.next_seq();
            inner.timers.insert(
                TimerKey {
                    next: st.next,
                    seq: st.seq,
                },
                timer.clone(),
            );
        }
    }

    /// Whether `key` became the new minimum and the owner has not been
    /// poked since the last `next_timeout`. Sets the latch when true.
    fn front_latch(&self, inner: &TimerMapInner, key: TimerKey) -> bool {
        let is_front = inner
            .timers
            .first_key_value()
            .map(|(k, _)| *k == key)
            .unwrap_or(false);
        if is_front && !self.tickled.load(Ordering::Acquire) {
            self.tickled.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn notify_front(&self) {
        if let Some(f) = self.on_front.get() {
            f();
        }
    }

    fn detect_rollover(inner: &mut TimerMapInner, now: SystemTime) -> bool {
        let rollover = match inner.prev_time.checked_sub(ROLLOVER_WINDOW) {
            Some(threshold) => now < threshold,
            None => false,
        };
        inner.prev_time = now;
        rollover
    }

    #[cfg(test)]
    fn set_prev_time(&self, t: SystemTime) {
        self.inner.write().unwrap().prev_time = t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn drain(mgr: &Arc<TimerManager>) -> usize {
        let mut cbs = Vec::new();
        mgr.collect_expired(&mut cbs);
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn test_empty_manager() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout(), u64::MAX);
        assert!(!mgr.has_timer());
        let mut cbs = Vec::new();
        mgr.collect_expired(&mut cbs);
        assert!(cbs.is_empty());
    }

    #[test]
    fn test_fire_and_release() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        mgr.add_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(mgr.has_timer());
        assert_eq!(drain(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // One-shot: gone after firing
        assert!(!mgr.has_timer());
        assert_eq!(mgr.next_timeout(), u64::MAX);
    }

    #[test]
    fn test_expiry_order_is_non_decreasing() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for ms in [30u64, 10, 20] {
            let o = order.clone();
            mgr.add_timer(
                ms,
                move || {
                    o.lock().unwrap().push(ms);
                },
                false,
            );
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(drain(&mgr), 3);
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = mgr.add_timer(
            10_000,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(timer.cancel());
        // Removed eagerly: the set is empty right away
        assert!(!mgr.has_timer());
        assert_eq!(mgr.next_timeout(), u64::MAX);
        assert_eq!(drain(&mgr), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // Second cancel reports failure
        assert!(!timer.cancel());
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = mgr.add_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(drain(&mgr), 1);
        assert!(mgr.has_timer());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(drain(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_reset_same_period_is_noop() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(5000, || {}, false);
        let seq_before = timer.state.lock().unwrap().seq;
        assert!(timer.reset(5000, false));
        // Entry untouched: same position in the set
        assert_eq!(timer.state.lock().unwrap().seq, seq_before);
    }

    #[test]
    fn test_reset_from_now_shortens() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = mgr.add_timer(
            60_000,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(timer.reset(10, true));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(drain(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_restarts_countdown() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(40, || {}, false);
        std::thread::sleep(Duration::from_millis(25));
        assert!(timer.refresh());
        // Refreshed to now+40: nothing is due yet
        assert_eq!(drain(&mgr), 0);
        assert!(mgr.has_timer());

        assert!(timer.cancel());
        assert!(!timer.refresh());
    }

    #[test]
    fn test_condition_timer_elides_after_drop() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let cond = Arc::new(());
        let h = hits.clone();
        mgr.add_condition_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&cond),
            false,
        );
        drop(cond);
        assert_eq!(drain(&mgr), 1);
        // Collected but elided: the condition owner is gone
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let cond = Arc::new(());
        let h = hits.clone();
        mgr.add_condition_timer(
            0,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&cond),
            false,
        );
        assert_eq!(drain(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rollover_boundary() {
        // Backward jump of exactly one hour: not a rollover
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        mgr.add_timer(
            3_600_000,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        mgr.set_prev_time(SystemTime::now() + Duration::from_millis(60 * 60 * 1000));
        assert_eq!(drain(&mgr), 0);

        // One hour plus a healthy margin: everything expires this round
        mgr.set_prev_time(SystemTime::now() + Duration::from_millis(60 * 60 * 1000 + 5000));
        assert_eq!(drain(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_front_insert_notification_latch() {
        let mgr = TimerManager::new();
        let pokes = Arc::new(AtomicUsize::new(0));
        let p = pokes.clone();
        mgr.set_front_notifier(move || {
            p.fetch_add(1, Ordering::SeqCst);
        });

        let _far = mgr.add_timer(50_000, || {}, false);
        assert_eq!(pokes.load(Ordering::SeqCst), 1);

        // New front, but the latch is still set: no duplicate poke
        let _nearer = mgr.add_timer(20_000, || {}, false);
        assert_eq!(pokes.load(Ordering::SeqCst), 1);

        // next_timeout clears the latch; the next front insert pokes again
        let _ = mgr.next_timeout();
        let _nearest = mgr.add_timer(1_000, || {}, false);
        assert_eq!(pokes.load(Ordering::SeqCst), 2);

        // Not at the front: never pokes
        let _back = mgr.add_timer(90_000, || {}, false);
        assert_eq!(pokes.load(Ordering::SeqCst), 2);
    }
}
