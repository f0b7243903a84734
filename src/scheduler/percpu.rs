//! Per-CPU thread queue.
//!
//! Each CPU owns three run queues — realtime, timeshare, idle — behind one
//! spinlock, plus the lock-free fields other CPUs read while picking a
//! destination: the cached `lowpri`, the load counters and the
//! `owe_preempt` wake request.
//!
//! The timeshare queue runs a rotation: `idx` is where new batch threads
//! are inserted (biased by their priority) and `ridx` is where `choose`
//! drains. While `ridx != idx` a previous rotation is still draining and no
//! insertion may land on `ridx`.

use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use super::context::TrapFrame;
use super::runq::RunQueue;
use super::table::{ThreadId, ThreadTable, NO_THREAD};
use super::types::*;

/// Divisor-load at which timeshare slices bottom out.
pub const SCHED_SLICE_MIN_DIVISOR: u32 = 6;

/// Run-queue state guarded by the queue spinlock.
pub struct TdqData {
    pub realtime: RunQueue,
    pub timeshare: RunQueue,
    pub idle: RunQueue,
    /// Rotating insertion cursor for the timeshare queue.
    pub idx: u8,
    /// Drain cursor; `choose` scans from here.
    pub ridx: u8,
}

impl TdqData {
    fn new() -> TdqData {
        TdqData {
            realtime: RunQueue::new(),
            timeshare: RunQueue::new(),
            idle: RunQueue::new(),
            idx: 0,
            ridx: 0,
        }
    }
}

/// One CPU's scheduler state.
pub struct PerCpu {
    pub(crate) tdq: Mutex<TdqData>,

    /// Best priority present (current thread or any runnable); read with
    /// acquire ordering from other CPUs.
    lowpri: AtomicU8,
    /// Remote preemption request; set after a fence so the queued thread
    /// is visible before the wake-up.
    owepreempt: AtomicBool,
    /// Runnable plus running threads.
    load: AtomicU32,
    /// As `load`, excluding `TDF_NOLOAD` threads.
    sysload: AtomicU32,
    /// Threads eligible to migrate away.
    transferable: AtomicU32,
    switchcnt: AtomicU32,
    oldswitchcnt: AtomicU32,

    curthread: AtomicUsize,
    idle_thread: AtomicUsize,

    /// Local tick counter advanced by `hardclock`.
    pub(crate) cpu_ticks: AtomicU32,
    /// Global tick at the last context switch, for runtime charging.
    pub(crate) switchtick: AtomicU32,
    pub(crate) swvoltick: AtomicU32,
    pub(crate) swinvoltick: AtomicU32,
    /// Trap frame being serviced, owned by the trap entry while non-null.
    pub(crate) cur_frame: AtomicPtr<TrapFrame>,
}

impl PerCpu {
    pub fn new() -> PerCpu {
        PerCpu {
            tdq: Mutex::new(TdqData::new()),
            lowpri: AtomicU8::new(PRI_MAX_IDLE),
            owepreempt: AtomicBool::new(false),
            load: AtomicU32::new(0),
            sysload: AtomicU32::new(0),
            transferable: AtomicU32::new(0),
            switchcnt: AtomicU32::new(0),
            oldswitchcnt: AtomicU32::new(0),
            curthread: AtomicUsize::new(NO_THREAD),
            idle_thread: AtomicUsize::new(NO_THREAD),
            cpu_ticks: AtomicU32::new(0),
            switchtick: AtomicU32::new(0),
            swvoltick: AtomicU32::new(0),
            swinvoltick: AtomicU32::new(0),
            cur_frame: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    // ========================================================================
    // Lock-free accessors
    // ========================================================================

    pub fn lowpri(&self) -> u8 {
        self.lowpri.load(Ordering::Acquire)
    }

    /// Lower the cached best priority to at most `pri`, returning the
    /// previous value. Called under the queue lock when a thread arrives.
    pub(crate) fn lower_lowpri(&self, pri: u8) -> u8 {
        self.lowpri.fetch_min(pri, Ordering::AcqRel)
    }

    pub fn owe_preempt(&self) -> bool {
        self.owepreempt.load(Ordering::Acquire)
    }

    pub(crate) fn clear_owe_preempt(&self) {
        self.owepreempt.store(false, Ordering::Release);
    }

    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Acquire)
    }

    pub fn sysload(&self) -> u32 {
        self.sysload.load(Ordering::Acquire)
    }

    pub fn transferable(&self) -> u32 {
        self.transferable.load(Ordering::Acquire)
    }

    pub fn switchcnt(&self) -> u32 {
        self.switchcnt.load(Ordering::Relaxed)
    }

    pub fn curthread(&self) -> Option<ThreadId> {
        match self.curthread.load(Ordering::Acquire) {
            NO_THREAD => None,
            tid => Some(tid),
        }
    }

    pub(crate) fn set_curthread(&self, tid: ThreadId) {
        self.curthread.store(tid, Ordering::Release);
    }

    pub fn idle_thread(&self) -> Option<ThreadId> {
        match self.idle_thread.load(Ordering::Acquire) {
            NO_THREAD => None,
            tid => Some(tid),
        }
    }

    pub(crate) fn set_idle_thread(&self, tid: ThreadId) {
        self.idle_thread.store(tid, Ordering::Release);
    }

    pub(crate) fn bump_switchcnt(&self) {
        self.switchcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the switch counter when the CPU goes idle.
    pub(crate) fn note_idle(&self) {
        self.oldswitchcnt
            .store(self.switchcnt.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Record the trap frame being serviced so diagnostics can reach the
    /// interrupted context.
    pub fn set_cur_frame(&self, frame: &mut TrapFrame) {
        self.cur_frame.store(frame, Ordering::Release);
    }

    pub fn clear_cur_frame(&self) {
        self.cur_frame
            .store(core::ptr::null_mut(), Ordering::Release);
    }

    /// The frame currently being serviced, or null outside a trap.
    pub fn cur_frame(&self) -> *mut TrapFrame {
        self.cur_frame.load(Ordering::Acquire)
    }

    /// Tick of the last voluntary switch on this CPU.
    pub fn last_voluntary_switch(&self) -> u32 {
        self.swvoltick.load(Ordering::Relaxed)
    }

    /// Tick of the last involuntary switch on this CPU.
    pub fn last_involuntary_switch(&self) -> u32 {
        self.swinvoltick.load(Ordering::Relaxed)
    }

    /// Switches since the CPU last went idle.
    pub fn switches_since_idle(&self) -> u32 {
        self.switchcnt
            .load(Ordering::Relaxed)
            .wrapping_sub(self.oldswitchcnt.load(Ordering::Relaxed))
    }

    // ========================================================================
    // Run-queue management (queue lock held)
    // ========================================================================

    /// Place a runnable thread on the right run queue for its priority.
    pub(crate) fn runq_add(
        &self,
        data: &mut TdqData,
        td: &mut ThreadSched,
        tid: ThreadId,
        flags: u32,
    ) {
        debug_assert!(td.state == ThreadState::Runq);
        let pri = td.pri;
        let preempted = flags & SRQ_PREEMPTED != 0;

        if td.flags & (TDF_BOUND | TDF_IDLETD) == 0 {
            td.flags |= TDF_XFERABLE;
            self.transferable.fetch_add(1, Ordering::Release);
        }

        if pri < PRI_MIN_BATCH {
            let bucket = pri / RQ_PPQ;
            td.runq = Some(RunqKind::Realtime);
            td.rqindex = bucket;
            data.realtime.insert(bucket, tid, preempted);
        } else if pri <= PRI_MAX_BATCH {
            td.runq = Some(RunqKind::Timeshare);
            let bucket = if flags & (SRQ_BORROWING | SRQ_PREEMPTED) == 0 {
                let mut bucket = (RQ_NQS as u32 * (pri - PRI_MIN_BATCH) as u32
                    / PRI_BATCH_RANGE) as u8;
                bucket = (bucket + data.idx) % RQ_NQS as u8;
                // The rotation still draining at ridx must not have new
                // arrivals queued in front of it; shorten by one slot.
                if data.ridx != data.idx && bucket == data.ridx {
                    bucket = bucket.wrapping_sub(1) % RQ_NQS as u8;
                }
                bucket
            } else {
                data.ridx
            };
            td.rqindex = bucket;
            data.timeshare.insert(bucket, tid, preempted);
        } else {
            let bucket = pri / RQ_PPQ;
            td.runq = Some(RunqKind::Idle);
            td.rqindex = bucket;
            data.idle.insert(bucket, tid, preempted);
        }
    }

    /// Take a thread off whichever run queue it is on.
    pub(crate) fn runq_rem(&self, data: &mut TdqData, td: &mut ThreadSched, tid: ThreadId) {
        if td.flags & TDF_XFERABLE != 0 {
            td.flags &= !TDF_XFERABLE;
            self.transferable.fetch_sub(1, Ordering::Release);
        }
        let bucket = td.rqindex;
        match td.runq.take() {
            Some(RunqKind::Realtime) => data.realtime.remove(bucket, tid, None),
            Some(RunqKind::Timeshare) => {
                if data.idx != data.ridx {
                    let mut ridx = data.ridx;
                    data.timeshare.remove(bucket, tid, Some(&mut ridx));
                    data.ridx = ridx;
                } else {
                    data.timeshare.remove(bucket, tid, None);
                }
            }
            Some(RunqKind::Idle) => data.idle.remove(bucket, tid, None),
            None => {
                crate::kwarn!("tdq: thread {} has no run queue at remove", tid);
            }
        }
    }

    /// Best runnable thread: realtime first, then the timeshare rotation,
    /// then idle.
    pub(crate) fn choose(&self, data: &TdqData) -> Option<(ThreadId, RunqKind)> {
        if let Some(tid) = data.realtime.choose() {
            return Some((tid, RunqKind::Realtime));
        }
        if let Some((tid, _bucket)) = data.timeshare.choose_from(data.ridx) {
            return Some((tid, RunqKind::Timeshare));
        }
        data.idle.choose().map(|tid| (tid, RunqKind::Idle))
    }

    // ========================================================================
    // Load accounting (queue lock held)
    // ========================================================================

    pub(crate) fn load_add(&self, td: &ThreadSched) {
        self.load.fetch_add(1, Ordering::Release);
        if td.flags & TDF_NOLOAD == 0 {
            self.sysload.fetch_add(1, Ordering::Release);
        }
    }

    pub(crate) fn load_rem(&self, td: &ThreadSched) {
        self.load.fetch_sub(1, Ordering::Release);
        if td.flags & TDF_NOLOAD == 0 {
            self.sysload.fetch_sub(1, Ordering::Release);
        }
    }

    /// Slice length for a timeshare thread under the current load.
    pub(crate) fn slice(&self, sched_slice: u32, sched_slice_min: u32) -> u32 {
        let load = self.sysload().saturating_sub(1);
        if load >= SCHED_SLICE_MIN_DIVISOR {
            sched_slice_min
        } else if load <= 1 {
            sched_slice
        } else {
            sched_slice / load
        }
    }

    /// Recompute `lowpri` from the current thread and the best runnable.
    ///
    /// # Safety contract
    /// Called with the queue lock held; `current` and every queued thread
    /// are owned by that lock.
    pub(crate) fn set_lowpri(
        &self,
        data: &TdqData,
        table: &ThreadTable,
        current: Option<ThreadId>,
    ) {
        let mut low = PRI_MAX_IDLE;
        if let Some(tid) = current {
            low = unsafe { table.td(tid) }.pri;
        }
        if let Some((tid, _)) = self.choose(data) {
            low = low.min(unsafe { table.td(tid) }.pri);
        }
        self.lowpri.store(low, Ordering::Release);
    }

    /// Raise the remote wake request if an incoming thread at `pri` should
    /// preempt this queue. The fence orders the queued thread's insertion
    /// before the flag so the remote CPU cannot observe the request without
    /// the thread.
    pub(crate) fn notify(&self, should_preempt: bool) {
        if self.owe_preempt() || !should_preempt {
            return;
        }
        fence(Ordering::SeqCst);
        self.owepreempt.store(true, Ordering::Release);
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        PerCpu::new()
    }
}
