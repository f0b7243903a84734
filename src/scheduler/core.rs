//! Scheduler core: preemption policy, CPU selection, sleep/wake, priority
//! lending, the clock tick, and the context-switch state machine.
//!
//! ## Locking
//!
//! Every thread is owned by exactly one spinlock at a time, named by its
//! lock tag: the thread queue of the CPU it runs or queues on, the shared
//! sleep lock while inhibited, or the blocked sentinel for the short window
//! between a CPU relinquishing a thread and its successor taking ownership.
//! `thread_lock` acquires whatever lock currently owns the thread, re-checks
//! the tag, and retries if ownership moved meanwhile. Spinning on the
//! blocked sentinel is expected and bounded by the other CPU's hand-off.
//!
//! ## Switching
//!
//! There are no coroutines: the switch path swaps trap frames in place.
//! `mi_switch` is reached from the timer trap (or any trap that decides to
//! reschedule) with the interrupted frame; the frame of the outgoing thread
//! is parked in its arena slot and the incoming thread's frame is written
//! over the live one, so the trap return resumes the new thread.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;
use lazy_static::lazy_static;

use crate::error::KernelError;
use crate::{kdebug, kinfo};

use super::context::TrapFrame;
use super::percpu::{PerCpu, TdqData};
use super::priority::{compute_priority, interact_update, pct_cpu, pctcpu_update};
use super::table::{ThreadId, ThreadTable, MAX_THREADS, TDL_BLOCKED, TDL_SLEEP};
use super::types::*;

/// CPUs the scheduler is dimensioned for.
pub const MAX_CPUS: usize = 16;

/// Timeshare slices are a tenth of this many ticks by default.
const SCHED_SLICE_DEFAULT_DIVISOR: u32 = 10;

pub(crate) enum TdLock<'a> {
    Queue(usize, spin::MutexGuard<'a, TdqData>),
    Sleep(#[allow(dead_code)] spin::MutexGuard<'a, ()>),
}

pub struct Scheduler {
    cpus: Box<[PerCpu]>,
    threads: ThreadTable,
    /// Shared lock owning every inhibited thread.
    sleep_lock: spin::Mutex<()>,
    /// Global tick counter; per-CPU counters feed it monotonically.
    ticks: AtomicU32,
    ncpus: AtomicUsize,

    hz: u32,
    /// Runtime charged per clock tick, shifted.
    tickincr: u32,
    /// Affinity window in ticks.
    affinity: u32,
    sched_slice: u32,
    sched_slice_min: u32,
    /// Priority at or below which a newly runnable thread unconditionally
    /// preempts. Zero disables threshold preemption.
    preempt_thresh: u8,
}

impl Scheduler {
    pub fn new(hz: u32) -> Scheduler {
        let sched_slice = (hz / SCHED_SLICE_DEFAULT_DIVISOR).max(1);
        let mut cpus = Vec::with_capacity(MAX_CPUS);
        cpus.resize_with(MAX_CPUS, PerCpu::new);
        Scheduler {
            cpus: cpus.into_boxed_slice(),
            threads: ThreadTable::new(MAX_THREADS),
            sleep_lock: spin::Mutex::new(()),
            ticks: AtomicU32::new(0),
            ncpus: AtomicUsize::new(1),
            hz,
            tickincr: 1 << SCHED_TICK_SHIFT,
            affinity: (hz / 1000).max(1),
            sched_slice,
            sched_slice_min: (sched_slice / super::percpu::SCHED_SLICE_MIN_DIVISOR).max(1),
            preempt_thresh: PRI_MIN_KERN,
        }
    }

    pub fn hz(&self) -> u32 {
        self.hz
    }

    pub fn ncpus(&self) -> usize {
        self.ncpus.load(Ordering::Acquire)
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn pcpu(&self, cpu: usize) -> &PerCpu {
        &self.cpus[cpu]
    }

    /// Bring the per-CPU structures for `ncpus` processors online. CPU 0's
    /// current context becomes the boot thread; the others sit in their
    /// idle threads until something migrates to them.
    pub fn init_cpus(&self, ncpus: usize) {
        let ncpus = ncpus.min(MAX_CPUS).max(1);
        self.ncpus.store(ncpus, Ordering::Release);
        for cpu in 0..ncpus {
            self.attach_cpu(cpu);
        }
    }

    fn attach_cpu(&self, cpu: usize) {
        let pc = &self.cpus[cpu];
        if pc.idle_thread().is_some() {
            return;
        }

        let mut idle = ThreadSched::new("idle", SchedClass::Idle, PRI_MAX_IDLE);
        idle.flags |= TDF_IDLETD | TDF_NOLOAD;
        idle.cpu = cpu as u32;
        let idle_tid = self.threads.create(idle).expect("thread arena exhausted at boot");
        pc.set_idle_thread(idle_tid);

        let cur = if cpu == 0 {
            let mut boot = ThreadSched::new("boot", SchedClass::Timeshare, PRI_MIN_KERN);
            boot.cpu = 0;
            self.threads.create(boot).expect("thread arena exhausted at boot")
        } else {
            idle_tid
        };

        let data = pc.tdq.lock();
        let slot = self.threads.slot(cur);
        slot.lock.store(cpu as u32, Ordering::Release);
        slot.critnest.store(0, Ordering::Relaxed);
        {
            // Safe: the queue lock owns the thread now.
            let td = unsafe { self.threads.td_mut(cur) };
            td.state = ThreadState::Running;
            td.oncpu = cpu as u32;
            // Idle threads never figure in the load.
            if td.flags & TDF_IDLETD == 0 {
                pc.load_add(td);
            }
        }
        pc.set_curthread(cur);
        pc.set_lowpri(&data, &self.threads, Some(cur));
        drop(data);

        if cur != idle_tid {
            // The idle thread waits for its first switch-in via the trap
            // return path, which runs one critical exit on its behalf.
            self.threads.slot(idle_tid).lock.store(cpu as u32, Ordering::Release);
            self.threads.slot(idle_tid).critnest.store(1, Ordering::Relaxed);
        }
        kdebug!("sched: CPU {} attached (curthread {})", cpu, cur);
    }

    // ========================================================================
    // Thread management
    // ========================================================================

    /// Allocate a thread in the arena. It starts `Inactive`, owned by the
    /// sleep lock, and runs for the first time after [`Scheduler::start`].
    pub fn thread_create(
        &self,
        name: &'static str,
        class: SchedClass,
        base_pri: u8,
    ) -> Result<ThreadId, KernelError> {
        let sched = ThreadSched::new(name, class, base_pri);
        let tid = self.threads.create(sched)?;
        // First entry happens through a trap return, which runs the
        // reschedule tail (one critical exit) on the thread's behalf.
        self.threads.slot(tid).critnest.store(1, Ordering::Relaxed);
        Ok(tid)
    }

    /// Make a freshly created thread runnable.
    pub fn start(&self, tid: ThreadId, cur_cpu: usize) {
        let guard = self.thread_lock(tid);
        {
            let td = unsafe { self.threads.td_mut(tid) };
            debug_assert_eq!(td.state, ThreadState::Inactive);
            td.state = ThreadState::CanRun;
        }
        self.sched_add(tid, SRQ_BORING, cur_cpu);
        drop(guard);
    }

    /// Run `f` under the thread's lock.
    pub fn with_thread<R>(&self, tid: ThreadId, f: impl FnOnce(&ThreadSched) -> R) -> R {
        let guard = self.thread_lock(tid);
        let result = f(unsafe { self.threads.td(tid) });
        drop(guard);
        result
    }

    /// Acquire whatever lock currently owns `tid`, retrying while
    /// ownership is in motion.
    pub(crate) fn thread_lock(&self, tid: ThreadId) -> TdLock<'_> {
        let slot = self.threads.slot(tid);
        loop {
            let tag = slot.lock.load(Ordering::Acquire);
            match tag {
                TDL_BLOCKED => core::hint::spin_loop(),
                TDL_SLEEP => {
                    let guard = self.sleep_lock.lock();
                    if slot.lock.load(Ordering::Relaxed) == TDL_SLEEP {
                        return TdLock::Sleep(guard);
                    }
                }
                cpu => {
                    let guard = self.cpus[cpu as usize].tdq.lock();
                    if slot.lock.load(Ordering::Relaxed) == tag {
                        return TdLock::Queue(cpu as usize, guard);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Preemption policy and CPU selection
    // ========================================================================

    /// Whether a newly runnable thread at `pri` should preempt a CPU whose
    /// best priority is `cpri`. Monotone in `pri`: lowering `pri` never
    /// turns a yes into a no.
    pub fn should_preempt(&self, pri: u8, cpri: u8, remote: bool) -> bool {
        if pri >= cpri {
            return false;
        }
        if cpri >= PRI_MIN_IDLE {
            return true;
        }
        if self.preempt_thresh == 0 {
            return false;
        }
        if pri <= self.preempt_thresh {
            return true;
        }
        if remote && pri <= PRI_MAX_INTERACT && cpri > PRI_MAX_INTERACT {
            return true;
        }
        false
    }

    /// Pick a CPU for a thread that is becoming runnable.
    ///
    /// Interrupt threads prefer the CPU that scheduled them, recently-run
    /// threads keep their cache affinity when their last CPU is idle, and
    /// everything else lands on the least-loaded CPU — unless the current
    /// CPU can take the thread immediately at no extra load.
    fn pick_cpu(&self, td: &mut ThreadSched, flags: u32, cur_cpu: usize) -> usize {
        let ncpus = self.ncpus();
        if flags & SRQ_OURSELF != 0 {
            return td.cpu as usize;
        }
        let ticks = self.ticks();

        if td.pri <= PRI_MAX_ITHD {
            if self.cpus[cur_cpu].lowpri() >= PRI_MIN_IDLE {
                return cur_cpu;
            }
            td.cpu = cur_cpu as u32;
        }

        let last = td.cpu as usize;
        if last < ncpus
            && self.cpus[last].lowpri() >= PRI_MIN_IDLE
            && ticks.wrapping_sub(td.rltick) < 2 * self.affinity
        {
            return last;
        }

        let mut best = cur_cpu;
        let mut best_load = u32::MAX;
        for cpu in 0..ncpus {
            let load = self.cpus[cpu].load();
            if load < best_load {
                best_load = load;
                best = cpu;
            }
        }

        // Prefer running locally over queueing behind nothing better.
        let cur = &self.cpus[cur_cpu];
        if self.cpus[best].lowpri() < PRI_MIN_IDLE
            && cur.lowpri() > td.pri
            && cur.load() <= best_load
        {
            return cur_cpu;
        }
        best
    }

    // ========================================================================
    // Making threads runnable
    // ========================================================================

    /// Place a runnable thread on a queue. The caller holds the thread's
    /// current lock; ownership transfers to the chosen queue.
    fn sched_add(&self, tid: ThreadId, flags: u32, cur_cpu: usize) {
        let (cpu, pri) = {
            let td = unsafe { self.threads.td_mut(tid) };
            debug_assert_eq!(td.state, ThreadState::CanRun);
            let cpu = if self.ncpus() > 1 {
                self.pick_cpu(td, flags, cur_cpu)
            } else {
                0
            };
            td.cpu = cpu as u32;
            (cpu, td.pri)
        };

        let pc = &self.cpus[cpu];
        let mut data = pc.tdq.lock();
        self.threads.slot(tid).lock.store(cpu as u32, Ordering::Release);
        {
            let td = unsafe { self.threads.td_mut(tid) };
            td.state = ThreadState::Runq;
            pc.runq_add(&mut data, td, tid, flags);
            pc.load_add(td);
        }
        let old_lowpri = pc.lower_lowpri(pri);

        if cpu != cur_cpu {
            pc.notify(self.should_preempt(pri, old_lowpri, true));
        } else if let Some(ctid) = pc.curthread() {
            // Local wake-up: ask the running thread to yield at the next
            // safe boundary if the newcomer beats it.
            let ctd = unsafe { self.threads.td_mut(ctid) };
            if pri < ctd.pri {
                ctd.flags |= TDF_NEEDRESCHED;
            }
        }
        drop(data);
    }

    // ========================================================================
    // Priority adjustment and lending
    // ========================================================================

    /// Apply an effective-priority change, fixing up whatever structure the
    /// thread currently occupies.
    fn thread_priority_locked(&self, tid: ThreadId, prio: u8, lock: &mut TdLock<'_>) {
        let (state, old) = {
            let td = unsafe { self.threads.td(tid) };
            (td.state, td.pri)
        };
        if old == prio {
            return;
        }
        match state {
            ThreadState::Runq => {
                if let TdLock::Queue(cpu, data) = lock {
                    let pc = &self.cpus[*cpu];
                    {
                        let td = unsafe { self.threads.td_mut(tid) };
                        pc.runq_rem(data, td, tid);
                        pc.load_rem(td);
                        td.pri = prio;
                        pc.runq_add(data, td, tid, SRQ_BORROWING);
                        pc.load_add(td);
                    }
                    pc.set_lowpri(data, &self.threads, pc.curthread());
                }
            }
            ThreadState::Running => {
                {
                    let td = unsafe { self.threads.td_mut(tid) };
                    td.pri = prio;
                }
                if let TdLock::Queue(cpu, data) = lock {
                    let pc = &self.cpus[*cpu];
                    if prio < pc.lowpri() {
                        pc.lower_lowpri(prio);
                    } else if pc.lowpri() == old {
                        pc.set_lowpri(data, &self.threads, Some(tid));
                    }
                }
            }
            _ => {
                let td = unsafe { self.threads.td_mut(tid) };
                td.pri = prio;
            }
        }
    }

    /// Set a thread's base priority, keeping any lent priority in force.
    pub fn sched_prio(&self, tid: ThreadId, prio: u8) {
        let mut guard = self.thread_lock(tid);
        self.sched_prio_locked(tid, prio, &mut guard);
        drop(guard);
    }

    fn sched_prio_locked(&self, tid: ThreadId, prio: u8, lock: &mut TdLock<'_>) {
        let lowered = {
            let td = unsafe { self.threads.td_mut(tid) };
            td.base_pri = prio;
            td.flags & TDF_BORROWING != 0 && td.pri < prio
        };
        // A borrowed priority is never degraded by base changes.
        if lowered {
            return;
        }
        self.thread_priority_locked(tid, prio, lock);
    }

    /// Lend `prio` to a thread (priority inheritance donor side).
    pub fn lend_priority(&self, tid: ThreadId, prio: u8) {
        let mut guard = self.thread_lock(tid);
        {
            let td = unsafe { self.threads.td_mut(tid) };
            td.flags |= TDF_BORROWING;
        }
        self.thread_priority_locked(tid, prio, &mut guard);
        drop(guard);
    }

    /// Retract a lend of `prio`, restoring the base (or user) priority
    /// unless a still-lower lend remains in force.
    pub fn unlend_priority(&self, tid: ThreadId, prio: u8) {
        let mut guard = self.thread_lock(tid);
        let (cur, base) = {
            let td = unsafe { self.threads.td(tid) };
            let base = if td.base_pri >= PRI_MIN_TIMESHARE && td.base_pri <= PRI_MAX_TIMESHARE {
                td.user_pri
            } else {
                td.base_pri
            };
            (td.pri, base)
        };
        if cur < prio {
            // Someone else lent a better priority after this one; it stays
            // lent and the borrow remains.
            drop(guard);
            return;
        }
        {
            let td = unsafe { self.threads.td_mut(tid) };
            td.flags &= !TDF_BORROWING;
        }
        self.thread_priority_locked(tid, base, &mut guard);
        drop(guard);
    }

    /// Lend a *user* priority (e.g. from a priority-propagating lock the
    /// thread holds in user space).
    pub fn lend_user_priority(&self, tid: ThreadId, prio: u8) {
        let mut guard = self.thread_lock(tid);
        let demote = {
            let td = unsafe { self.threads.td_mut(tid) };
            td.lend_user_pri = prio;
            td.user_pri = prio.min(td.base_user_pri);
            if td.pri > td.user_pri {
                Some(td.user_pri)
            } else {
                td.flags |= TDF_NEEDRESCHED;
                None
            }
        };
        if let Some(pri) = demote {
            self.sched_prio_locked(tid, pri, &mut guard);
        }
        drop(guard);
    }

    /// Change a thread's nice value and recompute its user priority.
    pub fn set_nice(&self, tid: ThreadId, nice: i32) {
        let mut guard = self.thread_lock(tid);
        let apply = {
            let td = unsafe { self.threads.td_mut(tid) };
            td.nice = nice.clamp(PRIO_MIN, PRIO_MAX - 1) as i8;
            compute_priority(td, self.hz);
            if td.class == SchedClass::Timeshare
                && td.flags & TDF_BORROWING == 0
                && td.pri >= PRI_MIN_TIMESHARE
            {
                Some(td.user_pri)
            } else {
                None
            }
        };
        if let Some(pri) = apply {
            self.thread_priority_locked(tid, pri, &mut guard);
        }
        drop(guard);
    }

    /// Recent CPU usage of a thread, 0-100.
    pub fn pct_cpu(&self, tid: ThreadId) -> u32 {
        let guard = self.thread_lock(tid);
        let ticks = self.ticks();
        let pct = {
            let td = unsafe { self.threads.td_mut(tid) };
            pctcpu_update(td, ticks, td.state == ThreadState::Running, self.hz);
            pct_cpu(td, self.hz)
        };
        drop(guard);
        pct
    }

    // ========================================================================
    // Sleep and wake-up
    // ========================================================================

    /// Record that the current thread is going to sleep. The actual
    /// removal from the CPU happens at the next `mi_switch`.
    pub fn sleep(&self, tid: ThreadId) {
        let mut guard = self.thread_lock(tid);
        let demote = {
            let td = unsafe { self.threads.td_mut(tid) };
            td.slptick = self.ticks();
            td.class == SchedClass::Timeshare && td.pri > PRI_MIN_BATCH
        };
        if demote {
            // Give sleepers at batch priorities a boost so they respond
            // promptly when woken.
            self.thread_priority_locked(tid, PRI_MIN_BATCH, &mut guard);
        }
        {
            let td = unsafe { self.threads.td_mut(tid) };
            td.inhibitors |= TDI_SLEEPING;
            td.state = ThreadState::Inhibited;
        }
        drop(guard);
    }

    /// Wake a sleeping thread and put it back on a run queue.
    pub fn wakeup(&self, tid: ThreadId, srq_flags: u32, cur_cpu: usize) {
        let guard = self.thread_lock(tid);
        let ticks = self.ticks();
        {
            let td = unsafe { self.threads.td_mut(tid) };
            td.inhibitors &= !TDI_SLEEPING;
            if td.inhibitors != 0 {
                drop(guard);
                return;
            }
            td.state = ThreadState::CanRun;

            let slptick = td.slptick;
            td.slptick = 0;
            if slptick != 0 && slptick != ticks {
                td.slptime = td
                    .slptime
                    .wrapping_add(ticks.wrapping_sub(slptick) << SCHED_TICK_SHIFT);
                interact_update(td, self.hz);
                pctcpu_update(td, ticks, false, self.hz);
            }
            if td.class == SchedClass::Interrupt && td.pri != td.base_ithread_pri {
                td.pri = td.base_ithread_pri;
            }
            // Sleeping advanced the rotation past us; start a fresh slice.
            td.slice = 0;
        }
        self.sched_add(tid, SRQ_BORING | srq_flags, cur_cpu);
        drop(guard);
    }

    // ========================================================================
    // Clock
    // ========================================================================

    /// Advance this CPU's tick counter and publish the global tick.
    /// The global counter only moves forward; concurrent publishers cannot
    /// stall each other.
    pub fn hardclock(&self, cpu: usize, cnt: u32) {
        let pc = &self.cpus[cpu];
        let local = pc.cpu_ticks.fetch_add(cnt, Ordering::AcqRel) + cnt;
        self.ticks.fetch_max(local, Ordering::AcqRel);
    }

    /// Per-tick scheduler work for the current thread of `cpu`.
    pub fn clock(&self, cpu: usize, cnt: u32) {
        let pc = &self.cpus[cpu];
        let mut data = pc.tdq.lock();

        // Advance the timeshare insertion point once per tick so every
        // bucket eventually takes new arrivals; drag the drain cursor along
        // when its bucket is already empty.
        if data.idx == data.ridx {
            data.idx = (data.idx + 1) % RQ_NQS as u8;
            if data.timeshare.bucket_is_empty(data.ridx) {
                data.ridx = data.idx;
            }
        }

        let Some(tid) = pc.curthread() else {
            return;
        };
        let ticks = self.ticks();

        let fixup = {
            let td = unsafe { self.threads.td_mut(tid) };
            pctcpu_update(td, ticks, true, self.hz);
            if td.flags & TDF_IDLETD != 0 {
                return;
            }
            if td.class == SchedClass::Timeshare {
                td.runtime = td.runtime.wrapping_add(self.tickincr * cnt);
                interact_update(td, self.hz);
                compute_priority(td, self.hz);
                // The tick boundary doubles as the point where a changed
                // user priority takes effect on the running thread.
                if td.flags & TDF_BORROWING == 0
                    && td.pri >= PRI_MIN_TIMESHARE
                    && td.pri != td.user_pri
                {
                    Some((td.pri, td.user_pri))
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some((old, new)) = fixup {
            {
                let td = unsafe { self.threads.td_mut(tid) };
                td.pri = new;
            }
            if new < pc.lowpri() {
                pc.lower_lowpri(new);
            } else if pc.lowpri() == old {
                pc.set_lowpri(&data, &self.threads, Some(tid));
            }
        }

        let (slice_used, class, base_pri) = {
            let td = unsafe { self.threads.td_mut(tid) };
            td.slice += cnt;
            (td.slice, td.class, td.base_pri)
        };
        let limit = if class == SchedClass::Timeshare {
            pc.slice(self.sched_slice, self.sched_slice_min)
        } else {
            self.sched_slice
        };
        if slice_used < limit {
            return;
        }

        let td = unsafe { self.threads.td_mut(tid) };
        td.slice = 0;
        if class == SchedClass::Interrupt {
            // An interrupt thread that burns a whole slice is demoted one
            // bucket and preempted.
            td.flags |= TDF_NEEDRESCHED;
            if base_pri + RQ_PPQ < PRI_MAX_ITHD {
                let old = td.pri;
                let new = base_pri + RQ_PPQ;
                td.pri = new;
                if new < pc.lowpri() {
                    pc.lower_lowpri(new);
                } else if pc.lowpri() == old {
                    pc.set_lowpri(&data, &self.threads, Some(tid));
                }
            }
        } else {
            td.flags |= TDF_SLICEEND | TDF_NEEDRESCHED;
        }
        drop(data);
    }

    /// Whether the timer trap should drive a switch: an AST was posted on
    /// the current thread or a remote CPU queued work for us.
    pub fn ast_pending(&self, cpu: usize) -> bool {
        let pc = &self.cpus[cpu];
        if pc.owe_preempt() {
            return true;
        }
        let data = pc.tdq.lock();
        let pending = pc
            .curthread()
            .map(|tid| unsafe { self.threads.td(tid) }.flags & TDF_NEEDRESCHED != 0)
            .unwrap_or(false);
        drop(data);
        pending
    }

    // ========================================================================
    // Context switch
    // ========================================================================

    /// Switch away from the current thread of `cpu`. `flags` must carry
    /// exactly one of `SW_VOL`/`SW_INVOL`; the caller is in a critical
    /// section exactly one level deep (the trap entry's).
    pub fn mi_switch(&self, cpu: usize, flags: u32, frame: &mut TrapFrame) {
        let vol = flags & SW_VOL != 0;
        let invol = flags & SW_INVOL != 0;
        assert!(vol ^ invol, "mi_switch: exactly one of SW_VOL/SW_INVOL");

        let pc = &self.cpus[cpu];
        let tid = pc.curthread().expect("mi_switch with no current thread");
        assert_eq!(
            self.threads.slot(tid).critnest.load(Ordering::Relaxed),
            1,
            "mi_switch outside the trap critical section"
        );

        let ticks = self.ticks();
        if vol {
            pc.swvoltick.store(ticks, Ordering::Relaxed);
        } else {
            pc.swinvoltick.store(ticks, Ordering::Relaxed);
        }
        let charge = ticks.wrapping_sub(pc.switchtick.swap(ticks, Ordering::Relaxed));
        self.sched_switch(cpu, tid, flags, frame, charge);
    }

    fn sched_switch(
        &self,
        cpu: usize,
        tid: ThreadId,
        flags: u32,
        frame: &mut TrapFrame,
        charge: u32,
    ) {
        let pc = &self.cpus[cpu];
        let slot = self.threads.slot(tid);
        let mut data = pc.tdq.lock();
        let ticks = self.ticks();

        let (was_idle, still_running, preempted, pickcpu) = {
            let td = unsafe { self.threads.td_mut(tid) };
            td.incruntime = td.incruntime.wrapping_add(charge);
            pctcpu_update(td, ticks, true, self.hz);
            // A forced migration relaxes affinity so pick_cpu does not
            // immediately drag the thread back.
            td.rltick = if td.flags & TDF_PICKCPU != 0 {
                ticks.wrapping_sub(self.affinity * MAX_CACHE_LEVELS)
            } else {
                ticks
            };
            td.lastcpu = cpu as u32;

            let preempted = flags & SW_PREEMPT != 0 && td.flags & TDF_SLICEEND == 0;
            let pickcpu = td.flags & TDF_PICKCPU != 0;
            td.flags &= !(TDF_PICKCPU | TDF_SLICEEND | TDF_NEEDRESCHED);
            (
                td.flags & TDF_IDLETD != 0,
                td.state == ThreadState::Running,
                preempted,
                pickcpu,
            )
        };

        pc.clear_owe_preempt();
        if !was_idle {
            pc.bump_switchcnt();
        }

        // Relinquish the thread: its lock becomes the blocked sentinel
        // until the frame below is parked, then moves to its new owner.
        slot.lock.store(TDL_BLOCKED, Ordering::Release);

        let pending_tag;
        if was_idle {
            let td = unsafe { self.threads.td_mut(tid) };
            td.state = ThreadState::CanRun;
            td.oncpu = NOCPU;
            pending_tag = cpu as u32;
        } else if still_running {
            let srq =
                SRQ_OURSELF | SRQ_YIELDING | if preempted { SRQ_PREEMPTED } else { 0 };
            let dest = {
                let td = unsafe { self.threads.td_mut(tid) };
                td.oncpu = NOCPU;
                td.state = ThreadState::Runq;
                if pickcpu && td.flags & TDF_BOUND == 0 && self.ncpus() > 1 {
                    td.cpu = self.pick_cpu(td, 0, cpu) as u32;
                }
                td.cpu as usize
            };
            if dest == cpu {
                let td = unsafe { self.threads.td_mut(tid) };
                pc.runq_add(&mut data, td, tid, srq);
                pending_tag = cpu as u32;
            } else {
                data = self.switch_migrate(data, cpu, tid, srq, dest);
                pending_tag = dest as u32;
            }
        } else {
            // Inhibited: off to the sleep lock, dropping our load.
            let td = unsafe { self.threads.td_mut(tid) };
            td.oncpu = NOCPU;
            pc.load_rem(td);
            pending_tag = TDL_SLEEP;
        }

        // Select the successor and install it.
        let ntid = match pc.choose(&data) {
            Some((next, _kind)) => {
                let td = unsafe { self.threads.td_mut(next) };
                pc.runq_rem(&mut data, td, next);
                next
            }
            None => {
                pc.note_idle();
                pc.idle_thread().expect("CPU has no idle thread")
            }
        };
        {
            let ntd = unsafe { self.threads.td_mut(ntid) };
            ntd.state = ThreadState::Running;
            ntd.oncpu = cpu as u32;
            ntd.cpu = cpu as u32;
        }
        pc.set_curthread(ntid);
        pc.set_lowpri(&data, &self.threads, Some(ntid));
        {
            let ntd = unsafe { self.threads.td_mut(ntid) };
            pctcpu_update(ntd, ticks, false, self.hz);
        }
        drop(data);

        // Keep the preemption timer alive across the switch.
        crate::lapic::arm_oneshot(
            crate::interrupts::TIMER_VECTOR,
            crate::interrupts::TIMER_ONESHOT_COUNT,
        );

        if ntid != tid {
            // If the successor is still being switched out elsewhere, wait
            // for that CPU to park its frame.
            let nslot = self.threads.slot(ntid);
            while nslot.lock.load(Ordering::Acquire) == TDL_BLOCKED {
                core::hint::spin_loop();
            }
            nslot.lock.store(cpu as u32, Ordering::Release);

            // The in-place frame swap: park the outgoing register image,
            // resume the incoming one on trap return.
            unsafe {
                self.threads.td_mut(tid).frame = *frame;
                *frame = self.threads.td(ntid).frame;
            }
        }

        // Publish the outgoing thread to its new owning lock.
        slot.lock.store(pending_tag, Ordering::Release);
    }

    /// The cross-queue migration dance: drop the source lock, queue on the
    /// destination, notify it, then re-take the source in the original
    /// order so lock ordering never inverts.
    fn switch_migrate<'a>(
        &'a self,
        data: spin::MutexGuard<'a, TdqData>,
        cpu: usize,
        tid: ThreadId,
        srq: u32,
        dest: usize,
    ) -> spin::MutexGuard<'a, TdqData> {
        let pc = &self.cpus[cpu];
        {
            let td = unsafe { self.threads.td_mut(tid) };
            pc.load_rem(td);
        }
        drop(data);
        {
            let dpc = &self.cpus[dest];
            let mut ddata = dpc.tdq.lock();
            let pri = {
                let td = unsafe { self.threads.td_mut(tid) };
                dpc.runq_add(&mut ddata, td, tid, srq);
                dpc.load_add(td);
                // From here on the destination treats the thread as pinned.
                td.flags |= TDF_BOUND;
                td.pri
            };
            let old_lowpri = dpc.lower_lowpri(pri);
            dpc.notify(self.should_preempt(pri, old_lowpri, true));
        }
        pc.tdq.lock()
    }

    /// Voluntarily give up the CPU from a trap context.
    pub fn yield_now(&self, cpu: usize, frame: &mut TrapFrame) {
        {
            let pc = &self.cpus[cpu];
            let data = pc.tdq.lock();
            if let Some(tid) = pc.curthread() {
                let td = unsafe { self.threads.td_mut(tid) };
                td.flags |= TDF_SLICEEND;
                td.slice = 0;
            }
            drop(data);
        }
        self.critical_enter(cpu);
        self.mi_switch(cpu, SW_VOL, frame);
        self.critical_exit(cpu);
    }

    // ========================================================================
    // Critical-section / spinlock discipline
    // ========================================================================

    /// Enter a critical section: the current thread cannot be preempted
    /// until the matching exit.
    pub fn critical_enter(&self, cpu: usize) {
        if let Some(tid) = self.cpus[cpu].curthread() {
            self.threads.slot(tid).critnest.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Leave a critical section. A preemption owed while inside is turned
    /// into an AST at the outermost exit and honored at the next trap
    /// boundary.
    pub fn critical_exit(&self, cpu: usize) {
        let pc = &self.cpus[cpu];
        let Some(tid) = pc.curthread() else {
            return;
        };
        let nest = self.threads.slot(tid).critnest.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(nest >= 1, "critical_exit underflow");
        if nest == 1 && pc.owe_preempt() {
            let data = pc.tdq.lock();
            if let Some(cur) = pc.curthread() {
                let td = unsafe { self.threads.td_mut(cur) };
                td.flags |= TDF_NEEDRESCHED;
            }
            drop(data);
        }
    }

    /// First spinlock entry disables interrupts and enters a critical
    /// section; nesting is per-thread.
    pub fn spinlock_enter(&self, cpu: usize) {
        let Some(tid) = self.cpus[cpu].curthread() else {
            return;
        };
        let slot = self.threads.slot(tid);
        if slot.spinlocks.fetch_add(1, Ordering::Relaxed) == 0 {
            let enabled = crate::smp::intr_disable();
            slot.saved_intr.store(enabled, Ordering::Relaxed);
            self.critical_enter(cpu);
        }
    }

    /// Reverse of [`Scheduler::spinlock_enter`]; the saved interrupt state
    /// is restored at the outermost exit.
    pub fn spinlock_exit(&self, cpu: usize) {
        let Some(tid) = self.cpus[cpu].curthread() else {
            return;
        };
        let slot = self.threads.slot(tid);
        let nest = slot.spinlocks.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(nest >= 1, "spinlock_exit underflow");
        if nest == 1 {
            self.critical_exit(cpu);
            crate::smp::intr_restore(slot.saved_intr.load(Ordering::Relaxed));
        }
    }
}

lazy_static! {
    /// The system scheduler.
    pub static ref SCHED: Scheduler = Scheduler::new(1000);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::priority::interact_score;

    fn sched(ncpus: usize) -> Scheduler {
        let s = Scheduler::new(1000);
        s.init_cpus(ncpus);
        s
    }

    fn boot_thread(s: &Scheduler) -> ThreadId {
        s.pcpu(0).curthread().expect("boot thread")
    }

    /// Drive a switch the way the timer trap does.
    fn switch(s: &Scheduler, cpu: usize, flags: u32, frame: &mut TrapFrame) {
        s.critical_enter(cpu);
        s.mi_switch(cpu, flags, frame);
        s.critical_exit(cpu);
    }

    fn force_cpu(s: &Scheduler, tid: ThreadId, cpu: u32) {
        let guard = s.thread_lock(tid);
        unsafe { s.threads.td_mut(tid) }.cpu = cpu;
        drop(guard);
    }

    // ========================================================================
    // Preemption policy
    // ========================================================================

    #[test]
    fn should_preempt_policy_table() {
        let s = sched(1);
        // Not better: never.
        assert!(!s.should_preempt(150, 150, false));
        assert!(!s.should_preempt(200, 150, false));
        // Anything beats an idle CPU.
        assert!(s.should_preempt(200, PRI_MIN_IDLE, false));
        assert!(s.should_preempt(254, 255, true));
        // At or below the threshold: always.
        assert!(s.should_preempt(PRI_MIN_KERN, 100, false));
        assert!(s.should_preempt(10, 100, false));
        // Above the threshold, local: no.
        assert!(!s.should_preempt(100, 120, false));
        // Remote interactive displacing batch: yes.
        assert!(s.should_preempt(100, 150, true));
        assert!(!s.should_preempt(100, 120, true));
    }

    #[test]
    fn should_preempt_is_monotone_in_the_new_priority() {
        let s = sched(1);
        for &cpri in &[50u8, 100, 140, 200, 230, 255] {
            for &remote in &[false, true] {
                let mut fired = false;
                for pri in (0..=255u8).rev() {
                    let now = s.should_preempt(pri, cpri, remote);
                    if fired {
                        assert!(
                            now,
                            "regression at pri {} cpri {} remote {}",
                            pri, cpri, remote
                        );
                    }
                    fired |= now;
                }
            }
        }
    }

    // ========================================================================
    // Queue placement and choose ordering
    // ========================================================================

    #[test]
    fn fresh_threads_are_chosen_in_priority_order() {
        let s = sched(1);
        let t100 = s.thread_create("a", SchedClass::Timeshare, 100).unwrap();
        let t140 = s.thread_create("b", SchedClass::Timeshare, 140).unwrap();
        let t180 = s.thread_create("c", SchedClass::Timeshare, 180).unwrap();
        for &tid in &[t140, t180, t100] {
            assert_eq!(
                s.with_thread(tid, |td| interact_score(td.runtime, td.slptime)),
                0
            );
            s.start(tid, 0);
        }

        let pc = s.pcpu(0);
        let mut order = alloc::vec::Vec::new();
        let mut data = pc.tdq.lock();
        while let Some((tid, _)) = pc.choose(&data) {
            let td = unsafe { s.threads.td_mut(tid) };
            pc.runq_rem(&mut data, td, tid);
            order.push(tid);
        }
        drop(data);
        assert_eq!(order, alloc::vec![t100, t140, t180]);
    }

    #[test]
    fn runnable_threads_appear_exactly_once() {
        let s = sched(1);
        let mut tids = alloc::vec::Vec::new();
        for pri in [40u8, 100, 150, 200, 240] {
            let class = match pri {
                p if p < PRI_MIN_KERN => SchedClass::Realtime,
                p if p < PRI_MIN_IDLE => SchedClass::Timeshare,
                _ => SchedClass::Idle,
            };
            let tid = s.thread_create("t", class, pri).unwrap();
            s.start(tid, 0);
            tids.push(tid);
        }
        let pc = s.pcpu(0);
        let data = pc.tdq.lock();
        for &tid in &tids {
            let total = data.realtime.count(tid) + data.timeshare.count(tid)
                + data.idle.count(tid);
            assert_eq!(total, 1, "thread {} present {} times", tid, total);
            assert_eq!(s.threads.lock_tag(tid), 0);
            assert_eq!(unsafe { s.threads.td(tid) }.state, ThreadState::Runq);
        }
        drop(data);
    }

    #[test]
    fn lowpri_tracks_current_and_best_runnable() {
        let s = sched(1);
        // Boot thread runs at PRI_MIN_KERN.
        assert_eq!(s.pcpu(0).lowpri(), PRI_MIN_KERN);

        let rt = s.thread_create("rt", SchedClass::Realtime, 20).unwrap();
        s.start(rt, 0);
        assert_eq!(s.pcpu(0).lowpri(), 20);

        let ts = s.thread_create("ts", SchedClass::Timeshare, 150).unwrap();
        s.start(ts, 0);
        assert_eq!(s.pcpu(0).lowpri(), 20);
    }

    #[test]
    fn load_counts_runnable_plus_running() {
        let s = sched(1);
        let pc = s.pcpu(0);
        // The boot thread is running; the idle thread never counts.
        assert_eq!(pc.load(), 1);
        assert_eq!(pc.sysload(), 1);

        let a = s.thread_create("a", SchedClass::Timeshare, 150).unwrap();
        s.start(a, 0);
        assert_eq!(pc.load(), 2);

        let mut noload = ThreadSched::new("intr", SchedClass::Interrupt, 8);
        noload.flags |= TDF_NOLOAD;
        let b = s.threads.create(noload).unwrap();
        s.threads.slot(b).critnest.store(1, Ordering::Relaxed);
        {
            let guard = s.thread_lock(b);
            unsafe { s.threads.td_mut(b) }.state = ThreadState::CanRun;
            drop(guard);
        }
        let guard = s.thread_lock(b);
        s.sched_add(b, SRQ_BORING, 0);
        drop(guard);
        assert_eq!(pc.load(), 3);
        assert_eq!(pc.sysload(), 2, "NOLOAD thread excluded from sysload");
    }

    #[test]
    fn timeshare_insertion_avoids_the_drain_cursor() {
        let s = sched(1);
        {
            let mut data = s.pcpu(0).tdq.lock();
            data.idx = 5;
            data.ridx = 2;
        }
        // Raw bucket 61 lands on (61 + 5) % 64 == 2 == ridx; the insert
        // must step back one bucket so the old rotation keeps draining.
        let t = s.thread_create("batch", SchedClass::Timeshare, 220).unwrap();
        s.start(t, 0);
        s.with_thread(t, |td| {
            assert_eq!(td.runq, Some(RunqKind::Timeshare));
            assert_eq!(td.rqindex, 1);
        });
    }

    #[test]
    fn batch_threads_drain_one_bucket_per_rotation() {
        let s = sched(1);
        let mut tids = alloc::vec::Vec::new();
        for i in 0..22u32 {
            let pri = (PRI_MIN_BATCH as u32 + i * 4).min(PRI_MAX_BATCH as u32) as u8;
            let tid = s.thread_create("batch", SchedClass::Timeshare, pri).unwrap();
            s.start(tid, 0);
            tids.push(tid);
        }
        let pc = s.pcpu(0);
        let mut data = pc.tdq.lock();
        let mut seen = alloc::vec::Vec::new();
        while let Some((tid, bucket)) = data.timeshare.choose_from(data.ridx) {
            assert!(
                !seen.contains(&bucket),
                "bucket {} visited twice in one rotation",
                bucket
            );
            seen.push(bucket);
            let td = unsafe { s.threads.td_mut(tid) };
            pc.runq_rem(&mut data, td, tid);
        }
        drop(data);
        assert_eq!(seen.len(), tids.len());
        // Distinct priorities spread over distinct buckets, drained in
        // ascending circular order.
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn tdq_add_then_remove_restores_everything() {
        let s = sched(1);
        let pc = s.pcpu(0);
        let load0 = pc.load();
        let status0 = {
            let data = pc.tdq.lock();
            (data.realtime.status(), data.timeshare.status(), data.idle.status())
        };

        let t = s.thread_create("t", SchedClass::Timeshare, 180).unwrap();
        s.start(t, 0);

        let mut guard = s.thread_lock(t);
        if let TdLock::Queue(cpu, data) = &mut guard {
            let pc = s.pcpu(*cpu);
            let td = unsafe { s.threads.td_mut(t) };
            pc.runq_rem(data, td, t);
            pc.load_rem(td);
        } else {
            panic!("runnable thread not owned by a queue lock");
        }
        drop(guard);

        assert_eq!(pc.load(), load0);
        let data = pc.tdq.lock();
        assert_eq!(
            (data.realtime.status(), data.timeshare.status(), data.idle.status()),
            status0
        );
        drop(data);
    }

    // ========================================================================
    // Context switching
    // ========================================================================

    #[test]
    fn preemption_swaps_frames_in_place() {
        let s = sched(1);
        let boot = boot_thread(&s);
        let rt = s.thread_create("rt", SchedClass::Realtime, 30).unwrap();
        s.start(rt, 0);
        assert!(s.ast_pending(0), "better thread must post an AST");

        let mut frame = TrapFrame::zero();
        frame.rip = 0x1111;
        switch(&s, 0, SW_INVOL | SW_PREEMPT, &mut frame);

        assert_eq!(s.pcpu(0).curthread(), Some(rt));
        s.with_thread(rt, |td| {
            assert_eq!(td.state, ThreadState::Running);
            assert_eq!(td.oncpu, 0);
        });
        // The preempted boot thread parked its frame and went back on the
        // run queue at the head of its bucket.
        s.with_thread(boot, |td| {
            assert_eq!(td.state, ThreadState::Runq);
            assert_eq!(td.frame.rip, 0x1111);
        });
        assert_eq!(frame.rip, 0, "live frame now belongs to the new thread");
    }

    #[test]
    fn sleep_wakeup_accumulates_slptime() {
        let s = sched(1);
        let boot = boot_thread(&s);
        let rt = s.thread_create("rt", SchedClass::Realtime, 30).unwrap();
        s.start(rt, 0);
        let mut frame = TrapFrame::zero();
        switch(&s, 0, SW_INVOL | SW_PREEMPT, &mut frame);
        assert_eq!(s.pcpu(0).curthread(), Some(rt));

        s.hardclock(0, 3);
        s.sleep(rt);
        s.with_thread(rt, |td| {
            assert_eq!(td.state, ThreadState::Inhibited);
            assert_eq!(td.inhibitors, TDI_SLEEPING);
        });
        switch(&s, 0, SW_VOL, &mut frame);
        assert_eq!(s.pcpu(0).curthread(), Some(boot));
        assert_eq!(s.threads.lock_tag(rt), TDL_SLEEP);
        assert_eq!(s.pcpu(0).load(), 1, "sleeper dropped from load");

        s.hardclock(0, 5);
        s.wakeup(rt, 0, 0);
        s.with_thread(rt, |td| {
            assert_eq!(td.state, ThreadState::Runq);
            assert_eq!(td.slptime, 5 << SCHED_TICK_SHIFT);
            assert_eq!(td.slice, 0, "wakeup starts a fresh slice");
        });
        assert_eq!(s.pcpu(0).load(), 2);
    }

    #[test]
    fn sleeping_batch_threads_are_boosted_to_min_batch() {
        let s = sched(1);
        let boot = boot_thread(&s);
        let t = s.thread_create("batch", SchedClass::Timeshare, 200).unwrap();
        s.start(t, 0);
        // Park the boot thread so the batch thread actually runs.
        let mut frame = TrapFrame::zero();
        s.hardclock(0, 1);
        s.sleep(boot);
        switch(&s, 0, SW_VOL, &mut frame);
        assert_eq!(s.pcpu(0).curthread(), Some(t));

        s.sleep(t);
        s.with_thread(t, |td| {
            assert_eq!(td.pri, PRI_MIN_BATCH);
            assert_eq!(td.state, ThreadState::Inhibited);
        });
        assert_eq!(s.pcpu(0).lowpri(), PRI_MIN_BATCH);
    }

    #[test]
    fn idle_thread_runs_when_the_queue_empties() {
        let s = sched(1);
        let boot = boot_thread(&s);
        let mut frame = TrapFrame::zero();
        s.hardclock(0, 1);
        s.sleep(boot);
        switch(&s, 0, SW_VOL, &mut frame);

        let idle = s.pcpu(0).idle_thread().unwrap();
        assert_eq!(s.pcpu(0).curthread(), Some(idle));
        assert_eq!(s.pcpu(0).lowpri(), PRI_MAX_IDLE);
        assert_eq!(s.pcpu(0).load(), 0);

        // Waking the boot thread preempts idle at the next switch.
        s.wakeup(boot, 0, 0);
        assert_eq!(s.pcpu(0).lowpri(), PRI_MIN_KERN);
        switch(&s, 0, SW_INVOL | SW_PREEMPT, &mut frame);
        assert_eq!(s.pcpu(0).curthread(), Some(boot));
        s.with_thread(idle, |td| assert_eq!(td.state, ThreadState::CanRun));
    }

    #[test]
    fn migration_does_the_lock_dance_and_binds() {
        let s = sched(2);
        let boot = boot_thread(&s);
        let mut frame = TrapFrame::zero();

        // Send the running boot thread to CPU 1 at the next switch.
        force_cpu(&s, boot, 1);
        switch(&s, 0, SW_INVOL | SW_PREEMPT, &mut frame);

        assert_eq!(s.threads.lock_tag(boot), 1, "ownership moved to CPU 1");
        s.with_thread(boot, |td| {
            assert_eq!(td.state, ThreadState::Runq);
            assert_ne!(td.flags & TDF_BOUND, 0, "destination sees it bound");
        });
        // CPU 0 fell back to its idle thread and gave up the load.
        assert_eq!(s.pcpu(0).curthread(), s.pcpu(0).idle_thread());
        assert_eq!(s.pcpu(0).load(), 0);

        let pc1 = s.pcpu(1);
        assert_eq!(pc1.load(), 1);
        assert_eq!(pc1.lowpri(), PRI_MIN_KERN);
        assert!(pc1.owe_preempt(), "remote CPU owes a preemption");
        let data = pc1.tdq.lock();
        assert_eq!(pc1.choose(&data).map(|(t, _)| t), Some(boot));
        drop(data);
    }

    // ========================================================================
    // CPU selection
    // ========================================================================

    #[test]
    fn wakeup_prefers_an_idle_cpu() {
        let s = sched(2);
        let boot = boot_thread(&s);
        s.sched_prio(boot, 50);
        assert_eq!(s.pcpu(0).lowpri(), 50);
        assert_eq!(s.pcpu(1).lowpri(), PRI_MAX_IDLE);

        let t = s.thread_create("interactive", SchedClass::Timeshare, 80).unwrap();
        s.hardclock(0, 100);
        s.start(t, 0);

        s.with_thread(t, |td| assert_eq!(td.cpu, 1));
        assert!(s.pcpu(1).owe_preempt());
        assert!(s.should_preempt(80, 255, true));
        assert!(!s.pcpu(0).owe_preempt());
    }

    #[test]
    fn recent_threads_keep_their_cache_affinity() {
        let s = sched(2);
        // CPU 1 idle, thread last ran there moments ago.
        let t = s.thread_create("t", SchedClass::Timeshare, 150).unwrap();
        s.hardclock(0, 10);
        {
            let guard = s.thread_lock(t);
            let td = unsafe { s.threads.td_mut(t) };
            td.cpu = 1;
            td.rltick = s.ticks();
            td.state = ThreadState::CanRun;
            drop(guard);
        }
        let guard = s.thread_lock(t);
        s.sched_add(t, SRQ_BORING, 0);
        drop(guard);
        s.with_thread(t, |td| assert_eq!(td.cpu, 1, "affinity kept"));
    }

    #[test]
    fn stale_affinity_falls_back_to_least_loaded() {
        let s = sched(2);
        let t = s.thread_create("t", SchedClass::Timeshare, 150).unwrap();
        s.hardclock(0, 1000);
        {
            let guard = s.thread_lock(t);
            let td = unsafe { s.threads.td_mut(t) };
            td.cpu = 1;
            td.rltick = s.ticks().wrapping_sub(100);
            td.state = ThreadState::CanRun;
            drop(guard);
        }
        let guard = s.thread_lock(t);
        s.sched_add(t, SRQ_BORING, 0);
        drop(guard);
        // CPU 1 carries no load, CPU 0 carries the boot thread; least
        // loaded wins even without affinity.
        s.with_thread(t, |td| assert_eq!(td.cpu, 1));
        assert_eq!(s.pcpu(1).load(), 1);
    }

    #[test]
    fn pick_cpu_ourself_short_circuits() {
        let s = sched(2);
        let t = s.thread_create("t", SchedClass::Timeshare, 150).unwrap();
        let guard = s.thread_lock(t);
        let td = unsafe { s.threads.td_mut(t) };
        td.cpu = 1;
        assert_eq!(s.pick_cpu(td, SRQ_OURSELF, 0), 1);
        drop(guard);
    }

    // ========================================================================
    // Priority lending
    // ========================================================================

    #[test]
    fn lend_and_unlend_round_trip() {
        let s = sched(1);
        let t = s.thread_create("t", SchedClass::Timeshare, 140).unwrap();
        s.start(t, 0);

        s.lend_priority(t, 60);
        s.with_thread(t, |td| {
            assert_eq!(td.pri, 60);
            assert_ne!(td.flags & TDF_BORROWING, 0);
            assert_eq!(td.runq, Some(RunqKind::Realtime), "lent into realtime range");
        });

        s.unlend_priority(t, 60);
        s.with_thread(t, |td| {
            assert_eq!(td.pri, 140);
            assert_eq!(td.flags & TDF_BORROWING, 0);
        });
    }

    #[test]
    fn unlend_keeps_a_better_surviving_lend() {
        let s = sched(1);
        let t = s.thread_create("t", SchedClass::Timeshare, 140).unwrap();
        s.start(t, 0);
        s.lend_priority(t, 90);
        s.lend_priority(t, 60);
        // Retracting the weaker lend leaves the stronger one in force.
        s.unlend_priority(t, 90);
        s.with_thread(t, |td| {
            assert_eq!(td.pri, 60);
            assert_ne!(td.flags & TDF_BORROWING, 0);
        });
    }

    #[test]
    fn lend_user_priority_demotes_or_posts_an_ast() {
        let s = sched(1);
        let t = s.thread_create("t", SchedClass::Timeshare, 140).unwrap();
        s.start(t, 0);
        s.lend_user_priority(t, 100);
        s.with_thread(t, |td| {
            assert_eq!(td.user_pri, 100);
            assert_eq!(td.pri, 100, "effective priority pulled down");
        });

        // Lending something worse than the current priority only posts an
        // AST for the next boundary.
        s.lend_user_priority(t, 120);
        s.with_thread(t, |td| {
            assert_eq!(td.user_pri, 120);
            assert_eq!(td.pri, 100);
            assert_ne!(td.flags & TDF_NEEDRESCHED, 0);
        });
    }

    #[test]
    fn nice_moves_user_priority() {
        let s = sched(1);
        let t = s.thread_create("t", SchedClass::Timeshare, 160).unwrap();
        {
            // Give it batch history so nice acts on the batch band.
            let guard = s.thread_lock(t);
            unsafe { s.threads.td_mut(t) }.runtime = 50 << SCHED_TICK_SHIFT;
            drop(guard);
        }
        s.set_nice(t, 10);
        let kind = s.with_thread(t, |td| td.user_pri);
        s.set_nice(t, -15);
        let greedy = s.with_thread(t, |td| td.user_pri);
        assert!(greedy < kind);
    }

    // ========================================================================
    // Clock
    // ========================================================================

    #[test]
    fn hardclock_publishes_the_max_of_cpu_ticks() {
        let s = sched(2);
        s.hardclock(0, 5);
        assert_eq!(s.ticks(), 5);
        s.hardclock(1, 3);
        assert_eq!(s.ticks(), 5, "slower CPU cannot move time backward");
        s.hardclock(1, 10);
        assert_eq!(s.ticks(), 13);
    }

    #[test]
    fn clock_rotates_the_insertion_cursor() {
        let s = sched(1);
        {
            let data = s.pcpu(0).tdq.lock();
            assert_eq!((data.idx, data.ridx), (0, 0));
        }
        s.clock(0, 1);
        let data = s.pcpu(0).tdq.lock();
        assert_eq!((data.idx, data.ridx), (1, 1), "empty bucket drags ridx");
        drop(data);
    }

    #[test]
    fn slice_exhaustion_posts_a_sliceend_ast() {
        let s = sched(1);
        // Boot thread is timeshare; exhaust its slice in one call.
        s.hardclock(0, 1);
        s.clock(0, s.sched_slice);
        let boot = boot_thread(&s);
        s.with_thread(boot, |td| {
            assert_ne!(td.flags & TDF_SLICEEND, 0);
            assert_ne!(td.flags & TDF_NEEDRESCHED, 0);
            assert_eq!(td.slice, 0);
        });
        assert!(s.ast_pending(0));
    }

    #[test]
    fn interrupt_threads_demote_one_bucket_on_a_full_slice() {
        let s = sched(1);
        let it = s.thread_create("ithd", SchedClass::Interrupt, 8).unwrap();
        s.start(it, 0);
        let mut frame = TrapFrame::zero();
        switch(&s, 0, SW_INVOL | SW_PREEMPT, &mut frame);
        assert_eq!(s.pcpu(0).curthread(), Some(it));

        s.clock(0, s.sched_slice);
        s.with_thread(it, |td| {
            assert_eq!(td.pri, 8 + RQ_PPQ);
            assert_ne!(td.flags & TDF_NEEDRESCHED, 0);
        });
    }

    #[test]
    fn timeshare_slices_shrink_under_load() {
        let s = sched(1);
        let pc = s.pcpu(0);
        // Load 1 (boot thread only): a full slice.
        assert_eq!(pc.slice(s.sched_slice, s.sched_slice_min), s.sched_slice);
        for i in 0..7 {
            let t = s
                .thread_create("filler", SchedClass::Timeshare, 150 + i)
                .unwrap();
            s.start(t, 0);
        }
        // sysload - 1 >= 6: minimum slice.
        assert_eq!(pc.slice(s.sched_slice, s.sched_slice_min), s.sched_slice_min);
    }

    // ========================================================================
    // Critical sections
    // ========================================================================

    #[test]
    fn spinlock_nesting_restores_interrupts_once() {
        let s = sched(1);
        assert!(crate::smp::intr_enabled());
        s.spinlock_enter(0);
        assert!(!crate::smp::intr_enabled());
        s.spinlock_enter(0);
        s.spinlock_exit(0);
        assert!(!crate::smp::intr_enabled(), "still nested");
        s.spinlock_exit(0);
        assert!(crate::smp::intr_enabled());
    }

    #[test]
    fn owed_preemption_becomes_an_ast_at_the_outermost_exit() {
        let s = sched(1);
        let boot = boot_thread(&s);
        s.critical_enter(0);
        s.pcpu(0).notify(true);
        assert!(s.pcpu(0).owe_preempt());
        s.with_thread(boot, |td| assert_eq!(td.flags & TDF_NEEDRESCHED, 0));
        s.critical_exit(0);
        s.with_thread(boot, |td| assert_ne!(td.flags & TDF_NEEDRESCHED, 0));
    }
}

/// Bring the global scheduler up for `ncpus` processors.
pub fn init(ncpus: usize) {
    SCHED.init_cpus(ncpus);
    kinfo!(
        "sched: ULE core online, {} CPUs, hz {}, slice {} ticks",
        SCHED.ncpus(),
        SCHED.hz(),
        SCHED.sched_slice
    );
}
