//! Worker pool, barrier, and hybrid spin/block waiting.
//!
//! The pool is created once and reused across many graph executions to
//! amortize thread spin-up. The calling thread acts as worker 0; `new`
//! spawns workers 1..n. Publication protocol: the caller writes the work
//! descriptor, then increments the generation counter (SeqCst) and rings
//! the gate; workers read the descriptor only after observing a fresh
//! generation, and the caller does not return until the final per-node
//! barrier, so the descriptor's raw pointers never outlive their targets.
//!
//! The barrier is two atomic counters: arrivals fetch-add into one, the
//! last arriver resets it and bumps the release counter, everyone else
//! spins on the release counter. SeqCst throughout gives the full ordering
//! between node i's writes and node i+1's reads; it is the only cross-node
//! guarantee the engine provides or needs.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{contract, EngineError, EngineResult, Status};
use crate::graph::{ComputePlan, Graph};
use crate::ops::{forward, NodeCtx};
use crate::tensor::Arena;

/// Scheduling priority applied to every worker (best effort; unsupported
/// platforms log and continue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPrio {
    Normal,
    Medium,
    High,
    Realtime,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Worker count (including the calling thread).
    pub n_threads: usize,
    /// Spin iterations in the hybrid wait before blocking on the condvar.
    /// Latency/CPU-usage tradeoff; 0 blocks immediately.
    pub poll: u32,
    pub prio: ThreadPrio,
    /// Explicit CPU pin per worker (`cpumask[i]` pins worker `i`).
    pub cpumask: Option<Vec<usize>>,
    /// Fail pool creation when pinning is requested but unavailable.
    pub strict_cpu: bool,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            n_threads: std::thread::available_parallelism().map_or(4, |p| p.get()),
            poll: 50,
            prio: ThreadPrio::Normal,
            cpumask: None,
            strict_cpu: false,
        }
    }
}

impl ThreadPoolConfig {
    pub fn with_threads(n_threads: usize) -> Self {
        Self {
            n_threads,
            ..Self::default()
        }
    }
}

/// Two-phase wait primitive: bounded spin on the predicate, then block on
/// a condvar. The spin count is the pool's `poll` knob scaled by 128.
pub(crate) struct SpinGate {
    lock: Mutex<()>,
    cv: Condvar,
    spins: u32,
}

impl SpinGate {
    fn new(poll: u32) -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
            spins: poll.saturating_mul(128),
        }
    }

    /// Wait until `waiting()` turns false: spin `spins` times, then block.
    fn wait_while(&self, waiting: impl Fn() -> bool) {
        for _ in 0..self.spins {
            if !waiting() {
                return;
            }
            std::hint::spin_loop();
        }
        let mut guard = self.lock.lock().unwrap();
        while waiting() {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    /// Wake all blocked waiters. Takes the lock so a waiter cannot miss a
    /// notify between its predicate check and the wait.
    fn notify_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_all();
    }
}

/// Raw work descriptor published per graph generation.
#[derive(Clone, Copy)]
struct WorkDesc {
    graph: *const Graph,
    arena: *const Arena,
    wdata: *mut u8,
    wsize: usize,
}

impl WorkDesc {
    const fn empty() -> Self {
        Self {
            graph: std::ptr::null(),
            arena: std::ptr::null(),
            wdata: std::ptr::null_mut(),
            wsize: 0,
        }
    }
}

pub(crate) struct PoolShared {
    work: UnsafeCell<WorkDesc>,
    /// Monotonic graph generation counter.
    generation: AtomicU32,
    n_barrier: AtomicU32,
    n_barrier_passed: AtomicU32,
    /// Work-stealing cursor for the matmul chunk grid.
    current_chunk: AtomicI64,
    stop: AtomicBool,
    pause: AtomicBool,
    /// Index of the node at whose boundary cancellation was observed;
    /// -1 when no abort is pending. Written once per graph by thread 0;
    /// the index keeps the per-thread break decision uniform even when the
    /// store lands while other threads sit at an earlier node boundary.
    abort_node: AtomicI64,
    /// Threads participating in the current graph (<= n_threads_max).
    n_threads_cur: AtomicUsize,
    n_threads_max: usize,
    /// Bumped by resume() so workers re-apply priority/affinity.
    settings_gen: AtomicU32,
    gate: SpinGate,
    prio: ThreadPrio,
    cpumask: Option<Vec<usize>>,
    /// Guards against concurrent graph_compute calls on one pool.
    in_flight: AtomicBool,
}

unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

impl PoolShared {
    /// Two-phase counter barrier over the currently active threads.
    pub(crate) fn barrier(&self) {
        let n = self.n_threads_cur.load(SeqCst) as u32;
        if n == 1 {
            return;
        }
        let passed_old = self.n_barrier_passed.load(SeqCst);
        if self.n_barrier.fetch_add(1, SeqCst) == n - 1 {
            // last to arrive: reset arrivals, release the others
            self.n_barrier.store(0, SeqCst);
            self.n_barrier_passed.fetch_add(1, SeqCst);
        } else {
            while self.n_barrier_passed.load(SeqCst) == passed_old {
                std::hint::spin_loop();
            }
        }
    }
}

/// Per-invocation, per-thread kernel parameters. Created fresh for every
/// node dispatch, never persisted.
pub struct ComputeParams<'a> {
    pub ith: usize,
    pub nth: usize,
    /// Shared scratch workspace; kernels slice it by deterministic
    /// per-thread offsets, never by locking.
    pub wdata: *mut u8,
    pub wsize: usize,
    pub(crate) shared: &'a PoolShared,
}

impl ComputeParams<'_> {
    #[inline]
    pub fn barrier(&self) {
        self.shared.barrier();
    }

    #[inline]
    pub(crate) fn chunk_store(&self, v: i64) {
        self.shared.current_chunk.store(v, SeqCst);
    }

    #[inline]
    pub(crate) fn chunk_next(&self) -> i64 {
        self.shared.current_chunk.fetch_add(1, SeqCst)
    }
}

/// Fixed pool of OS worker threads with barrier synchronization,
/// pause/resume, and cooperative abort.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(cfg: ThreadPoolConfig) -> EngineResult<ThreadPool> {
        if cfg.n_threads == 0 {
            return Err(EngineError::InvalidPoolConfig("n_threads must be >= 1".into()));
        }
        let cpus = std::thread::available_parallelism().map_or(1, |p| p.get());
        let mut n_threads = cfg.n_threads;
        if n_threads > cpus {
            log::warn!("threadpool: clamping {} requested threads to {} CPUs", n_threads, cpus);
            n_threads = cpus;
        }
        if let Some(mask) = &cfg.cpumask {
            if mask.len() < n_threads {
                let msg = format!("cpumask has {} entries for {} threads", mask.len(), n_threads);
                if cfg.strict_cpu {
                    return Err(EngineError::InvalidPoolConfig(msg));
                }
                log::warn!("threadpool: {msg}; ignoring mask");
            }
        }

        let shared = Arc::new(PoolShared {
            work: UnsafeCell::new(WorkDesc::empty()),
            generation: AtomicU32::new(0),
            n_barrier: AtomicU32::new(0),
            n_barrier_passed: AtomicU32::new(0),
            current_chunk: AtomicI64::new(0),
            stop: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            abort_node: AtomicI64::new(-1),
            n_threads_cur: AtomicUsize::new(1),
            n_threads_max: n_threads,
            settings_gen: AtomicU32::new(1),
            gate: SpinGate::new(cfg.poll),
            prio: cfg.prio,
            cpumask: cfg.cpumask.filter(|m| m.len() >= n_threads),
            in_flight: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(n_threads.saturating_sub(1));
        for ith in 1..n_threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("dagml-worker-{ith}"))
                .spawn(move || worker_main(&shared, ith))
                .map_err(|e| EngineError::Os(e.to_string()))?;
            workers.push(handle);
        }

        // worker 0 is the calling thread; apply its settings now
        apply_thread_settings(&shared, 0);

        Ok(ThreadPool { shared, workers })
    }

    /// Maximum threads a plan may use on this pool.
    #[inline]
    pub fn n_threads(&self) -> usize {
        self.shared.n_threads_max
    }

    /// Park all workers in the blocked wait between graphs.
    pub fn pause(&self) {
        self.shared.pause.store(true, SeqCst);
    }

    /// Release paused workers; they re-apply priority/affinity on wake.
    pub fn resume(&self) {
        self.shared.settings_gen.fetch_add(1, SeqCst);
        self.shared.pause.store(false, SeqCst);
        self.shared.gate.notify_all();
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.shared.pause.load(SeqCst)
    }

    /// Blocking execution of a finished graph under a plan. Returns
    /// [`Status::Aborted`] if `abort_cb` reported true at a node boundary.
    pub fn graph_compute(
        &self,
        graph: &Graph,
        arena: &Arena,
        plan: &ComputePlan,
        abort_cb: Option<&(dyn Fn() -> bool + Sync)>,
    ) -> Status {
        let shared = &*self.shared;
        contract!(
            !shared.in_flight.swap(true, SeqCst),
            "graph_compute: pool already executing a graph"
        );

        let mut nth = plan.n_threads;
        if nth > shared.n_threads_max {
            log::warn!(
                "graph_compute: plan wants {} threads, pool has {}; clamping",
                nth,
                shared.n_threads_max
            );
            nth = shared.n_threads_max;
        }
        contract!(
            plan.work_size <= plan.work_buf.len(),
            "graph_compute: plan workspace smaller than its work_size"
        );

        if self.is_paused() {
            self.resume();
        }

        shared.abort_node.store(-1, SeqCst);
        shared.n_threads_cur.store(nth, SeqCst);
        let desc = WorkDesc {
            graph,
            arena,
            wdata: plan.work_buf.base(),
            wsize: plan.work_size,
        };
        unsafe { *shared.work.get() = desc };

        // publish, then participate as worker 0
        shared.generation.fetch_add(1, SeqCst);
        shared.gate.notify_all();

        run_graph(shared, 0, nth, desc, abort_cb);

        let status = if shared.abort_node.load(SeqCst) >= 0 {
            Status::Aborted
        } else {
            Status::Success
        };
        shared.in_flight.store(false, SeqCst);
        status
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, SeqCst);
        self.shared.pause.store(false, SeqCst);
        self.shared.gate.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Node loop shared by worker 0 (the caller) and the pool workers.
fn run_graph(
    shared: &PoolShared,
    ith: usize,
    nth: usize,
    work: WorkDesc,
    abort_cb: Option<&(dyn Fn() -> bool + Sync)>,
) {
    let graph = unsafe { &*work.graph };
    let arena = unsafe { &*work.arena };

    for (i, &node_id) in graph.nodes().iter().enumerate() {
        // cooperative cancellation: polled by thread 0 once per node; the
        // stored index makes every thread break at the same boundary
        if ith == 0 {
            if let Some(cb) = abort_cb {
                if shared.abort_node.load(SeqCst) < 0 && cb() {
                    shared.abort_node.store(i as i64, SeqCst);
                }
            }
        }

        let node = graph.tensor(node_id);
        let params = ComputeParams {
            ith,
            nth,
            wdata: work.wdata,
            wsize: work.wsize,
            shared,
        };
        let ctx = NodeCtx {
            graph,
            arena,
            dst: node,
        };
        forward(node.op)(&params, &ctx);

        // full fence between node i's writes and node i+1's reads
        shared.barrier();
        let abort_at = shared.abort_node.load(SeqCst);
        if abort_at >= 0 && abort_at <= i as i64 {
            break;
        }
    }

    // drain: nobody returns (and the caller cannot reset shared state or
    // drop the graph) until every participant has left the node loop
    shared.barrier();
}

fn worker_main(shared: &Arc<PoolShared>, ith: usize) {
    let mut settings_seen = 0u32;
    let mut last_gen = shared.generation.load(SeqCst);
    loop {
        let seen = shared.settings_gen.load(SeqCst);
        if seen != settings_seen {
            settings_seen = seen;
            apply_thread_settings(shared, ith);
        }

        shared.gate.wait_while(|| {
            !shared.stop.load(SeqCst)
                && (shared.pause.load(SeqCst) || shared.generation.load(SeqCst) == last_gen)
        });
        if shared.stop.load(SeqCst) {
            break;
        }
        let gen = shared.generation.load(SeqCst);
        if gen == last_gen {
            continue;
        }
        last_gen = gen;

        let nth = shared.n_threads_cur.load(SeqCst);
        if ith < nth {
            let work = unsafe { *shared.work.get() };
            run_graph(shared, ith, nth, work, None);
        }
    }
}

fn apply_thread_settings(shared: &PoolShared, ith: usize) {
    apply_priority(shared.prio);
    if let Some(mask) = &shared.cpumask {
        apply_affinity(mask[ith]);
    }
}

#[cfg(target_os = "linux")]
fn apply_priority(prio: ThreadPrio) {
    unsafe {
        match prio {
            ThreadPrio::Normal => {}
            ThreadPrio::Medium => {
                libc::setpriority(libc::PRIO_PROCESS, 0, -5);
            }
            ThreadPrio::High => {
                libc::setpriority(libc::PRIO_PROCESS, 0, -10);
            }
            ThreadPrio::Realtime => {
                let param = libc::sched_param { sched_priority: 1 };
                if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
                    log::warn!("threadpool: SCHED_FIFO unavailable, keeping default priority");
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(prio: ThreadPrio) {
    if prio != ThreadPrio::Normal {
        log::warn!("threadpool: thread priority not supported on this platform");
    }
}

#[cfg(target_os = "linux")]
fn apply_affinity(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!("threadpool: failed to pin thread to cpu {cpu}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_affinity(_cpu: usize) {
    log::warn!("threadpool: cpu pinning not supported on this platform");
}
