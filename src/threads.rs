// Copyright 2017-2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Thread pool management for a4, for asynchronous and parallel (lazy-SMP) search.
//!
//! a4 spawns a number of threads on startup. These are:
//!  1. The main thread, which receives requests from external systems (such as the UCI driver) and coordinates worker
//!     threads to provide an answer to the request,
//!  2. Worker threads, which perform search work as coordinated by the main thread.
//!
//! Every worker searches the same position independently (lazy SMP): there is no work
//! splitting, only a shared transposition table and move-hash busy table (see
//! [`crate::table`]) that let workers avoid duplicating each other's effort. When a search
//! is stopped, the main thread picks the deepest completed result among the workers as the
//! one to report.

#![allow(dead_code)] // Lots of this code will be used elsewhere in time.

use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender},
        Arc, Condvar, Mutex, Once, RwLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::Level;

use crate::config::EngineOptions;
use crate::search::{self, IterationSync, SearchOptions, SearchResult};
use crate::Position;

/// External interface to the thread pool.
pub struct Threads {
    main_thread: MainThread,
    worker_threads: Vec<WorkerThread>,
}

impl Threads {
    fn new(options: EngineOptions) -> Threads {
        crate::table::initialize(options.hash_mb() as usize);
        let num_workers = options.threads().max(1) as usize;
        Threads {
            main_thread: MainThread::new(options.abdada_depth()),
            worker_threads: (0..num_workers).map(WorkerThread::new).collect(),
        }
    }

    /// Gets a reference to the main thread, for the purposes of sending messages to it.
    pub fn main_thread(&self) -> &MainThread {
        &self.main_thread
    }

    pub fn worker_threads(&self) -> &[WorkerThread] {
        &self.worker_threads
    }

    /// The best result among all workers: the one that reached the greatest depth, with
    /// ties broken by node count (a proxy for "searched the position most thoroughly").
    pub fn best_result(&self) -> Option<SearchResult> {
        self.worker_threads
            .iter()
            .filter_map(|w| *w.last_result.lock().unwrap())
            .max_by_key(|r| (r.depth_reached, r.nodes_evaluated))
    }

    /// True if any worker is currently mid-search. Lazy-SMP has no shared "search finished"
    /// signal, so callers that need to block for completion (the UCI driver's `go`) poll this.
    pub fn is_searching(&self) -> bool {
        self.worker_threads.iter().any(|w| !w.is_idle())
    }
}

static mut THREADS: Option<Threads> = None;
static INIT: Once = Once::new();

/// Initializes the global thread pool with the given engine configuration.
pub fn initialize() {
    initialize_with_options(EngineOptions::default());
}

pub fn initialize_with_options(options: EngineOptions) {
    unsafe {
        INIT.call_once(|| THREADS = Some(Threads::new(options)));
    }
}

/// Retrieves the global thread pool. Panics if the thread pool hasn't been initialized yet.
pub fn get() -> &'static Threads {
    unsafe { THREADS.as_ref().expect("get called before initialize") }
}

enum Request {
    Ping,
    Shutdown,
    Search(SearchJob),
    Stop,
}

#[derive(Clone)]
struct SearchJob {
    position: Position,
    depth: u32,
    time_limit: Option<Duration>,
    soft_time_limit: Option<Duration>,
    node_limit: Option<u64>,
    abdada_depth: u32,
    /// Shared by every worker searching this job, so the pool claims depths to search
    /// cooperatively (see [`crate::search::IterationSync`]) instead of each worker
    /// redundantly restarting iterative deepening from depth 1.
    iteration_sync: Arc<IterationSync>,
}

enum Response {
    Ping,
    Shutdown,
    Stop,
}

pub struct MainThread {
    handle: JoinHandle<()>,
    request_tx: SyncSender<Request>,
    response_rx: Receiver<Response>,
    position: RwLock<Position>,
    abdada_depth: u32,
}

impl MainThread {
    fn new(abdada_depth: u32) -> MainThread {
        let (request_tx, request_rx) = mpsc::sync_channel(0);
        let (response_tx, response_rx) = mpsc::sync_channel(0);
        let handle = thread::Builder::new()
            .name("a4 main thread".into())
            .spawn(|| {
                thread_loop(request_rx, response_tx);
            })
            .expect("failed to spawn main thread");

        MainThread {
            handle,
            request_tx,
            response_rx,
            position: RwLock::new(Position::new()),
            abdada_depth,
        }
    }

    pub fn ping(&self) -> bool {
        self.request_tx
            .send(Request::Ping)
            .expect("ping failed to send on request tx");
        let _ = self
            .response_rx
            .recv()
            .expect("ping failed to read on request rx");
        true
    }

    /// Starts every worker searching the current position to `depth`, optionally bounded
    /// by time (`time_limit` is the hard cap, `soft_time_limit` the soft one - see
    /// [`crate::search::SearchOptions`]) or node count. A fresh [`IterationSync`] is
    /// created per call and shared by every worker in the pool for this search only.
    pub fn search(
        &self,
        depth: u32,
        time_limit: Option<Duration>,
        soft_time_limit: Option<Duration>,
        node_limit: Option<u64>,
    ) {
        let position = self.position.read().unwrap().clone();
        self.request_tx
            .send(Request::Search(SearchJob {
                position,
                depth,
                time_limit,
                soft_time_limit,
                node_limit,
                abdada_depth: self.abdada_depth,
                iteration_sync: Arc::new(IterationSync::new(depth)),
            }))
            .expect("search failed to send on request tx");
    }

    pub fn stop(&self) {
        self.request_tx
            .send(Request::Stop)
            .expect("stop failed to send on request tx");
    }

    pub fn shutdown(self) {
        self.request_tx
            .send(Request::Shutdown)
            .expect("shutdown failed to send on request tx");
        let _ = self
            .response_rx
            .recv()
            .expect("shutdown failed to recv on request rx");
        self.handle.join().expect("failed to join loop thread");
    }

    pub fn set_position(&self, pos: Position) {
        *self.position.write().unwrap() = pos;
    }
}

fn thread_loop(rx: Receiver<Request>, tx: SyncSender<Response>) {
    let _span = tracing::span!(Level::INFO, "main_thread").entered();
    tracing::debug!("entering main loop");
    while let Ok(req) = rx.recv() {
        match req {
            Request::Ping => {
                if tx.send(Response::Ping).is_err() {
                    return;
                }
            }
            Request::Shutdown => {
                let _ = tx.send(Response::Shutdown);
                return;
            }
            Request::Search(job) => {
                tracing::debug!("sending start signal to workers");
                for worker in get().worker_threads() {
                    worker.start(job.clone());
                }
            }
            Request::Stop => {
                for worker in get().worker_threads() {
                    worker.stop();
                }

                let _ = tx.send(Response::Stop);
            }
        }
    }
}

pub struct WorkerThread {
    handle: JoinHandle<()>,
    idle_lock: Mutex<bool>,
    idle_cv: Condvar,
    job: Mutex<Option<SearchJob>>,
    stop_flag: Arc<AtomicBool>,
    shutdown_flag: AtomicBool,
    last_result: Mutex<Option<SearchResult>>,
}

impl WorkerThread {
    fn new(id: usize) -> WorkerThread {
        let handle = thread::Builder::new()
            .name(format!("a4 worker thread {}", id))
            .spawn(move || {
                THREAD_KIND.with(|kind| *kind.borrow_mut() = ThreadIdentifier::WorkerThread(id));
                worker_thread_loop(id)
            })
            .expect("failed to spawn worker thread");

        WorkerThread {
            handle,
            idle_lock: Mutex::new(true),
            idle_cv: Condvar::new(),
            job: Mutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(false)),
            shutdown_flag: AtomicBool::new(false),
            last_result: Mutex::new(None),
        }
    }

    pub fn shutdown(self) {
        self.shutdown_flag.store(true, Ordering::Release);
        self.start_internal(None);
        self.handle.join().unwrap();
    }

    pub fn start(&self, job: SearchJob) {
        self.start_internal(Some(job));
    }

    fn start_internal(&self, job: Option<SearchJob>) {
        *self.job.lock().unwrap() = job;
        let mut idle = self.idle_lock.lock().unwrap();
        *idle = false;
        self.idle_cv.notify_one();
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn last_result(&self) -> Option<SearchResult> {
        *self.last_result.lock().unwrap()
    }

    /// True if this worker is between jobs. Used by callers (the UCI driver) that need to
    /// block until a `search` request has actually finished, since `MainThread::search` only
    /// dispatches the job and returns.
    pub fn is_idle(&self) -> bool {
        *self.idle_lock.lock().unwrap()
    }
}

fn worker_thread_loop(id: usize) {
    let (_, thread) = current().unwrap_worker();
    let _span = tracing::span!(Level::DEBUG, "worker_thread", id).entered();
    tracing::debug!("entering main loop");
    loop {
        tracing::debug!("waiting for start signal");
        let idle = thread.idle_lock.lock().unwrap();
        let mut idle = thread.idle_cv.wait_while(idle, |idle| *idle).unwrap();
        if thread.shutdown_flag.load(Ordering::Acquire) {
            tracing::debug!("received shutdown signal, terminating");
            return;
        }

        let job = thread.job.lock().unwrap().clone();
        if let Some(job) = job {
            tracing::debug!("worker becoming active");
            thread.stop_flag.store(false, Ordering::Release);
            let options = SearchOptions {
                depth: job.depth,
                time_limit: job.time_limit,
                soft_time_limit: job.soft_time_limit,
                node_limit: job.node_limit,
                hard_stop: Some(&thread.stop_flag),
                abdada_depth: job.abdada_depth,
                iteration_sync: Some(job.iteration_sync.clone()),
            };

            let result = search::search(&job.position, &options);
            *thread.last_result.lock().unwrap() = Some(result);
            tracing::debug!("worker finished search");
        }

        thread.stop_flag.store(false, Ordering::Release);
        *idle = true;
    }
}

enum ThreadIdentifier {
    MainThread,
    WorkerThread(usize),
    Unknown,
}

enum ThreadKind {
    Main(&'static MainThread),
    Worker(usize, &'static WorkerThread),
    Unknown,
}

impl ThreadKind {
    pub fn unwrap_main(self) -> &'static MainThread {
        match self {
            ThreadKind::Main(thread) => thread,
            ThreadKind::Worker(_, _) => panic!("unwrap_main() called on worker thread"),
            ThreadKind::Unknown => panic!("unwrap_main() called on unknown thread"),
        }
    }

    pub fn unwrap_worker(self) -> (usize, &'static WorkerThread) {
        match self {
            ThreadKind::Main(_) => panic!("unwrap_worker() called on main thread"),
            ThreadKind::Worker(id, thread) => (id, thread),
            ThreadKind::Unknown => panic!("unwrap_main() called on unknown thread"),
        }
    }
}

thread_local! {
    static THREAD_KIND: RefCell<ThreadIdentifier> = RefCell::new(ThreadIdentifier::Unknown);
}

fn current() -> ThreadKind {
    let threads = get();
    THREAD_KIND.with(|kind| match *kind.borrow() {
        ThreadIdentifier::MainThread => ThreadKind::Main(threads.main_thread()),
        ThreadIdentifier::WorkerThread(id) => ThreadKind::Worker(id, &threads.worker_threads()[id]),
        ThreadIdentifier::Unknown => ThreadKind::Unknown,
    })
}

#[cfg(test)]
mod tests {
    use super::MainThread;

    #[test]
    fn setup_shutdown() {
        let thread = MainThread::new(3);
        thread.shutdown()
    }

    #[test]
    fn ping_pong() {
        let thread = MainThread::new(3);
        assert!(thread.ping());
        thread.shutdown();
    }
}
