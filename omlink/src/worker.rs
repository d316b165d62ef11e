//! Background worker that owns a register transport.
//!
//! All register traffic of one link goes through a single thread. Callers
//! submit [`Request`]s over a bounded queue and either wait for the answer
//! with a timeout or fire and forget. The worker runs requests strictly one
//! at a time in submission order and never retries.
//!
//! A caller that times out only stops waiting: the request still runs and
//! its answer is discarded, because every blocking request carries its own
//! reply channel.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    transport::{RegisterTransport, Request, Response},
};

/// Depth of the request queue.
pub const QUEUE_DEPTH: usize = 100;

/// How long the idle worker waits before re-checking the running flag.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Retry interval of a blocking caller waiting for queue space.
const ENQUEUE_POLL: Duration = Duration::from_millis(5);

type Reply = SyncSender<Result<Response>>;

struct Job {
    request: Request,
    silent: bool,
    reply: Option<Reply>,
}

/// Owner of the worker thread. Stops the worker when dropped.
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

/// Cloneable submission side of a [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    // `None` is the shutdown sentinel.
    tx: SyncSender<Option<Job>>,
    running: Arc<AtomicBool>,
}

impl Worker {
    /// Move `transport` into a new worker thread.
    pub fn spawn<T>(transport: T) -> Result<Self>
    where
        T: RegisterTransport + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("omlink-worker".to_string())
            .spawn(move || run(transport, &rx, &flag))?;

        Ok(Self {
            handle: WorkerHandle { tx, running },
            thread: Some(thread),
        })
    }

    /// Submission handle that can be shared across threads.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// See [`WorkerHandle::submit`].
    pub fn submit(
        &self,
        request: Request,
        blocking: bool,
        timeout: Duration,
        silent: bool,
    ) -> Result<Option<Response>> {
        self.handle
            .submit(request, blocking, timeout, silent)
    }

    /// Whether the worker accepts requests.
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Stop the worker and wait for the in-flight request to finish.
    ///
    /// Requests still queued are dropped; their callers get
    /// [`Error::WorkerStopped`].
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle
            .running
            .store(false, Ordering::Release);
        match self.handle.tx.try_send(None) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {},
            // The worker sees the flag after its current request.
            Err(TrySendError::Full(_)) => trace!("Request queue full, not queueing stop sentinel"),
        }
        if thread.join().is_err() {
            warn!("Worker thread panicked");
        }
        debug!("Worker stopped");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WorkerHandle {
    /// Submit a request.
    ///
    /// With `blocking`, waits up to `timeout` and returns the response; a
    /// missed deadline yields [`Error::Timeout`] while the request itself is
    /// still executed. Time spent waiting for queue space counts against
    /// `timeout`. Without `blocking`, returns `Ok(None)` once queued, or a
    /// transport error at once if the queue is full.
    /// `silent` keeps the request out of the debug log.
    pub fn submit(
        &self,
        request: Request,
        blocking: bool,
        timeout: Duration,
        silent: bool,
    ) -> Result<Option<Response>> {
        if blocking {
            self.call(request, timeout, silent).map(Some)
        } else {
            self.post(request, silent).map(|()| None)
        }
    }

    /// Submit and wait up to `timeout` for the response.
    pub fn call(&self, request: Request, timeout: Duration, silent: bool) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let label = request.to_string();
        let timed_out = || Error::Timeout(format!("no response to {label} within {timeout:?}"));

        let mut job = Job {
            request,
            silent,
            reply: Some(reply_tx),
        };
        loop {
            job = match self.try_enqueue(job)? {
                None => break,
                Some(job) => job,
            };
            let now = Instant::now();
            if now >= deadline {
                trace!("Request queue full, giving up on {label}");
                return Err(timed_out());
            }
            thread::sleep(ENQUEUE_POLL.min(deadline - now));
        }

        match reply_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(timed_out()),
            Err(RecvTimeoutError::Disconnected) => Err(Error::WorkerStopped),
        }
    }

    /// Submit without waiting.
    pub fn post(&self, request: Request, silent: bool) -> Result<()> {
        let job = Job {
            request,
            silent,
            reply: None,
        };
        match self.try_enqueue(job)? {
            None => Ok(()),
            Some(job) => Err(Error::Transport(format!(
                "request queue full, dropping {}",
                job.request
            ))),
        }
    }

    /// Whether the worker accepts requests.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue `job` without blocking; hands it back if the queue is full.
    fn try_enqueue(&self, job: Job) -> Result<Option<Job>> {
        if !self.is_running() {
            return Err(Error::WorkerStopped);
        }
        match self.tx.try_send(Some(job)) {
            Ok(()) => Ok(None),
            Err(TrySendError::Full(job)) => Ok(job),
            Err(TrySendError::Disconnected(_)) => Err(Error::WorkerStopped),
        }
    }
}

fn run<T: RegisterTransport>(mut transport: T, rx: &Receiver<Option<Job>>, running: &AtomicBool) {
    debug!("Worker started");
    while running.load(Ordering::Acquire) {
        let job = match rx.recv_timeout(IDLE_POLL) {
            Ok(Some(job)) => job,
            Ok(None) | Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if !job.silent {
            debug!("-> {}", job.request);
        }
        let result = job.request.execute(&mut transport);
        match &result {
            Ok(response) => trace!("<- {response:?}"),
            Err(e) if !job.silent => debug!("<- {} failed: {e}", job.request),
            Err(_) => {},
        }

        match job.reply {
            // A send error means the caller gave up waiting.
            Some(reply) => {
                if reply.send(result).is_err() {
                    trace!("Dropping stale response to {}", job.request);
                }
            },
            None => {
                if let Err(e) = result {
                    if !job.silent {
                        warn!("Unanswered {} failed: {e}", job.request);
                    }
                }
            },
        }
    }
}
