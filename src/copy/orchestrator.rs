//! Worker pool copying every selected file of a data directory.

use std::{path::Path, sync::atomic::Ordering, time::Duration};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, instrument};

use crate::{
    datasink::Datasink,
    logging::{self, CopyProgressSnapshot},
    Error, Result,
};

use super::{
    copy_tablespace,
    datadir::{DatadirEntry, DatadirIterator, EntryKind},
    read_filter::ReadFilter,
    throttle::Throttle,
    write_filter::WriteFilter,
    CopyCounters,
};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

pub struct CopyOrchestrator<'a> {
    sink: &'a dyn Datasink,
    workers: usize,
    throttle: Option<&'a Throttle>,
    progress_interval: Duration,
}

impl std::fmt::Debug for CopyOrchestrator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyOrchestrator")
            .field("workers", &self.workers)
            .field("throttled", &self.throttle.is_some())
            .finish()
    }
}

/// Bumps the finished-worker count even if the worker unwinds.
struct FinishGuard<'a>(&'a (Mutex<usize>, Condvar));

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        let (count, cv) = self.0;
        *count.lock() += 1;
        cv.notify_all();
    }
}

impl<'a> CopyOrchestrator<'a> {
    pub fn new(sink: &'a dyn Datasink, workers: usize) -> Self {
        Self {
            sink,
            workers: workers.max(1),
            throttle: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_throttle(mut self, throttle: &'a Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Copy every entry under `root` accepted by `select`. Workers are never
    /// cancelled: a failing worker stops itself, the rest run to completion,
    /// and the run fails if any worker did.
    #[instrument(skip_all, fields(root = %root.display(), workers = self.workers))]
    pub fn run<R: ReadFilter, W: WriteFilter>(
        &self,
        root: &Path,
        select: &(dyn Fn(&DatadirEntry) -> bool + Sync),
        read_filter: &R,
        write_filter: &W,
    ) -> Result<CopyProgressSnapshot> {
        let iter = DatadirIterator::new(root, select);
        let counters = CopyCounters::default();
        let first_failure: Mutex<Option<String>> = Mutex::new(None);
        let finished = (Mutex::new(0usize), Condvar::new());

        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.workers)
                .map(|thread| {
                    let iter = &iter;
                    let counters = &counters;
                    let first_failure = &first_failure;
                    let finished = &finished;
                    scope.spawn(move || {
                        let _guard = FinishGuard(finished);
                        self.worker_loop(
                            thread,
                            iter,
                            read_filter,
                            write_filter,
                            counters,
                            first_failure,
                        )
                    })
                })
                .collect();

            {
                let (count, cv) = &finished;
                let mut done = count.lock();
                while *done < self.workers {
                    if cv.wait_for(&mut done, self.progress_interval).timed_out() {
                        logging::log_copy_progress(self.snapshot(&counters), false);
                    }
                }
            }

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(false))
                .collect()
        });

        let snapshot = self.snapshot(&counters);
        let failed = results.iter().filter(|ok| !**ok).count();
        logging::log_copy_progress(snapshot, failed > 0);

        if failed > 0 {
            let first = first_failure
                .into_inner()
                .unwrap_or_else(|| "worker panicked".to_string());
            return Err(Error::WorkerFailed {
                failed,
                total: self.workers,
                first,
            }
            .into());
        }
        info!(files = snapshot.files_done, "data files copied");
        Ok(snapshot)
    }

    fn snapshot(&self, counters: &CopyCounters) -> CopyProgressSnapshot {
        let waits = self.throttle.map_or(0, |t| t.waits());
        counters.snapshot(self.workers, waits)
    }

    fn worker_loop<R: ReadFilter, W: WriteFilter>(
        &self,
        thread: usize,
        iter: &DatadirIterator<'_>,
        read_filter: &R,
        write_filter: &W,
        counters: &CopyCounters,
        first_failure: &Mutex<Option<String>>,
    ) -> bool {
        let record_failure = |msg: String| {
            counters.files_failed.fetch_add(1, Ordering::Relaxed);
            first_failure.lock().get_or_insert(msg);
        };

        loop {
            let entry = match iter.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => return true,
                Err(err) => {
                    error!(thread, error = %err, "failed to list data directory");
                    record_failure(err.to_string());
                    return false;
                }
            };

            let res = match entry.kind {
                EntryKind::EmptyDir => self.sink.mkdir(&entry.rel_path),
                EntryKind::File => copy_tablespace(
                    &entry,
                    read_filter,
                    write_filter,
                    self.sink,
                    self.throttle,
                    counters,
                    thread,
                ),
            };

            match res {
                Ok(()) => {
                    counters.files_done.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    error!(
                        thread,
                        path = %entry.path.display(),
                        error = %err,
                        "failed to copy file"
                    );
                    record_failure(format!("{}: {err}", entry.rel_path.display()));
                    return false;
                }
            }
        }
    }
}
