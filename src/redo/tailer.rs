//! Background copy of the redo log while data files are being copied.
//!
//! The tailer moves through `Initial -> Tailing -> Final`. Its output is a
//! backup log header followed by log blocks, contiguous from the block
//! holding the checkpoint LSN. While tailing, only complete blocks are
//! written; the final pass also writes the trailing partial block.

use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, instrument};

use super::{
    align_down, align_up, classify_block,
    log_file::{backup_log_header, RedoLogFile},
    BlockState, LOG_BLOCK_SIZE,
};
use crate::{
    datasink::DatasinkFile,
    logging::{self, RedoProgressSnapshot},
    Error, Result,
};

/// Blocks read per scan step.
pub const SCAN_BLOCKS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerPhase {
    Initial,
    Tailing,
    Final,
}

#[derive(Debug)]
struct Shared {
    scanned_lsn: Mutex<u64>,
    advanced: Condvar,
    stop: Mutex<bool>,
    wake: Condvar,
}

pub struct RedoTailer {
    log: RedoLogFile,
    out: Box<dyn DatasinkFile>,
    checkpoint_lsn: u64,
    /// Output holds blocks up to here.
    write_lsn: u64,
    scanned_lsn: u64,
    /// Highest LSN whose log data is in the output.
    copied_lsn: u64,
    phase: TailerPhase,
    shared: Arc<Shared>,
    bytes_copied: u64,
    passes: u64,
}

impl std::fmt::Debug for RedoTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedoTailer")
            .field("log", &self.log.path())
            .field("checkpoint_lsn", &self.checkpoint_lsn)
            .field("write_lsn", &self.write_lsn)
            .field("scanned_lsn", &self.scanned_lsn)
            .field("phase", &self.phase)
            .finish()
    }
}

impl RedoTailer {
    /// Write the backup log header; copying starts at `checkpoint_lsn`.
    pub fn new(log: RedoLogFile, mut out: Box<dyn DatasinkFile>, checkpoint_lsn: u64) -> Result<Self> {
        let start = align_down(checkpoint_lsn);
        out.write(&backup_log_header(start, checkpoint_lsn))?;
        Ok(Self {
            log,
            out,
            checkpoint_lsn,
            write_lsn: start,
            scanned_lsn: checkpoint_lsn,
            copied_lsn: start,
            phase: TailerPhase::Initial,
            shared: Arc::new(Shared {
                scanned_lsn: Mutex::new(checkpoint_lsn),
                advanced: Condvar::new(),
                stop: Mutex::new(false),
                wake: Condvar::new(),
            }),
            bytes_copied: 0,
            passes: 0,
        })
    }

    pub fn phase(&self) -> TailerPhase {
        self.phase
    }

    pub fn scanned_lsn(&self) -> u64 {
        self.scanned_lsn
    }

    pub fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn
    }

    fn expect_phase(&self, phase: TailerPhase) -> Result<()> {
        if self.phase != phase {
            return Err(Error::Inconsistent(format!(
                "redo tailer is in phase {:?}, expected {phase:?}",
                self.phase
            ))
            .into());
        }
        Ok(())
    }

    /// First copy, from the block holding the checkpoint LSN.
    #[instrument(skip(self), fields(checkpoint_lsn = self.checkpoint_lsn))]
    pub fn initial_copy(&mut self) -> Result<u64> {
        self.expect_phase(TailerPhase::Initial)?;
        let mut first = vec![0u8; LOG_BLOCK_SIZE];
        let first_lsn = align_down(self.checkpoint_lsn);
        self.log.read_blocks(first_lsn, &mut first)?;
        match classify_block(&first, first_lsn) {
            BlockState::Complete | BlockState::Partial(_) => {}
            state => {
                return Err(Error::corrupt(
                    self.log.path(),
                    format!("no valid log block at checkpoint LSN {} ({state:?})", self.checkpoint_lsn),
                )
                .into());
            }
        }
        self.copy_pass(false)?;
        self.phase = TailerPhase::Tailing;
        info!(scanned_lsn = self.scanned_lsn, "redo log copy started");
        Ok(self.scanned_lsn)
    }

    fn copy_pass(&mut self, final_pass: bool) -> Result<()> {
        let chunk_len = (SCAN_BLOCKS * LOG_BLOCK_SIZE).min(self.log.capacity() as usize);
        let mut chunk = vec![0u8; chunk_len];
        loop {
            let start = self.write_lsn;
            self.log.read_blocks(start, &mut chunk)?;

            let mut lsn = start;
            let mut whole_chunk = true;
            for (i, block) in chunk.chunks_exact(LOG_BLOCK_SIZE).enumerate() {
                let block_lsn = start + (i * LOG_BLOCK_SIZE) as u64;
                match classify_block(block, block_lsn) {
                    BlockState::Complete => lsn = block_lsn + LOG_BLOCK_SIZE as u64,
                    BlockState::Partial(len) => {
                        lsn = block_lsn + len as u64;
                        whole_chunk = false;
                        break;
                    }
                    BlockState::End => {
                        whole_chunk = false;
                        break;
                    }
                    BlockState::Overwritten => {
                        return Err(Error::Inconsistent(format!(
                            "redo log overwritten at LSN {block_lsn} before it was copied"
                        ))
                        .into());
                    }
                }
            }

            let write_end = if final_pass {
                align_up(lsn)
            } else {
                align_down(lsn)
            };
            if write_end > start {
                let len = (write_end - start) as usize;
                self.out.write(&chunk[..len])?;
                self.write_lsn = write_end;
                self.bytes_copied += len as u64;
            }
            let copied = if final_pass { lsn } else { align_down(lsn) };
            self.copied_lsn = self.copied_lsn.max(copied);
            self.publish_scanned(lsn);

            if !whole_chunk || final_pass && write_end == start {
                break;
            }
        }
        self.passes += 1;
        logging::log_redo_progress(RedoProgressSnapshot {
            scanned_lsn: self.scanned_lsn,
            start_lsn: self.checkpoint_lsn,
            bytes_copied: self.bytes_copied,
            passes: self.passes,
        });
        Ok(())
    }

    fn publish_scanned(&mut self, lsn: u64) {
        if lsn <= self.scanned_lsn {
            return;
        }
        self.scanned_lsn = lsn;
        let mut shared = self.shared.scanned_lsn.lock();
        *shared = lsn;
        self.shared.advanced.notify_all();
    }

    /// Keep copying on a background thread every `interval` until stopped.
    pub fn spawn(self, interval: Duration) -> Result<TailerHandle> {
        self.expect_phase(TailerPhase::Tailing)?;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("redo-tailer".into())
            .spawn(move || self.run_tailing(interval))?;
        Ok(TailerHandle { shared, handle })
    }

    fn run_tailing(mut self, interval: Duration) -> Result<Self> {
        loop {
            {
                let mut stop = self.shared.stop.lock();
                if !*stop {
                    self.shared.wake.wait_for(&mut stop, interval);
                }
                if *stop {
                    break;
                }
            }
            self.copy_pass(false)?;
        }
        debug!(scanned_lsn = self.scanned_lsn, "redo tailer stopped");
        Ok(self)
    }

    /// Final pass: copy through the current end of the log, padding the
    /// last partial block, then require that `to_lsn` was reached.
    #[instrument(skip(self), fields(to_lsn))]
    pub fn finish(mut self, to_lsn: u64) -> Result<u64> {
        self.expect_phase(TailerPhase::Tailing)?;
        self.phase = TailerPhase::Final;
        self.copy_pass(true)?;
        if self.copied_lsn < to_lsn {
            return Err(Error::Inconsistent(format!(
                "redo log copied up to LSN {} but the backup requires LSN {to_lsn}",
                self.copied_lsn
            ))
            .into());
        }
        let scanned = self.scanned_lsn;
        self.out.close()?;
        info!(scanned_lsn = scanned, to_lsn, "redo log copy finished");
        Ok(scanned)
    }
}

/// Running tailer thread.
#[derive(Debug)]
pub struct TailerHandle {
    shared: Arc<Shared>,
    handle: JoinHandle<Result<RedoTailer>>,
}

impl TailerHandle {
    pub fn scanned_lsn(&self) -> u64 {
        *self.shared.scanned_lsn.lock()
    }

    /// Wait until the tailer has scanned `lsn`; false on timeout.
    pub fn wait_for_lsn(&self, lsn: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut scanned = self.shared.scanned_lsn.lock();
        while *scanned < lsn {
            if self
                .shared
                .advanced
                .wait_until(&mut scanned, deadline)
                .timed_out()
            {
                return *scanned >= lsn;
            }
        }
        true
    }

    /// Signal the thread and take the tailer back for its final pass.
    pub fn stop(self) -> Result<RedoTailer> {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
            self.shared.wake.notify_all();
        }
        match self.handle.join() {
            Ok(res) => res,
            Err(_) => Err(Error::Inconsistent("redo tailer thread panicked".into()).into()),
        }
    }
}
