//! Backend running positioned reads on dedicated I/O threads.

use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::backend::{CompletedRead, IoBackend, IoContext, PendingRead, Wakeup};
use crate::types::IoPriorityHint;

pub const DEFAULT_IO_THREADS: usize = 2;

struct IoJob {
    read: PendingRead,
    wakeup: Wakeup,
}

/// Asynchronous file backend.
///
/// At most `max_in_flight` reads are handed to the I/O threads at once; the
/// rest stay in the engine's priority queue, so a newly queued high priority
/// read only waits behind reads already in flight. The minimum priority hint
/// lowers that cap while nothing urgent is queued, keeping I/O threads free
/// for the next urgent read.
pub struct ThreadedFileBackend {
    job_tx: Option<Sender<IoJob>>,
    result_rx: Receiver<CompletedRead>,
    threads: Vec<JoinHandle<()>>,
    max_in_flight: usize,
    in_flight: usize,
    hint: IoPriorityHint,
}

impl ThreadedFileBackend {
    pub fn new(io_threads: usize, max_in_flight: usize) -> std::io::Result<Self> {
        let (job_tx, job_rx) = unbounded::<IoJob>();
        let (result_tx, result_rx) = unbounded();
        let mut threads = Vec::with_capacity(io_threads.max(1));
        for i in 0..io_threads.max(1) {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("iostore-io-{}", i))
                .spawn(move || io_thread(job_rx, result_tx))?;
            threads.push(handle);
        }
        Ok(ThreadedFileBackend {
            job_tx: Some(job_tx),
            result_rx,
            threads,
            max_in_flight: max_in_flight.max(1),
            in_flight: 0,
            hint: IoPriorityHint::Min,
        })
    }

    pub fn minimum_priority(&self) -> IoPriorityHint {
        self.hint
    }

    /// Reads admitted at once under the current hint.
    pub fn in_flight_limit(&self) -> usize {
        let limit = match self.hint {
            IoPriorityHint::Max => self.max_in_flight,
            IoPriorityHint::Normal => self.max_in_flight - self.max_in_flight / 4,
            IoPriorityHint::Min => self.max_in_flight / 2,
        };
        limit.max(1)
    }
}

fn io_thread(jobs: Receiver<IoJob>, results: Sender<CompletedRead>) {
    while let Ok(IoJob { read, wakeup }) = jobs.recv() {
        let done = read.perform();
        if let Err(e) = &done.result {
            log::warn!("Raw block read failed: {}", e);
        }
        if results.send(done).is_err() {
            break;
        }
        wakeup.notify();
    }
}

impl IoBackend for ThreadedFileBackend {
    fn start_requests(&mut self, cx: &mut IoContext<'_>) -> bool {
        let Some(job_tx) = &self.job_tx else { return false };
        let mut started = false;
        while self.in_flight < self.in_flight_limit() {
            let Some(read) = cx.next_read() else { break };
            log::trace!(
                "Starting read container={} offset={} size={} priority={:?}",
                read.container(),
                read.offset(),
                read.size(),
                read.priority()
            );
            match job_tx.send(IoJob { read, wakeup: cx.wakeup() }) {
                Ok(()) => {
                    self.in_flight += 1;
                    started = true;
                }
                Err(err) => {
                    // I/O threads are gone; fail the read rather than lose it.
                    let read = err.into_inner().read;
                    cx.completed.push(read.finish(Err(crate::error::IoStoreError::ReadError(
                        "I/O threads stopped".to_owned(),
                    ))));
                    break;
                }
            }
        }
        started
    }

    fn completed_requests(&mut self, out: &mut Vec<CompletedRead>) {
        for done in self.result_rx.try_iter() {
            self.in_flight -= 1;
            out.push(done);
        }
    }

    fn set_minimum_priority(&mut self, hint: IoPriorityHint) {
        log::trace!("Minimum I/O priority {:?} -> {:?}", self.hint, hint);
        self.hint = hint;
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl Drop for ThreadedFileBackend {
    fn drop(&mut self) {
        // Closing the job channel ends every I/O thread after its current read.
        self.job_tx.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_scales_in_flight_limit() {
        let mut backend = ThreadedFileBackend::new(1, 8).unwrap();
        assert_eq!(backend.minimum_priority(), IoPriorityHint::Min);
        assert_eq!(backend.in_flight_limit(), 4);
        backend.set_minimum_priority(IoPriorityHint::Normal);
        assert_eq!(backend.in_flight_limit(), 6);
        backend.set_minimum_priority(IoPriorityHint::Max);
        assert_eq!(backend.in_flight_limit(), 8);
    }

    #[test]
    fn single_slot_is_never_closed() {
        let mut backend = ThreadedFileBackend::new(1, 1).unwrap();
        for hint in [IoPriorityHint::Min, IoPriorityHint::Normal, IoPriorityHint::Max] {
            backend.set_minimum_priority(hint);
            assert_eq!(backend.in_flight_limit(), 1);
        }
    }
}
