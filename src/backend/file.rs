//! Synchronous positioned-read backend.

use std::fs::File;

use crate::backend::{CompletedRead, IoBackend, IoContext};
use crate::error::{IoStoreError, Result};
use crate::types::IoPriorityHint;

/// Fills `buf` from `file` at `offset`, without moving any shared cursor.
#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
        .map_err(|e| IoStoreError::ReadError(format!("{} bytes at {}: {}", buf.len(), offset, e)))
}

/// Fills `buf` from `file` at `offset`, without moving any shared cursor.
#[cfg(windows)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0usize;
    while done < buf.len() {
        match file.seek_read(&mut buf[done..], offset + done as u64) {
            Ok(0) => {
                return Err(IoStoreError::ReadError(format!(
                    "{} bytes at {}: unexpected end of file",
                    buf.len(),
                    offset
                )))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(IoStoreError::ReadError(format!("{} bytes at {}: {}", buf.len(), offset, e)))
            }
        }
    }
    Ok(())
}

/// Default number of reads started per `start_requests` call.
pub const DEFAULT_READS_PER_CALL: usize = 8;

/// Performs reads inline on the service thread.
///
/// Each `start_requests` call reads up to `reads_per_call` blocks, so a long
/// queue is interleaved with decoding instead of drained in one go.
#[derive(Debug)]
pub struct FileIoBackend {
    reads_per_call: usize,
    completed: Vec<CompletedRead>,
    hint: IoPriorityHint,
}

impl Default for FileIoBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIoBackend {
    pub fn new() -> Self {
        Self::with_reads_per_call(DEFAULT_READS_PER_CALL)
    }

    pub fn with_reads_per_call(reads_per_call: usize) -> Self {
        FileIoBackend { reads_per_call: reads_per_call.max(1), completed: Vec::new(), hint: IoPriorityHint::Min }
    }

    pub fn minimum_priority(&self) -> IoPriorityHint {
        self.hint
    }
}

impl IoBackend for FileIoBackend {
    fn start_requests(&mut self, cx: &mut IoContext<'_>) -> bool {
        let mut started = 0;
        while started < self.reads_per_call {
            let Some(read) = cx.next_read() else { break };
            let done = read.perform();
            if let Err(e) = &done.result {
                log::warn!("Raw block read failed: {}", e);
            }
            self.completed.push(done);
            started += 1;
        }
        started > 0
    }

    fn completed_requests(&mut self, out: &mut Vec<CompletedRead>) {
        out.append(&mut self.completed);
    }

    fn set_minimum_priority(&mut self, hint: IoPriorityHint) {
        log::trace!("Minimum I/O priority {:?} -> {:?}", self.hint, hint);
        self.hint = hint;
    }

    fn in_flight(&self) -> usize {
        self.completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn positioned_read() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"abcdefghij").unwrap();
        let mut buf = [0u8; 4];
        read_exact_at(&file, &mut buf, 3).unwrap();
        assert_eq!(&buf, b"defg");
    }

    #[test]
    fn short_read_is_read_error() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"abc").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(read_exact_at(&file, &mut buf, 1), Err(IoStoreError::ReadError(_))));
    }
}
