//! Line-oriented pipe I/O between the supervisor and its workers.
//!
//! Both directions of the protocol are single lines terminated by `\n`.
//! Reads and writes go through a raw fd wrapper that retries on EINTR so a
//! signal delivery never tears a protocol line.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// One end of a worker pipe, with EINTR-safe reads and writes.
pub struct PipeEnd {
    fd: OwnedFd,
}

impl PipeEnd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Take ownership of a raw file descriptor.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor not owned elsewhere.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }
}

impl AsFd for PipeEnd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered reader yielding protocol lines without their terminator.
pub struct LineReader {
    reader: BufReader<PipeEnd>,
}

impl LineReader {
    pub fn new(fd: PipeEnd) -> Self {
        Self {
            reader: BufReader::with_capacity(PIPE_BUFFER_SIZE, fd),
        }
    }

    /// Read one line. `None` means the other side closed the pipe.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        match self.reader.read_line(&mut line)? {
            0 => Ok(None),
            _ => {
                if line.ends_with('\n') {
                    line.pop();
                }
                Ok(Some(line))
            }
        }
    }
}

/// Buffered writer that flushes after every protocol line.
pub struct LineWriter {
    writer: BufWriter<PipeEnd>,
}

impl LineWriter {
    pub fn new(fd: PipeEnd) -> Self {
        Self {
            writer: BufWriter::with_capacity(PIPE_BUFFER_SIZE, fd),
        }
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Whether an I/O failure means the other side of the pipe is gone.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (PipeEnd, PipeEnd) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("pipe");
        (PipeEnd::new(read_fd), PipeEnd::new(write_fd))
    }

    #[test]
    fn test_line_roundtrip() {
        let (read_end, write_end) = pipe_pair();
        let mut reader = LineReader::new(read_end);
        let mut writer = LineWriter::new(write_end);

        writer.write_line("next").unwrap();
        writer.write_line("do [\"a\"]").unwrap();
        writer.write_line("").unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap().as_deref(), Some("next"));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("do [\"a\"]"));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some(""));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_write_to_closed_pipe_is_disconnect() {
        let (read_end, write_end) = pipe_pair();
        drop(read_end);
        let mut writer = LineWriter::new(write_end);
        let err = writer.write_line("next").unwrap_err();
        assert!(is_disconnect(&err));
    }
}
