//! Serialized access to the record stream.
//!
//! Every emitted record is one line; the mutex guarantees lines from
//! different collectors never interleave, and each line is flushed before
//! the lock is released.

use std::io::{self, Write};
use std::sync::Mutex;

pub struct OutputLock {
    stream: Mutex<Box<dyn Write + Send>>,
}

impl OutputLock {
    pub fn new(stream: impl Write + Send + 'static) -> Self {
        Self {
            stream: Mutex::new(Box::new(stream)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write one record as a single line and flush.
    pub fn emit(&self, record: &serde_json::Value) -> io::Result<()> {
        let mut stream = self.stream.lock().expect("output stream poisoned");
        serde_json::to_writer(&mut *stream, record)?;
        stream.write_all(b"\n")?;
        stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lines_do_not_interleave() {
        let buf = SharedBuf::default();
        let out = Arc::new(OutputLock::new(buf.clone()));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let out = Arc::clone(&out);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        out.emit(&serde_json::json!({"attr": format!("job-{i}")}))
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value["attr"].as_str().unwrap().starts_with("job-"));
        }
    }
}
