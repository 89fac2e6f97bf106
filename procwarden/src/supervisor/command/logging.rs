use crate::config::process_name::ProcessName;
use crate::utils::threads::{process_thread_name, spawn_named_thread};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Lines of recent output kept per process for the management API's tail
/// requests.
pub const DEFAULT_RING_CAPACITY: usize = 500;

/// Which pipe of the child a logger drains.
#[derive(Debug, Clone, Copy)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn label(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "out",
            OutputStream::Stderr => "err",
        }
    }
}

/// Bounded ring of the most recent output lines of one process, shared by
/// the logger threads of all its instances. The ring outlives supervisor
/// recreations, so `tail` still answers while a process is being restarted;
/// the structured log remains the full stream.
#[derive(Clone)]
pub struct OutputRing {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for OutputRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.max(1)))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The most recent `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let Ok(lines) = self.lines.lock() else {
            return Vec::new();
        };
        lines
            .iter()
            .skip(lines.len().saturating_sub(n))
            .cloned()
            .collect()
    }
}

/// Spawns a thread that forwards each line the child writes to the
/// structured log and into the process's output ring. The thread ends when
/// the pipe closes, i.e. when the child exits.
pub fn spawn_line_logger<R>(
    reader: R,
    name: ProcessName,
    instance: usize,
    stream: OutputStream,
    ring: OutputRing,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    let thread_name = process_thread_name(stream.label(), &name, Some(instance));

    spawn_named_thread(thread_name, move || {
        let buffered = BufReader::new(reader);
        for line in buffered.lines() {
            let Ok(line) = line else {
                break;
            };
            ring.push(format!("[{instance}/{}] {line}", stream.label()));
            match stream {
                OutputStream::Stdout => info!(process = %name, instance, "{line}"),
                OutputStream::Stderr => warn!(process = %name, instance, "{line}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn logger_forwards_each_line_until_eof() {
        let ring = OutputRing::default();

        let stdout: &[u8] = b"listening on :8080\nworker ready\n";
        spawn_line_logger(
            stdout,
            ProcessName::must("logger-test"),
            0,
            OutputStream::Stdout,
            ring.clone(),
        )
        .join()
        .unwrap();

        let stderr: &[u8] = b"deprecation warning\n";
        spawn_line_logger(
            stderr,
            ProcessName::must("logger-test"),
            1,
            OutputStream::Stderr,
            ring.clone(),
        )
        .join()
        .unwrap();

        assert!(logs_contain("listening on :8080"));
        assert!(logs_contain("worker ready"));
        assert!(logs_contain("deprecation warning"));

        let tail = ring.tail(10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0], "[0/out] listening on :8080");
        assert_eq!(tail[2], "[1/err] deprecation warning");
    }

    #[test]
    fn ring_keeps_only_the_most_recent_lines() {
        let ring = OutputRing::new(3);
        for n in 0..5 {
            ring.push(format!("line {n}"));
        }

        assert_eq!(ring.tail(10), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(ring.tail(2), vec!["line 3", "line 4"]);
        assert!(ring.tail(0).is_empty());
    }
}
