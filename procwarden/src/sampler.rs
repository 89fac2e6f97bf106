//! Periodic per-child resource sampling.
//!
//! Reads CPU time, resident set and open descriptor counts for every live
//! instance from procfs and hands the batch to the fleet manager, which
//! merges it into the status snapshot.

use crate::config::process_name::ProcessName;
use crate::event::channel::{EventConsumer, EventPublisher};
use crate::fleet::status::FleetStatus;
use crate::utils::thread_context::{CancellationMessage, NotStartedThreadContext, StartedThreadContext};
use fs::file::reader::FileReader;
use fs::LocalFile;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::trace;

pub const SAMPLER_THREAD_NAME: &str = "resource_sampler";

/// One measurement of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    pub name: ProcessName,
    pub instance: usize,
    pub pid: u32,
    pub cpu_percent: Option<f64>,
    pub rss_bytes: Option<u64>,
    pub open_fds: Option<usize>,
}

/// A full sampling round.
pub type SampleBatch = Vec<ResourceSample>;

/// Spawns the sampling loop. It reads live pids from the shared status
/// snapshot and publishes batches for the fleet manager to merge.
pub fn spawn_sampler(
    interval: Duration,
    status: Arc<RwLock<FleetStatus>>,
    publisher: EventPublisher<SampleBatch>,
) -> StartedThreadContext {
    let callback = move |stop_consumer: EventConsumer<CancellationMessage>| {
        let mut cpu_tracker = CpuTracker::default();
        loop {
            if stop_consumer.is_cancelled(interval) {
                break;
            }

            let targets = match status.read() {
                Ok(status) => status.sample_targets(),
                Err(_) => break,
            };

            let batch: SampleBatch = targets
                .into_iter()
                .map(|(name, instance, pid)| sample(&LocalFile, &mut cpu_tracker, name, instance, pid))
                .collect();

            cpu_tracker.retain_current();
            if !batch.is_empty() {
                trace!(instances = batch.len(), "sampled fleet resources");
                let _ = publisher.publish(batch);
            }
        }
    };
    NotStartedThreadContext::new(SAMPLER_THREAD_NAME, callback).start()
}

/// CPU usage needs two observations; this keeps the previous tick counts per
/// pid and drops entries for pids that disappeared.
#[derive(Default)]
struct CpuTracker {
    previous: HashMap<u32, (u64, Instant)>,
    seen: Vec<u32>,
}

impl CpuTracker {
    fn cpu_percent(&mut self, pid: u32, total_ticks: u64) -> Option<f64> {
        let now = Instant::now();
        self.seen.push(pid);
        let previous = self.previous.insert(pid, (total_ticks, now));

        let (previous_ticks, previous_at) = previous?;
        let elapsed = now.duration_since(previous_at).as_secs_f64();
        if elapsed <= 0.0 || total_ticks < previous_ticks {
            return None;
        }

        let ticks_per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks_per_second <= 0 {
            return None;
        }
        let cpu_seconds = (total_ticks - previous_ticks) as f64 / ticks_per_second as f64;
        Some(100.0 * cpu_seconds / elapsed)
    }

    fn retain_current(&mut self) {
        let seen = std::mem::take(&mut self.seen);
        self.previous.retain(|pid, _| seen.contains(pid));
    }
}

fn sample<F: FileReader>(
    file_reader: &F,
    cpu_tracker: &mut CpuTracker,
    name: ProcessName,
    instance: usize,
    pid: u32,
) -> ResourceSample {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));

    let cpu_percent = file_reader
        .read(&proc_dir.join("stat"))
        .ok()
        .and_then(|raw| parse_stat_ticks(&raw))
        .and_then(|ticks| cpu_tracker.cpu_percent(pid, ticks));

    let rss_bytes = file_reader
        .read(&proc_dir.join("statm"))
        .ok()
        .and_then(|raw| parse_statm_rss_pages(&raw))
        .map(|pages| pages * page_size());

    let open_fds = file_reader.entry_count(&proc_dir.join("fd")).ok();

    ResourceSample {
        name,
        instance,
        pid,
        cpu_percent,
        rss_bytes,
        open_fds,
    }
}

/// utime + stime from /proc/<pid>/stat. The command field may contain spaces
/// and parentheses, so fields are counted after the closing paren.
fn parse_stat_ticks(raw: &str) -> Option<u64> {
    let after_comm = raw.rsplit_once(')')?.1;
    let mut fields = after_comm.split_whitespace();
    // after the comm field: state is field 3, utime is field 14, stime 15
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

/// Resident pages: second field of /proc/<pid>/statm.
fn parse_statm_rss_pages(raw: &str) -> Option<u64> {
    raw.split_whitespace().nth(1)?.parse().ok()
}

fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}
