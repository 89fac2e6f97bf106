//! Debounced watch on the configuration file.
//!
//! Editor saves and config-management tools touch the file several times in a
//! burst; the watcher coalesces a burst into one reload event delivered on a
//! single-slot channel. An event that finds the slot full is dropped: the
//! latest state of the file is what matters, not how often it changed.

use crate::event::channel::{pub_sub_latest, EventConsumer, EventPublisher};
use crate::utils::thread_context::{CancellationMessage, NotStartedThreadContext, StartedThreadContext};
use crossbeam::channel::{unbounded, RecvTimeoutError};
use crossbeam::select;
use notify::{recommended_watcher, EventKind, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const WATCHER_THREAD_NAME: &str = "config_watcher";

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// A coalesced "the configuration changed" notification.
pub type ReloadEvent = ();

/// The single-slot channel the watcher delivers into.
pub fn reload_channel() -> (EventPublisher<ReloadEvent>, EventConsumer<ReloadEvent>) {
    pub_sub_latest(1)
}

/// Spawns the watch loop on `config_path`. The parent directory is watched
/// so file replacement (the common editor save strategy) is seen as well.
pub fn spawn_config_watcher(
    config_path: &Path,
    debounce: Duration,
    reload_publisher: EventPublisher<ReloadEvent>,
) -> StartedThreadContext {
    let directory = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name: Option<OsString> = config_path.file_name().map(OsString::from);

    let callback = move |stop_consumer: EventConsumer<CancellationMessage>| {
        let (raw_publisher, raw_consumer) = unbounded();

        let mut watcher = match recommended_watcher(move |event| {
            let _ = raw_publisher.send(event);
        }) {
            Ok(watcher) => watcher,
            Err(err) => {
                warn!(%err, "could not create the filesystem watcher; hot reload is off");
                let _ = stop_consumer.as_ref().recv();
                return;
            }
        };
        if let Err(err) = watcher.watch(&directory, RecursiveMode::NonRecursive) {
            warn!(%err, path = %directory.display(), "could not watch the configuration directory; hot reload is off");
            let _ = stop_consumer.as_ref().recv();
            return;
        }

        loop {
            select! {
                recv(raw_consumer) -> event => {
                    let Ok(event) = event else { break };
                    if !is_relevant(&event, file_name.as_deref()) {
                        continue;
                    }

                    // coalesce the burst: wait until the file is quiet
                    loop {
                        match raw_consumer.recv_timeout(debounce) {
                            Ok(_) => continue,
                            Err(RecvTimeoutError::Timeout) => break,
                            Err(RecvTimeoutError::Disconnected) => return,
                        }
                    }

                    if stop_consumer.is_cancelled(Duration::ZERO) {
                        break;
                    }

                    debug!("configuration changed; requesting reload");
                    // a full slot means a reload is already pending
                    let _ = reload_publisher.try_publish(());
                },
                recv(stop_consumer.as_ref()) -> _ => break,
            }
        }
    };

    NotStartedThreadContext::new(WATCHER_THREAD_NAME, callback).start()
}

fn is_relevant(
    event: &Result<notify::Event, notify::Error>,
    file_name: Option<&std::ffi::OsStr>,
) -> bool {
    let Ok(event) = event else {
        return false;
    };
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    match file_name {
        Some(file_name) => event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name)),
        None => true,
    }
}
