use crate::config::process_name::ProcessName;
use std::thread;

/// Builds the conventional name of a thread working on behalf of one
/// supervised process: `{role}-{process}`, with the instance index appended
/// for per-instance workers. Keeping the scheme in one place makes `ps -T`
/// output map straight back to the fleet.
pub fn process_thread_name(
    role: &str,
    process: &ProcessName,
    instance: Option<usize>,
) -> String {
    match instance {
        Some(instance) => format!("{role}-{process}-{instance}"),
        None => format!("{role}-{process}"),
    }
}

/// Spawns a named thread. Thread creation only fails on OS resource
/// exhaustion, and a supervisor that cannot spawn its worker threads cannot
/// supervise anything, so this propagates the panic `thread::spawn` itself
/// would raise.
pub fn spawn_named_thread<F, T, S>(name: S, f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
    S: ToString,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("the OS refused to spawn a supervisor thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_names_follow_the_fleet_scheme() {
        let web = ProcessName::new("web").unwrap();
        assert_eq!(process_thread_name("sup", &web, None), "sup-web");
        assert_eq!(process_thread_name("wait", &web, Some(2)), "wait-web-2");
    }

    #[test]
    fn spawned_threads_carry_their_name() {
        let handle = spawn_named_thread("name-check", || {
            thread::current().name().map(str::to_string)
        });
        assert_eq!(handle.join().unwrap().as_deref(), Some("name-check"));
    }
}
