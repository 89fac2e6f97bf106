use super::error::CommandError;
use super::executable_data::ExecutableData;
use super::logging::{spawn_line_logger, OutputRing, OutputStream};
use crate::config::process_name::ProcessName;
use std::process::{Child, Command, ExitStatus, Stdio};

pub struct NotStartedChild {
    cmd: Command,
    name: ProcessName,
    instance: usize,
}

pub struct StartedChild {
    name: ProcessName,
    instance: usize,
    process: Child,
}

impl NotStartedChild {
    pub fn new(name: ProcessName, instance: usize, executable_data: &ExecutableData) -> Self {
        let mut cmd = Command::new(&executable_data.bin);
        cmd.args(&executable_data.args)
            .envs(&executable_data.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &executable_data.working_dir {
            cmd.current_dir(dir);
        }

        Self {
            cmd,
            name,
            instance,
        }
    }

    pub fn start(mut self) -> Result<StartedChild, CommandError> {
        Ok(StartedChild {
            process: self.cmd.spawn()?,
            name: self.name,
            instance: self.instance,
        })
    }
}

impl StartedChild {
    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    pub fn is_running(&mut self) -> bool {
        self.process.try_wait().is_ok_and(|v| v.is_none())
    }

    /// Blocks until the child exits and reaps it.
    pub fn wait(mut self) -> Result<ExitStatus, CommandError> {
        self.process.wait().map_err(CommandError::from)
    }

    /// Takes the output pipes and forwards them line-wise to the structured
    /// log and the process's output ring in dedicated threads.
    pub fn stream(mut self, ring: &OutputRing) -> Result<Self, CommandError> {
        let stdout = self
            .process
            .stdout
            .take()
            .ok_or(CommandError::StreamPipeError("stdout".to_string()))?;

        let stderr = self
            .process
            .stderr
            .take()
            .ok_or(CommandError::StreamPipeError("stderr".to_string()))?;

        spawn_line_logger(
            stdout,
            self.name.clone(),
            self.instance,
            OutputStream::Stdout,
            ring.clone(),
        );
        spawn_line_logger(
            stderr,
            self.name.clone(),
            self.instance,
            OutputStream::Stderr,
            ring.clone(),
        );

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> NotStartedChild {
        NotStartedChild::new(
            ProcessName::must(name),
            0,
            &ExecutableData::from_argv(&[
                "/bin/sh".to_string(),
                "-c".to_string(),
                script.to_string(),
            ]),
        )
    }

    #[test]
    fn spawn_and_wait_reports_exit_code() {
        let child = sh("child-test", "exit 7").start().unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn spawn_failure_surfaces_as_error() {
        let not_started = NotStartedChild::new(
            ProcessName::must("missing-bin"),
            0,
            &ExecutableData::from_argv(&["/does/not/exist".to_string()]),
        );
        assert!(not_started.start().is_err());
    }

    #[test]
    fn streaming_child_records_output_and_still_waits() {
        let ring = OutputRing::default();
        let child = sh("stream-test", "echo out; echo err >&2; exit 3")
            .start()
            .unwrap()
            .stream(&ring)
            .unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(3));

        // the logger threads race the wait; give them a beat to drain
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while ring.tail(10).len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let tail = ring.tail(10);
        assert!(tail.contains(&"[0/out] out".to_string()));
        assert!(tail.contains(&"[0/err] err".to_string()));
    }

    #[test]
    fn is_running_detects_liveness() {
        let mut child = sh("liveness-test", "sleep 5").start().unwrap();
        assert!(child.is_running());
        super::super::shutdown::ProcessTerminator::new(child.pid())
            .signal(nix::sys::signal::Signal::SIGKILL)
            .unwrap();
        let status = child.wait().unwrap();
        assert!(status.code().is_none());
    }
}
