use super::{HealthChecker, HealthCheckerError};
use crate::config::health::TcpProbeConfig;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Succeeds when a TCP connection to the configured endpoint can be
/// established within the timeout. The connection is closed immediately.
pub struct TcpHealthChecker {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpHealthChecker {
    pub fn new(config: &TcpProbeConfig, timeout: Duration) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout,
        }
    }
}

impl HealthChecker for TcpHealthChecker {
    fn check_health(&self) -> Result<(), HealthCheckerError> {
        let address = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| HealthCheckerError::Rejected(err.to_string()))?
            .next()
            .ok_or_else(|| {
                HealthCheckerError::Rejected(format!(
                    "{}:{} did not resolve to any address",
                    self.host, self.port
                ))
            })?;

        match TcpStream::connect_timeout(&address, self.timeout) {
            Ok(_stream) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                Err(HealthCheckerError::Timeout(self.timeout))
            }
            Err(err) => Err(HealthCheckerError::Rejected(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::TcpListener;

    fn checker(port: u16) -> TcpHealthChecker {
        TcpHealthChecker::new(
            &TcpProbeConfig {
                host: "127.0.0.1".to_string(),
                port,
            },
            Duration::from_millis(500),
        )
    }

    #[test]
    fn open_port_is_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(checker(port).check_health().is_ok());
    }

    #[test]
    fn closed_port_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert_matches!(
            checker(port).check_health(),
            Err(HealthCheckerError::Rejected(_))
        );
    }
}
