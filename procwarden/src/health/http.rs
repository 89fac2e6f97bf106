use super::{HealthChecker, HealthCheckerError};
use crate::config::health::HttpProbeConfig;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

/// The acceptance set used when no explicit status codes are configured.
const DEFAULT_ACCEPTED_STATUS: std::ops::Range<u16> = 200..400;

/// Succeeds when a GET against the configured endpoint returns a status in
/// the acceptance set within the timeout.
pub struct HttpHealthChecker {
    client: Client,
    url: String,
    headers: HeaderMap,
    healthy_status_codes: Vec<u16>,
    timeout: Duration,
}

impl HttpHealthChecker {
    pub fn try_new(config: &HttpProbeConfig, timeout: Duration) -> Result<Self, HealthCheckerError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|err| HealthCheckerError::Rejected(err.to_string()))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name: HeaderName = key
                .parse()
                .map_err(|_| HealthCheckerError::Rejected(format!("invalid header name `{key}`")))?;
            let value: HeaderValue = value.parse().map_err(|_| {
                HealthCheckerError::Rejected(format!("invalid header value for `{key}`"))
            })?;
            headers.insert(name, value);
        }

        Ok(Self {
            client,
            url: format!("http://{}:{}{}", config.host, config.port, config.path),
            headers,
            healthy_status_codes: config.healthy_status_codes.clone(),
            timeout,
        })
    }

    fn is_accepted(&self, status: u16) -> bool {
        if self.healthy_status_codes.is_empty() {
            DEFAULT_ACCEPTED_STATUS.contains(&status)
        } else {
            self.healthy_status_codes.contains(&status)
        }
    }
}

impl HealthChecker for HttpHealthChecker {
    fn check_health(&self) -> Result<(), HealthCheckerError> {
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    HealthCheckerError::Timeout(self.timeout)
                } else {
                    HealthCheckerError::Rejected(err.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if self.is_accepted(status) {
            Ok(())
        } else {
            Err(HealthCheckerError::Rejected(format!(
                "response status code {status} is not in the acceptance set"
            )))
        }
    }
}
