use crate::config::ProfileName;

const MIB: u64 = 1024 * 1024;

/// Sizing parameters behind a profile name. Memory figures are bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    /// Estimated resident set of one worker.
    pub per_worker_rss: u64,
    /// Opcode-cache reservation.
    pub opcache: u64,
    /// Headroom for the supervisor itself.
    pub supervisor_headroom: u64,
    pub safety_margin: u64,
    /// Default fraction of total memory the pool may use.
    pub memory_threshold: f64,
    /// Upper bound on the computed pool size.
    pub max_children_cap: usize,
    /// Requests served by one worker before it is recycled.
    pub max_requests: u32,
}

impl Profile {
    pub fn for_name(name: ProfileName) -> Self {
        match name {
            ProfileName::Dev => Self {
                per_worker_rss: 48 * MIB,
                opcache: 64 * MIB,
                supervisor_headroom: 32 * MIB,
                safety_margin: 16 * MIB,
                memory_threshold: 0.8,
                max_children_cap: 16,
                max_requests: 500,
            },
            ProfileName::Light => Self {
                per_worker_rss: 48 * MIB,
                opcache: 96 * MIB,
                supervisor_headroom: 48 * MIB,
                safety_margin: 32 * MIB,
                memory_threshold: 0.75,
                max_children_cap: 32,
                max_requests: 1000,
            },
            ProfileName::Medium => Self {
                per_worker_rss: 64 * MIB,
                opcache: 128 * MIB,
                supervisor_headroom: 64 * MIB,
                safety_margin: 48 * MIB,
                memory_threshold: 0.75,
                max_children_cap: 64,
                max_requests: 1000,
            },
            ProfileName::Heavy => Self {
                per_worker_rss: 96 * MIB,
                opcache: 192 * MIB,
                supervisor_headroom: 96 * MIB,
                safety_margin: 64 * MIB,
                memory_threshold: 0.7,
                max_children_cap: 128,
                max_requests: 500,
            },
            ProfileName::Bursty => Self {
                per_worker_rss: 56 * MIB,
                opcache: 128 * MIB,
                supervisor_headroom: 64 * MIB,
                safety_margin: 48 * MIB,
                memory_threshold: 0.75,
                max_children_cap: 96,
                max_requests: 2000,
            },
        }
    }

    pub fn reserved(&self) -> u64 {
        self.opcache + self.supervisor_headroom + self.safety_margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_requests_per_profile() {
        assert_eq!(Profile::for_name(ProfileName::Dev).max_requests, 500);
        assert_eq!(Profile::for_name(ProfileName::Light).max_requests, 1000);
        assert_eq!(Profile::for_name(ProfileName::Heavy).max_requests, 500);
        assert_eq!(Profile::for_name(ProfileName::Bursty).max_requests, 2000);
    }

    #[test]
    fn reserved_sums_the_overheads() {
        let dev = Profile::for_name(ProfileName::Dev);
        assert_eq!(dev.reserved(), (64 + 32 + 16) * MIB);
    }
}
