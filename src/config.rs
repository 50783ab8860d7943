/// Largest job body accepted by default, matching beanstalkd.
pub const DEFAULT_MAX_JOB_SIZE: u32 = 65535;

/// Settings the broker needs at runtime.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Bodies larger than this are answered with `JOB_TOO_BIG`.
    pub max_job_size: u32,
    /// Reported by `stats`.
    pub hostname: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_job_size: DEFAULT_MAX_JOB_SIZE,
            hostname: "localhost".to_string(),
        }
    }
}
