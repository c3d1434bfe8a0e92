use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Prefix of every source file, the billing date and `.bil` are appended to it.
    #[envconfig(default = "")]
    pub bil_path: String,

    pub upload_url: String,

    #[envconfig(default = "8")]
    pub upload_concurrency: NonZeroUsize,

    #[envconfig(default = "5")]
    pub max_retry: u32,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    pub access_token: String,

    pub signing_salt: String,

    #[envconfig(default = "point.save")]
    pub checkpoint_path: PathBuf,

    #[envconfig(default = "log/reserveList.save")]
    pub retry_store_path: PathBuf,

    #[envconfig(default = "log")]
    pub log_dir: PathBuf,
}

impl Config {
    /// How long to wait for in-flight deliveries at shutdown: one request timeout per slot.
    pub fn drain_timeout(&self) -> time::Duration {
        let slots = u32::try_from(self.upload_concurrency.get()).unwrap_or(u32::MAX);

        self.request_timeout.0.saturating_mul(slots)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
