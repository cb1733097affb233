use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "METRICS_PORT", default = "9090")]
    pub port: u16,

    #[envconfig(from = "REDIS_ADDR", default = "redis://127.0.0.1:6379")]
    pub redis_addr: String,

    #[envconfig(from = "ENGINE_ADDR", default = "127.0.0.1:9999")]
    pub engine_addr: String,

    #[envconfig(default = "worker")]
    pub worker_name: String,

    #[envconfig(default = "5000")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(default = "1024")]
    pub max_concurrent_jobs: usize,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
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
