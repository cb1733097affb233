use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8000")]
    pub port: u16,

    #[envconfig(from = "REDIS_ADDR", default = "redis://127.0.0.1:6379")]
    pub redis_addr: String,

    #[envconfig(from = "CORS_ALLOW_ORIGIN", default = "*")]
    pub cors_allow_origin: String,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
