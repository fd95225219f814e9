use clap::{Parser, ValueEnum};

#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Homelab cluster command-center control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long, env = "SENTINEL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Address to bind the HTTPS control-plane server to.
    #[arg(long, env = "SENTINEL_ADDR", default_value = "0.0.0.0:8443")]
    pub addr: String,

    /// TLS certificate file (PEM).
    #[arg(long, env = "SENTINEL_TLS_CERT", default_value = "tls.crt")]
    pub tls_cert: String,

    /// TLS private key file (PEM).
    #[arg(long, env = "SENTINEL_TLS_KEY", default_value = "tls.key")]
    pub tls_key: String,

    /// Log line format.
    #[arg(long, env = "SENTINEL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}
