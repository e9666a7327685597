//! Command line and environment configuration.

use crate::metrics::ProcFs;
use crate::scheduler::MIN_INTERVAL;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Prometheus exporter for host and Docker container metrics
#[derive(Parser, Debug)]
#[command(name = "metrics-exporter")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Port to serve /metrics on
    #[arg(short, long, env = "METRICS_PORT", default_value = "8000")]
    pub port: u16,

    /// Address to bind the HTTP server to
    #[arg(long, env = "METRICS_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Host and process collection interval in seconds
    #[arg(short, long, env = "COLLECTION_INTERVAL", default_value = "5")]
    pub interval: u64,

    /// Container and compose collection interval in seconds
    #[arg(long, env = "DOCKER_COLLECTION_INTERVAL", default_value = "30")]
    pub docker_interval: u64,

    /// Docker daemon socket
    #[arg(long, env = "DOCKER_SOCKET", default_value = "/var/run/docker.sock")]
    pub docker_socket: PathBuf,

    /// Disable container and compose metrics
    #[arg(long, env = "DISABLE_DOCKER")]
    pub no_docker: bool,

    /// Only report compose status for this project
    #[arg(long, env = "COMPOSE_PROJECT")]
    pub compose_project: Option<String>,

    /// procfs root [default: /host/proc when mounted, else /proc]
    #[arg(long, env = "HOST_PROC")]
    pub proc_root: Option<PathBuf>,

    /// Number of processes reported per ranking
    #[arg(short = 'n', long, env = "TOP_PROCESSES", default_value = "5")]
    pub top_processes: usize,

    /// Seconds to wait for collectors to finish at shutdown
    #[arg(long, env = "SHUTDOWN_GRACE", default_value = "5")]
    pub shutdown_grace: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("top process count must be at least 1")]
    NoTopProcesses,

    #[error("shutdown grace period must be at least 1 second")]
    NoShutdownGrace,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub listen: SocketAddr,
    pub host_interval: Duration,
    pub docker_interval: Duration,
    /// Runtime socket, `None` when container metrics are disabled
    pub docker_socket: Option<PathBuf>,
    pub compose_project: Option<String>,
    pub procfs: ProcFs,
    pub top_processes: usize,
    pub shutdown_grace: Duration,
}

impl ExporterConfig {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.top_processes == 0 {
            return Err(ConfigError::NoTopProcesses);
        }
        if args.shutdown_grace == 0 {
            return Err(ConfigError::NoShutdownGrace);
        }

        Ok(Self {
            listen: SocketAddr::new(args.bind, args.port),
            host_interval: interval("interval", args.interval),
            docker_interval: interval("docker_interval", args.docker_interval),
            docker_socket: (!args.no_docker).then_some(args.docker_socket),
            compose_project: args.compose_project.filter(|p| !p.is_empty()),
            procfs: args.proc_root.map(ProcFs::new).unwrap_or_else(ProcFs::detect),
            top_processes: args.top_processes,
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
        })
    }
}

fn interval(option: &str, secs: u64) -> Duration {
    let requested = Duration::from_secs(secs);
    if requested < MIN_INTERVAL {
        tracing::warn!(
            option,
            requested = ?requested,
            min_interval = ?MIN_INTERVAL,
            "Interval below minimum, clamping"
        );
        MIN_INTERVAL
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("metrics-exporter").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_overrides() {
        let config = ExporterConfig::from_args(parse(&[
            "--port",
            "9100",
            "--bind",
            "127.0.0.1",
            "--interval",
            "10",
            "--docker-interval",
            "60",
            "--compose-project",
            "shop",
            "--proc-root",
            "/tmp/proc",
            "-n",
            "3",
        ]))
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.host_interval, Duration::from_secs(10));
        assert_eq!(config.docker_interval, Duration::from_secs(60));
        assert_eq!(config.compose_project.as_deref(), Some("shop"));
        assert_eq!(config.procfs.root(), std::path::Path::new("/tmp/proc"));
        assert_eq!(config.top_processes, 3);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = ExporterConfig::from_args(parse(&["--interval", "0", "--docker-interval", "0"]))
            .unwrap();
        assert_eq!(config.host_interval, MIN_INTERVAL);
        assert_eq!(config.docker_interval, MIN_INTERVAL);
    }

    #[test]
    fn test_no_docker() {
        let config = ExporterConfig::from_args(parse(&["--no-docker"])).unwrap();
        assert!(config.docker_socket.is_none());

        let config = ExporterConfig::from_args(parse(&["--docker-socket", "/run/docker.sock"]))
            .unwrap();
        assert_eq!(config.docker_socket, Some(PathBuf::from("/run/docker.sock")));
    }

    #[test]
    fn test_rejects_zero_counts() {
        assert_eq!(
            ExporterConfig::from_args(parse(&["-n", "0"])).unwrap_err(),
            ConfigError::NoTopProcesses
        );
        assert_eq!(
            ExporterConfig::from_args(parse(&["--shutdown-grace", "0"])).unwrap_err(),
            ConfigError::NoShutdownGrace
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let args = ["metrics-exporter", "--port", "http"];
        assert!(Args::try_parse_from(args).is_err());
        let args = ["metrics-exporter", "--bind", "localhost:80"];
        assert!(Args::try_parse_from(args).is_err());
    }
}
