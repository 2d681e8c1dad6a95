use std::path::PathBuf;
use std::time::Duration;

/// Tracker used for peer discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub tracker: TrackerConfig,
    /// Port the peer protocol server listens on, also announced to the tracker.
    pub listen_port: u16,
    /// Directory holding one subdirectory per job.
    pub download_root: PathBuf,
    /// Number of jobs worked on concurrently.
    pub n_workers: usize,
    /// Backoff between attempts when no peer can serve a request.
    pub retry_interval: Duration,
    /// How often the download root is scanned for new job directories.
    pub watch_interval: Duration,
    /// How often an idle worker polls the registry for work.
    pub poll_interval: Duration,
    /// Upper bound of the random delay before a worker starts polling.
    pub startup_jitter: Duration,
    /// Minimum time between two `idle` announcements of this node.
    pub idle_report_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            listen_port: 42069,
            download_root: PathBuf::from("/tmp/swarmjob"),
            n_workers: 8,
            retry_interval: Duration::from_secs(60),
            watch_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            startup_jitter: Duration::from_secs(10),
            idle_report_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    pub fn new(download_root: impl Into<PathBuf>, listen_port: u16) -> Self {
        Self {
            download_root: download_root.into(),
            listen_port,
            ..Default::default()
        }
    }

    pub fn with_tracker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.tracker = TrackerConfig {
            host: host.into(),
            port,
        };
        self
    }

    pub fn with_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_startup_jitter(mut self, jitter: Duration) -> Self {
        self.startup_jitter = jitter;
        self
    }

    pub fn with_idle_report_interval(mut self, interval: Duration) -> Self {
        self.idle_report_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.tracker, TrackerConfig::default());
        assert_eq!(cfg.tracker.port, 8000);
        assert_eq!(cfg.listen_port, 42069);
        assert_eq!(cfg.download_root, PathBuf::from("/tmp/swarmjob"));
        assert_eq!(cfg.n_workers, 8);
        assert_eq!(cfg.retry_interval, Duration::from_secs(60));
        assert_eq!(cfg.startup_jitter, Duration::from_secs(10));
        assert_eq!(cfg.idle_report_interval, Duration::from_secs(60));
    }

    #[test]
    fn node_config_builders() {
        let cfg = NodeConfig::new("/data/jobs", 9000)
            .with_tracker("tracker.example.com", 8123)
            .with_workers(2)
            .with_retry_interval(Duration::from_millis(50))
            .with_startup_jitter(Duration::ZERO);
        assert_eq!(cfg.download_root, PathBuf::from("/data/jobs"));
        assert_eq!(cfg.listen_port, 9000);
        assert_eq!(cfg.tracker.host, "tracker.example.com");
        assert_eq!(cfg.tracker.port, 8123);
        assert_eq!(cfg.n_workers, 2);
        assert_eq!(cfg.retry_interval, Duration::from_millis(50));
        assert_eq!(cfg.startup_jitter, Duration::ZERO);
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
    }
}
