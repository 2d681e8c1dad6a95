use std::sync::Arc;

use crate::config::NodeConfig;
use crate::protocol::tracker::TrackerClient;
use crate::scheduler::JobRegistry;
use crate::worker::idle::IdleAdvertiser;

/// Everything the node's tasks share. Built once per node and handed to
/// each component as `Arc<NodeContext>`.
#[derive(Debug)]
pub struct NodeContext {
    pub config: NodeConfig,
    pub registry: JobRegistry,
    pub tracker: TrackerClient,
    pub idle: IdleAdvertiser,
}

impl NodeContext {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let tracker = TrackerClient::new(&config.tracker, config.listen_port, config.connect_timeout);
        Arc::new(Self {
            registry: JobRegistry::new(config.n_workers),
            idle: IdleAdvertiser::new(config.idle_report_interval),
            tracker,
            config,
        })
    }
}
