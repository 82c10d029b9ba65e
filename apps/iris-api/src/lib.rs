pub mod auth;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod realtime;
pub mod routes;
pub mod workflow;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use broker::Broker;
use config::Config;
use db::jobs::JobApplicationStore;
use realtime::{AdmissionController, EventBus, PresenceTracker, StreamBridge};
use workflow::WorkflowTrigger;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobApplicationStore>,
    pub workflows: Arc<dyn WorkflowTrigger>,
    pub bus: EventBus,
    pub presence: PresenceTracker,
    pub admission: AdmissionController,
    pub bridge: StreamBridge,
    pub config: Arc<Config>,
    /// Cancelled on process shutdown; every event stream runs under a child.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire every realtime component to one broker.
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        jobs: Arc<dyn JobApplicationStore>,
        workflows: Arc<dyn WorkflowTrigger>,
    ) -> Self {
        let bus = EventBus::new(broker.clone()).with_subscribe_timeout(config.subscribe_timeout);
        let presence = PresenceTracker::new(broker.clone());
        let bridge = StreamBridge::new(bus.clone())
            .heartbeat_interval(config.heartbeat_interval)
            .with_presence(presence.clone());

        Self {
            jobs,
            workflows,
            bus,
            presence,
            admission: AdmissionController::new(broker),
            bridge,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}
