//! The `Cluster` composition root.
//!
//! Owns one node's messaging, discovery, membership, and event services and
//! runs their lifecycles in order: messaging, then membership (which starts
//! discovery), then the event service. Stopping runs the same stages in
//! reverse.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use raftlink_core::{ClusterConfig, Member};
use raftlink_messaging::{MessagingService, TcpMessagingService};
use tracing::{info, warn};

use crate::discovery::{
    BootstrapDiscoveryProvider, BootstrapService, DefaultNodeDiscoveryService, NodeDiscoveryProvider,
};
use crate::error::{ClusterError, ClusterResult};
use crate::event_service::ClusterEventService;
use crate::membership::{ClusterMembershipService, DefaultClusterMembershipService};
use crate::protocol::DiscoveryMembershipProtocol;

pub struct Cluster {
    config: ClusterConfig,
    messaging: TcpMessagingService,
    membership: Arc<DefaultClusterMembershipService>,
    events: ClusterEventService,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Cluster {
    /// Build a node that discovers peers from the configured bootstrap list.
    pub fn from_config(config: ClusterConfig) -> ClusterResult<Self> {
        let provider = Arc::new(BootstrapDiscoveryProvider::new(config.discovery.to_nodes()));
        Self::with_provider(config, provider)
    }

    /// Build a node with a custom discovery provider.
    pub fn with_provider(
        config: ClusterConfig,
        provider: Arc<dyn NodeDiscoveryProvider>,
    ) -> ClusterResult<Self> {
        config.validate()?;

        let messaging = TcpMessagingService::new(
            &config.cluster_id,
            config.node.address.clone(),
            config.messaging.clone(),
        );
        let shared: Arc<dyn MessagingService> = Arc::new(messaging.clone());
        let bootstrap = BootstrapService::new(shared.clone());

        let local = Arc::new(config.node.to_member());
        let discovery = Arc::new(DefaultNodeDiscoveryService::new(
            bootstrap.clone(),
            local.node(),
            provider,
        ));
        let membership = Arc::new(DefaultClusterMembershipService::new(
            local,
            bootstrap,
            discovery,
            Arc::new(DiscoveryMembershipProtocol::new()),
        ));
        let events = ClusterEventService::new(
            shared,
            membership.clone(),
            config.event_service.clone(),
        );

        Ok(Self {
            config,
            messaging,
            membership,
            events,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn local_member(&self) -> Arc<Member> {
        self.membership.local_member()
    }

    pub fn messaging(&self) -> Arc<dyn MessagingService> {
        Arc::new(self.messaging.clone())
    }

    pub fn membership(&self) -> Arc<DefaultClusterMembershipService> {
        self.membership.clone()
    }

    pub fn events(&self) -> &ClusterEventService {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start every service. A second call while running does nothing; a
    /// stopped or failed cluster cannot be started again.
    pub async fn start(&self) -> ClusterResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClusterError::Stopped);
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        if let Err(e) = self.start_stages().await {
            // Stages already rolled back; the messaging service cannot be
            // restarted, so neither can the cluster.
            self.stopped.store(true, Ordering::Release);
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        info!(
            cluster_id = %self.config.cluster_id,
            member = %self.local_member(),
            address = %self.messaging.address(),
            "cluster started"
        );
        Ok(())
    }

    async fn start_stages(&self) -> ClusterResult<()> {
        self.messaging.start().await?;

        if let Err(e) = self.membership.start().await {
            self.messaging.stop().await;
            return Err(e);
        }

        if let Err(e) = self.events.start().await {
            if let Err(stop_err) = self.membership.stop().await {
                warn!(error = %stop_err, "failed to stop membership after start failure");
            }
            self.messaging.stop().await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop every service in reverse start order. A failing stage is logged
    /// and the remaining stages still run.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if self
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Err(e) = self.events.stop().await {
            warn!(error = %e, "failed to stop event service");
        }
        if let Err(e) = self.membership.stop().await {
            warn!(error = %e, "failed to stop membership service");
        }
        self.messaging.stop().await;
        info!(cluster_id = %self.config.cluster_id, "cluster stopped");
    }
}
