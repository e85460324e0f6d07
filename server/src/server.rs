//! Server loop and dispatch workers

use crate::buffer::{BufferPool, PacketReader};
use crate::config::Configuration;
use crate::context::ServerContext;
use crate::error::ServerError;
use crate::network::{TransportSettings, UdpTransport};
use crate::transport::{PeerId, TransportEvent};
use log::{debug, error, info};
use shared::DeliveryMethod;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Work handed from the server loop to a dispatch worker
#[derive(Debug)]
enum WorkItem {
    Packet {
        peer: PeerId,
        channel: u8,
        delivery: DeliveryMethod,
        reader: PacketReader,
    },
    Disconnected {
        peer: PeerId,
    },
}

/// Main server coordinating the transport and the dispatch workers
pub struct Server {
    context: Arc<ServerContext>,
    transport: Arc<UdpTransport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Server {
    /// Validates `config`, binds every socket and builds the server context.
    pub async fn bind(config: Configuration) -> Result<Self, ServerError> {
        config.validate()?;

        let buffers = BufferPool::new();
        let (transport, events) = UdpTransport::bind(
            &config.socket_addrs(),
            TransportSettings::from_config(&config),
            buffers.clone(),
        )
        .await?;

        let context = Arc::new(ServerContext::new(config, transport.clone(), buffers)?);
        info!(
            "Relay ready: {:?} auth, {} workers, up to {} connections",
            context.session.mode(),
            context.config.workers,
            context.config.max_connections
        );

        Ok(Self {
            context,
            transport,
            events,
        })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.context)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.transport.local_addrs()
    }

    /// Runs until the transport shuts down.
    ///
    /// Packets and disconnects for a peer always go to the same worker, so a
    /// peer's traffic is handled in order while different peers proceed in
    /// parallel.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let workers: Vec<mpsc::UnboundedSender<WorkItem>> = (0..self.context.config.workers)
            .map(|index| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(worker_loop(index, Arc::clone(&self.context), rx));
                tx
            })
            .collect();

        let mut maintenance = interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started on {:?}", self.local_addrs());

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(TransportEvent::ConnectRequest { addr, payload }) => {
                            self.context.handle_connect(addr, &payload);
                        }
                        Some(TransportEvent::Received { peer, channel, delivery, reader }) => {
                            let item = WorkItem::Packet { peer, channel, delivery, reader };
                            route(&workers, peer, item);
                        }
                        Some(TransportEvent::Disconnected { peer }) => {
                            route(&workers, peer, WorkItem::Disconnected { peer });
                        }
                        None => {
                            info!("Transport closed, server shutting down");
                            break;
                        }
                    }
                },

                _ = maintenance.tick() => {
                    self.context.expire_challenges();
                    debug!(
                        "{} connections, {} buffers in flight",
                        self.transport.connection_count(),
                        self.context.buffers.outstanding()
                    );
                },
            }
        }

        Ok(())
    }
}

fn route(workers: &[mpsc::UnboundedSender<WorkItem>], peer: PeerId, item: WorkItem) {
    let index = peer as usize % workers.len();
    if workers[index].send(item).is_err() {
        error!("Dispatch worker {} is gone, dropping work for peer {}", index, peer);
    }
}

async fn worker_loop(
    index: usize,
    context: Arc<ServerContext>,
    mut work: mpsc::UnboundedReceiver<WorkItem>,
) {
    while let Some(item) = work.recv().await {
        match item {
            WorkItem::Packet {
                peer,
                channel,
                delivery,
                reader,
            } => context.dispatch(peer, reader, channel, delivery).await,
            WorkItem::Disconnected { peer } => context.remove_peer(peer),
        }
    }
    debug!("Dispatch worker {} stopped", index);
}
