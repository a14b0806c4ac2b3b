//! Server network layer: UDP I/O, operator console and tick scheduling
//!
//! Socket reads, socket writes and console input each run in their own task
//! and talk to the main loop over channels. The main loop owns the
//! [`TickDriver`] outright, so every session mutation happens on one task.

use crate::admin::{self, CONSOLE_LEVEL};
use crate::config::ServerConfig;
use crate::deferred::DeferredSender;
use crate::driver::{Outbound, TickDriver};
use crate::policy::BanPolicy;
use crate::simulation::Simulation;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Largest datagram the receiver accepts
const MAX_DATAGRAM: usize = 65_536;

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived { data: Vec<u8>, addr: SocketAddr },
    /// One line typed at the operator console
    Console(String),
    Shutdown,
}

/// Main server coordinating networking and the tick driver
pub struct Server<S, P> {
    socket: Arc<UdpSocket>,
    driver: TickDriver<S, P>,
    tick_duration: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
}

impl<S: Simulation, P: BanPolicy> Server<S, P> {
    pub async fn new(
        config: ServerConfig,
        simulation: S,
        policy: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            tick_duration: config.tick_duration(),
            driver: TickDriver::new(config, simulation, policy),
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that stops the main loop when given [`ServerMessage::Shutdown`]
    pub fn control(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn deferred_sender(&self) -> DeferredSender {
        self.driver.deferred_sender()
    }

    pub fn driver(&self) -> &TickDriver<S, P> {
        &self.driver
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let message = ServerMessage::DatagramReceived {
                            data: buffer[..len].to_vec(),
                            addr,
                        };
                        if server_tx.send(message).is_err() {
                            debug!("Main loop gone, receiver stopping");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that writes queued datagrams to the socket
    fn spawn_network_sender(&mut self) {
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            while let Some(Outbound { addr, data }) = outbound_rx.recv().await {
                if let Err(e) = socket.send_to(&data, addr).await {
                    error!("Failed to send datagram to {}: {}", addr, e);
                }
            }
        });
    }

    /// Spawns task that forwards operator lines from stdin
    fn spawn_console(&self) {
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if server_tx.send(ServerMessage::Console(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Console read failed: {}", e);
                        break;
                    }
                }
            }
        });
    }

    fn handle_console_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if line.eq_ignore_ascii_case("help") {
            for command in admin::registry().visible(CONSOLE_LEVEL) {
                println!("  {}", command.usage);
            }
            return;
        }

        match admin::registry().dispatch(line, CONSOLE_LEVEL) {
            Ok(scheduled) => {
                info!("Console: {}", line);
                self.driver.deferred_sender().send(scheduled);
            }
            Err(e) => println!("{}", e),
        }
    }

    /// Hands everything the driver produced to the sender task
    fn flush_outbound(&mut self) {
        for outbound in self.driver.take_outbound() {
            if self.outbound_tx.send(outbound).is_err() {
                error!("Sender task gone, dropping outbound datagrams");
                break;
            }
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.run_inner(true).await
    }

    /// Runs without reading operator commands from stdin
    pub async fn run_headless(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.run_inner(false).await
    }

    async fn run_inner(&mut self, console: bool) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        if console {
            self.spawn_console();
        }

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let started = Instant::now();

        info!(
            "Server started: {} slots, {}ms frames",
            self.driver.clients().max_clients(),
            self.driver.config().frame_msec
        );

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::DatagramReceived { data, addr }) => {
                            self.driver.handle_datagram(addr, &data);
                        }
                        Some(ServerMessage::Console(line)) => self.handle_console_line(&line),
                        Some(ServerMessage::Shutdown) | None => break,
                    }
                },

                _ = tick_interval.tick() => {
                    self.driver.run_tick(started.elapsed().as_millis() as u64);

                    if self.driver.tick() % 200 == 0 {
                        let clients = self.driver.clients();
                        debug!(
                            "Tick {}: {} of {} slots in use",
                            self.driver.tick(),
                            clients.len(),
                            clients.max_clients()
                        );
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C");
                    break;
                }
            }

            self.flush_outbound();
        }

        self.driver.shutdown();
        self.flush_outbound();
        // Let the sender task drain the final datagrams
        tokio::time::sleep(Duration::from_millis(50)).await;

        Ok(())
    }
}
