use crate::connection::{ClientError, ClientEvent, ConnectionState, ServerConnection};
use log::{debug, error, info, warn};
use shared::UserCommand;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep};

/// Interval between handshake retransmissions
const HANDSHAKE_RETRY: Duration = Duration::from_secs(1);

/// Headless client that joins a server and plays a scripted input pattern
pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    connection: ServerConnection,

    tick_duration: Duration,
    fake_ping_ms: u64,
    last_handshake: Instant,
    input_sequence: u32,
    /// Commands sent once the connection is established
    startup_commands: Vec<String>,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        tick_duration: Duration,
        fake_ping_ms: u64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            connection: ServerConnection::new(),
            tick_duration,
            fake_ping_ms,
            last_handshake: Instant::now(),
            input_sequence: 0,
            startup_commands: Vec::new(),
        })
    }

    pub fn queue_command(&mut self, command: impl Into<String>) {
        self.startup_commands.push(command.into());
    }

    async fn flush(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let datagrams = self.connection.take_outbound();
        if datagrams.is_empty() {
            return Ok(());
        }
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }
        for data in datagrams {
            self.socket.send_to(&data, self.server_addr).await?;
        }
        Ok(())
    }

    /// Returns false once the session is over
    fn handle_datagram(&mut self, data: &[u8]) -> bool {
        match self.connection.handle_datagram(data) {
            Ok(events) => {
                for event in events {
                    if !self.handle_event(event) {
                        return false;
                    }
                }
                true
            }
            Err(ClientError::Refused(reason)) => {
                error!("Connection refused: {}", reason);
                false
            }
            Err(ClientError::Disconnected(reason)) => {
                warn!("Disconnected: {}", reason);
                false
            }
            Err(e) => {
                debug!("Dropping datagram: {}", e);
                true
            }
        }
    }

    fn handle_event(&mut self, event: ClientEvent) -> bool {
        match event {
            ClientEvent::Connected { slot } => {
                info!("Connected! Slot: {}", slot);
                for command in std::mem::take(&mut self.startup_commands) {
                    if let Err(e) = self.connection.send_command(command) {
                        warn!("Could not queue command: {}", e);
                    }
                }
            }
            ClientEvent::Gamestate {
                gamestate_id,
                snapshot,
            } => {
                info!(
                    "Gamestate {}: {} entities",
                    gamestate_id,
                    snapshot.len()
                );
            }
            ClientEvent::Snapshot(snapshot) => {
                debug!(
                    "Snapshot {}: {} entities, server time {}",
                    snapshot.tick(),
                    snapshot.len(),
                    self.connection.server_time()
                );
            }
            ClientEvent::ServerCommand(text) => info!("Server: {}", text),
            ClientEvent::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                return false;
            }
        }
        true
    }

    /// Walks right, then left, jumping now and then
    fn next_input(&mut self) -> UserCommand {
        self.input_sequence += 1;
        let phase = self.input_sequence % 80;
        UserCommand {
            sequence: self.input_sequence,
            server_time: self.connection.server_time(),
            left: phase >= 40,
            right: phase < 40,
            jump: self.input_sequence % 25 == 0,
        }
    }

    fn on_tick(&mut self) {
        match self.connection.state() {
            ConnectionState::Connecting | ConnectionState::Challenging => {
                if self.last_handshake.elapsed() >= HANDSHAKE_RETRY {
                    debug!("Resending handshake");
                    self.connection.resend_handshake();
                    self.last_handshake = Instant::now();
                }
            }
            ConnectionState::Connected | ConnectionState::Primed | ConnectionState::Active => {
                let input = self.next_input();
                if let Err(e) = self.connection.send_move(input) {
                    warn!("Failed to send input: {}", e);
                }
            }
            ConnectionState::Disconnected => {}
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to {}...", self.server_addr);
        self.connection.connect();
        self.last_handshake = Instant::now();
        self.flush().await?;

        let mut tick_interval = interval(self.tick_duration);
        let mut buffer = vec![0u8; 65_536];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) if addr == self.server_addr => {
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }
                            let data = buffer[..len].to_vec();
                            if !self.handle_datagram(&data) {
                                break;
                            }
                        }
                        Ok((_, addr)) => debug!("Ignoring datagram from {}", addr),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = tick_interval.tick() => self.on_tick(),

                _ = tokio::signal::ctrl_c() => {
                    info!("Disconnecting...");
                    if self.connection.disconnect().is_ok() {
                        self.flush().await?;
                    }
                    break;
                }
            }

            self.flush().await?;
        }

        Ok(())
    }
}
