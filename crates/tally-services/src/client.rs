//! Client endpoint: one reliable request/response channel to a server.
//!
//! Uses the same buffers as the server side. The client has no reaper; its
//! receive timeout doubles as the retransmission timer.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use tally_core::message::strip_delimiter;
use tally_core::wire::{self, Packet, WireError, DEFAULT_MTU};

use crate::reassembly::{ReassemblyBuffer, ReceiveOutcome};
use crate::retransmit::{AckOutcome, RetransmitBuffer, TickOutcome};

/// Largest UDP payload; anything a server sends fits.
const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub mtu: usize,
    /// Wait for ack progress this long before resending.
    pub retransmit_interval: Duration,
    /// Resends without progress before giving up.
    pub retry_budget: u32,
    /// Wait this long for a response once the request is acknowledged.
    pub response_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            retransmit_interval: Duration::from_millis(300),
            retry_budget: 10,
            response_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("server unreachable after {retries} retransmissions")]
    Unreachable { retries: u32 },

    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("response is not valid UTF-8")]
    InvalidUtf8,
}

pub struct Client {
    socket: UdpSocket,
    server: SocketAddr,
    settings: ClientSettings,
    inbound: ReassemblyBuffer,
    /// Messages completed while we were still waiting for acks.
    early: VecDeque<Bytes>,
    buf: Vec<u8>,
}

impl Client {
    pub async fn connect(server: SocketAddr) -> Result<Self, ClientError> {
        Self::with_settings(server, ClientSettings::default()).await
    }

    pub async fn with_settings(
        server: SocketAddr,
        settings: ClientSettings,
    ) -> Result<Self, ClientError> {
        let local = if server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        tracing::debug!(%server, local = %socket.local_addr()?, "client socket ready");
        Ok(Self {
            socket,
            server,
            settings,
            inbound: ReassemblyBuffer::new(),
            early: VecDeque::new(),
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Send `message` and return the server's reply with any trailing
    /// `\r\n\r\n` removed.
    pub async fn request(&mut self, message: &str) -> Result<String, ClientError> {
        self.send(message).await?;
        let reply = self.receive().await?;
        let text = std::str::from_utf8(&reply).map_err(|_| ClientError::InvalidUtf8)?;
        Ok(strip_delimiter(text).to_string())
    }

    /// Deliver `message` and return once every chunk is acknowledged.
    pub async fn send(&mut self, message: &str) -> Result<(), ClientError> {
        // Sending again means the previous reply was received.
        self.inbound.settle();

        let mut outbound =
            RetransmitBuffer::new(message.as_bytes(), wire::max_chunk_size(self.settings.mtu))?;
        for packet in outbound.send_all() {
            self.socket.send(&packet).await?;
        }
        tracing::trace!(total = outbound.total(), "request sent");

        loop {
            match timeout(self.settings.retransmit_interval, self.socket.recv(&mut self.buf)).await
            {
                Ok(Ok(len)) => {
                    let Some(packet) = decode(&self.buf[..len]) else {
                        continue;
                    };
                    match packet {
                        Packet::Ack { sequence } => {
                            if outbound.on_ack(sequence) == AckOutcome::Complete {
                                return Ok(());
                            }
                        }
                        Packet::Content {
                            sequence,
                            total,
                            payload,
                        } => {
                            if let Some(message) = self.on_content(sequence, total, payload).await? {
                                self.early.push_back(message);
                            }
                        }
                        Packet::Nack { .. } => {}
                    }
                }
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                    // ICMP port unreachable: nothing is listening yet.
                    tokio::time::sleep(self.settings.retransmit_interval).await;
                    self.retransmit(&mut outbound).await?;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => self.retransmit(&mut outbound).await?,
            }
        }
    }

    /// Wait for the next complete message from the server.
    pub async fn receive(&mut self) -> Result<Bytes, ClientError> {
        if let Some(message) = self.early.pop_front() {
            return Ok(message);
        }

        let deadline = Instant::now() + self.settings.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::ResponseTimeout(self.settings.response_timeout));
            }
            let len = match timeout(remaining, self.socket.recv(&mut self.buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ClientError::ResponseTimeout(self.settings.response_timeout)),
            };
            if let Some(Packet::Content {
                sequence,
                total,
                payload,
            }) = decode(&self.buf[..len])
            {
                if let Some(message) = self.on_content(sequence, total, payload).await? {
                    return Ok(message);
                }
            }
        }
    }

    async fn on_content(
        &mut self,
        sequence: u32,
        total: u32,
        payload: Bytes,
    ) -> Result<Option<Bytes>, ClientError> {
        let outcome = self.inbound.receive(sequence, total, payload);
        if let Some(ack) = outcome.ack() {
            self.socket.send(&wire::encode_ack(ack)).await?;
        }
        Ok(match outcome {
            ReceiveOutcome::Complete { message, .. } => Some(message),
            _ => None,
        })
    }

    async fn retransmit(&self, outbound: &mut RetransmitBuffer) -> Result<(), ClientError> {
        match outbound.tick(1, self.settings.retry_budget) {
            TickOutcome::Retransmit(packets) => {
                tracing::debug!(
                    cursor = outbound.ack_cursor(),
                    count = packets.len(),
                    "retransmitting"
                );
                for packet in packets {
                    self.socket.send(&packet).await?;
                }
                Ok(())
            }
            TickOutcome::Exhausted { retries } => Err(ClientError::Unreachable { retries }),
            TickOutcome::Waiting => Ok(()),
        }
    }
}

fn decode(datagram: &[u8]) -> Option<Packet> {
    match Packet::decode(datagram) {
        Ok(packet) => Some(packet),
        Err(e) => {
            tracing::debug!(error = %e, "dropping undecodable datagram");
            None
        }
    }
}
