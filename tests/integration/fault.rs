//! A raw protocol peer for fault injection: sends exactly the packets a
//! test asks for, so acks can be withheld, chunks repeated or reordered.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;

use tally_core::wire::{self, Packet};

pub struct RawPeer {
    socket: UdpSocket,
    server: SocketAddr,
}

impl RawPeer {
    pub async fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server).await.unwrap();
        Self { socket, server }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub async fn send_raw(&self, datagram: &[u8]) {
        self.socket.send(datagram).await.unwrap();
    }

    pub async fn send_content(&self, sequence: u32, total: u32, payload: &[u8]) {
        let packet = wire::encode_content(sequence, total, payload, usize::MAX).unwrap();
        self.send_raw(&packet).await;
    }

    pub async fn send_ack(&self, sequence: u32) {
        self.send_raw(&wire::encode_ack(sequence)).await;
    }

    pub async fn send_nack(&self, sequence: u32) {
        self.send_raw(&wire::encode_nack(sequence)).await;
    }

    /// Send a single-chunk request, read the reply and ack it.
    pub async fn exchange(&self, message: &[u8], wait: Duration) -> Option<Bytes> {
        self.send_content(0, 1, message).await;
        let (sequence, total, payload) = self.recv_content(wait).await?;
        assert_eq!(total, 1, "reply spans several chunks");
        self.send_ack(sequence).await;
        Some(payload)
    }

    /// Send `message` as one chunk per `chunk` bytes.
    pub async fn send_message(&self, message: &[u8], chunk: usize) {
        let pieces: Vec<&[u8]> = message.chunks(chunk).collect();
        let total = pieces.len() as u32;
        for (i, piece) in pieces.iter().enumerate() {
            self.send_content(i as u32, total, piece).await;
        }
    }

    /// Next packet, or `None` if nothing arrives within `wait`.
    pub async fn recv(&self, wait: Duration) -> Option<Packet> {
        let mut buf = vec![0u8; 65_536];
        match tokio::time::timeout(wait, self.socket.recv(&mut buf)).await {
            Ok(Ok(len)) => Some(Packet::decode(&buf[..len]).expect("server sent garbage")),
            _ => None,
        }
    }

    /// Next Content packet, skipping acks.
    pub async fn recv_content(&self, wait: Duration) -> Option<(u32, u32, Bytes)> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv(left).await? {
                Packet::Content {
                    sequence,
                    total,
                    payload,
                } => return Some((sequence, total, payload)),
                _ => continue,
            }
        }
    }

    /// Next Ack, skipping content.
    pub async fn recv_ack(&self, wait: Duration) -> Option<u32> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv(left).await? {
                Packet::Ack { sequence } => return Some(sequence),
                _ => continue,
            }
        }
    }
}
