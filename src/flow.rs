// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Session identity as seen by the reconstruction engine: the 5-tuple, the direction of a
//! transfer within it, and the key assemblers are registered under.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// A transport session between a client and a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flow {
    pub transport: Transport,
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl Flow {
    pub fn new(transport: Transport, client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            transport,
            client,
            server,
        }
    }

    /// Endpoint the bytes of a transfer come from.
    pub fn source(&self, direction: Direction) -> SocketAddr {
        match direction {
            Direction::ClientToServer => self.client,
            Direction::ServerToClient => self.server,
        }
    }

    /// Endpoint the bytes of a transfer are sent to.
    pub fn destination(&self, direction: Direction) -> SocketAddr {
        match direction {
            Direction::ClientToServer => self.server,
            Direction::ServerToClient => self.client,
        }
    }

    /// Directional 5-tuple, e.g. `TCP 10.0.0.2:80 -> 10.0.0.1:50000`.
    pub fn directional(&self, direction: Direction) -> String {
        format!(
            "{} {} -> {}",
            self.transport,
            self.source(direction),
            self.destination(direction)
        )
    }
}

/// Registry key of a transfer. Only one assembler per key is active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TransferKey {
    pub flow: String,
    pub extended_file_id: Option<String>,
}

impl TransferKey {
    pub fn new(flow: &Flow, direction: Direction, extended_file_id: Option<&str>) -> Self {
        Self {
            flow: flow.directional(direction),
            extended_file_id: extended_file_id.map(str::to_string),
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.extended_file_id {
            Some(id) => write!(f, "{}|{}", self.flow, id),
            None => f.write_str(&self.flow),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> Flow {
        Flow::new(
            Transport::Tcp,
            "10.0.0.1:50000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
    }

    #[test]
    fn test_directional_representation() {
        let flow = flow();
        assert_eq!(
            flow.directional(Direction::ServerToClient),
            "TCP 10.0.0.2:80 -> 10.0.0.1:50000"
        );
        assert_eq!(
            flow.directional(Direction::ClientToServer),
            "TCP 10.0.0.1:50000 -> 10.0.0.2:80"
        );
    }

    #[test]
    fn test_key_includes_extended_id() {
        let flow = flow();
        let plain = TransferKey::new(&flow, Direction::ServerToClient, None);
        let with_id = TransferKey::new(&flow, Direction::ServerToClient, Some("fid-7"));
        assert_ne!(plain, with_id);
        assert_eq!(with_id.to_string(), "TCP 10.0.0.2:80 -> 10.0.0.1:50000|fid-7");
    }
}
