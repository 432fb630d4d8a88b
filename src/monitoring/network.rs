//! System-wide connection table sampling from /proc/net

use std::collections::VecDeque;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};

/// Transport of a connection table row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Tcp6,
    Udp,
    Udp6,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::Tcp, Protocol::Tcp6, Protocol::Udp, Protocol::Udp6];

    /// File name under `/proc/net`
    pub fn table_name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tcp6 => "tcp6",
            Protocol::Udp => "udp",
            Protocol::Udp6 => "udp6",
        }
    }
}

/// One socket from the kernel connection tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: String,
}

impl Connection {
    /// Whether the socket has a concrete peer (not a listener)
    pub fn has_peer(&self) -> bool {
        self.remote.port() != 0 && !self.remote.ip().is_unspecified()
    }

    /// `proto://ip:port` of the peer
    pub fn endpoint(&self) -> String {
        format!("{}://{}", self.protocol.table_name(), self.remote)
    }
}

/// Capability to sample the system connection tables
pub trait NetworkProbe: Send + Sync {
    fn connections(&self) -> Result<Vec<Connection>>;
}

fn tcp_state_name(code: u8) -> &'static str {
    match code {
        0x01 => "ESTABLISHED",
        0x02 => "SYN_SENT",
        0x03 => "SYN_RECV",
        0x04 => "FIN_WAIT1",
        0x05 => "FIN_WAIT2",
        0x06 => "TIME_WAIT",
        0x07 => "CLOSE",
        0x08 => "CLOSE_WAIT",
        0x09 => "LAST_ACK",
        0x0A => "LISTEN",
        0x0B => "CLOSING",
        _ => "UNKNOWN",
    }
}

fn parse_addr(raw: &str) -> Option<SocketAddr> {
    let (ip_hex, port_hex) = raw.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    // the kernel prints each 32-bit word in host byte order
    let ip = match ip_hex.len() {
        8 => {
            let word = u32::from_str_radix(ip_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&ip_hex[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

/// Parse one `/proc/net/{tcp,udp}[6]` table; malformed rows are skipped
pub fn parse_proc_net(content: &str, protocol: Protocol) -> Vec<Connection> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 {
                return None;
            }
            let local = parse_addr(cols[1])?;
            let remote = parse_addr(cols[2])?;
            let code = u8::from_str_radix(cols[3], 16).ok()?;
            let state = match protocol {
                Protocol::Tcp | Protocol::Tcp6 => tcp_state_name(code),
                Protocol::Udp | Protocol::Udp6 if code == 0x01 => "ESTABLISHED",
                Protocol::Udp | Protocol::Udp6 => "UNCONN",
            };
            Some(Connection {
                protocol,
                local,
                remote,
                state: state.to_string(),
            })
        })
        .collect()
}

/// Reads connection tables from procfs
#[derive(Debug, Clone)]
pub struct ProcNetProbe {
    root: PathBuf,
}

impl Default for ProcNetProbe {
    fn default() -> Self {
        Self::new("/proc/net")
    }
}

impl ProcNetProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl NetworkProbe for ProcNetProbe {
    fn connections(&self) -> Result<Vec<Connection>> {
        let mut connections = Vec::new();
        let mut readable = 0;

        for protocol in Protocol::ALL {
            // hosts without IPv6 simply lack the *6 tables
            if let Ok(content) = fs::read_to_string(self.root.join(protocol.table_name())) {
                readable += 1;
                connections.extend(parse_proc_net(&content, protocol));
            }
        }

        if readable == 0 {
            return Err(SandboxError::ProcessMonitoring(format!(
                "No connection tables readable under {}",
                self.root.display()
            )));
        }
        Ok(connections)
    }
}

/// Replays scripted samples; an `Err` frame simulates a failed read.
/// The last frame repeats once the script runs out.
#[derive(Debug)]
pub struct ScriptedNetworkProbe {
    frames: Mutex<VecDeque<std::result::Result<Vec<Connection>, String>>>,
    last: Mutex<std::result::Result<Vec<Connection>, String>>,
}

impl ScriptedNetworkProbe {
    pub fn new(frames: Vec<std::result::Result<Vec<Connection>, String>>) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            last: Mutex::new(Ok(Vec::new())),
        }
    }

    /// Probe that always returns no connections
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl NetworkProbe for ScriptedNetworkProbe {
    fn connections(&self) -> Result<Vec<Connection>> {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(frame) = self
            .frames
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
        {
            *last = frame;
        }
        last.clone().map_err(SandboxError::ProcessMonitoring)
    }
}
