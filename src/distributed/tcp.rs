//! One process per rank over TCP
//!
//! Rank 0 is the hub: it listens, every other rank connects to it and
//! introduces itself. Collectives are star-shaped: peers send to the hub,
//! the hub combines in rank order and answers each peer. Frames are a
//! little-endian `u64` length followed by a `bincode` payload of at most
//! [`MAX_FRAME_BYTES`].

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::group::ProcessGroup;
use crate::utils::error::{FixMatchError, Result};

/// How long a peer keeps retrying to reach the hub
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Largest frame payload either side accepts (1 GiB)
pub const MAX_FRAME_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Message {
    Hello { rank: usize, world_size: usize },
    Barrier,
    Values(Vec<f32>),
}

fn frame_too_large(len: u64) -> FixMatchError {
    FixMatchError::Distributed(format!(
        "Frame of {} bytes exceeds the {} byte limit",
        len, MAX_FRAME_BYTES
    ))
}

fn send<W: Write>(stream: &mut W, message: &Message) -> Result<()> {
    let payload = bincode::serialize(message)?;
    let len = payload.len() as u64;
    if len > MAX_FRAME_BYTES {
        return Err(frame_too_large(len));
    }
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}

fn recv<R: Read>(stream: &mut R) -> Result<Message> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len > MAX_FRAME_BYTES {
        return Err(frame_too_large(len));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

fn recv_values(stream: &mut TcpStream, expected: usize) -> Result<Vec<f32>> {
    match recv(stream)? {
        Message::Values(v) if v.len() == expected => Ok(v),
        Message::Values(v) => Err(FixMatchError::Distributed(format!(
            "all_reduce length mismatch: {} vs {}",
            v.len(),
            expected
        ))),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(message: &Message) -> FixMatchError {
    FixMatchError::Distributed(format!("Unexpected message {:?}", message))
}

#[derive(Debug)]
enum Role {
    /// Streams to ranks 1..world_size, in rank order
    Hub(Mutex<Vec<TcpStream>>),
    Peer(Mutex<TcpStream>),
}

/// A rank of a multi-process group
#[derive(Debug)]
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl TcpGroup {
    /// Join the group at `addr`: rank 0 listens there, others connect
    pub fn connect(rank: usize, world_size: usize, addr: &str, timeout: Duration) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(FixMatchError::Config(format!(
                "Invalid rank {} for world size {}",
                rank, world_size
            )));
        }
        if rank == 0 {
            let listener = TcpListener::bind(addr)?;
            Self::hub(listener, world_size)
        } else {
            let addr = addr
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| FixMatchError::Config(format!("Cannot resolve '{}'", addr)))?;
            Self::peer(rank, world_size, addr, timeout)
        }
    }

    /// Rank 0: accept one connection per peer
    pub fn hub(listener: TcpListener, world_size: usize) -> Result<Self> {
        info!(
            "Waiting for {} peer(s) on {}",
            world_size - 1,
            listener.local_addr()?
        );

        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        for _ in 1..world_size {
            let (mut stream, from) = listener.accept()?;
            stream.set_nodelay(true)?;
            let rank = match recv(&mut stream)? {
                Message::Hello { rank, world_size: w } if w == world_size && (1..world_size).contains(&rank) => rank,
                other => return Err(unexpected(&other)),
            };
            if slots[rank - 1].is_some() {
                return Err(FixMatchError::Distributed(format!("Rank {} joined twice", rank)));
            }
            debug!("Rank {} joined from {}", rank, from);
            slots[rank - 1] = Some(stream);
        }

        let peers = slots.into_iter().flatten().collect();
        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Hub(Mutex::new(peers)),
        })
    }

    /// Ranks 1..: connect to the hub, retrying until `timeout`
    pub fn peer(rank: usize, world_size: usize, hub: SocketAddr, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match TcpStream::connect(hub) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!("Hub {} not reachable yet: {}", hub, e);
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(FixMatchError::Distributed(format!(
                        "Could not reach rank 0 at {} within {:?}: {}",
                        hub, timeout, e
                    )))
                }
            }
        };
        stream.set_nodelay(true)?;
        send(&mut stream, &Message::Hello { rank, world_size })?;

        Ok(Self {
            rank,
            world_size,
            role: Role::Peer(Mutex::new(stream)),
        })
    }

    fn poisoned() -> FixMatchError {
        FixMatchError::Distributed("Connection lock poisoned".to_string())
    }
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        match &self.role {
            Role::Hub(peers) => {
                let mut peers = peers.lock().map_err(|_| Self::poisoned())?;
                for stream in peers.iter_mut() {
                    match recv(stream)? {
                        Message::Barrier => {}
                        other => return Err(unexpected(&other)),
                    }
                }
                for stream in peers.iter_mut() {
                    send(stream, &Message::Barrier)?;
                }
            }
            Role::Peer(hub) => {
                let mut hub = hub.lock().map_err(|_| Self::poisoned())?;
                send(&mut *hub, &Message::Barrier)?;
                match recv(&mut *hub)? {
                    Message::Barrier => {}
                    other => return Err(unexpected(&other)),
                }
            }
        }
        Ok(())
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        match &self.role {
            Role::Hub(peers) => {
                let mut peers = peers.lock().map_err(|_| Self::poisoned())?;
                let mut sum = values.to_vec();
                for stream in peers.iter_mut() {
                    let theirs = recv_values(stream, values.len())?;
                    for (s, t) in sum.iter_mut().zip(theirs) {
                        *s += t;
                    }
                }
                for (v, s) in values.iter_mut().zip(sum) {
                    *v = s / self.world_size as f32;
                }
                let reply = Message::Values(values.to_vec());
                for stream in peers.iter_mut() {
                    send(stream, &reply)?;
                }
            }
            Role::Peer(hub) => {
                let mut hub = hub.lock().map_err(|_| Self::poisoned())?;
                send(&mut *hub, &Message::Values(values.to_vec()))?;
                let mean = recv_values(&mut hub, values.len())?;
                values.copy_from_slice(&mean);
            }
        }
        Ok(())
    }

    fn broadcast_from_main(&self, values: &mut Vec<f32>) -> Result<()> {
        match &self.role {
            Role::Hub(peers) => {
                let mut peers = peers.lock().map_err(|_| Self::poisoned())?;
                let message = Message::Values(values.clone());
                for stream in peers.iter_mut() {
                    send(stream, &message)?;
                }
            }
            Role::Peer(hub) => {
                let mut hub = hub.lock().map_err(|_| Self::poisoned())?;
                match recv(&mut *hub)? {
                    Message::Values(v) => *values = v,
                    other => return Err(unexpected(&other)),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_world(world_size: usize, body: fn(TcpGroup) -> Vec<f32>) -> Vec<Vec<f32>> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peers: Vec<_> = (1..world_size)
            .map(|rank| {
                thread::spawn(move || {
                    let group = TcpGroup::peer(rank, world_size, addr, Duration::from_secs(10)).unwrap();
                    body(group)
                })
            })
            .collect();

        let hub = TcpGroup::hub(listener, world_size).unwrap();
        let mut results = vec![body(hub)];
        results.extend(peers.into_iter().map(|h| h.join().unwrap()));
        results
    }

    #[test]
    fn test_all_reduce_over_tcp() {
        let results = run_world(3, |group| {
            group.barrier().unwrap();
            let mut values = vec![group.rank() as f32 * 3.0, 1.0];
            group.all_reduce_mean(&mut values).unwrap();
            values
        });
        for values in results {
            assert_eq!(values, vec![3.0, 1.0]);
        }
    }

    #[test]
    fn test_broadcast_over_tcp() {
        let results = run_world(2, |group| {
            let mut values = if group.is_main() { vec![4.0, 5.0] } else { vec![] };
            group.broadcast_from_main(&mut values).unwrap();
            values
        });
        assert!(results.iter().all(|v| v == &vec![4.0, 5.0]));
    }

    #[test]
    fn test_frame_round_trip() {
        let mut wire = Vec::new();
        send(&mut wire, &Message::Values(vec![1.5, -2.0])).unwrap();
        let message = recv(&mut std::io::Cursor::new(wire)).unwrap();
        assert_eq!(message, Message::Values(vec![1.5, -2.0]));
    }

    #[test]
    fn test_oversized_frame_rejected_before_allocation() {
        for len in [MAX_FRAME_BYTES + 1, u64::MAX] {
            let mut wire = len.to_le_bytes().to_vec();
            wire.extend_from_slice(&[0u8; 16]);
            let result = recv(&mut std::io::Cursor::new(wire));
            assert!(matches!(result, Err(FixMatchError::Distributed(msg)) if msg.contains("exceeds")));
        }
    }

    #[test]
    fn test_peer_gives_up_without_hub() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = TcpGroup::peer(1, 2, addr, Duration::from_millis(300));
        assert!(matches!(result, Err(FixMatchError::Distributed(_))));
    }

    #[test]
    fn test_invalid_rank_rejected() {
        assert!(TcpGroup::connect(2, 2, "127.0.0.1:0", Duration::from_millis(10)).is_err());
    }
}
