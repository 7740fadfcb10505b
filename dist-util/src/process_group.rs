use log::{debug, info};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Collective operations shared by all ranks of a training job.
///
/// Every rank must issue the same collectives in the same order;
/// buffers must have the same length on all ranks.
pub trait ProcessGroup {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Block until every rank reaches this point
    fn barrier(&mut self) -> anyhow::Result<()>;

    /// Replace `buf` by its element-wise mean over all ranks
    fn all_reduce_mean(&mut self, buf: &mut [f32]) -> anyhow::Result<()>;

    /// Overwrite `buf` with the values held by rank 0
    fn broadcast(&mut self, buf: &mut [f32]) -> anyhow::Result<()>;

    /// Final barrier, then release the connections
    fn destroy(&mut self) -> anyhow::Result<()>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// A group of one; every collective is a no-op
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn all_reduce_mean(&mut self, _buf: &mut [f32]) -> anyhow::Result<()> {
        Ok(())
    }

    fn broadcast(&mut self, _buf: &mut [f32]) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

///
/// Star topology over TCP. Rank 0 holds one stream per peer
/// (ordered by peer rank); every other rank holds a single stream
/// to rank 0. Reductions are gathered and summed on rank 0, then
/// sent back.
///
/// A frame is a little-endian `u64` element count followed by the
/// little-endian `f32` payload.
///
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    peers: Vec<TcpStream>,
}

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

impl TcpGroup {
    /// Rendezvous on rank 0: accept `world_size - 1` peers, each
    /// announcing its rank and the world size it expects
    pub fn from_listener(listener: TcpListener, world_size: usize) -> anyhow::Result<Self> {
        if world_size == 0 {
            return Err(anyhow::anyhow!("world size must be positive"));
        }

        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();

        for _ in 1..world_size {
            let (mut stream, addr) = listener.accept()?;
            stream.set_nodelay(true)?;

            let mut hello = [0u8; 16];
            stream.read_exact(&mut hello)?;
            let (peer_rank, peer_world) = decode_hello(&hello);

            if peer_world != world_size {
                return Err(anyhow::anyhow!(
                    "peer {} expects world size {}, not {}",
                    addr,
                    peer_world,
                    world_size
                ));
            }
            if peer_rank == 0 || peer_rank >= world_size {
                return Err(anyhow::anyhow!("peer {} sent invalid rank {}", addr, peer_rank));
            }
            let slot = &mut slots[peer_rank - 1];
            if slot.is_some() {
                return Err(anyhow::anyhow!("rank {} joined twice", peer_rank));
            }
            debug!("rank {} joined from {}", peer_rank, addr);
            *slot = Some(stream);
        }

        let peers = slots
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.ok_or(anyhow::anyhow!("rank {} never joined", i + 1)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        info!("rank 0: all {} ranks connected", world_size);

        Ok(Self {
            rank: 0,
            world_size,
            peers,
        })
    }

    /// Join the group held by rank 0 at `addr`, retrying until
    /// `timeout` has passed
    pub fn connect_to<A: ToSocketAddrs + std::fmt::Debug>(
        addr: A,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        if rank == 0 || rank >= world_size {
            return Err(anyhow::anyhow!(
                "cannot connect as rank {} of {}",
                rank,
                world_size
            ));
        }

        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => break stream,
                Err(err) if Instant::now() < deadline => {
                    debug!("rank {}: waiting for {:?} ({})", rank, addr, err);
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(err) => {
                    return Err(anyhow::anyhow!(
                        "rank {}: could not reach {:?} within {:?}: {}",
                        rank,
                        addr,
                        timeout,
                        err
                    ));
                }
            }
        };

        stream.set_nodelay(true)?;
        stream.write_all(&encode_hello(rank, world_size))?;

        info!("rank {}: connected to {:?}", rank, addr);

        Ok(Self {
            rank,
            world_size,
            peers: vec![stream],
        })
    }

    fn root_stream(&mut self) -> anyhow::Result<&mut TcpStream> {
        self.peers
            .first_mut()
            .ok_or(anyhow::anyhow!("rank {}: group already destroyed", self.rank))
    }
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&mut self) -> anyhow::Result<()> {
        self.all_reduce_mean(&mut [])
    }

    fn all_reduce_mean(&mut self, buf: &mut [f32]) -> anyhow::Result<()> {
        if self.rank == 0 {
            let mut sum = buf.to_vec();
            let mut scratch = vec![0f32; buf.len()];
            for peer in self.peers.iter_mut() {
                read_frame(peer, &mut scratch)?;
                sum.iter_mut().zip(scratch.iter()).for_each(|(s, x)| *s += x);
            }
            let denom = self.world_size as f32;
            buf.iter_mut()
                .zip(sum.iter())
                .for_each(|(b, s)| *b = s / denom);
            for peer in self.peers.iter_mut() {
                write_frame(peer, buf)?;
            }
        } else {
            let root = self.root_stream()?;
            write_frame(root, buf)?;
            read_frame(root, buf)?;
        }
        Ok(())
    }

    fn broadcast(&mut self, buf: &mut [f32]) -> anyhow::Result<()> {
        if self.rank == 0 {
            for peer in self.peers.iter_mut() {
                write_frame(peer, buf)?;
            }
        } else {
            read_frame(self.root_stream()?, buf)?;
        }
        Ok(())
    }

    fn destroy(&mut self) -> anyhow::Result<()> {
        if self.world_size > 1 && self.peers.is_empty() {
            return Ok(());
        }
        self.barrier()?;
        for peer in self.peers.drain(..) {
            // the other side may have closed first
            let _ = peer.shutdown(Shutdown::Both);
        }
        info!("rank {}: left the process group", self.rank);
        Ok(())
    }
}

fn encode_hello(rank: usize, world_size: usize) -> [u8; 16] {
    let mut hello = [0u8; 16];
    hello[..8].copy_from_slice(&(rank as u64).to_le_bytes());
    hello[8..].copy_from_slice(&(world_size as u64).to_le_bytes());
    hello
}

fn decode_hello(hello: &[u8; 16]) -> (usize, usize) {
    let mut rank = [0u8; 8];
    let mut world = [0u8; 8];
    rank.copy_from_slice(&hello[..8]);
    world.copy_from_slice(&hello[8..]);
    (u64::from_le_bytes(rank) as usize, u64::from_le_bytes(world) as usize)
}

/// Write `data` as one frame
pub fn write_frame<W: Write>(stream: &mut W, data: &[f32]) -> anyhow::Result<()> {
    let mut bytes = Vec::with_capacity(8 + 4 * data.len());
    bytes.extend_from_slice(&(data.len() as u64).to_le_bytes());
    for x in data {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame into `out`; the frame length must match
pub fn read_frame<R: Read>(stream: &mut R, out: &mut [f32]) -> anyhow::Result<()> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header)?;
    let count = u64::from_le_bytes(header) as usize;
    if count != out.len() {
        return Err(anyhow::anyhow!(
            "frame holds {} values, expected {}",
            count,
            out.len()
        ));
    }
    let mut payload = vec![0u8; 4 * count];
    stream.read_exact(&mut payload)?;
    for (x, b) in out.iter_mut().zip(payload.chunks_exact(4)) {
        *x = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    }
    Ok(())
}
