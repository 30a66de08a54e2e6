//! The message-passing fabric: a fixed group of peer ranks.
//!
//! A group is created up front with [`Fabric::group`]; each handle is moved
//! onto the thread that plays that rank. Point-to-point messages travel
//! over one unbounded FIFO channel per (source, destination) pair, so a
//! send never blocks and per-source ordering is preserved. Collectives are
//! built from point-to-point messages through rank 0 and are the only
//! suspension points: every rank blocks in them until all peers arrive.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub struct Fabric {
    rank: usize,
    size: usize,
    txs: Vec<Sender<Bytes>>,
    rxs: Vec<Receiver<Bytes>>,
}

impl Fabric {
    /// Create a group of `n` ranks. The returned handles are rank-ordered;
    /// move each onto its own thread.
    pub fn group(n: usize) -> Vec<Fabric> {
        assert!(n > 0, "a fabric group needs at least one rank");
        let mut txs_by_src: Vec<Vec<Sender<Bytes>>> = (0..n).map(|_| Vec::new()).collect();
        let mut rxs_by_dst: Vec<Vec<Receiver<Bytes>>> = (0..n).map(|_| Vec::new()).collect();
        for src in 0..n {
            for dst in 0..n {
                let (tx, rx) = channel();
                txs_by_src[src].push(tx);
                rxs_by_dst[dst].push(rx);
            }
        }
        txs_by_src
            .into_iter()
            .zip(rxs_by_dst)
            .enumerate()
            .map(|(rank, (txs, rxs))| Fabric {
                rank,
                size: n,
                txs,
                rxs,
            })
            .collect()
    }

    /// A single-rank group.
    pub fn solo() -> Fabric {
        Fabric::group(1).pop().unwrap()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Send one message to `to`. Never blocks.
    pub fn send(&self, to: usize, msg: Bytes) -> Result<()> {
        self.txs[to]
            .send(msg)
            .map_err(|_| anyhow!("fabric send from rank {} to rank {to} failed: peer gone", self.rank))
    }

    /// Receive the next message from `from`. Blocks until one arrives.
    pub fn recv(&self, from: usize) -> Result<Bytes> {
        self.rxs[from]
            .recv()
            .map_err(|_| anyhow!("fabric recv on rank {} from rank {from} failed: peer gone", self.rank))
    }

    /// Receive the next message from any rank, polling sources round-robin.
    pub fn recv_any(&self) -> Result<(usize, Bytes)> {
        loop {
            let mut alive = false;
            for src in 0..self.size {
                match self.rxs[src].try_recv() {
                    Ok(msg) => return Ok((src, msg)),
                    Err(TryRecvError::Empty) => alive = true,
                    Err(TryRecvError::Disconnected) => {}
                }
            }
            if !alive {
                bail!("fabric recv_any on rank {} failed: all peers gone", self.rank);
            }
            std::thread::yield_now();
        }
    }

    /// Block until every rank has entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        self.allreduce_sum(0).map(|_| ())
    }

    pub fn allreduce_sum(&self, v: u64) -> Result<u64> {
        Ok(self.allreduce_vec(&[v], |a, b| a.wrapping_add(b))?[0])
    }

    pub fn allreduce_max(&self, v: u64) -> Result<u64> {
        Ok(self.allreduce_vec(&[v], u64::max)?[0])
    }

    pub fn allreduce_min(&self, v: u64) -> Result<u64> {
        Ok(self.allreduce_vec(&[v], u64::min)?[0])
    }

    pub fn allreduce_sum_vec(&self, vals: &[u64]) -> Result<Vec<u64>> {
        self.allreduce_vec(vals, |a, b| a.wrapping_add(b))
    }

    fn allreduce_vec(&self, vals: &[u64], op: fn(u64, u64) -> u64) -> Result<Vec<u64>> {
        if self.size == 1 {
            return Ok(vals.to_vec());
        }
        if self.rank == 0 {
            let mut acc = vals.to_vec();
            for src in 1..self.size {
                let theirs = decode_u64s(self.recv(src)?);
                for (a, b) in acc.iter_mut().zip(theirs) {
                    *a = op(*a, b);
                }
            }
            let out = encode_u64s(&acc);
            for dst in 1..self.size {
                self.send(dst, out.clone())?;
            }
            Ok(acc)
        } else {
            self.send(0, encode_u64s(vals))?;
            Ok(decode_u64s(self.recv(0)?))
        }
    }

    /// Broadcast `msg` from `root`; every rank returns the root's message.
    pub fn bcast(&self, root: usize, msg: Bytes) -> Result<Bytes> {
        if self.size == 1 {
            return Ok(msg);
        }
        if self.rank == root {
            for dst in 0..self.size {
                if dst != root {
                    self.send(dst, msg.clone())?;
                }
            }
            Ok(msg)
        } else {
            self.recv(root)
        }
    }
}

pub(crate) fn encode_u64s(vals: &[u64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(vals.len() * 8);
    for &v in vals {
        buf.put_u64(v);
    }
    buf.freeze()
}

pub(crate) fn decode_u64s(mut msg: Bytes) -> Vec<u64> {
    let mut out = Vec::with_capacity(msg.len() / 8);
    while msg.remaining() >= 8 {
        out.push(msg.get_u64());
    }
    out
}
