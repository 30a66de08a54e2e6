//! Irregular personalized all-to-all exchange.
//!
//! Used by the cross-rank shuffle. Every rank knows only what it sends;
//! the receive volumes are discovered by a counts exchange, after which
//! per-record length arrays and then the packed payloads flow. The payload
//! bytes are KV page images: records destined for the same rank are packed
//! contiguously, and delivery keeps per-source ordering while saying
//! nothing about ordering across sources.

use anyhow::{ensure, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::fabric::{decode_u64s, encode_u64s, Fabric};

pub(crate) struct Irregular<'a> {
    fabric: &'a Fabric,
}

pub(crate) struct Plan {
    pub sendcounts: Vec<u64>,
    pub sendbytes: Vec<u64>,
    pub recvcounts: Vec<u64>,
    pub recvbytes: Vec<u64>,
}

impl Plan {
    pub fn total_recv_records(&self) -> u64 {
        self.recvcounts.iter().sum()
    }

    pub fn total_recv_bytes(&self) -> u64 {
        self.recvbytes.iter().sum()
    }
}

impl<'a> Irregular<'a> {
    pub fn new(fabric: &'a Fabric) -> Self {
        Irregular { fabric }
    }

    /// Step 1: exchange per-destination record and byte counts so every
    /// rank learns its receive volumes. Collective.
    pub fn plan(&self, dest: &[usize], sizes: &[u32]) -> Result<Plan> {
        let n = self.fabric.size();
        let mut sendcounts = vec![0u64; n];
        let mut sendbytes = vec![0u64; n];
        for (&d, &s) in dest.iter().zip(sizes) {
            sendcounts[d] += 1;
            sendbytes[d] += s as u64;
        }
        for dst in 0..n {
            self.fabric
                .send(dst, encode_u64s(&[sendcounts[dst], sendbytes[dst]]))?;
        }
        let mut recvcounts = vec![0u64; n];
        let mut recvbytes = vec![0u64; n];
        for src in 0..n {
            let v = decode_u64s(self.fabric.recv(src)?);
            recvcounts[src] = v[0];
            recvbytes[src] = v[1];
        }
        Ok(Plan {
            sendcounts,
            sendbytes,
            recvcounts,
            recvbytes,
        })
    }

    /// Step 2: exchange the per-record length arrays. Returns the received
    /// lengths grouped by source rank, sources in rank order. Collective.
    pub fn exchange_sizes(&self, plan: &Plan, dest: &[usize], sizes: &[u32]) -> Result<Vec<u32>> {
        let n = self.fabric.size();
        let mut bufs: Vec<BytesMut> = plan
            .sendcounts
            .iter()
            .map(|&c| BytesMut::with_capacity(c as usize * 4))
            .collect();
        for (&d, &s) in dest.iter().zip(sizes) {
            bufs[d].put_u32(s);
        }
        for (dst, buf) in bufs.into_iter().enumerate() {
            self.fabric.send(dst, buf.freeze())?;
        }
        let mut out = Vec::with_capacity(plan.total_recv_records() as usize);
        for src in 0..n {
            let mut msg = self.fabric.recv(src)?;
            ensure!(
                msg.len() as u64 == plan.recvcounts[src] * 4,
                "size exchange from rank {src} disagrees with the counts exchange"
            );
            while msg.remaining() >= 4 {
                out.push(msg.get_u32());
            }
        }
        Ok(out)
    }

    /// Step 3: pack each record's page span by destination, exchange, and
    /// concatenate the received payloads into `out` in source-rank order.
    /// Returns the received byte total. Collective.
    pub fn exchange_payload(
        &self,
        plan: &Plan,
        dest: &[usize],
        spans: &[(usize, usize)],
        page: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<u64> {
        let n = self.fabric.size();
        let mut bufs: Vec<BytesMut> = plan
            .sendbytes
            .iter()
            .map(|&b| BytesMut::with_capacity(b as usize))
            .collect();
        for (&d, &(s, e)) in dest.iter().zip(spans) {
            bufs[d].put_slice(&page[s..e]);
        }
        for (dst, buf) in bufs.into_iter().enumerate() {
            self.fabric.send(dst, buf.freeze())?;
        }

        let total = plan.total_recv_bytes();
        out.clear();
        out.reserve(total as usize);
        for src in 0..n {
            let msg = self.fabric.recv(src)?;
            ensure!(
                msg.len() as u64 == plan.recvbytes[src],
                "payload exchange from rank {src} disagrees with the counts exchange"
            );
            out.extend_from_slice(&msg);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fabric;

    #[test]
    fn counts_sizes_and_payload_agree() {
        let fabrics = Fabric::group(3);
        std::thread::scope(|s| {
            for fabric in fabrics {
                s.spawn(move || {
                    let me = fabric.rank();
                    // Rank r sends one 8-byte record to every rank, plus an
                    // extra one to rank 0.
                    let mut dest = vec![0, 1, 2];
                    let mut page = Vec::new();
                    for d in 0..3u8 {
                        page.extend_from_slice(&[d + 10 * me as u8; 8]);
                    }
                    dest.push(0);
                    page.extend_from_slice(&[99 + me as u8; 8]);
                    let sizes = vec![8u32; dest.len()];
                    let spans: Vec<(usize, usize)> =
                        (0..dest.len()).map(|i| (i * 8, (i + 1) * 8)).collect();

                    let ir = Irregular::new(&fabric);
                    let plan = ir.plan(&dest, &sizes).unwrap();
                    let expect_records = if me == 0 { 6 } else { 3 };
                    assert_eq!(plan.total_recv_records(), expect_records);
                    assert_eq!(plan.total_recv_bytes(), expect_records * 8);

                    let rsizes = ir.exchange_sizes(&plan, &dest, &sizes).unwrap();
                    assert_eq!(rsizes.len() as u64, expect_records);
                    assert!(rsizes.iter().all(|&s| s == 8));

                    let mut out = Vec::new();
                    let got = ir
                        .exchange_payload(&plan, &dest, &spans, &page, &mut out)
                        .unwrap();
                    assert_eq!(got, expect_records * 8);
                    // Source ordering: rank 0's bytes precede rank 1's.
                    let first = &out[..8];
                    assert!(first.iter().all(|&b| b == me as u8));
                });
            }
        });
    }

    #[test]
    fn empty_senders_still_participate() {
        let fabrics = Fabric::group(2);
        std::thread::scope(|s| {
            for fabric in fabrics {
                s.spawn(move || {
                    let me = fabric.rank();
                    let ir = Irregular::new(&fabric);
                    if me == 0 {
                        let dest = vec![1usize; 2];
                        let sizes = vec![4u32; 2];
                        let spans = vec![(0usize, 4usize), (4, 8)];
                        let page = [1u8, 2, 3, 4, 5, 6, 7, 8];
                        let plan = ir.plan(&dest, &sizes).unwrap();
                        assert_eq!(plan.total_recv_records(), 0);
                        ir.exchange_sizes(&plan, &dest, &sizes).unwrap();
                        let mut out = Vec::new();
                        ir.exchange_payload(&plan, &dest, &spans, &page, &mut out)
                            .unwrap();
                        assert!(out.is_empty());
                    } else {
                        let plan = ir.plan(&[], &[]).unwrap();
                        assert_eq!(plan.total_recv_records(), 2);
                        let rsizes = ir.exchange_sizes(&plan, &[], &[]).unwrap();
                        assert_eq!(rsizes, vec![4, 4]);
                        let mut out = Vec::new();
                        let n = ir
                            .exchange_payload(&plan, &[], &[], &[], &mut out)
                            .unwrap();
                        assert_eq!(n, 8);
                        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
                    }
                });
            }
        });
    }
}
