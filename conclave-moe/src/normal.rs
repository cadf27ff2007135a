//! Normal dispatch: variable-length exact per-expert shards.
//!
//! Each rank buckets its tokens by the rank owning the selected expert and
//! trades exact shards in one all-to-all. The receiver learns exact
//! per-expert counts (returned in the output so downstream buffers can be
//! sized), at the cost of shipping counts before compute can start.

use conclave::{DispatchOutputFormat, Error, HostTensor, ProcessGroup, Result};

use crate::dispatcher::{ExpertLayout, RoutingDecision, TokenDispatcher};
use crate::output::DispatchOutput;
use crate::wire::{put_f32, put_f32_slice, put_u32, Reader};

/// One routed (token, expert) assignment retained on the sending side.
#[derive(Clone)]
struct SentEntry {
    token: usize,
    weight: f32,
}

/// One received row: where it came from and how to hand it back.
struct RecvEntry {
    src: usize,
    /// Index of this entry within the source's shard, in the source's send
    /// order. The combine response is ordered by this so the source can zip
    /// it against its own bookkeeping.
    pos: u32,
    origin: u32,
    expert: u32,
    weight: f32,
    row: Vec<f32>,
}

struct PendingExchange {
    num_tokens: usize,
    /// Per destination rank, entries in send order.
    sent: Vec<Vec<SentEntry>>,
    /// Received entries in dispatch-output row order.
    recv: Vec<RecvEntry>,
}

/// Throughput-oriented dispatcher trading a count round-trip for exact
/// buffers.
pub struct NormalDispatcher<G> {
    group: G,
    layout: ExpertLayout,
    hidden_size: usize,
    pending: Option<PendingExchange>,
}

impl<G: ProcessGroup> NormalDispatcher<G> {
    #[must_use]
    pub fn new(group: G, layout: ExpertLayout, hidden_size: usize) -> Self {
        Self {
            group,
            layout,
            hidden_size,
            pending: None,
        }
    }

    /// Pack one outgoing shard: count, then per entry
    /// `(origin, expert, weight, row)`.
    fn pack_shard(&self, hidden: &HostTensor<f32>, entries: &[(u32, u32, f32)]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + entries.len() * (12 + self.hidden_size * 4));
        put_u32(&mut buf, entries.len() as u32);
        for &(origin, expert, weight) in entries {
            put_u32(&mut buf, origin);
            put_u32(&mut buf, expert);
            put_f32(&mut buf, weight);
            put_f32_slice(&mut buf, hidden.row(origin as usize));
        }
        buf
    }

    fn unpack_shard(&self, src: usize, bytes: &[u8]) -> Result<Vec<RecvEntry>> {
        let mut reader = Reader::new(bytes);
        let count = reader.u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for pos in 0..count {
            let origin = reader.u32()?;
            let expert = reader.u32()?;
            let weight = reader.f32()?;
            let row = reader.f32_vec(self.hidden_size)?;
            entries.push(RecvEntry {
                src,
                pos: pos as u32,
                origin,
                expert,
                weight,
                row,
            });
        }
        reader.finish()?;
        Ok(entries)
    }
}

impl<G: ProcessGroup> TokenDispatcher for NormalDispatcher<G> {
    fn format(&self) -> DispatchOutputFormat {
        DispatchOutputFormat::Normal
    }

    fn dispatch(
        &mut self,
        hidden: &HostTensor<f32>,
        routing: &RoutingDecision,
    ) -> Result<DispatchOutput> {
        let &[num_tokens, h] = hidden.shape() else {
            return Err(Error::ShapeMismatch {
                expected: vec![0, self.hidden_size],
                got: hidden.shape().to_vec(),
            });
        };
        if h != self.hidden_size {
            return Err(Error::ShapeMismatch {
                expected: vec![num_tokens, self.hidden_size],
                got: hidden.shape().to_vec(),
            });
        }
        routing.validate(num_tokens, self.layout.num_experts())?;

        let world = self.group.size();

        // bucket (token, expert) assignments by owning rank, send order
        let mut outgoing: Vec<Vec<(u32, u32, f32)>> = vec![Vec::new(); world];
        let mut sent: Vec<Vec<SentEntry>> = vec![Vec::new(); world];
        for token in 0..num_tokens {
            for j in 0..routing.top_k {
                let flat = token * routing.top_k + j;
                let expert = routing.topk_ids[flat];
                let weight = routing.topk_weights[flat];
                let dst = self.layout.owner(expert as usize);
                outgoing[dst].push((token as u32, expert, weight));
                sent[dst].push(SentEntry { token, weight });
            }
        }

        let shards = outgoing
            .iter()
            .map(|entries| self.pack_shard(hidden, entries))
            .collect();
        let received = self.group.all_to_all(shards)?;

        let mut recv = Vec::new();
        for (src, bytes) in received.iter().enumerate() {
            recv.extend(self.unpack_shard(src, bytes)?);
        }
        // group by local expert; source rank and send order break ties so
        // every rank derives the same deterministic layout
        recv.sort_by_key(|e| {
            (
                self.layout.local_index(e.expert as usize),
                e.src,
                e.pos,
            )
        });

        let mut counts = vec![0usize; self.layout.experts_per_rank()];
        let mut rows = Vec::with_capacity(recv.len() * self.hidden_size);
        let mut ids = Vec::with_capacity(recv.len());
        let mut weights = Vec::with_capacity(recv.len());
        for entry in &recv {
            counts[self.layout.local_index(entry.expert as usize)] += 1;
            rows.extend_from_slice(&entry.row);
            ids.push(entry.expert);
            weights.push(entry.weight);
        }

        let num_recv = recv.len();
        tracing::trace!(num_recv, "normal dispatch exchanged shards");

        self.pending = Some(PendingExchange {
            num_tokens,
            sent,
            recv,
        });

        Ok(DispatchOutput::Normal {
            hidden_states: HostTensor::new(rows, &[num_recv, self.hidden_size]),
            hidden_states_scale: None,
            topk_ids: Some(HostTensor::new(ids, &[num_recv])),
            topk_weights: Some(HostTensor::new(weights, &[num_recv])),
            num_recv_tokens_per_expert: counts,
        })
    }

    fn combine(&mut self, expert_outputs: HostTensor<f32>) -> Result<HostTensor<f32>> {
        let state = self.pending.take().ok_or_else(|| {
            Error::Config("combine called without a matching dispatch".into())
        })?;

        let expected = vec![state.recv.len(), self.hidden_size];
        if expert_outputs.shape() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                expected,
                got: expert_outputs.shape().to_vec(),
            });
        }

        // hand each processed row back to its source, ordered by the
        // source's original send order
        let world = self.group.size();
        let mut per_src: Vec<Vec<(u32, u32, &[f32])>> = vec![Vec::new(); world];
        for (i, entry) in state.recv.iter().enumerate() {
            per_src[entry.src].push((entry.pos, entry.origin, expert_outputs.row(i)));
        }
        let responses = per_src
            .into_iter()
            .map(|mut entries| {
                entries.sort_by_key(|&(pos, _, _)| pos);
                let mut buf =
                    Vec::with_capacity(4 + entries.len() * (8 + self.hidden_size * 4));
                put_u32(&mut buf, entries.len() as u32);
                for (pos, origin, row) in entries {
                    put_u32(&mut buf, pos);
                    put_u32(&mut buf, origin);
                    put_f32_slice(&mut buf, row);
                }
                buf
            })
            .collect();

        let returned = self.group.all_to_all(responses)?;

        // weighted reduction back into original token order
        let mut out = vec![0.0f32; state.num_tokens * self.hidden_size];
        for (dst, bytes) in returned.iter().enumerate() {
            let mut reader = Reader::new(bytes);
            let count = reader.u32()? as usize;
            if count != state.sent[dst].len() {
                return Err(Error::WireFormat(format!(
                    "rank {dst} returned {count} rows, expected {}",
                    state.sent[dst].len()
                )));
            }
            for _ in 0..count {
                let pos = reader.u32()? as usize;
                let origin = reader.u32()? as usize;
                let row = reader.f32_vec(self.hidden_size)?;

                let entry = state.sent[dst].get(pos).ok_or_else(|| {
                    Error::WireFormat(format!("rank {dst} returned unknown position {pos}"))
                })?;
                if entry.token != origin {
                    return Err(Error::WireFormat(format!(
                        "rank {dst} returned token {origin} at position {pos}, sent {}",
                        entry.token
                    )));
                }

                let base = entry.token * self.hidden_size;
                for (o, v) in out[base..base + self.hidden_size].iter_mut().zip(&row) {
                    *o += entry.weight * v;
                }
            }
            reader.finish()?;
        }

        Ok(HostTensor::new(
            out,
            &[state.num_tokens, self.hidden_size],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave::LocalProcessGroup;

    fn single_rank_dispatcher(num_experts: usize, hidden: usize) -> NormalDispatcher<LocalProcessGroup> {
        let group = LocalProcessGroup::group(1).pop().unwrap();
        let layout = ExpertLayout::new(num_experts, 1).unwrap();
        NormalDispatcher::new(group, layout, hidden)
    }

    #[test]
    fn single_rank_round_trip_reduces_by_weight() {
        let mut d = single_rank_dispatcher(2, 2);
        let hidden = HostTensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        // token 0 -> experts 0 (0.75) and 1 (0.25); token 1 -> expert 1 (1.0)
        let routing = RoutingDecision {
            topk_ids: vec![0, 1, 1, 1],
            topk_weights: vec![0.75, 0.25, 0.5, 0.5],
            top_k: 2,
        };

        let out = d.dispatch(&hidden, &routing).unwrap();
        let DispatchOutput::Normal {
            hidden_states,
            num_recv_tokens_per_expert,
            topk_ids,
            ..
        } = &out
        else {
            panic!("wrong format");
        };

        // 4 assignments total: expert 0 got 1 row, expert 1 got 3
        assert_eq!(hidden_states.shape(), &[4, 2]);
        assert_eq!(num_recv_tokens_per_expert, &vec![1, 3]);
        // rows are grouped by local expert
        assert_eq!(topk_ids.as_ref().unwrap().as_slice(), &[0, 1, 1, 1]);

        // expert output = input row unchanged; combine must then produce
        // sum(weight) * row per token
        let expert_out = hidden_states.clone();
        let combined = d.combine(expert_out).unwrap();
        assert_eq!(combined.shape(), &[2, 2]);
        // token 0: 0.75*row + 0.25*row = row; token 1: 0.5+0.5 = row
        for (o, e) in combined.as_slice().iter().zip(hidden.as_slice()) {
            assert!((o - e).abs() < 1e-6);
        }
    }

    #[test]
    fn combine_without_dispatch_is_an_error() {
        let mut d = single_rank_dispatcher(2, 2);
        assert!(d.combine(HostTensor::zeros(&[0, 2])).is_err());
    }

    #[test]
    fn dispatch_output_tag_is_normal() {
        let mut d = single_rank_dispatcher(2, 2);
        let hidden = HostTensor::new(vec![1.0, 2.0], &[1, 2]);
        let routing = RoutingDecision {
            topk_ids: vec![1],
            topk_weights: vec![1.0],
            top_k: 1,
        };
        let out = d.dispatch(&hidden, &routing).unwrap();
        assert!(out.format().is_normal());
    }
}
