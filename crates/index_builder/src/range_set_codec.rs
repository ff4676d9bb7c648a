//! Encodes a `RangeSet` into the bytes stored at `<index>/range`. `range_set`
//! itself has no I/O; this is the one place that knows its on-disk shape.
use range_set::RangeSet;
use store_api::{
    End,
    Interval,
    Key,
    Start,
    StoreTransaction,
};

use crate::keyspace;

pub async fn load(tx: &mut dyn StoreTransaction, index: &str) -> anyhow::Result<RangeSet> {
    match tx.get_subspace(index, keyspace::RANGE).await? {
        Some(bytes) => decode(&bytes),
        None => Ok(RangeSet::new()),
    }
}

pub async fn store(tx: &mut dyn StoreTransaction, index: &str, set: &RangeSet) -> anyhow::Result<()> {
    tx.put_subspace(index, keyspace::RANGE, encode(set)).await
}

/// `[n: u32][for each of n intervals: len(start): u32, start bytes, tag: u8
/// (0 = excluded end follows, 1 = unbounded), [len(end): u32, end bytes]]`
pub fn encode(set: &RangeSet) -> Vec<u8> {
    let intervals: Vec<_> = set.iter().collect();
    let mut buf = Vec::new();
    buf.extend_from_slice(&(intervals.len() as u32).to_le_bytes());
    for interval in intervals {
        let start = interval.start.0.as_slice();
        buf.extend_from_slice(&(start.len() as u32).to_le_bytes());
        buf.extend_from_slice(start);
        match interval.end {
            End::Unbounded => buf.push(1),
            End::Excluded(ref end) => {
                buf.push(0);
                buf.extend_from_slice(&(end.as_slice().len() as u32).to_le_bytes());
                buf.extend_from_slice(end.as_slice());
            },
        }
    }
    buf
}

pub fn decode(bytes: &[u8]) -> anyhow::Result<RangeSet> {
    let mut set = RangeSet::new();
    if bytes.is_empty() {
        return Ok(set);
    }
    let mut pos = 0;
    let read_u32 = |bytes: &[u8], pos: &mut usize| -> anyhow::Result<u32> {
        let slice = bytes
            .get(*pos..*pos + 4)
            .ok_or_else(|| anyhow::anyhow!("truncated range set encoding"))?;
        *pos += 4;
        Ok(u32::from_le_bytes(slice.try_into().unwrap()))
    };
    let count = read_u32(bytes, &mut pos)?;
    for _ in 0..count {
        let start_len = read_u32(bytes, &mut pos)? as usize;
        let start = bytes
            .get(pos..pos + start_len)
            .ok_or_else(|| anyhow::anyhow!("truncated range set encoding"))?
            .to_vec();
        pos += start_len;
        let tag = *bytes
            .get(pos)
            .ok_or_else(|| anyhow::anyhow!("truncated range set encoding"))?;
        pos += 1;
        let end = if tag == 1 {
            End::Unbounded
        } else {
            let end_len = read_u32(bytes, &mut pos)? as usize;
            let end = bytes
                .get(pos..pos + end_len)
                .ok_or_else(|| anyhow::anyhow!("truncated range set encoding"))?
                .to_vec();
            pos += end_len;
            End::Excluded(Key::from(end))
        };
        set.add(Interval {
            start: Start(Key::from(start)),
            end,
        });
    }
    Ok(set)
}
