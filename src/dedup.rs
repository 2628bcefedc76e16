use std::collections::HashSet;

use xxhash_rust::xxh3::xxh3_128;

const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Report identifiers already seen by the stream.
///
/// Exact until `capacity` identifiers are held, then the set is folded into a
/// Bloom filter sized for twice the capacity. After that point a fresh
/// identifier may occasionally be reported as a duplicate.
pub enum SeenIds {
    Exact {
        ids: HashSet<String>,
        capacity: usize,
    },
    Probabilistic(BloomFilter),
}

impl SeenIds {
    pub fn with_capacity(capacity: usize) -> Self {
        SeenIds::Exact {
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Records `id`, returning `false` if it was (probably) seen before.
    pub fn insert(&mut self, id: &str) -> bool {
        match self {
            SeenIds::Exact { ids, capacity } => {
                if ids.contains(id) {
                    return false;
                }
                if ids.len() < *capacity {
                    ids.insert(id.to_string());
                    return true;
                }

                tracing::warn!(
                    capacity = *capacity,
                    "report id set reached capacity; duplicate detection is now probabilistic"
                );
                let mut bloom = BloomFilter::new(*capacity * 2, BLOOM_FALSE_POSITIVE_RATE);
                for existing in ids.iter() {
                    bloom.insert(existing);
                }
                bloom.insert(id);
                *self = SeenIds::Probabilistic(bloom);
                true
            }
            SeenIds::Probabilistic(bloom) => {
                if bloom.contains(id) {
                    return false;
                }
                bloom.insert(id);
                true
            }
        }
    }

    pub fn is_probabilistic(&self) -> bool {
        matches!(self, SeenIds::Probabilistic(_))
    }
}

pub struct BloomFilter {
    bits: Vec<u64>,
    bit_count: u64,
    hashes: u32,
}

impl BloomFilter {
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let bit_count = (-(n * false_positive_rate.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let hashes = ((bit_count as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;

        Self {
            bits: vec![0; bit_count.div_ceil(64) as usize],
            bit_count,
            hashes,
        }
    }

    fn positions(&self, item: &str) -> impl Iterator<Item = u64> + '_ {
        let hash = xxh3_128(item.as_bytes());
        let h1 = hash as u64;
        let h2 = (hash >> 64) as u64 | 1;
        (0..self.hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count)
    }

    pub fn insert(&mut self, item: &str) {
        let positions: Vec<u64> = self.positions(item).collect();
        for bit in positions {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn contains(&self, item: &str) -> bool {
        self.positions(item)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }
}
