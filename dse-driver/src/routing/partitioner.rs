//! The Murmur3 partitioner, the default partitioner of Cassandra and DSE.
//!
//! This is the x64 128-bit variant of MurmurHash3 with Cassandra's quirk:
//! tail bytes are sign-extended before mixing. Only the first half of the
//! 128-bit hash becomes the token.

use bytes::Buf;
use std::num::Wrapping;

use crate::routing::Token;

/// Computes tokens out of routing keys.
pub trait Partitioner: Send + Sync {
    /// Token of the partition identified by `routing_key`.
    fn hash(&self, routing_key: &[u8]) -> Token;
}

/// `org.apache.cassandra.dht.Murmur3Partitioner`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Partitioner;

const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

#[inline]
fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
    Wrapping(v.0.rotate_left(n))
}

#[inline]
fn mix_k1(mut k1: Wrapping<i64>) -> Wrapping<i64> {
    k1 *= C1;
    k1 = rotl64(k1, 31);
    k1 * C2
}

#[inline]
fn mix_k2(mut k2: Wrapping<i64>) -> Wrapping<i64> {
    k2 *= C2;
    k2 = rotl64(k2, 33);
    k2 * C1
}

#[inline]
fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xff51afd7ed558ccd_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xc4ceb9fe1a85ec53_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k
}

impl Partitioner for Murmur3Partitioner {
    fn hash(&self, routing_key: &[u8]) -> Token {
        let mut h1 = Wrapping(0_i64);
        let mut h2 = Wrapping(0_i64);

        let mut blocks = routing_key.chunks_exact(16);
        for mut block in &mut blocks {
            h1 ^= mix_k1(Wrapping(block.get_i64_le()));
            h1 = rotl64(h1, 27);
            h1 += h2;
            h1 = h1 * Wrapping(5) + Wrapping(0x52dce729);

            h2 ^= mix_k2(Wrapping(block.get_i64_le()));
            h2 = rotl64(h2, 31);
            h2 += h1;
            h2 = h2 * Wrapping(5) + Wrapping(0x38495ab5);
        }

        let tail = blocks.remainder();
        if tail.len() > 8 {
            let mut k2 = Wrapping(0_i64);
            for i in (8..tail.len()).rev() {
                k2 ^= Wrapping(tail[i] as i8 as i64) << ((i - 8) * 8);
            }
            h2 ^= mix_k2(k2);
        }
        if !tail.is_empty() {
            let mut k1 = Wrapping(0_i64);
            for i in (0..tail.len().min(8)).rev() {
                k1 ^= Wrapping(tail[i] as i8 as i64) << (i * 8);
            }
            h1 ^= mix_k1(k1);
        }

        let len = Wrapping(routing_key.len() as i64);
        h1 ^= len;
        h2 ^= len;

        h1 += h2;
        h2 += h1;

        h1 = fmix(h1);
        h2 = fmix(h2);

        h1 += h2;

        Token::new(h1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{Murmur3Partitioner, Partitioner};
    use crate::routing::compose_routing_key;
    use crate::utils::test_utils::setup_tracing;

    fn assert_correct_murmur3_hash(pk: &'static str, expected_hash: i64) {
        let hash = Murmur3Partitioner.hash(pk.as_bytes()).value();
        assert_eq!(hash, expected_hash);
    }

    #[test]
    fn test_murmur3_partitioner() {
        setup_tracing();
        for s in [
            ("test", -6017608668500074083),
            ("xd", 4507812186440344727),
            ("primary_key", -1632642444691073360),
            ("kremówki", 4354931215268080151),
        ] {
            assert_correct_murmur3_hash(s.0, s.1);
        }
    }

    #[test]
    fn test_murmur3_partitioner_composite_key() {
        setup_tracing();
        // Two int columns (1, 2): the hash is taken over the composite encoding.
        let key = compose_routing_key([&1_i32.to_be_bytes()[..], &2_i32.to_be_bytes()[..]])
            .unwrap();
        assert_eq!(key.len(), 2 * (2 + 4 + 1));
        let a = Murmur3Partitioner.hash(&key);
        let b = Murmur3Partitioner.hash(&key);
        assert_eq!(a, b);
        assert_ne!(a, Murmur3Partitioner.hash(&1_i32.to_be_bytes()));
    }
}
