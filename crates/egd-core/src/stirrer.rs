//! The stirring transform: a deterministic, length-preserving SHA-256
//! sliding-window XOR that distills a byte buffer in place.
//!
//! Walks the input in non-overlapping `BLOCK`-byte blocks. For the block
//! ending at offset `e`, the window is the `min(WINDOW, e)` bytes of the
//! buffer ending at `e` — a shrinking prefix for blocks too close to the
//! start to have a full window behind them. Because the buffer is stirred
//! in place as we go, a window for block `k` sees the *already stirred*
//! output of earlier blocks, not their original bytes — this is what gives
//! a single-bit change in the input cascading effect on every later block.

use sha2::{Digest, Sha256};

/// Sliding-window size in bytes.
pub const WINDOW: usize = 1024;
/// Block size in bytes; also the hash output slice width.
pub const BLOCK: usize = 32;

/// Distill `input` into a same-length buffer via the sliding-window
/// SHA-256 XOR transform. Deterministic: equal inputs yield equal outputs.
pub fn stir(input: &[u8]) -> Vec<u8> {
    let mut buf = input.to_vec();
    let mut offset = 0;
    while offset < buf.len() {
        let block_len = BLOCK.min(buf.len() - offset);
        let end = offset + block_len;
        let window_start = end.saturating_sub(WINDOW);

        let mut hasher = Sha256::new();
        hasher.update(&buf[window_start..end]);
        let digest = hasher.finalize();

        for i in 0..block_len {
            buf[offset + i] ^= digest[i];
        }
        offset = end;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    /// S1 — stir empty.
    #[test]
    fn stir_empty_is_empty() {
        assert_eq!(stir(b""), Vec::<u8>::new());
    }

    /// S2 — stir single block: stir(zeros(32)) == SHA-256(zeros(32))[0..32].
    #[test]
    fn stir_single_zero_block_matches_hash() {
        let input = [0u8; 32];
        let mut hasher = Sha256::new();
        hasher.update(input);
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(stir(&input), expected.to_vec());
    }

    #[test]
    fn stir_preserves_length_for_various_sizes() {
        for len in [0, 1, 31, 32, 33, 1023, 1024, 1025, 4096, 5000] {
            let input = vec![0x42u8; len];
            assert_eq!(stir(&input).len(), len);
        }
    }

    #[test]
    fn stir_is_deterministic() {
        let input: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        assert_eq!(stir(&input), stir(&input));
    }

    #[test]
    fn stir_short_of_block_still_produces_output() {
        let input = vec![7u8; 17];
        let out = stir(&input);
        assert_eq!(out.len(), 17);
        assert_ne!(out, input, "a non-zero input block should not XOR to itself");
    }

    #[test]
    fn stir_avalanche_flips_later_blocks() {
        let a = vec![0u8; 3 * BLOCK];
        let mut b = a.clone();
        b[0] ^= 0x01;
        let sa = stir(&a);
        let sb = stir(&b);
        assert_ne!(sa[0..BLOCK], sb[0..BLOCK], "first block must change");
        assert_ne!(
            sa[BLOCK..2 * BLOCK],
            sb[BLOCK..2 * BLOCK],
            "later block's window covers the changed byte via the stirred prefix"
        );
    }
}
