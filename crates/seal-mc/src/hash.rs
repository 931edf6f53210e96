//! 64-bit state hash.
//!
//! Bob Jenkins' lookup3 construction run over little-endian 32-bit words and
//! returning both result words. Inputs of up to 12 bytes skip the mixing loop
//! and go straight to the final avalanche.

#[inline(always)]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

#[inline(always)]
fn finish(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

/// Read up to four bytes as a little-endian word, zero padded.
#[inline(always)]
fn word(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf[..bytes.len()].copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Hash `data` with a 64-bit seed.
pub fn hash64(data: &[u8], seed: u64) -> u64 {
    let init = 0xdead_beef_u32
        .wrapping_add(data.len() as u32)
        .wrapping_add(seed as u32);
    let mut a = init;
    let mut b = init;
    let mut c = init.wrapping_add((seed >> 32) as u32);

    let mut rest = data;
    while rest.len() > 12 {
        a = a.wrapping_add(word(&rest[0..4]));
        b = b.wrapping_add(word(&rest[4..8]));
        c = c.wrapping_add(word(&rest[8..12]));
        mix(&mut a, &mut b, &mut c);
        rest = &rest[12..];
    }

    if rest.is_empty() {
        return ((b as u64) << 32) | c as u64;
    }

    let take = |from: usize| -> u32 {
        if from >= rest.len() {
            0
        } else {
            word(&rest[from..rest.len().min(from + 4)])
        }
    };
    a = a.wrapping_add(take(0));
    b = b.wrapping_add(take(4));
    c = c.wrapping_add(take(8));
    finish(&mut a, &mut b, &mut c);
    ((b as u64) << 32) | c as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_deterministic() {
        assert_eq!(hash64(b"state", 0), hash64(b"state", 0));
        assert_ne!(hash64(b"state", 0), hash64(b"state", 1));
        assert_ne!(hash64(b"state", 0), hash64(b"state", 1 << 32));
    }

    #[test]
    fn test_length_matters() {
        assert_ne!(hash64(&[0], 0), hash64(&[0, 0], 0));
        assert_ne!(hash64(&[0; 12], 0), hash64(&[0; 13], 0));
    }

    #[test]
    fn test_single_bit_flips_spread() {
        let base = [0u8; 40];
        let h0 = hash64(&base, 0);
        let mut seen = HashSet::new();
        for byte in 0..base.len() {
            for bit in 0..8 {
                let mut data = base;
                data[byte] ^= 1 << bit;
                let h = hash64(&data, 0);
                assert_ne!(h, h0);
                // Roughly half of the output bits should flip.
                let flipped = (h ^ h0).count_ones();
                assert!(flipped > 8, "weak avalanche at byte {byte} bit {bit}");
                seen.insert(h);
            }
        }
        assert_eq!(seen.len(), 40 * 8);
    }

    #[test]
    fn test_low_bits_distribution() {
        // Counter-like keys must spread over the low bits the table indexes by.
        let mut buckets = [0usize; 64];
        for i in 0u32..64_000 {
            buckets[(hash64(&i.to_le_bytes(), 0) & 63) as usize] += 1;
        }
        for count in buckets {
            assert!(count > 700 && count < 1300, "bucket count {count}");
        }
    }
}
