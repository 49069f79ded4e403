//! Simple-8b packing of strictly increasing integers.
//!
//! A codeword carries a 4-bit selector in its top bits and a 60-bit payload.
//! The payload holds the differences between successive values, minus one,
//! so runs of consecutive integers pack into selector 0 or 1 with no payload.

pub const MAX_VALUES_PER_CODEWORD: usize = 240;

/// Marks an item whose next value is too far away to encode. Selector 0 with
/// non-zero payload bits never occurs otherwise.
pub const EMPTY_CODEWORD: u64 = 0x0FFF_FFFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy)]
struct Mode {
    bits_per_int: u32,
    num_ints: usize,
}

const MODES: [Mode; 17] = [
    Mode { bits_per_int: 0, num_ints: 240 },
    Mode { bits_per_int: 0, num_ints: 120 },
    Mode { bits_per_int: 1, num_ints: 60 },
    Mode { bits_per_int: 2, num_ints: 30 },
    Mode { bits_per_int: 3, num_ints: 20 },
    Mode { bits_per_int: 4, num_ints: 15 },
    Mode { bits_per_int: 5, num_ints: 12 },
    Mode { bits_per_int: 6, num_ints: 10 },
    Mode { bits_per_int: 7, num_ints: 8 },
    Mode { bits_per_int: 8, num_ints: 7 },
    Mode { bits_per_int: 10, num_ints: 6 },
    Mode { bits_per_int: 12, num_ints: 5 },
    Mode { bits_per_int: 15, num_ints: 4 },
    Mode { bits_per_int: 20, num_ints: 3 },
    Mode { bits_per_int: 30, num_ints: 2 },
    Mode { bits_per_int: 60, num_ints: 1 },
    // sentinel
    Mode { bits_per_int: 0, num_ints: 0 },
];

fn mode_of(codeword: u64) -> Mode {
    MODES[(codeword >> 60) as usize]
}

/// Encodes as many leading values of `ints` as fit into one codeword.
///
/// `base` is the value preceding `ints[0]`; every value must be greater than
/// its predecessor. Returns the codeword and how many values it holds, which
/// is zero when the first difference needs more than 60 bits.
pub fn encode(ints: &[u64], base: u64) -> (u64, usize) {
    debug_assert!(!ints.is_empty() && ints[0] > base);
    let mut selector = 0usize;
    let mut nints = MODES[0].num_ints;
    let mut bits = MODES[0].bits_per_int;
    let mut diff = ints[0] - base - 1;
    let mut last_val = ints[0];
    let mut accepted = 0usize;

    loop {
        if diff >= (1u64 << bits) {
            // Does not fit, fall back to a wider mode.
            selector += 1;
            nints = MODES[selector].num_ints;
            bits = MODES[selector].bits_per_int;
            if accepted >= nints {
                break;
            }
        } else {
            accepted += 1;
            if accepted >= nints || accepted >= ints.len() {
                // A short input cannot fill the chosen mode; widen until it does.
                if accepted < nints {
                    while MODES[selector].num_ints > accepted {
                        selector += 1;
                    }
                    nints = MODES[selector].num_ints;
                    bits = MODES[selector].bits_per_int;
                }
                break;
            }
            debug_assert!(ints[accepted] > last_val);
            diff = ints[accepted] - last_val - 1;
            last_val = ints[accepted];
        }
    }

    if nints == 0 {
        return (EMPTY_CODEWORD, 0);
    }

    let mut codeword = 0u64;
    if bits > 0 {
        for i in (1..nints).rev() {
            codeword |= ints[i] - ints[i - 1] - 1;
            codeword <<= bits;
        }
        codeword |= ints[0] - base - 1;
    }
    codeword |= (selector as u64) << 60;
    (codeword, nints)
}

/// Decodes `codeword` into `out`, returning the number of values written.
pub fn decode(codeword: u64, base: u64, out: &mut [u64]) -> usize {
    if codeword == EMPTY_CODEWORD {
        return 0;
    }
    let mode = mode_of(codeword);
    let mask = mask(mode.bits_per_int);
    let mut payload = codeword;
    let mut curr = base;
    for slot in out.iter_mut().take(mode.num_ints) {
        curr += 1 + (payload & mask);
        *slot = curr;
        payload >>= mode.bits_per_int;
    }
    mode.num_ints
}

/// Whether `key` is one of the values encoded in `codeword` after `base`.
pub fn contains(codeword: u64, key: u64, base: u64) -> bool {
    if codeword == EMPTY_CODEWORD || key <= base {
        return false;
    }
    let mode = mode_of(codeword);
    if mode.bits_per_int == 0 {
        return key - base <= mode.num_ints as u64;
    }
    let mask = mask(mode.bits_per_int);
    let mut payload = codeword;
    let mut curr = base;
    for _ in 0..mode.num_ints {
        curr += 1 + (payload & mask);
        if curr >= key {
            return curr == key;
        }
        payload >>= mode.bits_per_int;
    }
    false
}

fn mask(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_run_uses_zero_width_mode() {
        let ints: Vec<u64> = (11..=250).collect();
        let (codeword, n) = encode(&ints, 10);
        assert_eq!(n, 240);
        assert_eq!(codeword, 0);
        let mut out = [0u64; MAX_VALUES_PER_CODEWORD];
        assert_eq!(decode(codeword, 10, &mut out), 240);
        assert_eq!(&out[..240], ints.as_slice());
        assert!(contains(codeword, 250, 10));
        assert!(!contains(codeword, 251, 10));
        assert!(!contains(codeword, 10, 10));
    }

    #[test]
    fn mixed_gaps_pick_narrowest_mode() {
        let ints = [3u64, 7, 8, 100, 101, 300, 301, 302, 303, 310];
        let (codeword, n) = encode(&ints, 1);
        assert!(n > 0 && n <= ints.len());
        let mut out = [0u64; MAX_VALUES_PER_CODEWORD];
        let decoded = decode(codeword, 1, &mut out);
        assert_eq!(decoded, n);
        assert_eq!(&out[..n], &ints[..n]);
        for v in &ints[..n] {
            assert!(contains(codeword, *v, 1));
        }
        assert!(!contains(codeword, 4, 1));
    }

    #[test]
    fn huge_gap_yields_empty_codeword() {
        let (codeword, n) = encode(&[10 + (1u64 << 61)], 10);
        assert_eq!(codeword, EMPTY_CODEWORD);
        assert_eq!(n, 0);
        let mut out = [0u64; 1];
        assert_eq!(decode(codeword, 10, &mut out), 0);
        assert!(!contains(codeword, 10 + (1u64 << 61), 10));
    }
}
