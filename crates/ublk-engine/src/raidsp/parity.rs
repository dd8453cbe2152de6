//! Word-wise XOR parity.
//!
//! All routines require 8-byte-multiple lengths and offsets; the engine only
//! ever hands them sector-granular views. XOR is symmetric, so there are no
//! endianness concerns: the parity strip holds the same bytes on every
//! architecture.

use crate::buf::IoBuf;

fn xor_words(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.chunks_exact_mut(8).zip(src.chunks_exact(8)) {
        let word = u64::from_ne_bytes(d.try_into().expect("8-byte chunk"))
            ^ u64::from_ne_bytes(s.try_into().expect("8-byte chunk"));
        d.copy_from_slice(&word.to_ne_bytes());
    }
}

/// `dst ^= src`, element-wise. Lengths must match and be 8-byte multiples.
pub fn xor_into(src: &IoBuf, dst: &IoBuf) {
    assert_eq!(src.len(), dst.len());
    assert_eq!(src.len() % 8, 0);
    dst.with_mut(|d| src.with(|s| xor_words(d, s)));
}

/// XORs `data` into `parity`, starting `parity_start_offset` bytes into the
/// parity buffer and wrapping around it as needed.
///
/// `data` may be any multiple of the word size, shorter or longer than
/// `parity`; a full stripe of data folds onto the parity strip one
/// strip-sized window at a time.
pub fn parity_to(data: &IoBuf, parity: &IoBuf, parity_start_offset: usize) {
    assert_eq!(data.len() % 8, 0);
    assert_eq!(parity.len() % 8, 0);
    assert_eq!(parity_start_offset % 8, 0);

    let psz = parity.len();
    let mut dpos = 0usize;

    let head = parity_start_offset % psz;
    if head != 0 {
        let chunk = data.len().min(psz - head);
        xor_into(&data.slice(0, chunk), &parity.slice(head, chunk));
        dpos += chunk;
    }

    while data.len() - dpos >= psz {
        xor_into(&data.slice(dpos, psz), parity);
        dpos += psz;
    }

    let tail = data.len() - dpos;
    if tail > 0 {
        xor_into(&data.slice(dpos, tail), &parity.slice(0, tail));
    }
}

/// Recomputes `parity` from scratch: zero, then fold `data` in.
pub fn parity_renew(data: &IoBuf, parity: &IoBuf) {
    parity.fill_zero();
    parity_to(data, parity, 0);
}
