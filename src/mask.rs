//! XOR masking of frame payloads.
//!
//! Client frames arrive masked, and the server codec unmasks them chunk by chunk
//! while streaming them to the engine, so every entry point takes the position of
//! the chunk within the frame payload.

/// Unmasks `buf`, which starts `offset` bytes into the frame payload.
#[inline]
pub fn unmask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    apply_mask_fast32(buf, rotate(mask, offset));
}

/// Key to use for a chunk that starts `offset` bytes into the payload.
#[inline]
fn rotate(mask: [u8; 4], offset: usize) -> [u8; 4] {
    let shift = offset & 3;
    [
        mask[shift],
        mask[(shift + 1) & 3],
        mask[(shift + 2) & 3],
        mask[(shift + 3) & 3],
    ]
}

#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Word-at-a-time masking, for the aligned middle of `buf`.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    // SAFETY: every bit pattern is a valid u32, align_to_mut only reinterprets the aligned middle.
    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_fallback(prefix, mask);
    let head = prefix.len() & 3;
    let mask_u32 = if head > 0 {
        if cfg!(target_endian = "big") {
            mask_u32.rotate_left(8 * head as u32)
        } else {
            mask_u32.rotate_right(8 * head as u32)
        }
    } else {
        mask_u32
    };
    for word in words.iter_mut() {
        *word ^= mask_u32;
    }
    apply_mask_fallback(suffix, mask_u32.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x6d, 0xb6, 0xb2, 0x80];

    fn masked(data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        apply_mask_fallback(&mut out, MASK);
        out
    }

    #[test]
    fn test_fast_path_matches_fallback() {
        let data: Vec<u8> = (0u8..64).collect();
        for off in 0..=3 {
            let mut slow = data.clone();
            apply_mask_fallback(&mut slow[off..], MASK);
            let mut fast = data.clone();
            apply_mask_fast32(&mut fast[off..], MASK);
            assert_eq!(slow, fast);
        }
    }

    #[test]
    fn test_unmask_whole_payload() {
        let original = b"Hello, WebSocket server!".to_vec();
        let mut data = masked(&original);
        unmask(&mut data, MASK, 0);
        assert_eq!(data, original);
    }

    #[test]
    fn test_unmask_in_uneven_chunks() {
        let original: Vec<u8> = (0u8..=200).collect();
        let mut data = masked(&original);

        let mut offset = 0;
        for chunk in [1usize, 6, 3, 17, 2, 100] {
            let end = (offset + chunk).min(data.len());
            unmask(&mut data[offset..end], MASK, offset);
            offset = end;
        }
        unmask(&mut data[offset..], MASK, offset);

        assert_eq!(data, original);
    }

    #[test]
    fn test_zero_mask_is_identity() {
        let mut data = b"unchanged".to_vec();
        unmask(&mut data, [0; 4], 3);
        assert_eq!(&data, b"unchanged");
    }
}
