//! Scattered-buffer copies. The two-cursor walk advances the source and
//! destination vectors independently so the copy works for any mismatch
//! of element boundaries.

/// Total number of bytes described by an I/O vector.
pub fn iov_len(iov: &[&[u8]]) -> usize {
    iov.iter().map(|e| e.len()).sum()
}

/// Copy bytes from `src` into `dst`, stopping when either vector is
/// exhausted or a zero-length element is reached. Returns the number of
/// bytes copied; the tail of `dst` is left untouched.
pub fn iovcpy(src: &[&[u8]], dst: &mut [&mut [u8]]) -> usize {
    if src.is_empty() || dst.is_empty() {
        return 0;
    }

    let mut sidx = 0;
    let mut didx = 0;
    let mut soff = 0;
    let mut doff = 0;
    let mut total = 0;

    loop {
        if sidx == src.len() || didx == dst.len() {
            break;
        }
        let slen = src[sidx].len() - soff;
        let dlen = dst[didx].len() - doff;
        // an empty element terminates the walk
        if slen == 0 || dlen == 0 {
            break;
        }

        let len = slen.min(dlen);
        dst[didx][doff .. doff + len]
            .copy_from_slice(&src[sidx][soff .. soff + len]);
        total += len;

        soff += len;
        if soff == src[sidx].len() {
            sidx += 1;
            soff = 0;
        }
        doff += len;
        if doff == dst[didx].len() {
            didx += 1;
            doff = 0;
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(len: usize, val: u8) -> Vec<u8> {
        vec![val; len]
    }

    #[test]
    fn single_to_single() {
        let src = filled(64, 0xab);
        let mut dst = filled(64, 0);
        let copied = iovcpy(&[&src], &mut [&mut dst]);
        assert_eq!(copied, 64);
        assert!(dst.iter().all(|b| *b == 0xab));
    }

    #[test]
    fn single_to_many() {
        let src: Vec<u8> = (0 .. 48u8).collect();
        let mut d0 = filled(16, 0);
        let mut d1 = filled(16, 0);
        let mut d2 = filled(16, 0);
        let copied = iovcpy(&[&src], &mut [&mut d0, &mut d1, &mut d2]);
        assert_eq!(copied, 48);
        assert_eq!(&d0[..], &src[0 .. 16]);
        assert_eq!(&d1[..], &src[16 .. 32]);
        assert_eq!(&d2[..], &src[32 .. 48]);
    }

    #[test]
    fn many_to_single_unaligned_boundaries() {
        let s0: Vec<u8> = (0 .. 7u8).collect();
        let s1: Vec<u8> = (7 .. 30u8).collect();
        let s2: Vec<u8> = (30 .. 33u8).collect();
        let mut dst = filled(33, 0);
        let copied = iovcpy(&[&s0, &s1, &s2], &mut [&mut dst]);
        assert_eq!(copied, 33);
        let expect: Vec<u8> = (0 .. 33u8).collect();
        assert_eq!(dst, expect);
    }

    #[test]
    fn short_destination_leaves_tail_untouched() {
        let src = filled(32, 0xcd);
        let mut d0 = filled(8, 0x11);
        let mut d1 = filled(8, 0x22);
        let copied = iovcpy(&[&src], &mut [&mut d0, &mut d1]);
        // min(total(src), total(dst)) bytes move
        assert_eq!(copied, 16);
        assert!(d0.iter().all(|b| *b == 0xcd));
        assert!(d1.iter().all(|b| *b == 0xcd));
    }

    #[test]
    fn short_source_leaves_destination_tail() {
        let src = filled(10, 0x5a);
        let mut dst = filled(24, 0x77);
        let copied = iovcpy(&[&src], &mut [&mut dst]);
        assert_eq!(copied, 10);
        assert!(dst[.. 10].iter().all(|b| *b == 0x5a));
        assert!(dst[10 ..].iter().all(|b| *b == 0x77));
    }

    #[test]
    fn totals() {
        let a = filled(3, 0);
        let b = filled(5, 0);
        assert_eq!(iov_len(&[&a, &b]), 8);
        assert_eq!(iov_len(&[]), 0);
    }
}
