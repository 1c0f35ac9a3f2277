//! Scatter/gather helpers for caller-supplied buffer segments.

/// Total capacity of a segment list.
pub fn total_len<B: AsRef<[u8]>>(segments: &[B]) -> usize {
    segments.iter().map(|seg| seg.as_ref().len()).sum()
}

/// Concatenate segments into one contiguous payload, preserving order.
pub fn gather<B: AsRef<[u8]>>(segments: &[B]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(total_len(segments));
    for seg in segments {
        payload.extend_from_slice(seg.as_ref());
    }
    payload
}

/// Copy `src` across the segments front to back. Returns the number of bytes copied, which is
/// `min(src.len(), total_len(segments))`.
pub fn scatter<B: AsMut<[u8]>>(segments: &mut [B], src: &[u8]) -> usize {
    let mut copied = 0;
    for seg in segments.iter_mut() {
        if copied == src.len() {
            break;
        }
        let seg = seg.as_mut();
        let n = seg.len().min(src.len() - copied);
        seg[..n].copy_from_slice(&src[copied..copied + n]);
        copied += n;
    }
    copied
}
