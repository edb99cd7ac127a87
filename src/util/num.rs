/// Round up `n` to the nearest multiple of `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// `a + b`, but `None` instead of wrapping. Used for every
/// `header + payload` size computation, since the payload size comes
/// straight from the caller.
pub fn checked_total(header_size: usize, payload: usize) -> Option<usize> {
    header_size.checked_add(payload)
}

/// Convert a byte count to whole KiB, rounding down.
pub const fn kib(bytes: usize) -> usize {
    bytes / 1024
}
