use std::cmp;

/// Clamp `n` into `[lower, upper]`.
///
/// Unlike `Ord::clamp` this never panics when the bounds cross. The upper bound wins.
///
pub(crate) fn clamp<N: Ord>(n: N, lower: N, upper: N) -> N {
    cmp::min(cmp::max(n, lower), upper)
}

/// Integer `n`-th root of `value`, rounded down.
///
/// A small epsilon guards against results like `1000^(1/3) = 9.999999999999998`.
///
pub(crate) fn nth_root(value: f64, n: usize) -> usize {
    if n == 0 || value <= 1.0 {
        return 1;
    }

    let root = value.powf(1.0 / n as f64);
    (root + 1e-9).floor() as usize
}
