/// A rational timebase scaling a packet's `pts` into seconds. `den` is
/// always non-zero; `num` may be zero on wires that carry no time domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub num: u32,
    pub den: u32,
}

/// The target timebase used throughout the player core.
pub const MICROSECONDS: Timebase = Timebase {
    num: 1,
    den: 1_000_000,
};

impl Timebase {
    pub fn new(num: u32, den: u32) -> Option<Self> {
        (den > 0).then_some(Self { num, den })
    }
}

/// Rescales `pts` from `src` to `dst`: `pts · (n₁·d₂) / (d₁·n₂)`. Computed
/// in 128-bit arithmetic so 64-bit timestamps cannot overflow. Degenerate
/// timebases (zero numerators) rescale to zero instead of faulting.
pub fn rescale(pts: u64, src: Timebase, dst: Timebase) -> u64 {
    let numerator = u128::from(pts) * u128::from(src.num) * u128::from(dst.den);
    let denominator = u128::from(src.den) * u128::from(dst.num);

    if denominator == 0 {
        return 0;
    }

    (numerator / denominator) as u64
}

pub fn to_micros(pts: u64, src: Timebase) -> u64 {
    rescale(pts, src, MICROSECONDS)
}
