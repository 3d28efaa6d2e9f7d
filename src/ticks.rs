/// The replay clock: retired conditional branches observed by the hardware
/// performance counter.
pub type Ticks = u64;
