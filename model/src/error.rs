use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Channels ({channels}) must be divisible by the number of attention heads ({heads}).")]
    HeadsNotDivisible { channels: usize, heads: usize },

    #[error("First filter size must be an even number, got {0}.")]
    OddFirstFilter(usize),

    #[error("Network depth must be at least 1.")]
    ZeroDepth,

    #[error("Network depth {depth} exceeds the maximum of {max}.")]
    DepthTooLarge { depth: usize, max: usize },

    #[error("First filter {first_filter} overflows after {depth} doublings.")]
    FilterOverflow { first_filter: usize, depth: usize },

    #[error("Channel counts must be positive: {0}.")]
    ZeroChannels(&'static str),
}
