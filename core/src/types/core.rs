pub type ChainId = u64;
pub type BlockNumber = u64;

/// Inclusive block interval `[0] ..= [1]`.
pub type BlockRange = (BlockNumber, BlockNumber);
