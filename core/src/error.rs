/// Batching core errors.
///
/// Settings errors are fatal at construction time: a mix must refuse to
/// start rather than run with undefined batching behavior.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Batch size below the minimum of one
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    /// Non-positive sending rate
    #[error("sending rate must be positive")]
    InvalidSendingRate,
    /// Probability or output fraction outside [0.0, 1.0]
    #[error("probability must be within [0.0, 1.0], got {0}")]
    InvalidProbability(f64),
    /// Non-positive standard deviation for the binomial pool bias
    #[error("standard deviation must be positive")]
    InvalidStddev,
    /// Pool floor incompatible with the release threshold
    #[error("pool minimum {pool_min} must be below the threshold {threshold}")]
    InvalidPoolMin { pool_min: usize, threshold: usize },
    /// Non-positive maximum delay
    #[error("maximum delay must be positive")]
    InvalidMaxDelay,
    /// Exponential distribution rate error (stop-and-go)
    #[error("exponential distribution error: {0}")]
    Exp(#[from] rand_distr::ExpError),
    /// The engine task has stopped and no longer accepts input
    #[error("mix engine has stopped")]
    EngineStopped,
}
