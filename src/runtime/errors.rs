//! Error types for the runtime system

/// Error type for graph construction and finalization
///
/// All of these are detected synchronously, before any scheduler thread
/// starts.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Block '{0}' not found")]
    BlockNotFound(String),

    #[error("Block with name '{0}' already exists")]
    DuplicateName(String),

    #[error("Port index {port} out of range for block '{block}'")]
    PortOutOfRange { block: String, port: usize },

    #[error(
        "Item size mismatch: {from_block}.{from_port} ({from_size} bytes) -> {to_block}.{to_port} ({to_size} bytes)"
    )]
    ItemSizeMismatch {
        from_block: String,
        from_port: usize,
        from_size: usize,
        to_block: String,
        to_port: usize,
        to_size: usize,
    },

    #[error("Input port {port} on block '{block}' is already connected")]
    DuplicateConnection { block: String, port: usize },

    #[error("Connecting '{from_block}' -> '{to_block}' would create a cycle")]
    CycleDetected {
        from_block: String,
        to_block: String,
    },

    #[error("Block '{block}' requires at least {required} connected input(s), has {connected}")]
    MissingInputs {
        block: String,
        required: usize,
        connected: usize,
    },

    #[error("Block '{block}' requires at least {required} connected output(s), has {connected}")]
    MissingOutputs {
        block: String,
        required: usize,
        connected: usize,
    },

    #[error("Input ports on block '{block}' must be connected densely from port 0; port {port} is unconnected")]
    SparseInputs { block: String, port: usize },

    #[error("Output ports on block '{block}' must be connected densely from port 0; port {port} is unconnected")]
    SparseOutputs { block: String, port: usize },

    #[error("Block '{0}' is already assigned to a block group")]
    AlreadyGrouped(String),
}

/// Error type for work function operations
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("Block-specific error: {0}")]
    BlockError(String),

    #[error("Block contract violation in '{block}': {detail}")]
    ContractViolation { block: String, detail: String },
}

/// Error returned by `Scheduler::wait` when a block failed during the run
#[derive(Debug, thiserror::Error)]
#[error("Block '{block}' failed: {source}")]
pub struct RunError {
    pub block: String,
    #[source]
    pub source: WorkError,
}

/// Result type for work functions
pub type WorkResult<T = ()> = Result<T, WorkError>;
