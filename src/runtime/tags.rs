//! Stream tags: offset-keyed metadata attached to sample positions
//!
//! A tag rides alongside the sample stream at an absolute item offset
//! (counted from stream start). Producers attach tags when they post
//! items; consumers see a snapshot of the tags covering their input
//! window. Offsets are translated by the executor when tags cross a
//! rate-changing block.

/// Value payload carried by a [`Tag`]
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Bool(bool),
    U64(u64),
    F64(f64),
    Str(String),
}

/// A single tag: key/value metadata pinned to an absolute item offset
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Absolute item offset since stream start
    pub offset: u64,
    pub key: String,
    pub value: TagValue,
}

impl Tag {
    pub fn new(offset: u64, key: impl Into<String>, value: TagValue) -> Self {
        Self {
            offset,
            key: key.into(),
            value,
        }
    }
}

/// How the executor forwards input tags to a block's outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagPropagation {
    /// Copy every tag in the consumed window to every output, scaling the
    /// offset by the block's rate ratio
    #[default]
    All,
    /// Forward nothing; the block emits its own tags if it wants any
    None,
}
