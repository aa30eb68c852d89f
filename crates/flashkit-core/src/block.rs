//! The unit of data that flows through a flash pipeline

/// A chunk of bytes travelling through the pipeline
///
/// Raw chunks read from a source carry no address. Blocks leaving the
/// [`Blocker`](crate::blocker::Blocker) are exactly one block size long, and
/// blocks that survive a sparse filter also carry their logical `address`
/// and absolute byte `position`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    /// Payload
    pub data: Vec<u8>,

    /// Logical block index
    pub address: Option<u64>,

    /// Absolute byte offset on the target (`address * block_size`)
    pub position: Option<u64>,
}

impl Block {
    /// Wrap a payload with no address
    pub fn raw(data: Vec<u8>) -> Self {
        Self {
            data,
            address: None,
            position: None,
        }
    }

    /// Wrap a payload destined for a specific block of the target
    pub fn addressed(data: Vec<u8>, address: u64, block_size: usize) -> Self {
        Self {
            data,
            address: Some(address),
            position: Some(address * block_size as u64),
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the block carries a target position
    pub fn is_addressed(&self) -> bool {
        self.position.is_some()
    }
}

impl From<Vec<u8>> for Block {
    fn from(data: Vec<u8>) -> Self {
        Self::raw(data)
    }
}
