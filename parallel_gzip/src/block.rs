//! Chunks flowing through the pipeline.

use std::sync::Arc;

use crate::succession::SuccessionNode;

/// A chunk read from the input, waiting to be transformed.
#[derive(Debug)]
pub struct InputChunk {
    data: Vec<u8>,
    original_len: u64,
    node: Arc<SuccessionNode>,
}

impl InputChunk {
    /// Creates a chunk whose succession node follows `previous`.
    ///
    /// Must be called on the reading thread, in read order.
    pub fn new(data: Vec<u8>, original_len: u64, previous: Option<&Arc<SuccessionNode>>) -> Self {
        Self {
            data,
            original_len,
            node: SuccessionNode::next(previous),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Length of the chunk's plain (uncompressed) content.
    pub fn original_len(&self) -> u64 {
        self.original_len
    }

    pub fn node(&self) -> &Arc<SuccessionNode> {
        &self.node
    }

    /// Replaces the payload with its transformed form, keeping the chunk's
    /// place in the succession chain.
    pub fn into_output(self, data: Vec<u8>) -> OutputChunk {
        OutputChunk {
            data,
            original_len: self.original_len,
            node: self.node,
        }
    }
}

/// A transformed chunk, ready to be written.
#[derive(Debug)]
pub struct OutputChunk {
    data: Vec<u8>,
    original_len: u64,
    node: Arc<SuccessionNode>,
}

impl OutputChunk {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn original_len(&self) -> u64 {
        self.original_len
    }

    /// True if no chunk has been read after this one.
    pub fn is_tail(&self) -> bool {
        self.node.is_tail()
    }

    pub fn node(&self) -> &Arc<SuccessionNode> {
        &self.node
    }
}
