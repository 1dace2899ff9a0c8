//! Collaborative text shared type.

use crate::item::{Content, ItemSnapshot};
use crate::yata::ItemChain;
use std::fmt;

/// A replicated string built on the YATA chain.
///
/// Indices and lengths count Unicode scalar values.
#[derive(Debug, Clone, Default)]
pub struct YText {
    chain: ItemChain,
}

impl YText {
    /// Create an empty text.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible characters.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.chain.len()
    }

    /// Whether the text is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// The underlying item chain.
    #[must_use]
    pub fn chain(&self) -> &ItemChain {
        &self.chain
    }

    pub(crate) fn chain_mut(&mut self) -> &mut ItemChain {
        &mut self.chain
    }

    /// Every item, tombstones included, in document order.
    #[must_use]
    pub fn to_snapshot(&self) -> Vec<ItemSnapshot> {
        self.chain.iter().map(crate::item::Item::to_snapshot).collect()
    }
}

impl fmt::Display for YText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for content in self.chain.visible() {
            if let Content::Text(run) = content {
                f.write_str(run)?;
            }
        }
        Ok(())
    }
}
