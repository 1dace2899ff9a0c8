//! Collaborative array shared type.

use crate::item::{Content, Item, ItemSnapshot, TypeRef};
use crate::yata::ItemChain;

/// One visible element of an array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element<'a> {
    /// A plain JSON-like value
    Value(&'a serde_json::Value),
    /// A nested shared type
    Type(&'a TypeRef),
}

/// A replicated list of values or nested types built on the YATA chain.
#[derive(Debug, Clone, Default)]
pub struct YArray {
    chain: ItemChain,
}

impl YArray {
    /// Create an empty array.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible elements.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.chain.len()
    }

    /// Whether the array is empty.
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

    /// Iterate over visible elements in order.
    pub fn iter(&self) -> impl Iterator<Item = Element<'_>> {
        self.chain.visible().flat_map(|content| {
            let elements: Vec<Element<'_>> = match content {
                Content::Any(values) => values.iter().map(Element::Value).collect(),
                Content::Type(r) => vec![Element::Type(r)],
                Content::Text(_) => Vec::new(),
            };
            elements
        })
    }

    /// Get the element at a visible index.
    #[must_use]
    pub fn get(&self, index: u32) -> Option<Element<'_>> {
        self.iter().nth(index as usize)
    }

    /// Plain values in order; nested types are skipped.
    #[must_use]
    pub fn to_vec(&self) -> Vec<serde_json::Value> {
        self.iter()
            .filter_map(|element| match element {
                Element::Value(v) => Some(v.clone()),
                Element::Type(_) => None,
            })
            .collect()
    }

    /// Every item, tombstones included, in document order.
    #[must_use]
    pub fn to_snapshot(&self) -> Vec<ItemSnapshot> {
        self.chain.iter().map(Item::to_snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::{Hlc, NodeId};
    use crate::item::{Id, TypeKind};
    use serde_json::json;

    #[test]
    fn iter_expands_batched_values() {
        let mut array = YArray::new();
        let id = Id::new(Hlc::new(1, 0, NodeId::from("a")));
        let values = Item::new(
            id.clone(),
            Content::Any(vec![json!(1), json!(2)]),
            None,
            None,
            "arr",
        );
        array.chain_mut().integrate(values);
        let nested = Item::new(
            id.offset(2),
            Content::Type(TypeRef {
                key: "child".into(),
                kind: TypeKind::Map,
            }),
            Some(id.offset(1)),
            None,
            "arr",
        );
        array.chain_mut().integrate(nested);

        assert_eq!(array.len(), 3);
        assert_eq!(array.get(1), Some(Element::Value(&json!(2))));
        assert!(matches!(array.get(2), Some(Element::Type(r)) if r.key == "child"));
        assert_eq!(array.to_vec(), vec![json!(1), json!(2)]);
    }
}
