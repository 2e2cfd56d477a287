// rust/pipeline-core/src/record/slots.rs

use std::collections::HashMap;

use crate::config::{SlotConfig, SlotKind};

/// Slot definitions indexed by slot id (the position in the configured list).
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    slots: Vec<SlotConfig>,
    by_name: HashMap<String, u16>,
}

impl SlotTable {
    /// Builds the table from configured slots. Slots past index `u16::MAX` are ignored.
    pub fn new(slots: &[SlotConfig]) -> Self {
        let slots: Vec<SlotConfig> = slots.iter().take(usize::from(u16::MAX) + 1).cloned().collect();
        let by_name = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i as u16))
            .collect();
        Self { slots, by_name }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, slot: u16) -> Option<&SlotConfig> {
        self.slots.get(usize::from(slot))
    }

    /// Whether `slot` is dense. Unknown slots are sparse.
    pub fn is_dense(&self, slot: u16) -> bool {
        self.get(slot).is_some_and(|s| s.dense)
    }

    pub fn is_used(&self, slot: u16) -> bool {
        self.get(slot).is_some_and(|s| s.used)
    }

    pub fn kind(&self, slot: u16) -> Option<SlotKind> {
        self.get(slot).map(|s| s.kind)
    }

    pub fn name(&self, slot: u16) -> Option<&str> {
        self.get(slot).map(|s| s.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let table = SlotTable::new(&[
            SlotConfig::sparse("user", SlotKind::Uint64),
            SlotConfig::dense("ctr", SlotKind::Float),
        ]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.index_of("ctr"), Some(1));
        assert_eq!(table.index_of("missing"), None);
        assert!(table.is_dense(1));
        assert!(!table.is_dense(0));
        assert!(!table.is_dense(7));
        assert_eq!(table.kind(1), Some(SlotKind::Float));
        assert_eq!(table.name(0), Some("user"));
    }
}
