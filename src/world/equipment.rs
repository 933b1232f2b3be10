//! Equipment layers and the per-mobile equipment set.

use serde::{Deserialize, Serialize};

use super::serial::Serial;

/// Wear layer. The discriminant is the on-disk byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Layer {
    OneHanded = 1,
    TwoHanded = 2,
    Shoes = 3,
    Pants = 4,
    Shirt = 5,
    Helm = 6,
    Gloves = 7,
    Ring = 8,
    Neck = 10,
    Hair = 11,
    Waist = 12,
    InnerTorso = 13,
    Bracelet = 14,
    Beard = 16,
    MiddleTorso = 17,
    Earrings = 18,
    Arms = 19,
    Cloak = 20,
    Backpack = 21,
    OuterTorso = 22,
    OuterLegs = 23,
    InnerLegs = 24,
    Mount = 25,
    Bank = 29,
}

const LAYER_COUNT: usize = 24;

impl Layer {
    pub const ALL: [Layer; LAYER_COUNT] = [
        Layer::OneHanded,
        Layer::TwoHanded,
        Layer::Shoes,
        Layer::Pants,
        Layer::Shirt,
        Layer::Helm,
        Layer::Gloves,
        Layer::Ring,
        Layer::Neck,
        Layer::Hair,
        Layer::Waist,
        Layer::InnerTorso,
        Layer::Bracelet,
        Layer::Beard,
        Layer::MiddleTorso,
        Layer::Earrings,
        Layer::Arms,
        Layer::Cloak,
        Layer::Backpack,
        Layer::OuterTorso,
        Layer::OuterLegs,
        Layer::InnerLegs,
        Layer::Mount,
        Layer::Bank,
    ];

    pub fn from_code(code: u8) -> Option<Layer> {
        Layer::ALL.into_iter().find(|layer| *layer as u8 == code)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Layers whose contents do not count toward the carried weight.
    pub fn counts_toward_weight(self) -> bool {
        !matches!(self, Layer::Mount | Layer::Bank)
    }

    fn slot(self) -> usize {
        Layer::ALL
            .iter()
            .position(|layer| *layer == self)
            .unwrap_or_default()
    }
}

/// Fixed-size layer → entity mapping with a cached carried weight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EquipmentSet {
    slots: [Option<Serial>; LAYER_COUNT],
    weight: u32,
}

impl EquipmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, layer: Layer) -> Option<Serial> {
        self.slots[layer.slot()]
    }

    pub fn is_free(&self, layer: Layer) -> bool {
        self.get(layer).is_none()
    }

    /// Occupy `layer`. Fails without side effects if it is already taken.
    pub fn put(&mut self, layer: Layer, serial: Serial, weight: u32) -> bool {
        let slot = &mut self.slots[layer.slot()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(serial);
        if layer.counts_toward_weight() {
            self.weight += weight;
        }
        true
    }

    /// Vacate the layer holding `serial`, returning that layer.
    pub fn take(&mut self, serial: Serial, weight: u32) -> Option<Layer> {
        let layer = self.layer_of(serial)?;
        self.slots[layer.slot()] = None;
        if layer.counts_toward_weight() {
            self.weight = self.weight.saturating_sub(weight);
        }
        Some(layer)
    }

    pub fn layer_of(&self, serial: Serial) -> Option<Layer> {
        Layer::ALL
            .into_iter()
            .find(|layer| self.slots[layer.slot()] == Some(serial))
    }

    /// Occupied `(layer, serial)` pairs in layer order.
    pub fn iter(&self) -> impl Iterator<Item = (Layer, Serial)> + '_ {
        Layer::ALL
            .into_iter()
            .filter_map(|layer| self.slots[layer.slot()].map(|serial| (layer, serial)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached weight of everything worn, excluding mount and bank layers.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub(crate) fn adjust_weight(&mut self, delta: i64) {
        self.weight = (self.weight as i64 + delta).max(0) as u32;
    }

    pub(crate) fn set_weight(&mut self, weight: u32) {
        self.weight = weight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_codes_round_trip() {
        for layer in Layer::ALL {
            assert_eq!(Layer::from_code(layer.code()), Some(layer));
        }
        assert_eq!(Layer::from_code(0), None);
        assert_eq!(Layer::from_code(9), None);
    }

    #[test]
    fn occupied_layer_rejects_second_item() {
        let mut set = EquipmentSet::new();
        assert!(set.put(Layer::Helm, Serial::new(0x4000_0001), 3));
        assert!(!set.put(Layer::Helm, Serial::new(0x4000_0002), 4));
        assert_eq!(set.get(Layer::Helm), Some(Serial::new(0x4000_0001)));
        assert_eq!(set.weight(), 3);
    }

    #[test]
    fn mount_and_bank_are_weightless() {
        let mut set = EquipmentSet::new();
        set.put(Layer::Bank, Serial::new(0x4000_0001), 50);
        set.put(Layer::Mount, Serial::new(7), 400);
        set.put(Layer::Backpack, Serial::new(0x4000_0002), 5);
        assert_eq!(set.weight(), 5);
        assert_eq!(set.take(Serial::new(0x4000_0002), 5), Some(Layer::Backpack));
        assert_eq!(set.weight(), 0);
        assert_eq!(set.len(), 2);
    }
}
