//! Entity templates consumed by `World::create_entity`.
//!
//! The registry is assembled once at startup (built-ins plus `[[templates]]`
//! entries from the config file) and shared read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityKind};
use super::equipment::Layer;
use super::serial::Serial;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Template {
    pub name: String,
    pub kind: EntityKind,
    /// Display name with article; defaults to the template name.
    pub display_name: String,
    pub hue: u16,
    pub weight: u16,
    pub layer: Option<Layer>,
    pub amount: u16,
    pub movable: bool,
    pub body: u16,
    pub max_weight: Option<u32>,
    pub max_items: Option<u16>,
    pub events: Vec<String>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: EntityKind::Item,
            display_name: String::new(),
            hue: 0,
            weight: 1,
            layer: None,
            amount: 1,
            movable: true,
            body: 0,
            max_weight: None,
            max_items: None,
            events: Vec::new(),
        }
    }
}

impl Template {
    fn item(name: &str, display: &str, weight: u16) -> Self {
        Self {
            name: name.to_string(),
            display_name: display.to_string(),
            weight,
            ..Default::default()
        }
    }

    fn container(name: &str, display: &str, weight: u16) -> Self {
        Self {
            kind: EntityKind::Container,
            ..Self::item(name, display, weight)
        }
    }

    fn mobile(name: &str, display: &str, body: u16) -> Self {
        Self {
            kind: EntityKind::Mobile,
            body,
            weight: 0,
            ..Self::item(name, display, 0)
        }
    }

    fn worn(mut self, layer: Layer) -> Self {
        self.layer = Some(layer);
        self
    }

    fn capped(mut self, max_weight: u32, max_items: u16) -> Self {
        self.max_weight = Some(max_weight);
        self.max_items = Some(max_items);
        self
    }

    /// Fresh entity built from this template.
    pub fn instantiate(&self, serial: Serial) -> Entity {
        let mut entity = Entity::blank(self.kind, serial);
        entity.template = self.name.clone();
        entity.name = if self.display_name.is_empty() {
            self.name.clone()
        } else {
            self.display_name.clone()
        };
        entity.hue = self.hue;
        entity.weight = self.weight;
        entity.events = self.events.clone();
        if let Some(item) = entity.item_mut() {
            item.layer = self.layer;
            item.amount = self.amount.max(1);
            item.movable = self.movable;
        }
        if let Some(container) = entity.container_mut() {
            container.max_weight = self.max_weight;
            container.max_items = self.max_items;
        }
        if let Some(mobile) = entity.mobile_mut() {
            mobile.body = self.body;
        }
        entity
    }
}

/// Templates every world knows about without configuration.
pub fn builtin_templates() -> Vec<Template> {
    vec![
        Template::container("backpack", "a backpack", 3)
            .worn(Layer::Backpack)
            .capped(400, 125),
        Template::container("bankbox", "a bank box", 0)
            .worn(Layer::Bank)
            .capped(1600, 125),
        Template::container("bag", "a bag", 2),
        Template::container("pouch", "a pouch", 1).capped(100, 20),
        Template::item("gold", "gold coins", 0),
        Template::item("dagger", "a dagger", 1).worn(Layer::OneHanded),
        Template::item("shirt", "a shirt", 1).worn(Layer::Shirt),
        Template::item("helm", "a helm", 5).worn(Layer::Helm),
        Template::mobile("human", "a human", 0x190),
        Template::mobile("horse", "a horse", 0xC8),
    ]
}

#[derive(Debug, Default)]
pub struct TemplateRegistryBuilder {
    templates: HashMap<String, Template>,
}

impl TemplateRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(mut self) -> Self {
        for template in builtin_templates() {
            self.templates.insert(template.name.clone(), template);
        }
        self
    }

    /// Add or replace a template. Later additions win.
    pub fn add(mut self, template: Template) -> Self {
        self.templates.insert(template.name.clone(), template);
        self
    }

    pub fn extend(mut self, templates: impl IntoIterator<Item = Template>) -> Self {
        for template in templates {
            self.templates.insert(template.name.clone(), template);
        }
        self
    }

    pub fn build(self) -> Arc<TemplateRegistry> {
        Arc::new(TemplateRegistry {
            templates: self.templates,
        })
    }
}

#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl TemplateRegistry {
    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_include_backpack_and_human() {
        let registry = TemplateRegistryBuilder::new().with_builtins().build();
        let backpack = registry.get("backpack").expect("backpack");
        assert_eq!(backpack.kind, EntityKind::Container);
        assert_eq!(backpack.layer, Some(Layer::Backpack));
        assert_eq!(registry.get("human").map(|t| t.kind), Some(EntityKind::Mobile));
    }

    #[test]
    fn later_template_replaces_builtin() {
        let registry = TemplateRegistryBuilder::new()
            .with_builtins()
            .add(Template {
                name: "bag".into(),
                kind: EntityKind::Container,
                weight: 9,
                ..Default::default()
            })
            .build();
        assert_eq!(registry.get("bag").map(|t| t.weight), Some(9));
    }

    #[test]
    fn instantiate_copies_fields() {
        let template = Template::container("pouch", "a pouch", 1).capped(100, 20);
        let entity = template.instantiate(Serial::new(0x4000_0009));
        assert_eq!(entity.name, "a pouch");
        assert_eq!(entity.template, "pouch");
        assert_eq!(entity.container().and_then(|c| c.max_items), Some(20));
        assert_eq!(entity.kind(), EntityKind::Container);
    }

    #[test]
    fn partial_toml_template_uses_defaults() {
        let template: Template = toml::from_str("name = \"torch\"\nweight = 2\n").expect("parse");
        assert_eq!(template.kind, EntityKind::Item);
        assert_eq!(template.amount, 1);
        assert!(template.movable);
    }
}
