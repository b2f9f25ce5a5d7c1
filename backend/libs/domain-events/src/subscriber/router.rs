//! Topic to entity-family routing.

use std::collections::HashMap;

use crate::events::EventFamily;
use crate::topics::TopicCatalog;

/// Picks the decoder family for a topic.
///
/// Explicit routes win. Otherwise the topic is matched case-insensitively
/// against the family names in declaration order (`payment`, `invoice`,
/// `transaction`, `shipping`, `tracking`) and the first hit is used, so a
/// message is never decoded twice.
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    routes: HashMap<String, EventFamily>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router seeded with the catalog's topics and configured routes.
    pub fn from_catalog(catalog: &TopicCatalog) -> Self {
        catalog
            .routes()
            .into_iter()
            .fold(Self::new(), |router, (topic, family)| {
                router.with_route(topic, family)
            })
    }

    /// Add an explicit route. The first route for a topic is kept.
    pub fn with_route(mut self, topic: impl AsRef<str>, family: EventFamily) -> Self {
        self.routes
            .entry(topic.as_ref().to_ascii_lowercase())
            .or_insert(family);
        self
    }

    pub fn route(&self, topic: &str) -> Option<EventFamily> {
        let lowered = topic.to_ascii_lowercase();
        if let Some(family) = self.routes.get(&lowered) {
            return Some(*family);
        }
        EventFamily::ALL
            .into_iter()
            .find(|family| lowered.contains(family.as_str()))
    }
}
