//! Topic catalog: (entity family, event kind) to topic name.
//!
//! Built once at startup. Every declared pair defaults to
//! `{family}-{kind}` (`payment-status-changed`) and can be overridden with
//! `kafka.{family}.{kind}.topic`. An absent or empty pair is a startup error,
//! so `topic_for` never fails for a validated catalog.

use std::collections::BTreeMap;

use config::{Config, ConfigError};

use crate::error::TopicError;
use crate::events::{EventFamily, EventKind};

pub const DEFAULT_BROKERS: &str = "localhost:9092";

/// Default topic name for a pair.
pub fn default_topic(family: EventFamily, kind: EventKind) -> String {
    format!("{}-{}", family.as_str(), kind.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCatalog {
    topics: BTreeMap<(EventFamily, EventKind), String>,
    brokers: Vec<String>,
    group_id: String,
    consumer_enabled: bool,
    subscriptions: Vec<String>,
    routes: Vec<(String, EventFamily)>,
}

impl TopicCatalog {
    /// Catalog with every default applied.
    pub fn with_defaults(service: &str) -> Self {
        let topics = EventFamily::ALL
            .into_iter()
            .flat_map(|family| {
                family
                    .kinds()
                    .iter()
                    .map(move |kind| ((family, *kind), default_topic(family, *kind)))
            })
            .collect();

        let mut catalog = Self {
            topics,
            brokers: vec![DEFAULT_BROKERS.to_string()],
            group_id: format!("{}-group", service),
            consumer_enabled: true,
            subscriptions: Vec::new(),
            routes: Vec::new(),
        };
        catalog.subscriptions = catalog.all_topics();
        catalog
    }

    /// Read the `kafka.*` keys, falling back to defaults for absent keys.
    pub fn from_config(config: &Config, service: &str) -> Result<Self, TopicError> {
        let mut catalog = Self::with_defaults(service);

        if let Some(brokers) = optional(config.get_string("kafka.brokers"))? {
            catalog.brokers = split_list(&brokers);
        }
        if let Some(group) = optional(config.get_string("kafka.consumer.group"))? {
            catalog.group_id = group;
        }
        if let Some(enabled) = optional(config.get_bool("kafka.consumer.enable"))? {
            catalog.consumer_enabled = enabled;
        }

        for family in EventFamily::ALL {
            for kind in family.kinds() {
                if let Some(topic) = topic_override(config, family, *kind)? {
                    catalog.topics.insert((family, *kind), topic.trim().to_string());
                }
            }
        }

        catalog.subscriptions = match optional(config.get_string("kafka.consumer.topics"))? {
            Some(topics) => split_list(&topics),
            None => catalog.all_topics(),
        };

        if let Some(routes) = optional(config.get_string("kafka.consumer.routes"))? {
            catalog.routes = parse_routes(&routes)?;
        }

        catalog.validate()?;
        Ok(catalog)
    }

    /// Override one pair's topic (mainly for tests and embedded use).
    pub fn with_topic(mut self, family: EventFamily, kind: EventKind, topic: impl Into<String>) -> Self {
        let had_default_subscriptions = self.subscriptions == self.all_topics();
        self.topics.insert((family, kind), topic.into());
        if had_default_subscriptions {
            self.subscriptions = self.all_topics();
        }
        self
    }

    pub fn with_route(mut self, topic: impl Into<String>, family: EventFamily) -> Self {
        self.routes.push((topic.into(), family));
        self
    }

    /// Fail loudly on any declared pair without a usable topic.
    pub fn validate(&self) -> Result<(), TopicError> {
        for family in EventFamily::ALL {
            for kind in family.kinds() {
                self.topic_for(family, *kind)?;
            }
        }
        Ok(())
    }

    pub fn topic_for(&self, family: EventFamily, kind: EventKind) -> Result<&str, TopicError> {
        match self.topics.get(&(family, kind)) {
            Some(topic) if !topic.trim().is_empty() => Ok(topic.as_str()),
            Some(_) => Err(TopicError::Empty { family, kind }),
            None => Err(TopicError::Undeclared { family, kind }),
        }
    }

    /// The slice of the catalog one publisher needs.
    pub fn family(&self, family: EventFamily) -> Result<FamilyTopics, TopicError> {
        let mut topics = BTreeMap::new();
        for kind in family.kinds() {
            topics.insert(*kind, self.topic_for(family, *kind)?.to_string());
        }
        Ok(FamilyTopics { family, topics })
    }

    /// Union of every catalog topic, first occurrence order, no duplicates.
    pub fn all_topics(&self) -> Vec<String> {
        let mut all: Vec<String> = Vec::new();
        for family in EventFamily::ALL {
            for kind in family.kinds() {
                if let Some(topic) = self.topics.get(&(family, *kind)) {
                    if !topic.is_empty() && !all.contains(topic) {
                        all.push(topic.clone());
                    }
                }
            }
        }
        all
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    /// Comma-joined broker list for `bootstrap.servers`.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn consumer_enabled(&self) -> bool {
        self.consumer_enabled
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Explicit topic to family routes, configured ones first, then one per
    /// catalog topic.
    pub fn routes(&self) -> Vec<(String, EventFamily)> {
        let mut routes = self.routes.clone();
        for ((family, _), topic) in &self.topics {
            if !routes.iter().any(|(t, _)| t.eq_ignore_ascii_case(topic)) {
                routes.push((topic.clone(), *family));
            }
        }
        routes
    }
}

/// Kind to topic map for a single family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyTopics {
    family: EventFamily,
    topics: BTreeMap<EventKind, String>,
}

impl FamilyTopics {
    pub fn family(&self) -> EventFamily {
        self.family
    }

    pub fn topic(&self, kind: EventKind) -> Result<&str, TopicError> {
        self.topics
            .get(&kind)
            .map(String::as_str)
            .ok_or(TopicError::Undeclared {
                family: self.family,
                kind,
            })
    }
}

pub(crate) fn optional<T>(result: Result<T, ConfigError>) -> Result<Option<T>, TopicError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn topic_override(
    config: &Config,
    family: EventFamily,
    kind: EventKind,
) -> Result<Option<String>, TopicError> {
    let hyphenated = format!("kafka.{}.{}.topic", family.as_str(), kind.as_str());
    if let Some(topic) = optional(config.get_string(&hyphenated))? {
        return Ok(Some(topic));
    }
    // Environment variables cannot carry hyphens portably.
    let underscored = format!(
        "kafka.{}.{}.topic",
        family.as_str(),
        kind.as_str().replace('-', "_")
    );
    optional(config.get_string(&underscored))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_routes(raw: &str) -> Result<Vec<(String, EventFamily)>, TopicError> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            let (topic, family) = entry
                .split_once('=')
                .ok_or_else(|| TopicError::InvalidRoute(entry.clone()))?;
            let family = family
                .parse::<EventFamily>()
                .map_err(|_| TopicError::InvalidRoute(entry.clone()))?;
            let topic = topic.trim();
            if topic.is_empty() {
                return Err(TopicError::InvalidRoute(entry.clone()));
            }
            Ok((topic.to_string(), family))
        })
        .collect()
}
