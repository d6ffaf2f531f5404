use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Event Names & Topics
// ============================================================================
//
// Canonical form:  service.aggregate:eventName   (authentication.user:created)
// Topic form:      service.events.aggregate      (authentication.events.user)
//
// The topic is used both for in-process listener filters and as the broker
// topic, so every component is restricted to ASCII letters.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid event name: {0}")]
pub struct InvalidEventName(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventName {
    service: String,
    aggregate: String,
    event: String,
}

impl EventName {
    pub fn new(service: &str, aggregate: &str, event: &str) -> Result<Self, InvalidEventName> {
        if ![service, aggregate, event].iter().all(|part| is_component(part)) {
            return Err(InvalidEventName(format!("{service}.{aggregate}:{event}")));
        }

        Ok(Self {
            service: service.to_string(),
            aggregate: aggregate.to_string(),
            event: event.to_string(),
        })
    }

    /// Accepts `service.aggregate:event` and the older dotted
    /// `service.aggregate.event` spelling.
    pub fn parse(name: &str) -> Result<Self, InvalidEventName> {
        let invalid = || InvalidEventName(name.to_string());

        let (service, rest) = name.split_once('.').ok_or_else(invalid)?;
        let (aggregate, event) = rest
            .split_once(':')
            .or_else(|| rest.split_once('.'))
            .ok_or_else(invalid)?;

        Self::new(service, aggregate, event).map_err(|_| invalid())
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn aggregate(&self) -> &str {
        &self.aggregate
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn topic(&self) -> String {
        format!("{}.events.{}", self.service, self.aggregate)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.service, self.aggregate, self.event)
    }
}

impl FromStr for EventName {
    type Err = InvalidEventName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EventName {
    type Error = InvalidEventName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        name.to_string()
    }
}

/// `true` for topics shaped like `service.events.aggregate`.
pub fn is_valid_topic(topic: &str) -> bool {
    let mut parts = topic.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(service), Some("events"), Some(aggregate), None) => {
            is_component(service) && is_component(aggregate)
        }
        _ => false,
    }
}

fn is_component(part: &str) -> bool {
    !part.is_empty() && part.chars().all(|c| c.is_ascii_alphabetic())
}
