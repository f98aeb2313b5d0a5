//! Stream and topic topology declarations
//!
//! Each logical service declares the streams it owns as a pure function
//! returning an ordered list of [`StreamDefinition`]. The
//! [`TopologyRegistry`] collects those declarations so they can be
//! provisioned on the broker and used to validate consumer bindings.

pub mod catalog;
pub mod subject;

use crate::error::{EventError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message retention policy of a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetentionPolicy {
    /// Messages are removed once every known consumer has acknowledged them
    #[default]
    InterestBased,
    /// Messages are removed by age or size regardless of consumption
    LimitsBased,
}

/// Declaration of a durable stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDefinition {
    /// Stream name (e.g., "lesson")
    pub name: String,

    /// Subject patterns captured by the stream, in declaration order
    pub subjects: Vec<String>,

    /// Replication factor
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Retention policy
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Maximum stream size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<i64>,

    /// Maximum message age in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
}

fn default_replicas() -> usize {
    3
}

impl StreamDefinition {
    /// Start a declaration with default replicas and interest retention
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
            replicas: default_replicas(),
            retention: RetentionPolicy::default(),
            max_bytes: None,
            max_age_secs: None,
        }
    }

    /// Add a subject pattern; duplicates are ignored
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        let subject = subject.into();
        if !self.subjects.contains(&subject) {
            self.subjects.push(subject);
        }
        self
    }

    pub fn replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn max_bytes(mut self, max_bytes: i64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = Some(max_age.as_secs());
        self
    }

    /// Maximum message age, if limited
    pub fn max_age_duration(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }

    /// Whether this stream carries every subject `filter` can match
    pub fn covers(&self, filter: &str) -> bool {
        self.subjects
            .iter()
            .any(|pattern| subject::covers(pattern, filter))
    }

    /// Whether a concrete subject is captured by this stream
    pub fn captures(&self, subject_name: &str) -> bool {
        self.subjects
            .iter()
            .any(|pattern| subject::matches(pattern, subject_name))
    }

    /// Check the declaration is well-formed
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(|c: char| matches!(c, '.' | '*' | '>' | ' ')) {
            return Err(EventError::Config(format!(
                "Invalid stream name '{}'",
                self.name
            )));
        }
        if self.subjects.is_empty() {
            return Err(EventError::Config(format!(
                "Stream '{}' declares no subjects",
                self.name
            )));
        }
        if self.replicas == 0 {
            return Err(EventError::Config(format!(
                "Stream '{}' must have at least one replica",
                self.name
            )));
        }
        for s in &self.subjects {
            subject::validate(s)?;
        }
        Ok(())
    }
}

/// Declaration of a topic on the secondary simple-queue broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDefinition {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u16,
}

impl TopicDefinition {
    pub fn new(name: impl Into<String>, partitions: u32, replication_factor: u16) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// Streams and topics owned by one logical service
#[derive(Debug, Clone)]
pub struct ServiceTopology {
    pub service: String,
    pub streams: Vec<StreamDefinition>,
    pub topics: Vec<TopicDefinition>,
}

/// Ordered collection of per-service topology declarations
#[derive(Debug, Clone, Default)]
pub struct TopologyRegistry {
    services: Vec<ServiceTopology>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service's stream declarations
    pub fn register(
        &mut self,
        service: impl Into<String>,
        declare: fn() -> Vec<StreamDefinition>,
    ) -> &mut Self {
        let entry = self.entry(service.into());
        entry.streams.extend(declare());
        self
    }

    /// Register a service's simple-queue topic declarations
    pub fn register_topics(
        &mut self,
        service: impl Into<String>,
        declare: fn() -> Vec<TopicDefinition>,
    ) -> &mut Self {
        let entry = self.entry(service.into());
        entry.topics.extend(declare());
        self
    }

    fn entry(&mut self, service: String) -> &mut ServiceTopology {
        let idx = match self.services.iter().position(|s| s.service == service) {
            Some(idx) => idx,
            None => {
                self.services.push(ServiceTopology {
                    service,
                    streams: Vec::new(),
                    topics: Vec::new(),
                });
                self.services.len() - 1
            }
        };
        &mut self.services[idx]
    }

    /// Registered services in registration order
    pub fn services(&self) -> &[ServiceTopology] {
        &self.services
    }

    /// All streams in registration then declaration order
    pub fn streams(&self) -> impl Iterator<Item = &StreamDefinition> {
        self.services.iter().flat_map(|s| s.streams.iter())
    }

    /// All simple-queue topics in registration then declaration order
    pub fn topics(&self) -> impl Iterator<Item = &TopicDefinition> {
        self.services.iter().flat_map(|s| s.topics.iter())
    }

    /// Look up a stream by name
    pub fn stream(&self, name: &str) -> Option<&StreamDefinition> {
        self.streams().find(|s| s.name == name)
    }

    /// Find the stream capturing a concrete subject
    pub fn stream_for_subject(&self, subject_name: &str) -> Option<&StreamDefinition> {
        self.streams().find(|s| s.captures(subject_name))
    }

    /// Validate the whole topology
    ///
    /// Every stream must be well-formed, stream names must be unique and no
    /// two streams may capture the same subject.
    pub fn validate(&self) -> Result<()> {
        let streams: Vec<&StreamDefinition> = self.streams().collect();

        for (i, stream) in streams.iter().enumerate() {
            stream.validate()?;

            for other in &streams[i + 1..] {
                if other.name == stream.name {
                    return Err(EventError::Config(format!(
                        "Stream '{}' is declared more than once",
                        stream.name
                    )));
                }
                for a in &stream.subjects {
                    for b in &other.subjects {
                        if subject::overlaps(a, b) {
                            return Err(EventError::Config(format!(
                                "Streams '{}' and '{}' overlap on subjects '{}' / '{}'",
                                stream.name, other.name, a, b
                            )));
                        }
                    }
                }
            }
        }

        let mut topic_names = std::collections::HashSet::new();
        for topic in self.topics() {
            if topic.partitions == 0 {
                return Err(EventError::Config(format!(
                    "Topic '{}' must have at least one partition",
                    topic.name
                )));
            }
            if !topic_names.insert(topic.name.as_str()) {
                return Err(EventError::Config(format!(
                    "Topic '{}' is declared more than once",
                    topic.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lesson_streams() -> Vec<StreamDefinition> {
        vec![StreamDefinition::new("lesson")
            .subject("Lesson.*")
            .retention(RetentionPolicy::InterestBased)]
    }

    fn chat_streams() -> Vec<StreamDefinition> {
        vec![
            StreamDefinition::new("chat").subject("chat.chat.>"),
            StreamDefinition::new("chatmessage")
                .subject("ChatMessage.Created")
                .subject("ChatMessage.Deleted"),
        ]
    }

    fn clashing_streams() -> Vec<StreamDefinition> {
        vec![StreamDefinition::new("lesson2").subject("Lesson.Created")]
    }

    fn topics() -> Vec<TopicDefinition> {
        vec![TopicDefinition::new("student_event_logs", 3, 1)]
    }

    #[test]
    fn test_builder_dedups_subjects() {
        let stream = StreamDefinition::new("s").subject("A.B").subject("A.B").subject("A.C");
        assert_eq!(stream.subjects, vec!["A.B", "A.C"]);
        assert_eq!(stream.replicas, 3);
        assert_eq!(stream.retention, RetentionPolicy::InterestBased);
    }

    #[test]
    fn test_covers_and_captures() {
        let stream = &lesson_streams()[0];
        assert!(stream.captures("Lesson.Created"));
        assert!(stream.covers("Lesson.Deleted"));
        assert!(!stream.covers("Lesson.>"));
        assert!(!stream.captures("Chat.Created"));
    }

    #[test]
    fn test_registry_order_is_deterministic() {
        let mut registry = TopologyRegistry::new();
        registry
            .register("lessonmgmt", lesson_streams)
            .register("tom", chat_streams)
            .register_topics("tom", topics);

        let names: Vec<&str> = registry.streams().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["lesson", "chat", "chatmessage"]);
        assert_eq!(registry.services().len(), 2);
        assert_eq!(registry.topics().count(), 1);
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = TopologyRegistry::new();
        registry.register("lessonmgmt", lesson_streams).register("tom", chat_streams);

        assert_eq!(registry.stream("chat").unwrap().subjects, vec!["chat.chat.>"]);
        assert_eq!(
            registry.stream_for_subject("ChatMessage.Deleted").unwrap().name,
            "chatmessage"
        );
        assert!(registry.stream_for_subject("Unknown.Subject").is_none());
    }

    #[test]
    fn test_registry_rejects_overlap() {
        let mut registry = TopologyRegistry::new();
        registry.register("lessonmgmt", lesson_streams).register("bob", clashing_streams);
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut registry = TopologyRegistry::new();
        registry.register("a", lesson_streams).register("b", lesson_streams);
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_stream_validate() {
        assert!(StreamDefinition::new("bad.name").subject("A").validate().is_err());
        assert!(StreamDefinition::new("empty").validate().is_err());
        assert!(StreamDefinition::new("zero").subject("A").replicas(0).validate().is_err());
        assert!(StreamDefinition::new("ok").subject("A.>").validate().is_ok());
    }

    #[test]
    fn test_stream_serialization() {
        let stream = StreamDefinition::new("studentpackage")
            .subject("StudentPackage.Upserted")
            .retention(RetentionPolicy::LimitsBased)
            .max_age(Duration::from_secs(3600));

        let json = serde_json::to_string(&stream).unwrap();
        assert!(json.contains("\"retention\":\"limitsBased\""));
        assert!(json.contains("\"maxAgeSecs\":3600"));
        assert!(!json.contains("maxBytes"));

        let parsed: StreamDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, stream);
        assert_eq!(parsed.max_age_duration(), Some(Duration::from_secs(3600)));
    }
}
