use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::types::RDKafkaErrorCode;

use super::codec::MessagingError;
use crate::config::KafkaConfig;

fn new_topics(topics: &[String], partitions: i32) -> Vec<NewTopic<'_>> {
    topics
        .iter()
        .map(|topic| NewTopic::new(topic, partitions.max(1), TopicReplication::Fixed(1)))
        .collect()
}

/// Create the notification topics. Topics that already exist are fine;
/// returns the ones created by this call.
pub async fn create_topics(config: &KafkaConfig, topics: &[String]) -> Result<Vec<String>, MessagingError> {
    if topics.is_empty() {
        return Ok(Vec::new());
    }

    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("client.id", &config.client_id)
        .create()?;

    let results = admin
        .create_topics(&new_topics(topics, config.topic_partitions), &AdminOptions::new())
        .await?;

    let mut created = Vec::new();
    for result in results {
        match result {
            Ok(topic) => {
                tracing::info!(topic = %topic, partitions = config.topic_partitions, "Created topic");
                created.push(topic);
            }
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                tracing::debug!(topic = %topic, "Topic already exists");
            }
            Err((topic, code)) => {
                tracing::error!(topic = %topic, code = ?code, "Failed to create topic");
                return Err(MessagingError::Kafka(rdkafka::error::KafkaError::AdminOp(code)));
            }
        }
    }

    Ok(created)
}
