//! Progress bus (C3): fan-out of per-job progress events to subscribers in
//! this process, with an optional Redis layer so a second process (e.g. a
//! horizontally scaled API tier) observes the same events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const LOCAL_CHANNEL_CAPACITY: usize = 256;

fn redis_channel(job_id: Uuid) -> String {
    format!("job_progress:{job_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub total_posters: i64,
    pub completed_posters: i64,
    pub failed_posters: i64,
    pub current_poster_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.completed_posters + self.failed_posters >= self.total_posters
    }
}

#[derive(Debug, Clone, Serialize)]
struct RedisEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    job_id: Uuid,
    data: &'a ProgressEvent,
    timestamp: DateTime<Utc>,
}

/// Local hub keyed by job id. A subscriber that joins mid-job gets nothing
/// retroactively here — callers who need a snapshot should read current
/// job/poster state from the store before subscribing.
pub struct ProgressBus {
    channels: DashMap<Uuid, broadcast::Sender<ProgressEvent>>,
    redis: Option<redis::Client>,
}

impl ProgressBus {
    pub fn new(redis_url: Option<&str>) -> Self {
        let redis = redis_url.and_then(|url| match redis::Client::open(url) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("progress bus: failed to build redis client: {e}, falling back to local-only");
                None
            }
        });
        ProgressBus { channels: DashMap::new(), redis }
    }

    pub fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        self.channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publishes to local subscribers and, if configured, to Redis so other
    /// processes subscribed via [`ProgressBus::psubscribe_all`] see it too.
    pub async fn publish(&self, event: ProgressEvent) {
        if let Some(sender) = self.channels.get(&event.job_id) {
            // A send error here just means no local receivers remain.
            let _ = sender.send(event.clone());
        }

        if let Some(client) = &self.redis {
            let envelope = RedisEnvelope { kind: "progress_update", job_id: event.job_id, data: &event, timestamp: event.timestamp };
            match serde_json::to_string(&envelope) {
                Ok(payload) => {
                    if let Err(e) = publish_to_redis(client, &redis_channel(event.job_id), payload).await {
                        tracing::warn!("progress bus: redis publish failed for job {}: {e}", event.job_id);
                    }
                }
                Err(e) => tracing::warn!("progress bus: failed to encode progress envelope: {e}"),
            }
        }

        if event.is_terminal() {
            self.channels.remove(&event.job_id);
        }
    }

    pub fn has_subscribers(&self, job_id: Uuid) -> bool {
        self.channels.get(&job_id).map(|s| s.receiver_count() > 0).unwrap_or(false)
    }
}

async fn publish_to_redis(client: &redis::Client, channel: &str, payload: String) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.publish::<_, _, ()>(channel, payload).await
}

/// Cross-process listener: subscribes to `job_progress:*` on Redis and
/// forwards decoded events into the local hub so a consumer on this process
/// doesn't care whether the publisher was itself or a sibling instance.
pub async fn run_redis_bridge(bus: Arc<ProgressBus>, redis_url: String) {
    loop {
        match try_bridge_once(&bus, &redis_url).await {
            Ok(()) => {}
            Err(e) => tracing::warn!("progress bus: redis bridge disconnected: {e}, retrying"),
        }
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}

async fn try_bridge_once(bus: &Arc<ProgressBus>, redis_url: &str) -> redis::RedisResult<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe("job_progress:*").await?;
    let mut stream = pubsub.on_message();
    use futures::StreamExt;
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("progress bus: malformed redis payload: {e}");
                continue;
            }
        };
        if let Ok(envelope) = serde_json::from_str::<serde_json::Value>(&payload) {
            if let Ok(event) = serde_json::from_value::<ProgressEvent>(envelope["data"].clone()) {
                if let Some(sender) = bus.channels.get(&event.job_id) {
                    let _ = sender.send(event);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(job_id: Uuid, completed: i64, total: i64) -> ProgressEvent {
        ProgressEvent {
            job_id,
            total_posters: total,
            completed_posters: completed,
            failed_posters: 0,
            current_poster_id: Some("poster-1".into()),
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = ProgressBus::new(None);
        let job_id = Uuid::new_v4();
        let mut rx = bus.subscribe(job_id);
        bus.publish(sample_event(job_id, 1, 5)).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.completed_posters, 1);
    }

    #[tokio::test]
    async fn terminal_event_tears_down_the_channel() {
        let bus = ProgressBus::new(None);
        let job_id = Uuid::new_v4();
        let _rx = bus.subscribe(job_id);
        assert!(bus.has_subscribers(job_id));
        bus.publish(sample_event(job_id, 5, 5)).await;
        assert!(!bus.has_subscribers(job_id));
    }
}
