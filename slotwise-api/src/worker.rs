use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use slotwise_core::RetryJob;
use slotwise_sessions::{HoldManager, RetryProcessor};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumes retry jobs from Kafka and hands each to the retry processor.
///
/// A job that is not due yet parks its partition: the consumer seeks back to
/// it, pauses the partition and resumes it from a timer, so the loop keeps
/// polling and other partitions keep flowing. Offsets are stored only after a
/// job has been handled; a crash mid-job means redelivery, which the
/// processor tolerates.
pub async fn start_retry_worker(
    brokers: String,
    group_id: String,
    topic: String,
    processor: Arc<RetryProcessor>,
) -> Result<(), KafkaError> {
    let consumer: Arc<StreamConsumer> = Arc::new(
        ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()?,
    );

    consumer.subscribe(&[topic.as_str()])?;
    let parked: Arc<Mutex<HashSet<i32>>> = Arc::default();

    info!("Retry worker started, listening to {}", topic);

    loop {
        let m = match consumer.recv().await {
            Err(e) => {
                error!("Kafka error: {}", e);
                continue;
            }
            Ok(m) => m,
        };
        // Fetched before the pause took effect; it comes again after resume.
        if parked.lock().await.contains(&m.partition()) {
            continue;
        }

        let Some(payload) = m.payload() else {
            store_offset(&consumer, &m);
            continue;
        };
        let job = match serde_json::from_slice::<RetryJob>(payload) {
            Ok(job) => job,
            Err(e) => {
                error!("Dropping unreadable retry job: {}", e);
                store_offset(&consumer, &m);
                continue;
            }
        };

        if let Some(wait) = job.wait_before(Utc::now()) {
            let delay = wait.to_std().unwrap_or(Duration::ZERO);
            if park(&consumer, &parked, &m, delay).await {
                debug!("Job for session {} not due, partition {} parked for {:?}", job.session_id, m.partition(), delay);
                continue;
            }
            warn!("Could not park partition {}, running job for session {} early", m.partition(), job.session_id);
        }

        let outcome = processor.process_retry(job).await;
        debug!("Retry outcome: {:?}", outcome);
        store_offset(&consumer, &m);
    }
}

/// Rewinds the message's partition to the message, pauses it and schedules
/// the resume. False if the partition could not be parked.
async fn park(
    consumer: &Arc<StreamConsumer>,
    parked: &Arc<Mutex<HashSet<i32>>>,
    m: &BorrowedMessage<'_>,
    delay: Duration,
) -> bool {
    let partition = m.partition();
    let mut partitions = TopicPartitionList::new();
    partitions.add_partition(m.topic(), partition);

    if let Err(e) = consumer.pause(&partitions) {
        error!("Failed to pause partition {}: {}", partition, e);
        return false;
    }
    if let Err(e) = consumer.seek(m.topic(), partition, Offset::Offset(m.offset()), SEEK_TIMEOUT) {
        error!("Failed to rewind partition {}: {}", partition, e);
        if let Err(e) = consumer.resume(&partitions) {
            error!("Failed to resume partition {}: {}", partition, e);
        }
        return false;
    }
    parked.lock().await.insert(partition);

    let consumer = consumer.clone();
    let parked = parked.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        parked.lock().await.remove(&partition);
        match consumer.resume(&partitions) {
            Ok(()) => debug!("Partition {} resumed", partition),
            // Revoked in a rebalance meanwhile; the new owner picks it up.
            Err(e) => warn!("Failed to resume partition {}: {}", partition, e),
        }
    });
    true
}

fn store_offset(consumer: &StreamConsumer, m: &BorrowedMessage<'_>) {
    if let Err(e) = consumer.store_offset_from_message(m) {
        warn!("Failed to store offset {} on partition {}: {}", m.offset(), m.partition(), e);
    }
}

/// Periodic sweep of expired holds, on top of the sweep every create does.
pub async fn start_hold_reaper(holds: Arc<HoldManager>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    info!("Hold reaper started, running every {:?}", every);

    loop {
        ticker.tick().await;
        match holds.reap_expired().await {
            Ok(0) => {}
            Ok(n) => info!("Reaped {} expired holds", n),
            Err(e) => error!("Hold reaper failed: {}", e),
        }
    }
}
