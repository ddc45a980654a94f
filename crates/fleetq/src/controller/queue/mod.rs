pub mod sqs;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::controller::FleetResult;
use crate::controller::job::{Job, ReceiptToken};

/// Result of acknowledging a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Deleted,
    /// The receipt token is no longer valid (e.g. its visibility timeout has expired).
    /// The message may be delivered again.
    Expired,
}

/// Handler that can communicate with a FIFO request queue.
pub trait JobQueue {
    /// Waits up to `wait` for at most `max_messages` jobs.
    ///
    /// Received messages stay in the queue, hidden from other consumers for the visibility
    /// timeout, until they are acknowledged.
    fn receive(
        &self,
        wait: Duration,
        max_messages: u32,
    ) -> Pin<Box<dyn Future<Output = FleetResult<Vec<Job>>>>>;

    /// Removes a received message from the queue.
    /// Acknowledging an already removed message is not an error.
    fn acknowledge(
        &self,
        receipt: &ReceiptToken,
    ) -> Pin<Box<dyn Future<Output = FleetResult<AckOutcome>>>>;

    /// Eventually consistent estimate of the number of messages waiting in the queue.
    fn approximate_depth(&self) -> Pin<Box<dyn Future<Output = FleetResult<u64>>>>;
}

/// Waits up to `wait` for a single job.
pub async fn receive_next(queue: &dyn JobQueue, wait: Duration) -> FleetResult<Option<Job>> {
    let jobs = queue.receive(wait, 1).await?;
    Ok(jobs.into_iter().next())
}

/// Acknowledges a message, logging (instead of returning) failures.
/// Returns `true` if the message was removed from the queue.
pub async fn acknowledge_job(queue: &dyn JobQueue, job: &Job) -> bool {
    match queue.acknowledge(&job.receipt).await {
        Ok(AckOutcome::Deleted) => {
            log::debug!("Job {} was acknowledged", job.id);
            true
        }
        Ok(AckOutcome::Expired) => {
            log::warn!(
                "Receipt of job {} has expired, the job may be delivered again",
                job.id
            );
            false
        }
        Err(error) => {
            log::error!("Failed to acknowledge job {}: {error:?}", job.id);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{acknowledge_job, receive_next};
    use crate::tests::mocks::MockQueue;
    use std::time::Duration;

    #[tokio::test]
    async fn receive_next_returns_none_on_empty_queue() {
        let queue = MockQueue::default();
        assert!(
            receive_next(&queue, Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn received_job_is_hidden_until_redelivery() {
        let queue = MockQueue::with_urls(&["s3://bucket/a.jpg"]);
        let job = receive_next(&queue, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.id, "a.jpg");
        assert!(
            receive_next(&queue, Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );

        queue.expire_visibility();
        let again = receive_next(&queue, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.payload_ref, job.payload_ref);
    }

    #[tokio::test]
    async fn acknowledge_twice_is_not_fatal() {
        let queue = MockQueue::with_urls(&["s3://bucket/a.jpg"]);
        let job = receive_next(&queue, Duration::ZERO).await.unwrap().unwrap();
        assert!(acknowledge_job(&queue, &job).await);
        assert!(!acknowledge_job(&queue, &job).await);
        assert_eq!(queue.acknowledged(), vec![job.receipt.clone(), job.receipt]);
        assert_eq!(queue.len(), 0);
    }
}
