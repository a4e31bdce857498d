// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Reliable publishing over the realm gossip topic.
//!
//! The underlying mesh refuses publishes while it has no peers (common right after start) and
//! can fail transiently later. Messages that fail are queued and re-driven by a flush loop until
//! they are sent, age out, or exhaust their attempts. An optional acknowledgement layer frames
//! critical messages so selected receivers confirm them.

mod ack;

pub(crate) use ack::{AckFrame, AckReply, AckRequest};

use crate::error::{Error, Result};
use crate::network::GossipTopic;
use crate::types::NodeId;
use bytes::Bytes;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};
use tiny_keccak::{Hasher, Sha3};
use tokio::{sync::watch, task::JoinHandle};

/// Where a message is in its delivery lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Publish failed; waiting in the queue.
    Queued,
    /// Handed to the mesh.
    Sent,
    /// Confirmed by the required receivers.
    Acked,
    /// A publish attempt failed (the message may still be retried).
    Failed,
    /// Gave up: too old or too many attempts.
    Dropped,
    /// Sent, waiting for acknowledgements.
    PendingAck,
}

/// Tuning of the delivery core.
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// Maximum queued messages.
    pub max_queue: usize,
    /// Queued messages older than this are dropped.
    pub max_age: Duration,
    /// Maximum publish attempts per message.
    pub max_attempts: u32,
    /// Flush loop period.
    pub flush_interval: Duration,
    /// Messages re-driven per flush round.
    pub flush_batch: usize,
    /// Whether the acknowledgement layer is enabled.
    pub ack_enabled: bool,
    /// How long to wait for acknowledgements before retrying.
    pub ack_timeout: Duration,
    /// Re-publish attempts while waiting for acknowledgements.
    pub ack_retries: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_queue: 1000,
            max_age: Duration::from_secs(5 * 60),
            max_attempts: 3,
            flush_interval: Duration::from_secs(1),
            flush_batch: 10,
            ack_enabled: true,
            ack_timeout: Duration::from_secs(10),
            ack_retries: 2,
        }
    }
}

/// Result of an acknowledged publish.
#[derive(Clone, Debug)]
pub struct AckResult {
    /// The message id the receivers acknowledged.
    pub message_id: String,
    /// Which peers acknowledged.
    pub acked_by: Vec<NodeId>,
    /// Whether the completion rule (any/all) was satisfied.
    pub complete: bool,
}

#[derive(Debug)]
struct QueuedMessage {
    id: String,
    data: Bytes,
    queued_at: Instant,
    attempts: u32,
    last_attempt: Option<Instant>,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<QueuedMessage>,
    // Fast dedup of ids still in the queue.
    index: HashMap<String, ()>,
}

type StatusCallback = Arc<dyn Fn(&str, DeliveryStatus) + Send + Sync>;

/// Message queue and flush loop layered over one gossip topic.
pub struct ReliablePublisher {
    topic: Arc<dyn GossipTopic>,
    local: NodeId,
    config: DeliveryConfig,
    queue: Mutex<Queue>,
    callbacks: RwLock<Vec<StatusCallback>>,
    pending_acks: ack::PendingAckMap,
    flushing: AtomicBool,
    seq: AtomicU64,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReliablePublisher {
    pub(crate) fn new(
        topic: Arc<dyn GossipTopic>,
        local: NodeId,
        config: DeliveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic,
            local,
            config,
            queue: Mutex::new(Queue::default()),
            callbacks: RwLock::new(Vec::new()),
            pending_acks: ack::PendingAckMap::default(),
            flushing: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            loop_handle: Mutex::new(None),
        })
    }

    /// Spawns the flush loop.
    pub(crate) fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let publisher = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(publisher.config.flush_interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => publisher.flush().await,
                }
            }
            trace!("delivery flush loop stopped");
        });
        *self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    pub(crate) fn stop(&self) {
        if let Some(handle) = self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// Registers a status callback.
    pub fn on_status(&self, callback: impl Fn(&str, DeliveryStatus) + Send + Sync + 'static) {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(callback));
    }

    /// Depth of the retry queue.
    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .items
            .len()
    }

    fn emit(&self, id: &str, status: DeliveryStatus) {
        // Copy under the lock, invoke outside it.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(id, status);
        }
    }

    fn next_id(&self, data: &[u8]) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha3::v256();
        hasher.update(self.local.as_bytes());
        hasher.update(&seq.to_be_bytes());
        hasher.update(data);
        let mut digest = [0u8; 32];
        hasher.finalize(&mut digest);
        hex::encode(&digest[..12])
    }

    /// Publishes `data` once, framed, without queueing on failure. Callers that own their own
    /// retry schedule (join announcements, leave records) use this.
    pub(crate) async fn publish_direct(&self, data: Bytes) -> Result<()> {
        self.topic.publish(AckFrame::plain(&data)).await
    }

    /// Publishes `data`, wrapped in a no-ack frame. On mesh failure the message is queued for
    /// the flush loop. Returns the message id.
    pub async fn publish(&self, data: Bytes) -> Result<String> {
        let id = self.next_id(&data);
        let framed = AckFrame::plain(&data);
        match self.topic.publish(framed.clone()).await {
            Ok(()) => {
                self.emit(&id, DeliveryStatus::Sent);
                Ok(id)
            }
            Err(err) => {
                debug!("publish failed ({}), queueing {}", err, id);
                self.enqueue(id.clone(), framed)?;
                Ok(id)
            }
        }
    }

    fn enqueue(&self, id: String, framed: Bytes) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if queue.index.contains_key(&id) {
            return Ok(());
        }
        if queue.items.len() >= self.config.max_queue {
            drop(queue);
            self.emit(&id, DeliveryStatus::Dropped);
            return Err(Error::QueueFull);
        }
        let _ = queue.index.insert(id.clone(), ());
        queue.items.push_back(QueuedMessage {
            id: id.clone(),
            data: framed,
            queued_at: Instant::now(),
            attempts: 1,
            last_attempt: Some(Instant::now()),
        });
        drop(queue);
        self.emit(&id, DeliveryStatus::Queued);
        Ok(())
    }

    /// One flush round: re-drive up to `flush_batch` queued messages.
    pub(crate) async fn flush(&self) {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        let batch = {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut batch = Vec::new();
            while batch.len() < self.config.flush_batch {
                match queue.items.pop_front() {
                    Some(message) => {
                        let _ = queue.index.remove(&message.id);
                        batch.push(message);
                    }
                    None => break,
                }
            }
            batch
        };

        for mut message in batch {
            if message.queued_at.elapsed() > self.config.max_age {
                debug!(
                    "dropping {}: exceeded max age after {} attempts (last {:?} ago)",
                    message.id,
                    message.attempts,
                    message.last_attempt.map(|at| at.elapsed())
                );
                self.emit(&message.id, DeliveryStatus::Dropped);
                continue;
            }
            match self.topic.publish(message.data.clone()).await {
                Ok(()) => self.emit(&message.id, DeliveryStatus::Sent),
                Err(err) => {
                    message.attempts += 1;
                    message.last_attempt = Some(Instant::now());
                    self.emit(&message.id, DeliveryStatus::Failed);
                    if message.attempts >= self.config.max_attempts {
                        debug!("dropping {}: {} attempts ({})", message.id, message.attempts, err);
                        self.emit(&message.id, DeliveryStatus::Dropped);
                    } else {
                        let mut queue = self
                            .queue
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        let _ = queue.index.insert(message.id.clone(), ());
                        queue.items.push_back(message);
                    }
                }
            }
        }

        self.flushing.store(false, Ordering::SeqCst);
    }

    /// Publishes `data` framed with an acknowledgement request and waits for completion, timing
    /// out and re-publishing up to the configured retries.
    pub async fn publish_with_ack(
        &self,
        data: Bytes,
        required: Vec<NodeId>,
        require_all: bool,
    ) -> Result<AckResult> {
        if !self.config.ack_enabled {
            return Err(Error::AckDisabled);
        }
        if required.is_empty() {
            return Err(Error::NoCriticalPeers);
        }

        let id = self.next_id(&data);
        let request = AckRequest {
            message_id: id.clone(),
            reply_to: self.local.clone(),
            require_all,
            required: required.clone(),
        };
        let framed = AckFrame::with_request(&request, &data)?;
        let waiter = self.pending_acks.insert(&request);

        self.emit(&id, DeliveryStatus::PendingAck);
        let mut attempts = 0u32;
        loop {
            if let Err(err) = self.topic.publish(framed.clone()).await {
                debug!("ack publish attempt failed: {}", err);
            }
            match tokio::time::timeout(self.config.ack_timeout, waiter.wait()).await {
                Ok(()) => {
                    let acked_by = self.pending_acks.finish(&id);
                    self.emit(&id, DeliveryStatus::Acked);
                    return Ok(AckResult {
                        message_id: id,
                        acked_by,
                        complete: true,
                    });
                }
                Err(_) => {
                    attempts += 1;
                    if attempts > self.config.ack_retries {
                        let acked_by = self.pending_acks.finish(&id);
                        self.emit(&id, DeliveryStatus::Failed);
                        return Err(Error::AckTimeout(id));
                    }
                    trace!("ack wait for {} timed out, republishing", id);
                }
            }
        }
    }

    /// Peels the acknowledgement frame off an inbound payload, scheduling an outbound ACK when
    /// one was requested from the local node. Returns the application payload.
    pub(crate) fn process_incoming(self: &Arc<Self>, data: &[u8]) -> Result<Bytes> {
        let (request, payload) = AckFrame::split(data)?;
        if let Some(request) = request {
            if request.reply_to != self.local && request.required.contains(&self.local) {
                let publisher = self.clone();
                let _ = tokio::spawn(async move {
                    publisher.send_ack(&request).await;
                });
            }
        }
        Ok(payload)
    }

    async fn send_ack(&self, request: &AckRequest) {
        let reply = AckReply {
            message_id: request.message_id.clone(),
            from: self.local.clone(),
        };
        let bytes = match bincode::serialize(&reply) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to encode ack reply: {}", err);
                return;
            }
        };
        let payload = crate::gossip::TopicMsg::encode_ack(&bytes);
        if let Err(err) = self.topic.publish(AckFrame::plain(&payload)).await {
            debug!("failed to publish ack for {}: {}", request.message_id, err);
        }
    }

    /// Feeds an `ack2:` control payload into the pending-ack table.
    pub(crate) fn handle_ack_reply(&self, bytes: &[u8]) {
        let reply: AckReply = match bincode::deserialize(bytes) {
            Ok(reply) => reply,
            Err(err) => {
                trace!("undecodable ack reply: {}", err);
                return;
            }
        };
        self.pending_acks.record(&reply);
    }
}

impl std::fmt::Debug for ReliablePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliablePublisher")
            .field("queued", &self.queue_len())
            .finish()
    }
}
