//! Bus consumer: connection lifecycle, retry policy, and message dispatch.
//!
//! The connection lifecycle is an explicit state machine so the retry rules
//! are testable without a broker or timers. Retries are two-tier: a short
//! delay between attempts, and once `max_retries` attempts in a row have
//! failed, a long cooldown before the counter resets. The consumer never
//! gives up; losing events because the broker was down too long is not an
//! option.
//!
//! Message processing is at-least-once: the offset is committed after
//! dispatch, and a failed handler routes the event to the dead-letter sink
//! rather than blocking the partition.

use async_trait::async_trait;
use futures::StreamExt;
use metrics::{counter, gauge};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::events::{DeadLetterRecord, DeadLetterSink, EventEnvelope};
use crate::handlers::EventHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    CoolingDown,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Consecutive failed attempts before entering cooldown.
    pub max_retries: u32,
    /// Delay between ordinary attempts.
    pub retry_delay: Duration,
    /// Delay once `max_retries` attempts have failed in a row.
    pub cooldown: Duration,
}

/// What to wait before the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Retry(Duration),
    Cooldown(Duration),
}

/// Pure connection-lifecycle logic, driven by the run loop.
pub struct ConnectionStateMachine {
    state: ConnectionState,
    attempt: u32,
    policy: RetryPolicy,
}

impl ConnectionStateMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 1,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 1-based attempt number of the current retry tier.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn connect_succeeded(&mut self) {
        self.state = ConnectionState::Subscribed;
        self.attempt = 1;
    }

    /// Record a failed attempt and report what to wait. Reaching
    /// `max_retries` switches to the cooldown tier and resets the counter,
    /// so the cycle repeats indefinitely.
    pub fn connect_failed(&mut self) -> Backoff {
        if self.attempt >= self.policy.max_retries {
            self.state = ConnectionState::CoolingDown;
            self.attempt = 1;
            Backoff::Cooldown(self.policy.cooldown)
        } else {
            self.state = ConnectionState::Disconnected;
            self.attempt += 1;
            Backoff::Retry(self.policy.retry_delay)
        }
    }

    pub fn cooldown_elapsed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// An established subscription dropped (stream error).
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

/// Clock seam so retry behavior is testable without real waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleep out the backoff the state machine asked for.
async fn wait_backoff(machine: &mut ConnectionStateMachine, sleeper: &dyn Sleeper) {
    match machine.connect_failed() {
        Backoff::Retry(delay) => {
            debug!(attempt = machine.attempt(), "waiting before reconnect");
            sleeper.sleep(delay).await;
        }
        Backoff::Cooldown(delay) => {
            warn!(cooldown_secs = delay.as_secs(), "connect attempts exhausted, cooling down");
            sleeper.sleep(delay).await;
            machine.cooldown_elapsed();
        }
    }
}

/// Routes parsed envelopes to registered handlers; everything that cannot
/// be processed lands in the dead-letter sink with the original event.
pub struct EventDispatcher {
    handlers: HashMap<&'static str, Arc<dyn EventHandler>>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl EventDispatcher {
    pub fn new(dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            handlers: HashMap::new(),
            dead_letters,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(handler.event_type(), handler);
    }

    pub async fn dispatch(&self, raw: &[u8]) {
        let envelope: EventEnvelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                counter!("beats.consumer.failed").increment(1);
                warn!(error = %e, "undecodable event payload");
                let original = serde_json::Value::String(String::from_utf8_lossy(raw).into_owned());
                self.dead_letter(original, e.to_string()).await;
                return;
            }
        };

        let handler = match self.handlers.get(envelope.event_type.as_str()) {
            Some(handler) => handler,
            None => {
                counter!("beats.consumer.unknown_dropped").increment(1);
                warn!(event_type = %envelope.event_type, "no handler for event type, dropping");
                return;
            }
        };

        match handler.handle(envelope.payload.clone()).await {
            Ok(()) => {
                counter!("beats.consumer.processed").increment(1);
                debug!(event_type = %envelope.event_type, "event processed");
            }
            Err(e) => {
                counter!("beats.consumer.failed").increment(1);
                warn!(event_type = %envelope.event_type, error = %e, "handler failed, dead-lettering");
                let original = match serde_json::to_value(&envelope) {
                    Ok(value) => value,
                    Err(ser) => serde_json::Value::String(ser.to_string()),
                };
                self.dead_letter(original, format!("{e:#}")).await;
            }
        }
    }

    async fn dead_letter(&self, original_event: serde_json::Value, error: String) {
        let record = DeadLetterRecord::new(original_event, error);
        if let Err(e) = self.dead_letters.record(record).await {
            // Nothing left to fall back to but the log.
            error!(error = %e, "dead-letter sink unavailable, event lost from the bus");
        }
    }
}

enum LoopExit {
    Shutdown,
    StreamError(String),
}

pub struct EventConsumer {
    brokers: String,
    group_id: String,
    topic: String,
    policy: RetryPolicy,
    dispatcher: EventDispatcher,
    sleeper: Arc<dyn Sleeper>,
}

impl EventConsumer {
    pub fn new(
        brokers: &str,
        group_id: &str,
        topic: &str,
        policy: RetryPolicy,
        dispatcher: EventDispatcher,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            brokers: brokers.to_string(),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            policy,
            dispatcher,
            sleeper,
        }
    }

    /// Run until shutdown. Connection loss and connect failures are retried
    /// forever under the two-tier policy.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut machine = ConnectionStateMachine::new(self.policy);

        loop {
            machine.begin_connect();
            // The metadata probe blocks inside librdkafka; keep it off the
            // async worker threads.
            let brokers = self.brokers.clone();
            let group_id = self.group_id.clone();
            let topic = self.topic.clone();
            let connected =
                tokio::task::spawn_blocking(move || Self::try_connect(&brokers, &group_id, &topic))
                    .await
                    .unwrap_or_else(|e| Err(anyhow::Error::new(e)));

            match connected {
                Ok(consumer) => {
                    machine.connect_succeeded();
                    gauge!("beats.consumer.subscribed").set(1.0);
                    info!(topic = %self.topic, group_id = %self.group_id, "subscribed to event topic");

                    match self.consume(&consumer, &mut shutdown).await {
                        LoopExit::Shutdown => {
                            info!("event consumer shutting down");
                            return;
                        }
                        LoopExit::StreamError(e) => {
                            gauge!("beats.consumer.subscribed").set(0.0);
                            warn!(error = %e, "event stream dropped, reconnecting");
                            machine.disconnect();
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        attempt = machine.attempt(),
                        error = %e,
                        "broker connect failed"
                    );
                    wait_backoff(&mut machine, &*self.sleeper).await;
                }
            }

            if shutdown.try_recv().is_ok() {
                info!("event consumer shutting down");
                return;
            }
        }
    }

    /// Create the consumer, subscribe, and probe the broker so a dead
    /// bootstrap address fails here instead of inside the stream. The
    /// metadata fetch blocks, so callers run this on the blocking pool.
    fn try_connect(brokers: &str, group_id: &str, topic: &str) -> anyhow::Result<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        consumer.subscribe(&[topic])?;
        consumer.fetch_metadata(Some(topic), Duration::from_secs(5))?;
        Ok(consumer)
    }

    async fn consume(
        &self,
        consumer: &StreamConsumer,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> LoopExit {
        let mut stream = consumer.stream();

        loop {
            tokio::select! {
                _ = shutdown.recv() => return LoopExit::Shutdown,
                message = stream.next() => match message {
                    Some(Ok(message)) => {
                        if let Some(payload) = message.payload() {
                            self.dispatcher.dispatch(payload).await;
                        }
                        // Commit after dispatch: redelivery over loss.
                        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                            warn!(error = %e, "offset commit failed");
                        }
                    }
                    Some(Err(e)) => return LoopExit::StreamError(e.to_string()),
                    None => return LoopExit::StreamError("event stream ended".to_string()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryDeadLetters, RecordingSleeper};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            cooldown: Duration::from_secs(30),
        }
    }

    #[test]
    fn starts_disconnected() {
        let machine = ConnectionStateMachine::new(policy());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.attempt(), 1);
    }

    #[test]
    fn success_resets_the_attempt_counter() {
        let mut machine = ConnectionStateMachine::new(policy());
        machine.begin_connect();
        assert_eq!(machine.connect_failed(), Backoff::Retry(Duration::from_secs(2)));
        machine.begin_connect();
        machine.connect_succeeded();
        assert_eq!(machine.state(), ConnectionState::Subscribed);
        assert_eq!(machine.attempt(), 1);
    }

    #[test]
    fn exhausted_retries_enter_cooldown_and_reset() {
        let mut machine = ConnectionStateMachine::new(policy());

        machine.begin_connect();
        assert_eq!(machine.connect_failed(), Backoff::Retry(Duration::from_secs(2)));
        machine.begin_connect();
        assert_eq!(machine.connect_failed(), Backoff::Retry(Duration::from_secs(2)));
        machine.begin_connect();
        assert_eq!(
            machine.connect_failed(),
            Backoff::Cooldown(Duration::from_secs(30))
        );
        assert_eq!(machine.state(), ConnectionState::CoolingDown);

        machine.cooldown_elapsed();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        // Fresh tier after cooldown.
        assert_eq!(machine.attempt(), 1);
    }

    #[test]
    fn retries_forever_across_cooldown_cycles() {
        let mut machine = ConnectionStateMachine::new(policy());
        for _ in 0..5 {
            let mut cooldowns = 0;
            loop {
                machine.begin_connect();
                match machine.connect_failed() {
                    Backoff::Retry(_) => {}
                    Backoff::Cooldown(_) => {
                        cooldowns += 1;
                        machine.cooldown_elapsed();
                        break;
                    }
                }
            }
            assert_eq!(cooldowns, 1);
            assert_eq!(machine.state(), ConnectionState::Disconnected);
        }
    }

    #[tokio::test]
    async fn backoff_sleeps_follow_the_two_tier_policy() {
        let mut machine = ConnectionStateMachine::new(policy());
        let sleeper = RecordingSleeper::new();

        for _ in 0..7 {
            machine.begin_connect();
            wait_backoff(&mut machine, &sleeper).await;
        }

        let slept = sleeper.slept().await;
        assert_eq!(
            slept,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(30),
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(30),
                Duration::from_secs(2),
            ]
        );
    }

    struct TestHandler {
        calls: Arc<Mutex<Vec<Value>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for TestHandler {
        fn event_type(&self) -> &'static str {
            "user-deleted"
        }

        async fn handle(&self, payload: Value) -> anyhow::Result<()> {
            self.calls.lock().await.push(payload);
            if self.fail {
                anyhow::bail!("handler exploded");
            }
            Ok(())
        }
    }

    fn dispatcher_with(
        fail: bool,
    ) -> (EventDispatcher, Arc<Mutex<Vec<Value>>>, Arc<MemoryDeadLetters>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        let mut dispatcher = EventDispatcher::new(dead_letters.clone());
        dispatcher.register(Arc::new(TestHandler {
            calls: calls.clone(),
            fail,
        }));
        (dispatcher, calls, dead_letters)
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_handler() {
        let (dispatcher, calls, dead_letters) = dispatcher_with(false);
        let raw = json!({"type": "user-deleted", "payload": {"userId": "u1"}});
        dispatcher.dispatch(raw.to_string().as_bytes()).await;

        let calls = calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["userId"], "u1");
        assert!(dead_letters.records().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_event_types_are_dropped_silently() {
        let (dispatcher, calls, dead_letters) = dispatcher_with(false);
        let raw = json!({"type": "account-upgraded", "payload": {}});
        dispatcher.dispatch(raw.to_string().as_bytes()).await;

        assert!(calls.lock().await.is_empty());
        assert!(dead_letters.records().await.is_empty());
    }

    #[tokio::test]
    async fn handler_failure_dead_letters_the_original_event() {
        let (dispatcher, _, dead_letters) = dispatcher_with(true);
        let raw = json!({"type": "user-deleted", "payload": {"userId": "u1"}});
        dispatcher.dispatch(raw.to_string().as_bytes()).await;

        let records = dead_letters.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_event["type"], "user-deleted");
        assert_eq!(records[0].original_event["payload"]["userId"], "u1");
        assert!(records[0].error.contains("handler exploded"));
    }

    #[tokio::test]
    async fn undecodable_payloads_are_dead_lettered() {
        let (dispatcher, calls, dead_letters) = dispatcher_with(false);
        dispatcher.dispatch(b"not json at all").await;

        assert!(calls.lock().await.is_empty());
        let records = dead_letters.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_event, json!("not json at all"));
    }

    #[tokio::test]
    async fn processing_continues_after_a_poison_message() {
        let (dispatcher, calls, dead_letters) = dispatcher_with(false);
        dispatcher.dispatch(b"garbage").await;
        let ok = json!({"type": "user-deleted", "payload": {"userId": "u2"}});
        dispatcher.dispatch(ok.to_string().as_bytes()).await;

        assert_eq!(calls.lock().await.len(), 1);
        assert_eq!(dead_letters.records().await.len(), 1);
    }
}
