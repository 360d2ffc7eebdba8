//! The Board: owns every processor task, wires subscriptions between them,
//! and supervises failures according to each error's recovery strategy.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use streamboard_foundation::error::{BoardError, ConfigError};
use streamboard_foundation::state::{BoardState, StateManager};
use streamboard_telemetry::BoardMetrics;

use crate::messages::{BoardMessage, ProcessorMessage};
use crate::processor::{run_input_processor_task, run_processor_task, InputProcessor, Processor};
use crate::subscription::{make_channel, NetworkSubscriptionOrder, SubscriptionOrder};

/// A point-in-time snapshot of Board health, cheap enough to log on a
/// timer or serve from a status endpoint without touching any processor
/// task directly.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub state: BoardState,
    pub is_healthy: bool,
    pub processors_alive: usize,
    pub composites_completed: u64,
    pub composites_dropped_late: u64,
    pub composites_demoted_discontinuous: u64,
    pub last_error: Option<String>,
}

struct ProcessorHandle {
    board_tx: mpsc::Sender<BoardMessage>,
    join: JoinHandle<()>,
    required_keys: Vec<String>,
}

/// Owns the set of running processor tasks, mediates subscriptions between
/// them, and aggregates their `ProcessorMessage` reports into Board-wide
/// state transitions.
pub struct Board {
    processors: BTreeMap<String, ProcessorHandle>,
    state: StateManager,
    metrics: BoardMetrics,
    message_tx: mpsc::Sender<ProcessorMessage>,
    message_rx: mpsc::Receiver<ProcessorMessage>,
}

impl Board {
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(64);
        Self {
            processors: BTreeMap::new(),
            state: StateManager::new(),
            metrics: BoardMetrics::new(),
            message_tx,
            message_rx,
        }
    }

    pub fn metrics(&self) -> BoardMetrics {
        self.metrics.clone()
    }

    pub fn state(&self) -> BoardState {
        self.state.current()
    }

    /// Start a transform processor under `name`. Rejects duplicate names per
    /// the configuration contract.
    pub fn start_processor(
        &mut self,
        name: impl Into<String>,
        processor: Box<dyn Processor>,
    ) -> Result<(), BoardError> {
        let name = name.into();
        if self.processors.contains_key(&name) {
            return Err(BoardError::Config(ConfigError::DuplicateProcessorName(name)));
        }

        let required_keys = processor.required_keys();
        let (board_tx, board_rx) = mpsc::channel(16);
        let inputs = BTreeMap::new();
        let join = tokio::spawn(run_processor_task(
            processor,
            inputs,
            board_rx,
            self.message_tx.clone(),
            self.metrics.clone(),
        ));

        self.processors.insert(
            name,
            ProcessorHandle {
                board_tx,
                join,
                required_keys,
            },
        );
        self.metrics
            .processors_alive
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Start an input processor (no upstream subscriptions) under `name`.
    pub fn start_input_processor(
        &mut self,
        name: impl Into<String>,
        processor: Box<dyn InputProcessor>,
    ) -> Result<(), BoardError> {
        let name = name.into();
        if self.processors.contains_key(&name) {
            return Err(BoardError::Config(ConfigError::DuplicateProcessorName(name)));
        }

        let (board_tx, board_rx) = mpsc::channel(16);
        let join = tokio::spawn(run_input_processor_task(
            processor,
            board_rx,
            self.message_tx.clone(),
            self.metrics.clone(),
        ));

        self.processors.insert(
            name,
            ProcessorHandle {
                board_tx,
                join,
                required_keys: Vec::new(),
            },
        );
        self.metrics
            .processors_alive
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Wire processor `order.processor_name`'s `sender_key` output into
    /// `order.subscriber_name`'s `receiver_key` input. Validates both ends
    /// exist and that the receiver actually declared this key in
    /// `required_keys()`, mirroring the `TestRequiredKeys` handshake.
    pub async fn subscribe_to_processor(&self, order: SubscriptionOrder) -> Result<(), BoardError> {
        let producer = self
            .processors
            .get(&order.processor_name)
            .ok_or_else(|| ConfigError::UnknownSubscriptionKey(order.processor_name.clone()))?;
        let consumer = self
            .processors
            .get(&order.subscriber_name)
            .ok_or_else(|| ConfigError::UnknownSubscriptionKey(order.subscriber_name.clone()))?;

        if !consumer.required_keys.is_empty()
            && !consumer.required_keys.iter().any(|k| k == &order.receiver_key)
        {
            return Err(BoardError::Config(ConfigError::UnknownSubscriptionKey(
                format!("{}:{}", order.subscriber_name, order.receiver_key),
            )));
        }

        let (tx, rx) = make_channel();

        producer
            .board_tx
            .send(BoardMessage::Subscribe {
                sender_key: order.sender_key.clone(),
                tx,
                order: order.clone(),
            })
            .await
            .map_err(|_| BoardError::Fatal(format!("processor '{}' mailbox closed", order.processor_name)))?;

        consumer
            .board_tx
            .send(BoardMessage::Subscription {
                receiver_key: order.receiver_key.clone(),
                rx,
                order,
            })
            .await
            .map_err(|_| BoardError::Fatal("subscriber mailbox closed".into()))?;

        Ok(())
    }

    /// Forward a network fan-out/fan-in order to the named processor; the
    /// processor's own task owns the socket lifecycle (see the network
    /// boundary module).
    pub async fn subscribe_to_network(
        &self,
        processor_name: &str,
        order: NetworkSubscriptionOrder,
    ) -> Result<(), BoardError> {
        let handle = self
            .processors
            .get(processor_name)
            .ok_or_else(|| ConfigError::UnknownSubscriptionKey(processor_name.to_string()))?;
        handle
            .board_tx
            .send(BoardMessage::NetworkSubscription(order))
            .await
            .map_err(|_| BoardError::Fatal(format!("processor '{processor_name}' mailbox closed")))?;
        Ok(())
    }

    pub async fn stop_processor(&mut self, name: &str) -> Result<(), BoardError> {
        if let Some(handle) = self.processors.get(name) {
            let _ = handle.board_tx.send(BoardMessage::Stop).await;
        }
        Ok(())
    }

    pub async fn stop_all(&mut self) -> Result<(), BoardError> {
        self.state.transition(BoardState::Stopping)?;
        for handle in self.processors.values() {
            let _ = handle.board_tx.send(BoardMessage::Stop).await;
        }
        for (_, handle) in self.processors.iter_mut() {
            let _ = (&mut handle.join).await;
        }
        self.state.transition(BoardState::Stopped)?;
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self.state.current(), BoardState::Stopping | BoardState::Stopped)
    }

    /// Drain exactly one `ProcessorMessage`, applying its recovery policy to
    /// Board state. Intended to be called in a supervision loop alongside
    /// the application's own event loop.
    pub async fn supervise_once(&mut self) -> Option<ProcessorMessage> {
        let msg = self.message_rx.recv().await?;
        match &msg {
            ProcessorMessage::Error { kind, message, name } => {
                tracing::error!(processor = name, kind, message, "processor reported error");
                self.metrics.record_error(format!("{name}: {message}"));
                let _ = self.state.transition(BoardState::Degraded {
                    reason: format!("{name}: {message}"),
                });
                self.metrics.set_degraded(true);
            }
            ProcessorMessage::Finished { name } => {
                tracing::info!(processor = name, "processor finished");
                self.metrics
                    .processors_alive
                    .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        Some(msg)
    }

    pub fn start(&self) -> Result<(), BoardError> {
        self.state.transition(BoardState::Running)
    }

    /// Open a channel endpoint in the caller's own task, subscribed to
    /// `processor_name`'s `sender_key` output. Used by the host process to
    /// tap a stream directly (persistence, network fan-out) without
    /// routing it through another processor.
    pub async fn get_connection_to_processor(
        &self,
        processor_name: &str,
        sender_key: &str,
    ) -> Result<mpsc::Receiver<streamboard_foundation::chunk::Chunk>, BoardError> {
        let producer = self
            .processors
            .get(processor_name)
            .ok_or_else(|| ConfigError::UnknownSubscriptionKey(processor_name.to_string()))?;

        let (tx, rx) = make_channel();
        let order = SubscriptionOrder::new(processor_name, "<host>", sender_key, "<host>");
        producer
            .board_tx
            .send(BoardMessage::Subscribe {
                sender_key: sender_key.to_string(),
                tx,
                order,
            })
            .await
            .map_err(|_| BoardError::Fatal(format!("processor '{processor_name}' mailbox closed")))?;
        Ok(rx)
    }

    /// A cheap, lock-light snapshot of Board-wide health for a status
    /// endpoint or periodic log line.
    pub fn health_report(&self) -> HealthReport {
        HealthReport {
            state: self.state.current(),
            is_healthy: self.is_healthy(),
            processors_alive: self
                .metrics
                .processors_alive
                .load(std::sync::atomic::Ordering::Relaxed),
            composites_completed: self
                .metrics
                .composites_completed
                .load(std::sync::atomic::Ordering::Relaxed),
            composites_dropped_late: self
                .metrics
                .composites_dropped_late
                .load(std::sync::atomic::Ordering::Relaxed),
            composites_demoted_discontinuous: self
                .metrics
                .composites_demoted_discontinuous
                .load(std::sync::atomic::Ordering::Relaxed),
            last_error: self.metrics.last_error.read().clone(),
        }
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap as Map;
    use streamboard_foundation::alignment::ProcessorAlignment;

    struct Echo;

    #[async_trait]
    impl Processor for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn required_keys(&self) -> Vec<String> {
            vec!["in".to_string()]
        }
        fn processor_alignments(&self) -> Map<String, ProcessorAlignment> {
            Map::from([("out".to_string(), ProcessorAlignment::identity(16_000.0))])
        }
        async fn process(
            &mut self,
            composite: &crate::composite::CompositeChunk,
        ) -> Result<crate::processor::ProducedData, BoardError> {
            let payload = composite.received["in"].payload.clone();
            Ok(Map::from([("out".to_string(), payload)]))
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_processor_names() {
        let mut board = Board::new();
        board.start_processor("echo", Box::new(Echo)).unwrap();
        let err = board.start_processor("echo", Box::new(Echo));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn subscribe_requires_declared_receiver_key() {
        let mut board = Board::new();
        board.start_processor("a", Box::new(Echo)).unwrap();
        board.start_processor("b", Box::new(Echo)).unwrap();

        let bad = board
            .subscribe_to_processor(SubscriptionOrder::new("a", "b", "out", "not_in"))
            .await;
        assert!(bad.is_err());

        let ok = board
            .subscribe_to_processor(SubscriptionOrder::new("a", "b", "out", "in"))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn stop_all_transitions_through_stopping_to_stopped() {
        let mut board = Board::new();
        board.start_processor("a", Box::new(Echo)).unwrap();
        board.start().unwrap();
        board.stop_all().await.unwrap();
        assert_eq!(board.state(), BoardState::Stopped);
    }

    #[tokio::test]
    async fn health_report_reflects_state_and_processor_count() {
        let mut board = Board::new();
        board.start_processor("a", Box::new(Echo)).unwrap();
        board.start().unwrap();

        let report = board.health_report();
        assert_eq!(report.state, BoardState::Running);
        assert!(report.is_healthy);
        assert_eq!(report.processors_alive, 1);
    }

    #[tokio::test]
    async fn get_connection_to_processor_rejects_unknown_processor() {
        let board = Board::new();
        let err = board.get_connection_to_processor("nope", "out").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn get_connection_to_processor_opens_a_host_side_channel() {
        let mut board = Board::new();
        board.start_processor("a", Box::new(Echo)).unwrap();
        let rx = board.get_connection_to_processor("a", "out").await.unwrap();
        assert_eq!(rx.capacity(), crate::subscription::DEFAULT_CHANNEL_CAPACITY);
    }
}
