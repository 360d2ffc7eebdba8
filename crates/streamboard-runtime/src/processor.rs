//! Processor base: lifecycle, supervision plumbing, and the publish
//! contract shared by every task in the DAG.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use streamboard_foundation::alignment::{ChunkAlignment, ProcessorAlignment};
use streamboard_foundation::chunk::{Chunk, ChunkPayload, ConfigMetadata};
use streamboard_foundation::continuity::Continuity;
use streamboard_foundation::error::{BoardError, RecoveryStrategy};

use streamboard_telemetry::BoardMetrics;

use crate::composite::CompositeManager;
use crate::messages::{BoardMessage, ProcessorMessage};

/// How long a processor's main loop waits on an input channel before
/// re-checking its Board mailbox. Mirrors the source's small poll timeout.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(10);

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A map of produced per-key payloads, as returned by `process`/`generate_data`
/// before the harness wraps them into full [`Chunk`]s.
pub type ProducedData = BTreeMap<String, ChunkPayload>;

/// Capability shared by every non-input processor: transform a completed
/// composite into zero or more keyed output payloads.
#[async_trait]
pub trait Processor: Send {
    fn name(&self) -> &str;

    /// Keys this processor subscribes to; validated against the Board's
    /// `TestRequiredKeys` handshake.
    fn required_keys(&self) -> Vec<String>;

    /// The per-output-key alignment delta this processor introduces.
    fn processor_alignments(&self) -> BTreeMap<String, ProcessorAlignment>;

    async fn prerun(&mut self) -> Result<(), BoardError> {
        Ok(())
    }

    async fn process(
        &mut self,
        composite: &crate::composite::CompositeChunk,
    ) -> Result<ProducedData, BoardError>;

    async fn finalize(&mut self) -> Result<(), BoardError> {
        Ok(())
    }
}

/// Capability for a processor with no inputs: it manufactures chunks
/// itself (microphone, WAV reader, synthetic generator).
#[async_trait]
pub trait InputProcessor: Send {
    fn name(&self) -> &str;

    fn processor_alignments(&self) -> BTreeMap<String, ProcessorAlignment>;

    async fn prerun(&mut self) -> Result<(), BoardError> {
        Ok(())
    }

    /// Returns `None` once the source is exhausted and `Last` has already
    /// been emitted (main loop then exits).
    async fn generate_data(
        &mut self,
    ) -> Result<Option<(ProducedData, Continuity, u64, f64, Option<String>)>, BoardError>;

    async fn finalize(&mut self) -> Result<(), BoardError> {
        Ok(())
    }
}

pub struct OutputHandles {
    pub subs: BTreeMap<String, mpsc::Sender<Chunk>>,
}

impl OutputHandles {
    pub fn new() -> Self {
        Self {
            subs: BTreeMap::new(),
        }
    }

    /// Publish payloads produced this round, applying the envelope rules
    /// from the publish contract. `sender_key = "*"` subscriptions are
    /// wildcards that discard their input; they are simply absent here.
    pub async fn publish(
        &self,
        name: &str,
        produced: ProducedData,
        merged_input_alignment: ChunkAlignment,
        processor_alignments: &BTreeMap<String, ProcessorAlignment>,
        number: u64,
        continuity: Continuity,
        start_time: f64,
        sources: &std::collections::BTreeSet<String>,
        identifier: &Option<String>,
        data_generation_time: &BTreeMap<String, f64>,
        metadata: &BTreeMap<String, ConfigMetadata>,
        config_hash: u64,
        config_json: serde_json::Value,
    ) -> Result<(), BoardError> {
        for (key, tx) in &self.subs {
            let Some(payload) = produced.get(key) else {
                continue;
            };

            if payload.is_empty_last_axis()
                && matches!(payload, ChunkPayload::Series2(_))
                && !continuity.at_least_with_previous()
            {
                return Err(BoardError::Config(
                    streamboard_foundation::error::ConfigError::EmptyResult {
                        processor: name.to_string(),
                        key: key.clone(),
                    },
                ));
            }

            let pa = processor_alignments.get(key).cloned().unwrap_or_else(|| {
                ProcessorAlignment::identity(merged_input_alignment.fsampling.unwrap_or(1.0))
            });
            let alignment = merged_input_alignment.impose_processor_alignment(&pa);
            let fs = alignment.fsampling.unwrap_or(1.0);

            let mut out_sources = sources.clone();
            out_sources.insert(name.to_string());

            let mut out_dgt = data_generation_time.clone();
            out_dgt.insert(name.to_string(), now_unix());

            let mut out_meta = metadata.clone();
            out_meta.insert(
                name.to_string(),
                ConfigMetadata {
                    config_hash,
                    config_json: config_json.clone(),
                    annotation_json: None,
                },
            );

            let chunk = Chunk {
                payload: payload.clone(),
                start_time,
                fs,
                number,
                continuity,
                alignment,
                processor_name: name.to_string(),
                sources: out_sources,
                identifier: identifier.clone(),
                data_generation_time: out_dgt,
                metadata: out_meta,
                initial_sample_time: None,
            };

            // Local bounded channel: blocks the task until downstream
            // consumes, implementing back-pressure.
            if tx.send(chunk).await.is_err() {
                tracing::warn!(processor = name, key, "output subscriber dropped");
            }
        }
        Ok(())
    }
}

impl Default for OutputHandles {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a transform processor's main loop: poll inputs, inject into the
/// composite manager, process completed composites, check the Board
/// mailbox, until `Stop` or a fatal error.
pub async fn run_processor_task(
    mut processor: Box<dyn Processor>,
    mut inputs: BTreeMap<String, mpsc::Receiver<Chunk>>,
    mut board_rx: mpsc::Receiver<BoardMessage>,
    board_tx: mpsc::Sender<ProcessorMessage>,
    metrics: BoardMetrics,
) {
    let name = processor.name().to_string();

    if let Err(e) = processor.prerun().await {
        report_and_exit(&board_tx, &name, e).await;
        return;
    }

    let mut composite_manager = CompositeManager::new(
        inputs.keys().cloned(),
        processor.processor_alignments(),
    )
    .with_metrics(metrics.clone());

    let mut outputs = OutputHandles::new();
    let config_hash = 0u64;

    loop {
        let mut progressed = false;

        for (key, rx) in inputs.iter_mut() {
            match timeout(POLL_TIMEOUT, rx.recv()).await {
                Ok(Some(chunk)) => {
                    progressed = true;
                    match composite_manager.inject(key, chunk) {
                        Ok(Some(composite)) => {
                            match processor.process(&composite).await {
                                Ok(produced) => {
                                    if let Err(e) = outputs
                                        .publish(
                                            &name,
                                            produced,
                                            composite.alignment,
                                            &processor.processor_alignments(),
                                            composite.number,
                                            composite.continuity,
                                            composite.initial_sample_time,
                                            &composite.sources,
                                            &composite.identifier,
                                            &composite.data_generation_time,
                                            &composite.metadata,
                                            config_hash,
                                            serde_json::Value::Null,
                                        )
                                        .await
                                    {
                                        if handle_error(&board_tx, &metrics, &name, e).await {
                                            processor.finalize().await.ok();
                                            return;
                                        }
                                    }
                                    if composite.continuity == Continuity::Last {
                                        processor.finalize().await.ok();
                                        let _ = board_tx
                                            .send(ProcessorMessage::Finished { name: name.clone() })
                                            .await;
                                        return;
                                    }
                                }
                                Err(e) => {
                                    if handle_error(&board_tx, &metrics, &name, e).await {
                                        processor.finalize().await.ok();
                                        return;
                                    }
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            if handle_error(&board_tx, &metrics, &name, e.into()).await {
                                processor.finalize().await.ok();
                                return;
                            }
                        }
                    }
                }
                Ok(None) => {
                    // Channel closed: upstream producer is gone.
                }
                Err(_) => {
                    // Poll timeout, nothing arrived this round.
                }
            }
        }

        match board_rx.try_recv() {
            Ok(BoardMessage::Stop) => {
                processor.finalize().await.ok();
                let _ = board_tx
                    .send(ProcessorMessage::Finished { name: name.clone() })
                    .await;
                return;
            }
            Ok(BoardMessage::Subscription { receiver_key, rx, .. }) => {
                inputs.insert(receiver_key, rx);
            }
            Ok(BoardMessage::Subscribe { sender_key, tx, .. }) => {
                outputs.subs.insert(sender_key, tx);
            }
            _ => {}
        }

        if !progressed {
            tokio::task::yield_now().await;
        }
    }
}

/// Runs an input processor's main loop: pull data from `generate_data`,
/// publish it under an ever-increasing `number`, until the source signals
/// exhaustion or the Board sends `Stop`.
pub async fn run_input_processor_task(
    mut processor: Box<dyn InputProcessor>,
    mut board_rx: mpsc::Receiver<BoardMessage>,
    board_tx: mpsc::Sender<ProcessorMessage>,
    metrics: BoardMetrics,
) {
    let name = processor.name().to_string();

    if let Err(e) = processor.prerun().await {
        report_and_exit(&board_tx, &name, e).await;
        return;
    }

    let mut outputs = OutputHandles::new();
    let processor_alignments = processor.processor_alignments();
    let config_hash = 0u64;
    let merged_in = ChunkAlignment::new(0, 0, 0, 0, 1.0);

    loop {
        match board_rx.try_recv() {
            Ok(BoardMessage::Stop) => {
                processor.finalize().await.ok();
                let _ = board_tx
                    .send(ProcessorMessage::Finished { name: name.clone() })
                    .await;
                return;
            }
            Ok(BoardMessage::Subscribe { sender_key, tx, .. }) => {
                outputs.subs.insert(sender_key, tx);
            }
            _ => {}
        }

        match processor.generate_data().await {
            Ok(Some((produced, continuity, number, start_time, identifier))) => {
                if let Err(e) = outputs
                    .publish(
                        &name,
                        produced,
                        merged_in,
                        &processor_alignments,
                        number,
                        continuity,
                        start_time,
                        &Default::default(),
                        &identifier,
                        &Default::default(),
                        &Default::default(),
                        config_hash,
                        serde_json::Value::Null,
                    )
                    .await
                {
                    if handle_error(&board_tx, &metrics, &name, e).await {
                        processor.finalize().await.ok();
                        return;
                    }
                }
                if continuity == Continuity::Last {
                    processor.finalize().await.ok();
                    let _ = board_tx
                        .send(ProcessorMessage::Finished { name: name.clone() })
                        .await;
                    return;
                }
            }
            Ok(None) => {
                processor.finalize().await.ok();
                let _ = board_tx
                    .send(ProcessorMessage::Finished { name: name.clone() })
                    .await;
                return;
            }
            Err(e) => {
                if handle_error(&board_tx, &metrics, &name, e).await {
                    processor.finalize().await.ok();
                    return;
                }
            }
        }
    }
}

async fn report_and_exit(board_tx: &mpsc::Sender<ProcessorMessage>, name: &str, e: BoardError) {
    let _ = board_tx
        .send(ProcessorMessage::Error {
            kind: e.kind(),
            message: e.to_string(),
            name: name.to_string(),
        })
        .await;
}

/// Returns `true` if the processor must exit its main loop.
async fn handle_error(
    board_tx: &mpsc::Sender<ProcessorMessage>,
    metrics: &BoardMetrics,
    name: &str,
    e: BoardError,
) -> bool {
    metrics.record_error(e.to_string());
    match e.recovery_strategy() {
        RecoveryStrategy::DemoteAndContinue => {
            tracing::warn!(processor = name, error = %e, "transient error, demoting next continuity");
            false
        }
        RecoveryStrategy::ReportAndExit => {
            report_and_exit(board_tx, name, e).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;

    #[async_trait]
    impl Processor for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }
        fn required_keys(&self) -> Vec<String> {
            vec!["in".to_string()]
        }
        fn processor_alignments(&self) -> BTreeMap<String, ProcessorAlignment> {
            BTreeMap::from([("out".to_string(), ProcessorAlignment::identity(16_000.0))])
        }
        async fn process(
            &mut self,
            composite: &crate::composite::CompositeChunk,
        ) -> Result<ProducedData, BoardError> {
            let payload = composite.received["in"].payload.clone();
            Ok(BTreeMap::from([("out".to_string(), payload)]))
        }
    }

    #[tokio::test]
    async fn publish_sets_sources_and_generation_time() {
        let outputs = OutputHandles::new();
        let (tx, mut rx) = mpsc::channel(1);
        let mut outputs = outputs;
        outputs.subs.insert("out".to_string(), tx);

        let produced: ProducedData =
            BTreeMap::from([("out".to_string(), ChunkPayload::Series1(vec![1.0, 2.0]))]);
        let alignment = ChunkAlignment::new(0, 0, 0, 0, 16_000.0);
        let pas = BTreeMap::from([("out".to_string(), ProcessorAlignment::identity(16_000.0))]);

        outputs
            .publish(
                "demo",
                produced,
                alignment,
                &pas,
                0,
                Continuity::WithPrevious,
                0.0,
                &Default::default(),
                &None,
                &Default::default(),
                &Default::default(),
                0,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let chunk = rx.recv().await.unwrap();
        assert!(chunk.sources.contains("demo"));
        assert!(chunk.data_generation_time.contains_key("demo"));
        assert!(chunk.metadata.contains_key("demo"));
    }
}
