//! Live microphone capture (§6.1) via `cpal`. A `cpal::Stream` is not
//! `Send`, so capture runs on a dedicated OS thread that owns it and
//! forwards samples across a channel — the same shape the reference
//! capture thread in the corpus uses, simplified down to this board's
//! mono `f64` pipeline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tokio::sync::mpsc as tokio_mpsc;

use streamboard_foundation::alignment::ProcessorAlignment;
use streamboard_foundation::chunk::ChunkPayload;
use streamboard_foundation::continuity::Continuity;
use streamboard_foundation::error::{BoardError, ResourceError, TransientError};
use streamboard_runtime::processor::{InputProcessor, ProducedData};

pub const SIGNAL_KEY: &str = "signal";

/// How long `generate_data` waits for a fresh sample batch before treating
/// the stream as stalled and demoting the next emitted chunk.
const STALL_TIMEOUT: Duration = Duration::from_millis(500);

struct CaptureThread {
    handle: Option<std::thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Candidate input device names tried in order before falling back to the
/// host's reported default, mirroring the ALSA/PipeWire preference order a
/// desktop capture stack typically wants.
const PREFERRED_DEVICE_SUBSTRINGS: [&str; 2] = ["pipewire", "pulse"];

fn pick_device(host: &cpal::Host) -> Result<cpal::Device, ResourceError> {
    if let Ok(devices) = host.input_devices() {
        for pattern in PREFERRED_DEVICE_SUBSTRINGS {
            for device in devices_matching(host, pattern) {
                return Ok(device);
            }
        }
        let _ = devices;
    }
    host.default_input_device()
        .ok_or_else(|| ResourceError::FileUnwritable("no input audio device available".to_string()))
}

fn devices_matching(host: &cpal::Host, pattern: &str) -> Vec<cpal::Device> {
    host.input_devices()
        .map(|it| {
            it.filter(|d| {
                d.name()
                    .map(|n| n.to_lowercase().contains(pattern))
                    .unwrap_or(false)
            })
            .collect()
        })
        .unwrap_or_default()
}

/// Captures mono audio from the default (or preferred) input device.
pub struct MicrophoneSource {
    name: String,
    fs: f64,
    number: u64,
    rx: tokio_mpsc::UnboundedReceiver<Vec<f64>>,
    _capture: CaptureThread,
    last_sample_at: Instant,
    stalled: bool,
}

impl MicrophoneSource {
    /// Spawns the dedicated capture thread immediately; `fs` reflects the
    /// device's negotiated sample rate once the stream is built.
    pub fn spawn(name: impl Into<String>) -> Result<Self, ResourceError> {
        let (tx, rx) = tokio_mpsc::unbounded_channel::<Vec<f64>>();
        let (fs_tx, fs_rx) = std::sync::mpsc::channel::<Result<f64, String>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();

        let handle = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match pick_device(&host) {
                Ok(d) => d,
                Err(e) => {
                    let _ = fs_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let config = match device.default_input_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = fs_tx.send(Err(format!("no default input config: {e}")));
                    return;
                }
            };
            let fs = config.sample_rate().0 as f64;
            let channels = config.channels() as usize;
            let stream_config: StreamConfig = config.clone().into();
            let sample_format = config.sample_format();

            let tx_err = tx.clone();
            let err_fn = move |e: cpal::StreamError| {
                tracing::warn!(error = %e, "cpal stream error");
                let _ = tx_err.send(Vec::new());
            };

            let stream_result = match sample_format {
                SampleFormat::F32 => device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _| {
                        let mono = downmix_f32(data, channels);
                        let _ = tx.send(mono);
                    },
                    err_fn,
                    None,
                ),
                SampleFormat::I16 => device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _| {
                        let mono = downmix_i16(data, channels);
                        let _ = tx.send(mono);
                    },
                    err_fn,
                    None,
                ),
                SampleFormat::U16 => device.build_input_stream(
                    &stream_config,
                    move |data: &[u16], _| {
                        let mono = downmix_u16(data, channels);
                        let _ = tx.send(mono);
                    },
                    err_fn,
                    None,
                ),
                other => {
                    let _ = fs_tx.send(Err(format!("unsupported sample format: {other:?}")));
                    return;
                }
            };

            let stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    let _ = fs_tx.send(Err(format!("failed to build stream: {e}")));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = fs_tx.send(Err(format!("failed to start stream: {e}")));
                return;
            }
            let _ = fs_tx.send(Ok(fs));

            while !stop_thread.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(20));
            }
            drop(stream);
        });

        let fs = fs_rx
            .recv_timeout(Duration::from_secs(3))
            .map_err(|_| ResourceError::FileUnwritable("capture thread did not start in time".to_string()))?
            .map_err(ResourceError::FileUnwritable)?;

        Ok(Self {
            name: name.into(),
            fs,
            number: 0,
            rx,
            _capture: CaptureThread {
                handle: Some(handle),
                stop,
            },
            last_sample_at: Instant::now(),
            stalled: false,
        })
    }
}

fn downmix_f32(data: &[f32], channels: usize) -> Vec<f64> {
    if channels <= 1 {
        return data.iter().map(|&s| s as f64).collect();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| s as f64).sum::<f64>() / channels as f64)
        .collect()
}

fn downmix_i16(data: &[i16], channels: usize) -> Vec<f64> {
    const SCALE: f64 = i16::MAX as f64;
    if channels <= 1 {
        return data.iter().map(|&s| s as f64 / SCALE).collect();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| s as f64 / SCALE).sum::<f64>() / channels as f64)
        .collect()
}

fn downmix_u16(data: &[u16], channels: usize) -> Vec<f64> {
    const MID: f64 = 32_768.0;
    if channels <= 1 {
        return data.iter().map(|&s| (s as f64 - MID) / MID).collect();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| (s as f64 - MID) / MID).sum::<f64>() / channels as f64)
        .collect()
}

#[async_trait]
impl InputProcessor for MicrophoneSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn processor_alignments(&self) -> BTreeMap<String, ProcessorAlignment> {
        BTreeMap::from([(SIGNAL_KEY.to_string(), ProcessorAlignment::identity(self.fs))])
    }

    async fn generate_data(
        &mut self,
    ) -> Result<Option<(ProducedData, Continuity, u64, f64, Option<String>)>, BoardError> {
        let batch = tokio::time::timeout(STALL_TIMEOUT, self.rx.recv()).await;

        let samples = match batch {
            Ok(Some(samples)) if !samples.is_empty() => {
                self.last_sample_at = Instant::now();
                samples
            }
            Ok(Some(_empty)) => {
                return Err(BoardError::Transient(TransientError::CaptureOverflow(
                    "capture stream reported an error".to_string(),
                )));
            }
            Ok(None) => {
                return Err(BoardError::from(streamboard_foundation::error::ResourceError::SocketClosed(
                    "capture thread channel closed".to_string(),
                )));
            }
            Err(_timeout) => {
                self.stalled = true;
                return Err(BoardError::Transient(TransientError::CaptureOverflow(
                    "no samples received before stall timeout".to_string(),
                )));
            }
        };

        let continuity = if self.number == 0 || self.stalled {
            self.stalled = false;
            Continuity::Discontinuous
        } else {
            Continuity::WithPrevious
        };

        let start_time = self.last_sample_at.elapsed().as_secs_f64();
        let produced: ProducedData =
            BTreeMap::from([(SIGNAL_KEY.to_string(), ChunkPayload::Series1(samples))]);
        let number = self.number;
        self.number += 1;
        Ok(Some((produced, continuity, number, start_time, None)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_i16_averages_channels_to_zero_for_balanced_stereo() {
        let data = [100i16, -100, 200, -200];
        let mono = downmix_i16(&data, 2);
        assert!(mono.iter().all(|&v| v.abs() < 1e-9));
    }

    #[test]
    fn downmix_f32_passes_mono_through_unchanged() {
        let data = [0.1f32, 0.2, -0.3];
        let mono = downmix_f32(&data, 1);
        assert!((mono[0] - 0.1).abs() < 1e-6);
        assert!((mono[1] - 0.2).abs() < 1e-6);
    }
}
