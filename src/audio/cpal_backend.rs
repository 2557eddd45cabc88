//! `cpal` implementation of [`AudioBackend`].
//!
//! Wraps the cpal host/device/stream lifecycle.  Each stream callback runs
//! on a cpal-owned audio thread and touches only its ring endpoint (plus the
//! shared [`PlaybackControl`] flags on the output side), keeping the SPSC
//! discipline intact.  Dropping a `cpal::Stream` stops the hardware stream,
//! so `stop_input` / `stop_output` just drop the handle.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::error;

use crate::audio::buffer::{Consumer, Producer};
use crate::audio::engine::{AudioBackend, AudioError, PlaybackControl};

pub struct CpalBackend {
    host: cpal::Host,
    /// Device picked via `select_input`; `None` means the system default.
    selected_input: Option<cpal::Device>,
    input_stream: Option<cpal::Stream>,
    output_stream: Option<cpal::Stream>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            selected_input: None,
            input_stream: None,
            output_stream: None,
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn start_input(&mut self, mut producer: Producer) -> Result<u32, AudioError> {
        let device = match &self.selected_input {
            Some(device) => device.clone(),
            None => self
                .host
                .default_input_device()
                .ok_or(AudioError::NoInputDevice)?,
        };

        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::Backend(e.to_string()))?;
        let channels = supported.channels() as usize;
        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.into();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Downmix to mono and convert to i16 on the audio thread;
                    // everything downstream is mono PCM.
                    let mono: Vec<i16> = data
                        .chunks_exact(channels)
                        .map(|frame| {
                            let avg = frame.iter().sum::<f32>() / channels as f32;
                            (avg * 32_767.0).clamp(-32_768.0, 32_767.0) as i16
                        })
                        .collect();
                    producer.write(&mono);
                },
                |err: cpal::StreamError| {
                    error!("cpal input stream error: {err}");
                },
                None,
            )
            .map_err(|e| AudioError::Backend(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::Backend(e.to_string()))?;
        self.input_stream = Some(stream);
        Ok(sample_rate)
    }

    fn stop_input(&mut self) {
        // Dropping the stream stops the hardware capture.
        self.input_stream = None;
    }

    fn start_output(
        &mut self,
        mut consumer: Consumer,
        control: Arc<PlaybackControl>,
    ) -> Result<u32, AudioError> {
        let device = self
            .host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::Backend(e.to_string()))?;
        let channels = supported.channels() as usize;
        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.into();

        let mut mono = vec![0i16; 4_096];
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if control.clear.swap(false, Ordering::Relaxed) {
                        consumer.clear();
                    }
                    if control.muted.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }

                    let frames = data.len() / channels;
                    if mono.len() < frames {
                        mono.resize(frames, 0);
                    }
                    let got = consumer.pop(&mut mono[..frames]);

                    for (i, frame) in data.chunks_exact_mut(channels).enumerate() {
                        // Underrun past `got` plays silence; the engine
                        // treats an empty ring as normal between sentences.
                        let sample = if i < got {
                            mono[i] as f32 / 32_768.0
                        } else {
                            0.0
                        };
                        frame.fill(sample);
                    }
                },
                |err: cpal::StreamError| {
                    error!("cpal output stream error: {err}");
                },
                None,
            )
            .map_err(|e| AudioError::Backend(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::Backend(e.to_string()))?;
        self.output_stream = Some(stream);
        Ok(sample_rate)
    }

    fn stop_output(&mut self) {
        self.output_stream = None;
    }

    fn input_devices(&self) -> Result<Vec<String>, AudioError> {
        let devices = self
            .host
            .input_devices()
            .map_err(|e| AudioError::Backend(e.to_string()))?;
        Ok(devices
            .map(|d| d.name().unwrap_or_else(|_| "unknown".into()))
            .collect())
    }

    fn select_input(&mut self, index: usize) -> Result<(), AudioError> {
        let device = self
            .host
            .input_devices()
            .map_err(|e| AudioError::Backend(e.to_string()))?
            .nth(index)
            .ok_or(AudioError::InvalidDeviceIndex(index))?;
        self.selected_input = Some(device);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
