//! `cpal` implementation of [`AudioOutput`].
//!
//! The output stream lives on its own `audio-output` thread (cpal streams are
//! not `Send`). The data callback pulls from a shared [`Mixer`], which owns
//! the sink clock: one tick per output frame, so `current_time` is exactly
//! what has been played. If the device cannot run at the requested rate,
//! each chunk is converted with `rubato` before it reaches the mixer.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rubato::{FftFixedInOut, Resampler};
use tokio::sync::oneshot;

use crate::audio::buffer::RingBuffer;
use crate::audio::playback::{
    AudioOutput, AudioSink, OutputTap, PlaybackError, VoiceEndedCallback, VoiceId,
};

/// Samples kept for the volume meter.
pub const ANALYSIS_WINDOW: usize = 256;

// ---------------------------------------------------------------------------
// Mixer
// ---------------------------------------------------------------------------

struct Voice {
    id: VoiceId,
    samples: Vec<f32>,
    start_frame: u64,
    pos: usize,
}

/// Sums all live voices into the device buffer and keeps the frame clock.
pub(crate) struct Mixer {
    rate: u32,
    frame: u64,
    voices: Vec<Voice>,
    recent: RingBuffer<f32>,
    on_ended: VoiceEndedCallback,
}

impl Mixer {
    pub(crate) fn new(rate: u32, on_ended: VoiceEndedCallback) -> Self {
        Self {
            rate,
            frame: 0,
            voices: Vec::new(),
            recent: RingBuffer::new(ANALYSIS_WINDOW),
            on_ended,
        }
    }

    pub(crate) fn now(&self) -> f64 {
        self.frame as f64 / f64::from(self.rate)
    }

    pub(crate) fn add(&mut self, id: VoiceId, samples: Vec<f32>, start_at: f64) {
        let wanted = (start_at.max(0.0) * f64::from(self.rate)).round() as u64;
        self.voices.push(Voice {
            id,
            samples,
            start_frame: wanted.max(self.frame),
            pos: 0,
        });
    }

    pub(crate) fn remove(&mut self, id: VoiceId) {
        self.voices.retain(|v| v.id != id);
    }

    /// Fill an interleaved buffer of `channels` channels. Mono content is
    /// copied to every channel.
    pub(crate) fn render(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels.max(1)) {
            let mut acc = 0.0_f32;
            for v in self.voices.iter_mut() {
                if self.frame >= v.start_frame {
                    if let Some(s) = v.samples.get(v.pos) {
                        acc += *s;
                        v.pos += 1;
                    }
                }
            }
            let sample = acc.clamp(-1.0, 1.0);
            frame.fill(sample);
            self.recent.push(sample);
            self.frame += 1;
        }

        let on_ended = &self.on_ended;
        self.voices.retain(|v| {
            let done = v.pos >= v.samples.len();
            if done {
                on_ended(v.id);
            }
            !done
        });
    }

    pub(crate) fn recent(&self) -> Vec<f32> {
        self.recent.snapshot()
    }

    fn clear(&mut self) {
        self.voices.clear();
    }
}

type SharedMixer = Arc<Mutex<Mixer>>;

fn lock(mixer: &SharedMixer) -> std::sync::MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(|p| p.into_inner())
}

struct MixerTap(SharedMixer);

impl OutputTap for MixerTap {
    fn recent_samples(&self) -> Vec<f32> {
        lock(&self.0).recent()
    }
}

// ---------------------------------------------------------------------------
// ChunkConverter
// ---------------------------------------------------------------------------

/// Converts whole chunks between two rates. Each chunk is processed on its
/// own so voices stay independent.
struct ChunkConverter {
    resampler: FftFixedInOut<f32>,
}

impl ChunkConverter {
    const CHUNK_SIZE: usize = 1024;

    fn new(from: u32, to: u32) -> Result<Self, PlaybackError> {
        let resampler = FftFixedInOut::<f32>::new(from as usize, to as usize, Self::CHUNK_SIZE, 1)
            .map_err(|e| PlaybackError::Convert(e.to_string()))?;
        Ok(Self { resampler })
    }

    fn convert(&mut self, samples: &[f32]) -> Result<Vec<f32>, PlaybackError> {
        let mut out = Vec::new();
        let mut rest = samples;
        loop {
            let needed = self.resampler.input_frames_next();
            if needed == 0 || rest.len() < needed {
                break;
            }
            let (chunk, tail) = rest.split_at(needed);
            let converted = self
                .resampler
                .process(&[chunk], None)
                .map_err(|e| PlaybackError::Convert(e.to_string()))?;
            if let Some(channel) = converted.first() {
                out.extend_from_slice(channel);
            }
            rest = tail;
        }
        if !rest.is_empty() {
            let converted = self
                .resampler
                .process_partial(Some(&[rest]), None)
                .map_err(|e| PlaybackError::Convert(e.to_string()))?;
            if let Some(channel) = converted.first() {
                out.extend_from_slice(channel);
            }
        }
        self.resampler.reset();
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// CpalOutput
// ---------------------------------------------------------------------------

/// Default output device of the default `cpal` host.
#[derive(Debug, Default)]
pub struct CpalOutput;

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn open(
        &self,
        sample_rate: u32,
        on_ended: VoiceEndedCallback,
    ) -> Result<Box<dyn AudioSink>, PlaybackError> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<SharedMixer, PlaybackError>>();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                let stream = match open_output(sample_rate, on_ended) {
                    Ok((stream, mixer)) => {
                        let _ = ready_tx.send(Ok(mixer));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = release_rx.recv();
                drop(stream);
                log::debug!("output: stream closed");
            })
            .map_err(|_| PlaybackError::ThreadGone)?;

        let mixer = ready_rx.await.map_err(|_| PlaybackError::ThreadGone)??;
        let device_rate = lock(&mixer).rate;
        let converter = if device_rate == sample_rate {
            None
        } else {
            log::info!("output: converting {sample_rate} Hz → {device_rate} Hz");
            Some(ChunkConverter::new(sample_rate, device_rate)?)
        };

        Ok(Box::new(CpalSink {
            sample_rate,
            mixer,
            converter,
            release_tx: Some(release_tx),
        }))
    }
}

/// Prefer an f32 config at `rate`; otherwise the device default.
fn pick_config(
    device: &cpal::Device,
    rate: u32,
) -> Result<cpal::StreamConfig, PlaybackError> {
    let exact = device
        .supported_output_configs()?
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .find(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0)
        .map(|c| c.with_sample_rate(cpal::SampleRate(rate)));

    match exact {
        Some(supported) => Ok(supported.into()),
        None => Ok(device.default_output_config()?.into()),
    }
}

fn open_output(
    rate: u32,
    on_ended: VoiceEndedCallback,
) -> Result<(cpal::Stream, SharedMixer), PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(PlaybackError::NoDevice)?;
    let config = pick_config(&device, rate)?;
    let channels = config.channels as usize;

    let mixer: SharedMixer = Arc::new(Mutex::new(Mixer::new(config.sample_rate.0, on_ended)));
    let render_mixer = Arc::clone(&mixer);

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            lock(&render_mixer).render(data, channels);
        },
        |err: cpal::StreamError| {
            log::error!("output: stream error: {err}");
        },
        None,
    )?;
    stream.play()?;

    log::info!(
        "output: opened ({} ch @ {} Hz)",
        config.channels,
        config.sample_rate.0
    );
    Ok((stream, mixer))
}

struct CpalSink {
    sample_rate: u32,
    mixer: SharedMixer,
    converter: Option<ChunkConverter>,
    release_tx: Option<mpsc::Sender<()>>,
}

impl AudioSink for CpalSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        lock(&self.mixer).now()
    }

    fn start_voice(
        &mut self,
        id: VoiceId,
        samples: Vec<f32>,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        if self.release_tx.is_none() {
            return Err(PlaybackError::Closed);
        }
        let samples = match self.converter.as_mut() {
            Some(c) => c.convert(&samples)?,
            None => samples,
        };
        lock(&self.mixer).add(id, samples, start_at);
        Ok(())
    }

    fn stop_voice(&mut self, id: VoiceId) {
        lock(&self.mixer).remove(id);
    }

    fn tap(&self) -> Arc<dyn OutputTap> {
        Arc::new(MixerTap(Arc::clone(&self.mixer)))
    }

    fn close(&mut self) {
        lock(&self.mixer).clear();
        if let Some(tx) = self.release_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer_with_log(rate: u32) -> (Mixer, Arc<Mutex<Vec<VoiceId>>>) {
        let ended = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&ended);
        let mixer = Mixer::new(rate, Arc::new(move |id| log.lock().unwrap().push(id)));
        (mixer, ended)
    }

    #[test]
    fn clock_advances_per_frame() {
        let (mut mixer, _) = mixer_with_log(10);
        let mut buf = vec![0.0; 10];
        mixer.render(&mut buf, 2);
        assert_eq!(mixer.now(), 0.5);
    }

    #[test]
    fn voice_waits_for_its_start_frame() {
        let (mut mixer, _) = mixer_with_log(4);
        mixer.add(1, vec![0.5, 0.5], 0.5);

        let mut buf = vec![0.0; 4];
        mixer.render(&mut buf, 1);
        assert_eq!(buf, vec![0.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn voices_mix_and_report_end() {
        let (mut mixer, ended) = mixer_with_log(8);
        mixer.add(1, vec![0.25; 2], 0.0);
        mixer.add(2, vec![0.25; 4], 0.0);

        let mut buf = vec![0.0; 3];
        mixer.render(&mut buf, 1);
        assert_eq!(buf, vec![0.5, 0.5, 0.25]);
        assert_eq!(*ended.lock().unwrap(), vec![1]);

        let mut buf = vec![0.0; 2];
        mixer.render(&mut buf, 1);
        assert_eq!(*ended.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn stopped_voice_does_not_report_end() {
        let (mut mixer, ended) = mixer_with_log(8);
        mixer.add(7, vec![0.1; 4], 0.0);
        mixer.remove(7);

        let mut buf = vec![0.0; 8];
        mixer.render(&mut buf, 1);
        assert!(buf.iter().all(|s| *s == 0.0));
        assert!(ended.lock().unwrap().is_empty());
    }

    #[test]
    fn past_start_plays_immediately() {
        let (mut mixer, _) = mixer_with_log(4);
        let mut buf = vec![0.0; 4];
        mixer.render(&mut buf, 1);

        mixer.add(1, vec![0.3], 0.0);
        let mut buf = vec![0.0; 1];
        mixer.render(&mut buf, 1);
        assert_eq!(buf, vec![0.3]);
    }

    #[test]
    fn analysis_window_keeps_latest_output() {
        let (mut mixer, _) = mixer_with_log(48_000);
        mixer.add(1, vec![0.2; ANALYSIS_WINDOW * 2], 0.0);
        let mut buf = vec![0.0; ANALYSIS_WINDOW * 2];
        mixer.render(&mut buf, 1);

        let recent = mixer.recent();
        assert_eq!(recent.len(), ANALYSIS_WINDOW);
        assert!(recent.iter().all(|s| (*s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn converter_scales_length() {
        let mut conv = ChunkConverter::new(24_000, 48_000).unwrap();
        let out = conv.convert(&[0.0; 2_400]).unwrap();
        // FFT resampling pads the final partial block.
        assert!(out.len() >= 4_800);
    }
}
