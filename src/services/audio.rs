//! PCM buffers, WAV I/O and the concatenate/mix-down operations used by the
//! assembler.

use crate::error::AudioError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interleaved floating point PCM in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels,
            samples,
        }
    }

    pub fn silence(sample_rate: u32, channels: u16, duration: Duration) -> Self {
        let frames = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
        Self::new(sample_rate, channels, vec![0.0; frames * channels as usize])
    }

    /// Decode 16-bit little-endian PCM.
    pub fn from_pcm16(bytes: &[u8], sample_rate: u32, channels: u16) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();
        Self::new(sample_rate, channels, samples)
    }

    /// Decode a complete WAV file held in memory.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self, AudioError> {
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes))?;
        decode(reader)
    }

    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames() as f64 / self.sample_rate as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }

    /// Duplicate a mono buffer into `channels` identical channels.
    pub fn with_channels(&self, channels: u16) -> Result<Self, AudioError> {
        if channels == self.channels {
            return Ok(self.clone());
        }
        if self.channels != 1 {
            return Err(AudioError::UnsupportedChannels(self.channels));
        }
        let samples = self
            .samples
            .iter()
            .flat_map(|&s| std::iter::repeat(s).take(channels as usize))
            .collect();
        Ok(Self::new(self.sample_rate, channels, samples))
    }

    /// Linear-interpolation resample.
    pub fn resampled(&self, sample_rate: u32) -> Self {
        if sample_rate == self.sample_rate || self.is_empty() {
            return Self::new(sample_rate, self.channels, self.samples.clone());
        }
        let channels = self.channels.max(1) as usize;
        let source_frames = self.frames();
        let ratio = self.sample_rate as f64 / sample_rate as f64;
        let target_frames = ((source_frames as f64) / ratio).round() as usize;

        let mut samples = Vec::with_capacity(target_frames * channels);
        for frame in 0..target_frames {
            let position = frame as f64 * ratio;
            let left = (position.floor() as usize).min(source_frames - 1);
            let right = (left + 1).min(source_frames - 1);
            let weight = (position - left as f64) as f32;
            for channel in 0..channels {
                let a = self.samples[left * channels + channel];
                let b = self.samples[right * channels + channel];
                samples.push(a + (b - a) * weight);
            }
        }
        Self::new(sample_rate, self.channels, samples)
    }
}

fn decode<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<AudioBuffer, AudioError> {
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(AudioBuffer::new(spec.sample_rate, spec.channels, samples))
}

pub fn read_wav(path: &Path) -> Result<AudioBuffer, AudioError> {
    decode(hound::WavReader::open(path)?)
}

/// Write 16-bit PCM WAV through a temporary sibling file and a rename, so a
/// crash never leaves a truncated file under the final name.
pub fn write_wav(path: &Path, audio: &AudioBuffer) -> Result<(), AudioError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let tmp = temp_path(path);
    let mut writer = hound::WavWriter::create(&tmp, spec)?;
    for &sample in &audio.samples {
        let scaled = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer.write_sample(scaled)?;
    }
    writer.finalize()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Join buffers end to end with `pause` of silence between neighbours.
///
/// All inputs must share a sample rate. Mono inputs are upmixed when the set
/// mixes mono and multi-channel audio.
pub fn concatenate(buffers: &[AudioBuffer], pause: Duration) -> Result<AudioBuffer, AudioError> {
    let first = buffers.first().ok_or(AudioError::Empty)?;
    let sample_rate = first.sample_rate;
    let channels = buffers.iter().map(|b| b.channels).max().unwrap_or(1);

    let gap = AudioBuffer::silence(sample_rate, channels, pause);
    let mut samples = Vec::new();
    for (i, buffer) in buffers.iter().enumerate() {
        if buffer.sample_rate != sample_rate {
            return Err(AudioError::SampleRateMismatch {
                expected: sample_rate,
                found: buffer.sample_rate,
            });
        }
        if i > 0 {
            samples.extend_from_slice(&gap.samples);
        }
        samples.extend(buffer.with_channels(channels)?.samples);
    }
    Ok(AudioBuffer::new(sample_rate, channels, samples))
}

/// Lay `music` under `narration` without moving any narration sample.
///
/// The music is resampled to the narration rate, looped or trimmed to the
/// narration length, faded in and out and scaled by `volume`. The sum is
/// scaled back to a 0.95 peak only when it would clip.
pub fn mix_down(
    narration: &AudioBuffer,
    music: &AudioBuffer,
    volume: f32,
    fade: Duration,
) -> Result<AudioBuffer, AudioError> {
    if narration.is_empty() {
        return Ok(narration.clone());
    }
    if music.is_empty() {
        return Err(AudioError::Empty);
    }

    let channels = narration.channels.max(music.channels);
    let narration = narration.with_channels(channels)?;
    let music = music
        .resampled(narration.sample_rate)
        .with_channels(channels)?;

    // Music shorter than one frame at the narration rate has nothing to loop.
    let music_frames = music.frames();
    if music_frames == 0 {
        return Err(AudioError::Empty);
    }

    let width = channels as usize;
    let frames = narration.frames();
    let fade_frames = ((fade.as_secs_f64() * narration.sample_rate as f64) as usize).min(frames / 2);

    let mut samples = Vec::with_capacity(narration.samples.len());
    for frame in 0..frames {
        let gain = volume * fade_gain(frame, frames, fade_frames);
        let source = frame % music_frames;
        for channel in 0..width {
            let voice = narration.samples[frame * width + channel];
            let bed = music.samples[source * width + channel];
            samples.push(voice + bed * gain);
        }
    }

    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 1.0 {
        let scale = 0.95 / peak;
        samples.iter_mut().for_each(|s| *s *= scale);
    }
    Ok(AudioBuffer::new(narration.sample_rate, channels, samples))
}

fn fade_gain(frame: usize, frames: usize, fade_frames: usize) -> f32 {
    if fade_frames == 0 {
        return 1.0;
    }
    if frame < fade_frames {
        frame as f32 / fade_frames as f32
    } else if frame >= frames - fade_frames {
        (frames - frame) as f32 / fade_frames as f32
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(sample_rate: u32, channels: u16, frames: usize, level: f32) -> AudioBuffer {
        AudioBuffer::new(sample_rate, channels, vec![level; frames * channels as usize])
    }

    #[test]
    fn concatenate_inserts_pauses() {
        let a = tone(1000, 1, 100, 0.5);
        let b = tone(1000, 1, 50, -0.5);
        let joined = concatenate(&[a, b], Duration::from_millis(20)).unwrap();
        assert_eq!(joined.frames(), 170);
        assert_eq!(joined.samples[100..120], [0.0; 20]);
        assert_eq!(joined.samples[120], -0.5);
    }

    #[test]
    fn concatenate_upmixes_mono() {
        let mono = tone(1000, 1, 10, 0.25);
        let stereo = tone(1000, 2, 10, 0.5);
        let joined = concatenate(&[mono, stereo], Duration::ZERO).unwrap();
        assert_eq!(joined.channels, 2);
        assert_eq!(joined.frames(), 20);
        assert_eq!(joined.samples[0..2], [0.25, 0.25]);
    }

    #[test]
    fn concatenate_rejects_mixed_rates() {
        let err = concatenate(&[tone(1000, 1, 10, 0.1), tone(2000, 1, 10, 0.1)], Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, AudioError::SampleRateMismatch { expected: 1000, found: 2000 }));
    }

    #[test]
    fn concatenate_of_nothing_is_an_error() {
        assert!(matches!(concatenate(&[], Duration::ZERO), Err(AudioError::Empty)));
    }

    #[test]
    fn mix_down_keeps_narration_length() {
        let narration = tone(8000, 1, 8000, 0.2);
        let music = tone(4000, 1, 1000, 0.5);
        let mixed = mix_down(&narration, &music, 0.5, Duration::from_millis(100)).unwrap();
        assert_eq!(mixed.frames(), narration.frames());
        assert_eq!(mixed.sample_rate, 8000);
        // Fade starts from silence.
        assert!((mixed.samples[0] - 0.2).abs() < 1e-6);
        // Middle carries narration plus the scaled bed.
        assert!((mixed.samples[4000] - 0.45).abs() < 1e-3);
    }

    #[test]
    fn mix_down_normalizes_only_when_clipping() {
        let narration = tone(1000, 1, 1000, 0.9);
        let music = tone(1000, 1, 1000, 1.0);
        let mixed = mix_down(&narration, &music, 1.0, Duration::ZERO).unwrap();
        let peak = mixed.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.95).abs() < 1e-4);
    }

    #[test]
    fn mix_down_rejects_music_too_short_to_resample() {
        let narration = tone(8_000, 1, 800, 0.25);
        let music = tone(48_000, 1, 2, 0.5);
        assert!(matches!(
            mix_down(&narration, &music, 0.5, Duration::ZERO),
            Err(AudioError::Empty)
        ));
    }

    #[test]
    fn wav_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("clip.wav");
        let audio = tone(16000, 2, 160, 0.5);
        write_wav(&path, &audio).unwrap();
        assert!(!dir.path().join("nested").join("clip.wav.tmp").exists());

        let back = read_wav(&path).unwrap();
        assert_eq!(back.sample_rate, 16000);
        assert_eq!(back.channels, 2);
        assert_eq!(back.frames(), 160);
        assert!((back.samples[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn pcm16_decoding() {
        let bytes = [0x00, 0x40, 0x00, 0xC0];
        let audio = AudioBuffer::from_pcm16(&bytes, 24000, 1);
        assert_eq!(audio.samples, vec![0.5, -0.5]);
    }
}
