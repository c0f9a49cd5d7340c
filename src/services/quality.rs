//! Statistical gate run over every freshly synthesized chunk.

use crate::config::QualityConfig;
use crate::services::audio::AudioBuffer;
use crate::utils::estimate_speech_secs;
use serde::Serialize;
use std::fmt;

/// Analysis window used for the silence measurements.
const FRAME_SECS: f64 = 0.02;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityMetrics {
    pub duration_secs: f64,
    pub expected_secs: f64,
    /// Relative deviation of the duration from the text-derived expectation.
    pub duration_deviation: f64,
    pub silence_ratio: f64,
    pub trailing_silence_secs: f64,
    pub amplitude_variance: f64,
    pub clipping_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Defect {
    Empty,
    TooShort,
    ExcessiveSilence,
    TrailingSilence,
    Clipping,
    FlatSignal,
    Distorted,
    DurationMismatch,
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Defect::Empty => "empty audio",
            Defect::TooShort => "audio too short",
            Defect::ExcessiveSilence => "mostly silence",
            Defect::TrailingSilence => "long trailing silence",
            Defect::Clipping => "clipping",
            Defect::FlatSignal => "amplitude variance too low",
            Defect::Distorted => "amplitude variance too high",
            Defect::DurationMismatch => "duration does not match text length",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub passed: bool,
    pub metrics: QualityMetrics,
    pub defects: Vec<Defect>,
}

impl QualityReport {
    pub fn describe(&self) -> String {
        self.defects
            .iter()
            .map(Defect::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone)]
pub struct QualityAnalyzer {
    config: QualityConfig,
}

impl QualityAnalyzer {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Inspect `audio` synthesized from `text`. Deterministic and side-effect free.
    pub fn inspect(&self, audio: &AudioBuffer, text: &str) -> QualityReport {
        let metrics = measure(audio, text, &self.config);
        if !self.config.enabled {
            return QualityReport {
                passed: true,
                metrics,
                defects: Vec::new(),
            };
        }

        let c = &self.config;
        let mut defects = Vec::new();

        if audio.is_empty() {
            defects.push(Defect::Empty);
        } else {
            if metrics.duration_secs < c.min_duration_secs && metrics.expected_secs >= c.min_duration_secs {
                defects.push(Defect::TooShort);
            }
            if metrics.silence_ratio > c.max_silence_ratio {
                defects.push(Defect::ExcessiveSilence);
            }
            if metrics.trailing_silence_secs > c.max_trailing_silence_secs {
                defects.push(Defect::TrailingSilence);
            }
            if metrics.clipping_ratio > c.max_clipping_ratio {
                defects.push(Defect::Clipping);
            }
            if metrics.amplitude_variance < c.min_amplitude_variance {
                defects.push(Defect::FlatSignal);
            }
            if metrics.amplitude_variance > c.max_amplitude_variance {
                defects.push(Defect::Distorted);
            }
            if metrics.expected_secs > 0.0 && metrics.duration_deviation > c.duration_tolerance {
                defects.push(Defect::DurationMismatch);
            }
        }

        QualityReport {
            passed: defects.is_empty(),
            metrics,
            defects,
        }
    }
}

fn measure(audio: &AudioBuffer, text: &str, config: &QualityConfig) -> QualityMetrics {
    let mono = audio.to_mono();
    let duration_secs = audio.duration_secs();
    let expected_secs = estimate_speech_secs(text, config.words_per_minute, config.cjk_chars_per_minute);
    let duration_deviation = if expected_secs > 0.0 {
        (duration_secs - expected_secs).abs() / expected_secs
    } else {
        0.0
    };

    if mono.is_empty() {
        return QualityMetrics {
            duration_secs,
            expected_secs,
            duration_deviation,
            silence_ratio: 1.0,
            ..QualityMetrics::default()
        };
    }

    let frame_len = ((audio.sample_rate as f64 * FRAME_SECS) as usize).max(1);
    let silent: Vec<bool> = mono
        .chunks(frame_len)
        .map(|frame| rms_db(frame) < config.silence_threshold_db)
        .collect();
    let silence_ratio = silent.iter().filter(|s| **s).count() as f64 / silent.len() as f64;
    let trailing_frames = silent.iter().rev().take_while(|s| **s).count();
    let trailing_silence_secs = (trailing_frames * frame_len).min(mono.len()) as f64 / audio.sample_rate.max(1) as f64;

    let n = mono.len() as f64;
    let mean = mono.iter().map(|&s| s as f64).sum::<f64>() / n;
    let amplitude_variance = mono.iter().map(|&s| (s as f64 - mean).powi(2)).sum::<f64>() / n;
    let clipped = mono
        .iter()
        .filter(|s| s.abs() as f64 >= config.clipping_level)
        .count();

    QualityMetrics {
        duration_secs,
        expected_secs,
        duration_deviation,
        silence_ratio,
        trailing_silence_secs,
        amplitude_variance,
        clipping_ratio: clipped as f64 / n,
    }
}

fn rms_db(frame: &[f32]) -> f64 {
    let energy = frame.iter().map(|&s| (s as f64).powi(2)).sum::<f64>() / frame.len() as f64;
    if energy <= 0.0 {
        f64::NEG_INFINITY
    } else {
        10.0 * energy.log10()
    }
}
