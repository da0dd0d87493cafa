use sonar_types::SAMPLE_TIME_S;

// ── Acoustic constants ────────────────────────────────────────────────────────

/// Operating frequency of the TUSS4470 front-end. Selects the speed of
/// sound and how many leading samples are unconditionally ignored
/// (transducer excitation bleed-through differs between media).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SonarFrequency {
    /// 40 kHz — in-air ranging.
    Khz40,
    /// 200 kHz — underwater ranging.
    Khz200,
}

impl SonarFrequency {
    pub fn from_khz(khz: u32) -> Self {
        match khz {
            200 => Self::Khz200,
            _ => Self::Khz40,
        }
    }

    /// Speed of sound in the medium, m/s.
    pub fn speed_of_sound(self) -> f64 {
        match self {
            Self::Khz40 => 330.0,
            Self::Khz200 => 1522.0,
        }
    }

    /// Samples skipped before the blind-zone scan even starts.
    pub fn default_ignore_first(self) -> usize {
        match self {
            Self::Khz40 => 2,
            Self::Khz200 => 8,
        }
    }
}

// ── Pipeline configuration ────────────────────────────────────────────────────

/// All tunables of the echo pipeline, read once at startup.
/// Database credentials are deliberately not here: `DATABASE_URL` is read
/// directly in `main` so credentials never sit in a long-lived config struct.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Serial device of the sonar link (default /dev/ttyUSB0)
    pub serial_path: String,
    /// Baud rate (default 250 000, 8-N-1)
    pub baud_rate: u32,
    /// Operating frequency, selects acoustic constants
    pub frequency: SonarFrequency,
    /// Static detection gate; also the floor of the dynamic threshold
    pub value_threshold: f64,
    /// Multiple of the noise standard deviation added to the noise mean
    pub snr_factor: f64,
    /// Frames a track must persist before it counts as a real target
    pub consistency_samples: u32,
    /// Base association window for the tracker, in sample indices
    pub position_tolerance: f64,
    /// Gap enforced between the end of one pulse and the next search start
    pub min_signal_separation: usize,
    /// Gap (samples) across which two pulses collapse into one detection
    pub consolidation_tolerance: usize,
    /// Maximum detections reported per frame
    pub n_max: usize,
    /// Tail samples used for the per-frame noise floor
    pub noise_floor_range: usize,
    /// Upper bound of the blind-zone scan
    pub max_bz_search_samples: usize,
    /// Leading samples skipped before the blind-zone scan
    pub ignore_first_samples: usize,
    /// Margin applied to the noise mean for the blind-zone threshold
    pub bz_margin: f64,
    /// EMA factor of the primary-depth smoother
    pub ema_alpha: f64,
    /// EMA factor of the long-running noise mean
    pub noise_ema_alpha: f64,
    /// Throttle interval of the sonar_readings persistence
    pub db_write_interval_ms: i64,
    /// Minimum amplitude for a detection to reach the binary channel
    pub emit_threshold: u16,
    /// HTTP / Socket.IO port
    pub http_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let frequency = SonarFrequency::from_khz(env_parse("SONAR_FREQUENCY", 40));
        Self {
            serial_path: std::env::var("SERIAL_PATH")
                .unwrap_or_else(|_| "/dev/ttyUSB0".to_string()),
            baud_rate: env_parse("BAUD_RATE", 250_000),
            frequency,
            value_threshold: env_parse("VALUE_THRESHOLD", 60.0),
            snr_factor: env_parse("SNR_FACTOR", 3.0),
            consistency_samples: env_parse("CONSISTENCY_SAMPLES", 5),
            position_tolerance: env_parse("POSITION_TOLERANCE", 8.0),
            min_signal_separation: env_parse("MIN_SIGNAL_SEPARATION", 20),
            consolidation_tolerance: env_parse("CONSOLIDATION_TOLERANCE", 5),
            n_max: env_parse("N_MAX", 10),
            noise_floor_range: env_parse("NOISE_FLOOR_RANGE", 200),
            max_bz_search_samples: env_parse("MAX_BZ_SEARCH_SAMPLES", 300),
            ignore_first_samples: env_parse(
                "IGNORE_FIRST_SAMPLES",
                frequency.default_ignore_first(),
            ),
            bz_margin: env_parse("BZ_MARGIN", 1.1),
            ema_alpha: env_parse("EMA_ALPHA", 0.1),
            noise_ema_alpha: env_parse("NOISE_EMA_ALPHA", 0.1),
            db_write_interval_ms: env_parse("DB_WRITE_INTERVAL_MS", 3000),
            emit_threshold: env_parse("EMIT_THRESHOLD", 50),
            http_port: env_parse("HTTP_PORT", env_parse("PORT", 3001)),
        }
    }
}

impl PipelineConfig {
    /// Two-way range per sample index, in centimetres:
    /// `r = (c · Δt) / 2`, Δt = 13.2 µs.
    pub fn sample_resolution_cm(&self) -> f64 {
        self.frequency.speed_of_sound() * SAMPLE_TIME_S / 2.0 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_resolution_air_and_water() {
        let mut cfg = PipelineConfig::default();
        cfg.frequency = SonarFrequency::Khz40;
        // 330 m/s · 13.2 µs / 2 = 2.178 mm per sample
        assert!((cfg.sample_resolution_cm() - 0.2178).abs() < 1e-9);
        cfg.frequency = SonarFrequency::Khz200;
        assert!((cfg.sample_resolution_cm() - 1.00452).abs() < 1e-9);
    }

    #[test]
    fn frequency_selects_ring_down_skip() {
        assert_eq!(SonarFrequency::Khz40.default_ignore_first(), 2);
        assert_eq!(SonarFrequency::Khz200.default_ignore_first(), 8);
        assert_eq!(SonarFrequency::from_khz(200), SonarFrequency::Khz200);
        assert_eq!(SonarFrequency::from_khz(40), SonarFrequency::Khz40);
    }
}
