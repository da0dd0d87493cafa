//! envelope.rs — synthetic echo envelope generation
//!
//! Models what the TUSS4470 log-amp output actually looks like on the bench:
//! 1. Transducer ring-down: exponential decay from the excitation burst
//! 2. Background hiss: Gaussian noise around a configurable floor
//! 3. Targets: flat-topped pulses with a little amplitude jitter
//!
//! Target positions can drift as a slow random walk so the backend's
//! tracker association and depth smoothing see realistic motion.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use sonar_types::SAMPLES_PER_FRAME;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    /// Mean of the background hiss.
    pub noise_mean: f64,
    /// Standard deviation of the background hiss.
    pub noise_sigma: f64,
    /// Peak amplitude of the ring-down at sample 0.
    pub ring_down_amp: f64,
    /// Ring-down decay constant, in samples.
    pub ring_down_tau: f64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            noise_mean: 20.0,
            noise_sigma: 6.0,
            ring_down_amp: 3000.0,
            ring_down_tau: 25.0,
        }
    }
}

/// One simulated reflector.
#[derive(Debug, Clone)]
pub struct Target {
    /// Current centre sample index (drifts).
    pub index: f64,
    /// Pulse amplitude.
    pub amplitude: u16,
    /// Pulse width in samples.
    pub width: usize,
    /// Random-walk step per frame, samples.
    pub drift: f64,
}

impl Target {
    /// Parse `index:amplitude:width[:drift]`, e.g. `400:200:11` or
    /// `400:200:11:0.5`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(format!("expected index:amplitude:width[:drift], got {s:?}"));
        }
        let index: f64 = parts[0].parse().map_err(|_| format!("bad index in {s:?}"))?;
        let amplitude: u16 = parts[1].parse().map_err(|_| format!("bad amplitude in {s:?}"))?;
        let width: usize = parts[2].parse().map_err(|_| format!("bad width in {s:?}"))?;
        let drift: f64 = match parts.get(3) {
            Some(d) => d.parse().map_err(|_| format!("bad drift in {s:?}"))?,
            None => 0.0,
        };
        if index < 0.0 || index >= SAMPLES_PER_FRAME as f64 {
            return Err(format!("index out of range in {s:?}"));
        }
        Ok(Self { index, amplitude, width: width.max(1), drift })
    }

    /// Advance the random walk, staying inside the frame.
    pub fn step(&mut self, rng: &mut impl Rng) {
        if self.drift == 0.0 {
            return;
        }
        let step: f64 = rng.gen_range(-self.drift..=self.drift);
        self.index = (self.index + step)
            .clamp(0.0, (SAMPLES_PER_FRAME - self.width) as f64);
    }
}

// ── Generator ─────────────────────────────────────────────────────────────────

/// Synthesize one echo envelope.
pub fn generate(cfg: &EnvelopeConfig, targets: &[Target], rng: &mut impl Rng) -> Vec<u16> {
    let hiss = Normal::new(cfg.noise_mean, cfg.noise_sigma).unwrap();
    let mut samples = Vec::with_capacity(SAMPLES_PER_FRAME);

    for i in 0..SAMPLES_PER_FRAME {
        let ring = cfg.ring_down_amp * (-(i as f64) / cfg.ring_down_tau).exp();
        let noise: f64 = hiss.sample(rng);
        samples.push((ring + noise).clamp(0.0, u16::MAX as f64) as u16);
    }

    for t in targets {
        let start = t.index as usize;
        // ±3% amplitude jitter, like a real surface return
        let jitter = 1.0 + rng.gen_range(-0.03..=0.03);
        let amp = ((t.amplitude as f64) * jitter).clamp(0.0, u16::MAX as f64) as u16;
        for s in samples.iter_mut().skip(start).take(t.width) {
            *s = (*s).max(amp);
        }
    }

    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use sonar_types::{FrameAssembler, encode_frame};

    #[test]
    fn envelope_has_frame_length() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples = generate(&EnvelopeConfig::default(), &[], &mut rng);
        assert_eq!(samples.len(), SAMPLES_PER_FRAME);
    }

    #[test]
    fn ring_down_decays_into_hiss() {
        let mut rng = StdRng::seed_from_u64(7);
        let cfg = EnvelopeConfig::default();
        let samples = generate(&cfg, &[], &mut rng);
        assert!(samples[0] > 2000);
        // Five time constants out the burst is gone.
        let far = (cfg.ring_down_tau * 5.0) as usize;
        assert!(samples[far] < 100);
    }

    #[test]
    fn target_rises_above_noise() {
        let mut rng = StdRng::seed_from_u64(7);
        let target = Target { index: 400.0, amplitude: 200, width: 11, drift: 0.0 };
        let samples = generate(&EnvelopeConfig::default(), &[target], &mut rng);
        assert!(samples[405] >= 190);
    }

    #[test]
    fn generated_frames_survive_reassembly() {
        let mut rng = StdRng::seed_from_u64(7);
        let target = Target { index: 700.0, amplitude: 300, width: 6, drift: 0.0 };
        let samples = generate(&EnvelopeConfig::default(), &[target], &mut rng);
        let packet = encode_frame(&[0; 6], &samples);

        let mut asm = FrameAssembler::new();
        let frames = asm.push(&packet, 0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, samples);
    }

    #[test]
    fn drift_stays_inside_frame() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut target = Target { index: 5.0, amplitude: 100, width: 10, drift: 4.0 };
        for _ in 0..2000 {
            target.step(&mut rng);
            assert!(target.index >= 0.0);
            assert!(target.index as usize + target.width <= SAMPLES_PER_FRAME);
        }
    }

    #[test]
    fn target_arg_parsing() {
        let t = Target::parse("400:200:11").unwrap();
        assert_eq!(t.index, 400.0);
        assert_eq!(t.amplitude, 200);
        assert_eq!(t.width, 11);
        assert_eq!(t.drift, 0.0);

        let t = Target::parse("900:80:3:1.5").unwrap();
        assert_eq!(t.drift, 1.5);

        assert!(Target::parse("x:1:1").is_err());
        assert!(Target::parse("400:200").is_err());
        assert!(Target::parse("5000:200:11").is_err());
    }
}
