//! Signal extraction: threshold crossings → characterized detections.
//!
//! A pulse starts at the first sample at or above the dynamic threshold and
//! ends at the first sample below it. With consolidation enabled, a pulse
//! that re-crosses the threshold within `consolidation_tolerance` samples of
//! its end is treated as the same physical return (multipath shoulder or
//! notch in the envelope) and collapses into one detection carrying the
//! dominant peak's index and the maximum amplitude.

use crate::config::PipelineConfig;

/// One acoustic return in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Leading-edge sample index of the pulse.
    pub start: usize,
    /// Index of the strongest sample within the pulse.
    pub peak_index: usize,
    /// Strongest sample within the pulse.
    pub amplitude: u16,
    /// Samples from leading edge to the final trailing edge
    /// (consolidated pulses include the bridged gap).
    pub width: usize,
    /// Two-way range of the leading edge, centimetres.
    pub range_cm: f64,
}

impl Detection {
    /// Range of the dominant peak in millimetres, for the binary channel.
    pub fn peak_range_mm(&self, resolution_cm: f64) -> u32 {
        (self.peak_index as f64 * resolution_cm * 10.0).round().max(0.0) as u32
    }
}

/// Scan `[blind_zone, len)` for pulses above `threshold`. Detections come
/// out ordered by ascending index; at most `n_max`; consecutive pulses are
/// separated by at least `min_signal_separation` samples from pulse end to
/// the next search start.
pub fn extract(
    samples: &[u16],
    blind_zone: usize,
    threshold: f64,
    cfg: &PipelineConfig,
) -> Vec<Detection> {
    let resolution_cm = cfg.sample_resolution_cm();
    let len = samples.len();
    let mut out = Vec::new();
    let mut i = blind_zone;

    while i < len && out.len() < cfg.n_max {
        if (samples[i] as f64) < threshold {
            i += 1;
            continue;
        }

        let start = i;
        let mut peak_amp = 0u16;
        // A flat-topped pulse has a plateau of maximal samples; the peak
        // index is the plateau centre.
        let (mut first_max, mut last_max) = (i, i);
        let mut j = i;
        loop {
            // Consume one above-threshold run.
            while j < len && samples[j] as f64 >= threshold {
                if samples[j] > peak_amp {
                    peak_amp = samples[j];
                    first_max = j;
                    last_max = j;
                } else if samples[j] == peak_amp {
                    last_max = j;
                }
                j += 1;
            }
            if cfg.consolidation_tolerance == 0 || j >= len {
                break;
            }
            // Re-crossing within the tolerance continues the same pulse.
            let horizon = (j + cfg.consolidation_tolerance).min(len - 1);
            match (j..=horizon).find(|&k| samples[k] as f64 >= threshold) {
                Some(k) => j = k,
                None => break,
            }
        }

        out.push(Detection {
            start,
            peak_index: (first_max + last_max) / 2,
            amplitude: peak_amp,
            width: j - start,
            range_cm: start as f64 * resolution_cm,
        });

        i = j + cfg.min_signal_separation;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(min_sep: usize, consolidation: usize) -> PipelineConfig {
        PipelineConfig {
            min_signal_separation: min_sep,
            consolidation_tolerance: consolidation,
            n_max: 10,
            ..PipelineConfig::default()
        }
    }

    fn frame(pulses: &[(usize, usize, u16)]) -> Vec<u16> {
        let mut samples = vec![0u16; 1800];
        for &(at, width, amp) in pulses {
            for s in samples.iter_mut().skip(at).take(width) {
                *s = amp;
            }
        }
        samples
    }

    #[test]
    fn clean_single_target_ping() {
        // Samples 400–410 = 200, threshold 60: one detection, start 400,
        // peak 200, width 11, range 400 · r.
        let c = cfg(20, 0);
        let samples = frame(&[(400, 11, 200)]);
        let dets = extract(&samples, 0, 60.0, &c);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.start, 400);
        assert_eq!(d.amplitude, 200);
        assert_eq!(d.width, 11);
        assert!((d.range_cm - 400.0 * c.sample_resolution_cm()).abs() < 1e-9);
    }

    #[test]
    fn adjacent_peaks_consolidate_to_dominant() {
        // 500..502 = 120 and 508..510 = 150, gap 5: one detection at the
        // dominant peak's index with the maximum amplitude.
        let c = cfg(10, 5);
        let samples = frame(&[(500, 3, 120), (508, 3, 150)]);
        let dets = extract(&samples, 0, 60.0, &c);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].peak_index, 509);
        assert_eq!(dets[0].amplitude, 150);
        assert_eq!(dets[0].start, 500);
        assert_eq!(dets[0].width, 11);
    }

    #[test]
    fn adjacent_peaks_split_without_consolidation() {
        let c = cfg(3, 0);
        let samples = frame(&[(500, 3, 120), (508, 3, 150)]);
        let dets = extract(&samples, 0, 60.0, &c);
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].start, 500);
        assert_eq!(dets[0].amplitude, 120);
        assert_eq!(dets[1].start, 508);
        assert_eq!(dets[1].amplitude, 150);
    }

    #[test]
    fn blind_zone_suppresses_leading_pulse() {
        let c = cfg(20, 0);
        let samples = frame(&[(100, 5, 500), (700, 5, 300)]);
        let dets = extract(&samples, 200, 60.0, &c);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].start, 700);
        assert!(dets.iter().all(|d| d.start >= 200));
    }

    #[test]
    fn separation_invariant_holds() {
        let c = cfg(30, 0);
        // Second pulse inside the separation window of the first: skipped.
        let samples = frame(&[(600, 4, 100), (620, 4, 100), (700, 4, 100)]);
        let dets = extract(&samples, 0, 60.0, &c);
        assert_eq!(dets.len(), 2);
        for pair in dets.windows(2) {
            let end = pair[0].start + pair[0].width;
            assert!(pair[1].start - end >= c.min_signal_separation);
        }
    }

    #[test]
    fn detection_cap_respected() {
        let mut c = cfg(5, 0);
        c.n_max = 3;
        let samples = frame(&[
            (200, 3, 80),
            (300, 3, 80),
            (400, 3, 80),
            (500, 3, 80),
            (600, 3, 80),
        ]);
        let dets = extract(&samples, 0, 60.0, &c);
        assert_eq!(dets.len(), 3);
        assert_eq!(dets[2].start, 400);
    }

    #[test]
    fn pulse_running_to_frame_end() {
        let c = cfg(20, 0);
        let mut samples = vec![0u16; 1800];
        for s in samples.iter_mut().skip(1790) {
            *s = 90;
        }
        let dets = extract(&samples, 0, 60.0, &c);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].start, 1790);
        assert_eq!(dets[0].width, 10);
    }

    #[test]
    fn peak_range_mm_clamps_at_zero() {
        let d = Detection { start: 0, peak_index: 0, amplitude: 10, width: 1, range_cm: 0.0 };
        assert_eq!(d.peak_range_mm(0.2178), 0);
    }
}
