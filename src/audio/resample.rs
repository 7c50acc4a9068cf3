//! Integer-ratio resampling
//!
//! Downsampling averages each group of `ratio` input samples; upsampling
//! linearly interpolates between neighbors. Non-integer ratios are not
//! supported and return the input unchanged — acceptable here because the
//! wire rates (16 kHz out, 24 kHz in) and common device rates (48 kHz) are
//! all integer multiples of each other.

/// Resample mono PCM16 between two rates.
///
/// Returns the input unchanged (with a warning) for zero or non-integer
/// ratios rather than failing the audio path.
pub fn resample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == 0 || target_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate > target_rate {
        if source_rate % target_rate != 0 {
            log::warn!(
                "Unsupported resample ratio {}:{}, returning original",
                source_rate,
                target_rate
            );
            return samples.to_vec();
        }
        downsample(samples, (source_rate / target_rate) as usize)
    } else {
        if target_rate % source_rate != 0 {
            log::warn!(
                "Unsupported resample ratio {}:{}, returning original",
                source_rate,
                target_rate
            );
            return samples.to_vec();
        }
        upsample(samples, (target_rate / source_rate) as usize)
    }
}

/// Average each group of `ratio` samples.
fn downsample(samples: &[i16], ratio: usize) -> Vec<i16> {
    samples
        .chunks(ratio)
        .map(|chunk| {
            // i64 to avoid overflow on large chunks
            let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect()
}

/// Linear interpolation between neighboring samples; the final sample is
/// held for its whole output group.
fn upsample(samples: &[i16], ratio: usize) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * ratio);
    for (i, &sample) in samples.iter().enumerate() {
        let next = samples.get(i + 1).copied().unwrap_or(sample);
        for step in 0..ratio {
            let delta = (next as i64 - sample as i64) * step as i64 / ratio as i64;
            out.push((sample as i64 + delta) as i16);
        }
    }
    out
}
