//! Format selection policy
//!
//! Maps a requested [`AudioQuality`] (plus the metered-network hint) to one
//! of the audio-only formats offered by the provider.
//!
//! - `Auto` picks the highest bitrate under a per-network ceiling
//!   (metered links are capped at 128 kbit/s when such a format exists)
//! - `Low`/`Medium`/`High` pick the closest format to a target bitrate
//! - `Max` picks the best available
//! - Ties break toward Opus/WebM over M4A

use crate::resolver::StreamFormat;
use muse_core::AudioQuality;

/// Bitrate ceiling applied to `Auto` on metered links, bits per second.
pub const METERED_CEILING_BPS: u32 = 128_000;

const TARGET_LOW_BPS: u32 = 64_000;
const TARGET_MEDIUM_BPS: u32 = 128_000;
const TARGET_HIGH_BPS: u32 = 256_000;

/// Rank used as the final tie-break: lower is preferred.
fn mime_rank(f: &StreamFormat) -> u8 {
    if f.format.is_webm_opus() {
        0
    } else {
        1
    }
}

/// Pick the format matching the quality policy, or `None` when the provider
/// offered nothing.
pub fn select_format<'a>(
    formats: &'a [StreamFormat],
    quality: AudioQuality,
    metered: bool,
) -> Option<&'a StreamFormat> {
    if formats.is_empty() {
        return None;
    }

    match quality {
        AudioQuality::Auto => {
            let ceiling = if metered { METERED_CEILING_BPS } else { u32::MAX };
            let capped = formats
                .iter()
                .filter(|f| f.format.bitrate <= ceiling)
                .max_by_key(|f| (f.format.bitrate, std::cmp::Reverse(mime_rank(f))));
            // Nothing under the ceiling: fall back to the smallest offered.
            capped.or_else(|| {
                formats
                    .iter()
                    .min_by_key(|f| (f.format.bitrate, mime_rank(f)))
            })
        }
        AudioQuality::Low => closest_to(formats, TARGET_LOW_BPS),
        AudioQuality::Medium => closest_to(formats, TARGET_MEDIUM_BPS),
        AudioQuality::High => closest_to(formats, TARGET_HIGH_BPS),
        AudioQuality::Max => formats
            .iter()
            .max_by_key(|f| (f.format.bitrate, std::cmp::Reverse(mime_rank(f)))),
    }
}

fn closest_to(formats: &[StreamFormat], target: u32) -> Option<&StreamFormat> {
    formats
        .iter()
        .min_by_key(|f| (f.format.bitrate.abs_diff(target), mime_rank(f)))
}
