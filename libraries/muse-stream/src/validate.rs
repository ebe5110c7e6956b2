//! Post-download body validation
//!
//! The offline library refuses to keep a body that is too small, too far
//! short of the advertised length, or whose first bytes do not match the
//! container the file extension promises.

use crate::error::DownloadError;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Bodies below this size never validate.
const MIN_BODY_BYTES: u64 = 50 * 1024;

/// Largest tolerated deficit against a known expected length, percent.
const MAX_DEFICIT_PERCENT: f64 = 5.0;

/// Validate a finished download at `path`.
///
/// Checks, in order: existence, size floor, deficit against
/// `expected_bytes`, and container magic bytes for known extensions.
/// Unknown extensions skip the magic check.
pub async fn validate_downloaded_file(
    path: &Path,
    expected_bytes: Option<u64>,
) -> Result<(), DownloadError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => {
            return Err(DownloadError::Corrupt(format!(
                "missing file {}",
                path.display()
            )))
        }
    };

    let size = meta.len();
    if size < MIN_BODY_BYTES {
        return Err(DownloadError::Corrupt(format!(
            "body too small: {size} bytes"
        )));
    }

    if let Some(expected) = expected_bytes {
        if size < expected {
            let missing = (expected - size) as f64 / expected as f64 * 100.0;
            if missing > MAX_DEFICIT_PERCENT {
                return Err(DownloadError::Incomplete(missing));
            }
        }
    }

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let mut head = [0u8; 12];
    let mut file = tokio::fs::File::open(path).await?;
    let read = file.read(&mut head).await?;

    if !magic_matches(&ext, &head[..read]) {
        return Err(DownloadError::Corrupt(format!(
            "bad {ext} header in {}",
            path.display()
        )));
    }
    Ok(())
}

/// Magic-byte check by extension. Unknown extensions pass.
fn magic_matches(ext: &str, head: &[u8]) -> bool {
    match ext {
        "m4a" => {
            // `ftyp` box at offset 0 or 4.
            head.len() >= 8 && (&head[..4] == b"ftyp" || &head[4..8] == b"ftyp")
        }
        "opus" | "webm" => {
            // EBML header or an Ogg page.
            head.len() >= 4
                && (head[..4] == [0x1A, 0x45, 0xDF, 0xA3] || &head[..4] == b"OggS")
        }
        "mp3" => {
            // ID3 tag or an MPEG sync word.
            head.len() >= 3
                && (&head[..3] == b"ID3" || (head[0] == 0xFF && head[1] & 0xE0 == 0xE0))
        }
        _ => true,
    }
}
