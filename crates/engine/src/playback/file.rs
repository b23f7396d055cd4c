//! File-playback fallback
//!
//! Modular pipelines whose TTS cannot stream hand the engine one whole
//! utterance at a time. The audio is written as a canonical PCM16 WAV
//! under the shared media directory (visible to the PBX), played with
//! the ARI `play` verb, and deleted once `PlaybackFinished` arrives.
//! Filenames are unique per playback so concurrent calls never collide.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// One rendered utterance awaiting (or in) ARI playback
#[derive(Debug, Clone)]
pub struct RenderedUtterance {
    /// Absolute path of the WAV on disk
    pub path: PathBuf,
    /// `sound:` URI to hand to `play_media`
    pub media_uri: String,
}

/// Writes utterances into the shared media directory
#[derive(Debug, Clone)]
pub struct FilePlayback {
    media_dir: PathBuf,
}

impl FilePlayback {
    pub fn new(media_dir: impl Into<PathBuf>) -> Result<Self> {
        let media_dir = media_dir.into();
        std::fs::create_dir_all(&media_dir)
            .map_err(|e| EngineError::Transport(format!("media dir: {e}")))?;
        Ok(Self { media_dir })
    }

    /// Render PCM16 samples to a uniquely named WAV
    pub fn render(&self, samples: &[i16], sample_rate: u32) -> Result<RenderedUtterance> {
        let name = Uuid::new_v4().simple().to_string();
        let path = self.media_dir.join(format!("{name}.wav"));
        write_wav(&path, samples, sample_rate)?;
        // Asterisk resolves the extension itself for sound: URIs
        let media_uri = format!("sound:{}", self.media_dir.join(&name).display());
        debug!(path = %path.display(), ms = samples.len() as u64 * 1000 / sample_rate as u64,
               "rendered utterance");
        Ok(RenderedUtterance { path, media_uri })
    }

    /// Remove a rendered file after its playback finished (or failed)
    pub fn cleanup(&self, utterance: &RenderedUtterance) {
        if let Err(e) = std::fs::remove_file(&utterance.path) {
            warn!(path = %utterance.path.display(), "media cleanup failed: {e}");
        }
    }
}

/// Canonical 44-byte-header mono PCM16 WAV
fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let data_len = (samples.len() * 2) as u32;
    let byte_rate = sample_rate * 2;

    let mut out = Vec::with_capacity(44 + samples.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes()); // PCM fmt chunk
    out.extend_from_slice(&1u16.to_le_bytes()); // linear PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }

    let mut file = std::fs::File::create(path)
        .map_err(|e| EngineError::Transport(format!("create {}: {e}", path.display())))?;
    file.write_all(&out)
        .map_err(|e| EngineError::Transport(format!("write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_media_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("arivox-media-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn renders_a_valid_wav() {
        let dir = temp_media_dir("wav");
        let playback = FilePlayback::new(&dir).unwrap();
        let samples: Vec<i16> = (0..800).map(|i| (i % 200) as i16).collect();

        let utterance = playback.render(&samples, 8_000).unwrap();
        let bytes = std::fs::read(&utterance.path).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(bytes.len(), 44 + 1600);
        // sample rate field
        assert_eq!(u32::from_le_bytes(bytes[24..28].try_into().unwrap()), 8_000);
        // data length field
        assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 1_600);
        assert!(utterance.media_uri.starts_with("sound:"));
        assert!(!utterance.media_uri.ends_with(".wav"));

        playback.cleanup(&utterance);
        assert!(!utterance.path.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn filenames_are_unique() {
        let dir = temp_media_dir("uniq");
        let playback = FilePlayback::new(&dir).unwrap();
        let a = playback.render(&[0i16; 160], 8_000).unwrap();
        let b = playback.render(&[0i16; 160], 8_000).unwrap();
        assert_ne!(a.path, b.path);
        playback.cleanup(&a);
        playback.cleanup(&b);
        std::fs::remove_dir_all(&dir).ok();
    }
}
