//! Flushing a finalized capture.
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where the captured WAV goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    Stdout,
    File(PathBuf),
}

impl CaptureTarget {
    pub fn write(&self, wav: &[u8]) -> std::io::Result<()> {
        match self {
            CaptureTarget::Stdout => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(wav)?;
                stdout.flush()
            }
            CaptureTarget::File(path) => write_atomically(path, wav),
        }
    }
}

/// Write `data` next to `path` and rename it into place, so readers never
/// see a partial file.
pub fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture.wav".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_the_file() {
        let dir = std::env::temp_dir().join(format!("tts-capture-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.wav");

        std::fs::write(&path, b"old").unwrap();
        write_atomically(&path, b"RIFF....WAVE").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"RIFF....WAVE");

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_directory_is_an_error() {
        let path = std::env::temp_dir()
            .join(format!("tts-missing-{}", std::process::id()))
            .join("out.wav");
        assert!(write_atomically(&path, b"data").is_err());
    }
}
