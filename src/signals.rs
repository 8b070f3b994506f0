use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::warn;

use crate::config::DataDir;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Pause,
    Resume,
}

impl Signal {
    fn name(self) -> &'static str {
        match self {
            Signal::Pause => "pause",
            Signal::Resume => "resume",
        }
    }
}

/// Advisory out-of-process flags between supervisor and worker.
///
/// Raising twice is the same as raising once, and `take` clears what it saw.
pub trait SignalChannel: Send + Sync {
    fn raise(&self, signal: Signal) -> io::Result<()>;
    /// Look without consuming.
    fn is_raised(&self, signal: Signal) -> bool;
    /// Consume the flag if present.
    fn take(&self, signal: Signal) -> bool;
    fn clear_all(&self);
}

/// Marker files in the data directory.
#[derive(Clone, Debug)]
pub struct FileSignals {
    dir: DataDir,
}

impl FileSignals {
    pub fn new(dir: DataDir) -> Self {
        Self { dir }
    }

    fn path(&self, signal: Signal) -> PathBuf {
        self.dir.signal_path(signal.name())
    }

    fn remove(&self, path: PathBuf) {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(?e, path = %path.display(), "Could not clear signal file"),
        }
    }
}

impl SignalChannel for FileSignals {
    fn raise(&self, signal: Signal) -> io::Result<()> {
        fs::create_dir_all(self.dir.root())?;
        fs::write(self.path(signal), b"")
    }

    fn is_raised(&self, signal: Signal) -> bool {
        self.path(signal).exists()
    }

    fn take(&self, signal: Signal) -> bool {
        let path = self.path(signal);
        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                // still report it so the request is not lost
                warn!(?e, path = %path.display(), "Could not clear signal file");
                path.exists()
            }
        }
    }

    fn clear_all(&self) {
        self.remove(self.path(Signal::Pause));
        self.remove(self.path(Signal::Resume));
        self.remove(self.dir.signal_path("stop"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_self_clears() {
        let dir = tempfile::tempdir().unwrap();
        let signals = FileSignals::new(DataDir::new(dir.path()));

        assert!(!signals.take(Signal::Pause));
        signals.raise(Signal::Pause).unwrap();
        signals.raise(Signal::Pause).unwrap();
        assert!(signals.is_raised(Signal::Pause));
        assert!(signals.is_raised(Signal::Pause));
        assert!(signals.take(Signal::Pause));
        assert!(!signals.take(Signal::Pause));
        assert!(!signals.is_raised(Signal::Resume));
    }

    #[test]
    fn clear_all_removes_legacy_stop_marker() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let signals = FileSignals::new(data.clone());
        signals.raise(Signal::Pause).unwrap();
        signals.raise(Signal::Resume).unwrap();
        fs::write(data.signal_path("stop"), b"").unwrap();

        signals.clear_all();
        assert!(!signals.is_raised(Signal::Pause));
        assert!(!signals.is_raised(Signal::Resume));
        assert!(!data.signal_path("stop").exists());
        // nothing left to clear is fine
        signals.clear_all();
    }
}
