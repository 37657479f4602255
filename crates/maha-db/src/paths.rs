use std::path::{Path, PathBuf};

/// Paths into the state root for a given feature (spec §6).
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
    feature: String,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>, feature: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            feature: feature.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// `<state-root>/<feature>.json`
    pub fn state_document(&self) -> PathBuf {
        self.root.join(format!("{}.json", self.feature))
    }

    /// Sidecar lock file for the cross-process file lock.
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(format!("{}.json.lock", self.feature))
    }

    /// Temp file used for the write-to-temp-then-rename sequence.
    pub fn temp_document(&self) -> PathBuf {
        self.root.join(format!("{}.json.tmp", self.feature))
    }

    pub fn heartbeat_file(&self, worker_id: u32) -> PathBuf {
        self.root.join(format!("heartbeat-{worker_id}.json"))
    }

    pub fn progress_file(&self, worker_id: u32) -> PathBuf {
        self.root.join(format!("progress-{worker_id}.json"))
    }

    pub fn monitor_log(&self) -> PathBuf {
        self.root.join("monitor.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_deterministic() {
        let p = StatePaths::new("/tmp/state", "checkout-flow");
        assert_eq!(
            p.state_document(),
            PathBuf::from("/tmp/state/checkout-flow.json")
        );
        assert_eq!(
            p.lock_file(),
            PathBuf::from("/tmp/state/checkout-flow.json.lock")
        );
        assert_eq!(p.heartbeat_file(3), PathBuf::from("/tmp/state/heartbeat-3.json"));
        assert_eq!(p.progress_file(3), PathBuf::from("/tmp/state/progress-3.json"));
        assert_eq!(p.monitor_log(), PathBuf::from("/tmp/state/monitor.log"));
    }
}
