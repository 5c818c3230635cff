use std::path::PathBuf;

use membal::Suppression;

/// Suppresses balancing while a marker file exists.
#[derive(Debug, Clone)]
pub struct MarkerFile {
    path: PathBuf,
}

impl MarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Suppression for MarkerFile {
    fn is_suppressed(&self) -> bool {
        self.path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn follows_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        let marker = MarkerFile::new(dir.path().join("do-not-membalance"));
        assert!(!marker.is_suppressed());

        fs::write(dir.path().join("do-not-membalance"), "").unwrap();
        assert!(marker.is_suppressed());

        fs::remove_file(dir.path().join("do-not-membalance")).unwrap();
        assert!(!marker.is_suppressed());
    }

    #[test]
    fn directory_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!MarkerFile::new(dir.path()).is_suppressed());
    }
}
