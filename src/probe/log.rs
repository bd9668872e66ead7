//! Run-scoped diagnostics log.

use chrono::Utc;

/// Append-only event log for one verification run.
///
/// Entries are `[ISO-8601 timestamp with microseconds] message`, recorded at
/// event time. The log is cleared when a run starts; every entry is mirrored
/// to `tracing::debug!` and, in debug mode, to stdout.
#[derive(Debug, Default)]
pub struct ProbeLog {
    entries: Vec<String>,
    mirror_stdout: bool,
}

impl ProbeLog {
    pub fn new(mirror_stdout: bool) -> Self {
        Self {
            entries: Vec::new(),
            mirror_stdout,
        }
    }

    pub fn note(&mut self, message: &str) {
        let entry = format!(
            "[{}] {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            message
        );
        tracing::debug!(target: "mailprobe", "{message}");
        if self.mirror_stdout {
            println!("{entry}");
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_timestamped_and_ordered() {
        let mut log = ProbeLog::new(false);
        log.note("first");
        log.note("second");
        assert_eq!(log.entries().len(), 2);
        assert!(log.entries()[0].starts_with('['));
        assert!(log.entries()[0].ends_with("first"));
        assert!(log.entries()[1].ends_with("second"));
        // [YYYY-MM-DDTHH:MM:SS.ffffffZ] prefix
        let stamp = &log.entries()[0][1..log.entries()[0].find(']').expect("bracket")];
        assert!(stamp.contains('T'));
        assert!(stamp.ends_with('Z'));
        assert_eq!(stamp.split('.').nth(1).map(|f| f.len()), Some(7));
    }

    #[test]
    fn clear_empties_the_log() {
        let mut log = ProbeLog::new(false);
        log.note("entry");
        log.clear();
        assert!(log.entries().is_empty());
    }
}
