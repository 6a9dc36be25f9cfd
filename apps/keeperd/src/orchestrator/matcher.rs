//! Table-driven classification of host console output. The save-barrier
//! protocol is a handful of known lines; keeping the predicates in one table
//! keeps the surface auditable.

use tracing::warn;

/// One staged world file reported by the host as ready to copy, with the byte
/// length that was fully flushed at the snapshot instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub relative_path: String,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostResponse {
    /// A save is already in progress; the hold must be retried later.
    SaveBusy,
    /// The hold was accepted and a save pass started.
    SaveStarted,
    /// Snapshot complete; the listed files are safe to copy.
    SnapshotReady { files: Vec<SnapshotFile> },
    /// World writes are re-enabled.
    SaveResumed,
}

const BUSY_MARKERS: &[&str] = &["A previous save", "The command is already running"];
const SAVE_STARTED_LINE: &str = "Saving...";
const SNAPSHOT_READY_MARKER: &str = "Data saved. Files are now ready to be copied.";
const RESUMED_LINES: &[&str] = &[
    "Changes to the level are resumed.",
    "Changes to the world are resumed.",
];

/// Every line is checked against each matcher independently; the classes are
/// not mutually exclusive.
const MATCHERS: &[fn(&str) -> Option<HostResponse>] = &[
    match_save_busy,
    match_save_started,
    match_snapshot_ready,
    match_save_resumed,
];

pub fn classify(line: &str) -> Vec<HostResponse> {
    MATCHERS.iter().filter_map(|matcher| matcher(line)).collect()
}

fn match_save_busy(line: &str) -> Option<HostResponse> {
    BUSY_MARKERS
        .iter()
        .any(|marker| line.contains(marker))
        .then_some(HostResponse::SaveBusy)
}

fn match_save_started(line: &str) -> Option<HostResponse> {
    (line == SAVE_STARTED_LINE).then_some(HostResponse::SaveStarted)
}

fn match_snapshot_ready(line: &str) -> Option<HostResponse> {
    line.contains(SNAPSHOT_READY_MARKER)
        .then(|| HostResponse::SnapshotReady {
            files: parse_snapshot_files(line),
        })
}

fn match_save_resumed(line: &str) -> Option<HostResponse> {
    RESUMED_LINES
        .iter()
        .any(|resumed| line == *resumed)
        .then_some(HostResponse::SaveResumed)
}

/// The snapshot line is a comma-space separated list: the leading element is
/// the human-readable notice, each following element is `relative/path:length`.
fn parse_snapshot_files(line: &str) -> Vec<SnapshotFile> {
    line.split(", ")
        .skip(1)
        .filter_map(|entry| {
            let Some((path, length)) = entry.rsplit_once(':') else {
                warn!(entry, "snapshot entry without a byte offset, skipping");
                return None;
            };
            let Ok(length) = length.trim().parse::<u64>() else {
                warn!(entry, "snapshot entry with an unparseable byte offset, skipping");
                return None;
            };
            Some(SnapshotFile {
                relative_path: path.to_string(),
                length,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_busy_markers_by_substring() {
        assert_eq!(
            classify("A previous save has not been completed."),
            vec![HostResponse::SaveBusy]
        );
        assert_eq!(
            classify("The command is already running"),
            vec![HostResponse::SaveBusy]
        );
    }

    #[test]
    fn save_started_requires_an_exact_match() {
        assert_eq!(classify("Saving..."), vec![HostResponse::SaveStarted]);
        assert!(classify("Saving... please wait").is_empty());
    }

    #[test]
    fn resumed_matches_both_phrasings_exactly() {
        assert_eq!(
            classify("Changes to the level are resumed."),
            vec![HostResponse::SaveResumed]
        );
        assert_eq!(
            classify("Changes to the world are resumed."),
            vec![HostResponse::SaveResumed]
        );
        assert!(classify("Changes to the level are resumed. (again)").is_empty());
    }

    #[test]
    fn parses_the_snapshot_file_list() {
        let responses = classify(
            "Data saved. Files are now ready to be copied., World/test.txt:6, World/db/CURRENT:16",
        );
        assert_eq!(
            responses,
            vec![HostResponse::SnapshotReady {
                files: vec![
                    SnapshotFile {
                        relative_path: "World/test.txt".to_string(),
                        length: 6,
                    },
                    SnapshotFile {
                        relative_path: "World/db/CURRENT".to_string(),
                        length: 16,
                    },
                ],
            }]
        );
    }

    #[test]
    fn snapshot_with_no_file_entries_is_still_ready() {
        let responses = classify("Data saved. Files are now ready to be copied.");
        assert_eq!(
            responses,
            vec![HostResponse::SnapshotReady { files: vec![] }]
        );
    }

    #[test]
    fn malformed_snapshot_entries_are_skipped() {
        let responses = classify(
            "Data saved. Files are now ready to be copied., no-offset-here, World/ok.dat:12, World/bad.dat:many",
        );
        assert_eq!(
            responses,
            vec![HostResponse::SnapshotReady {
                files: vec![SnapshotFile {
                    relative_path: "World/ok.dat".to_string(),
                    length: 12,
                }],
            }]
        );
    }

    #[test]
    fn unrelated_lines_classify_to_nothing() {
        assert!(classify("Player connected: Steve, xuid: 253").is_empty());
        assert!(classify("").is_empty());
    }
}
