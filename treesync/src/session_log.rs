use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogParams {
    pub file: PathBuf,
    /// Truncate the file on `begin` instead of appending a session separator.
    pub rewrite: bool,
    pub timestamps: bool,
    pub out_info: bool,
    pub out_errors: bool,
    pub out_warnings: bool,
}

impl Default for LogParams {
    fn default() -> Self {
        Self {
            file: PathBuf::from("treesync.log"),
            rewrite: false,
            timestamps: true,
            out_info: true,
            out_errors: true,
            out_warnings: true,
        }
    }
}

/// Append-only session journal. Write failures never interrupt a sync,
/// the line falls back to stderr instead.
pub struct SessionLog {
    params: LogParams,
}

impl SessionLog {
    pub fn new(params: LogParams) -> Self {
        Self { params }
    }

    /// Open the session: truncate or separate from the previous session,
    /// then write a dated header.
    pub fn begin(&self) {
        if self.params.rewrite {
            if let Err(err) = std::fs::write(&self.params.file, b"") {
                eprintln!("[treesync] log truncate failed: {err}");
            }
        } else if std::fs::metadata(&self.params.file).is_ok_and(|m| m.len() > 0) {
            self.append(&format!("\n{}\n", "═".repeat(64)));
        }
        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown time".to_string());
        self.append(&format!("{stamp}\n{}\n", "─".repeat(stamp.len())));
    }

    pub fn service(&self, message: &str, title: Option<&str>) {
        if !self.params.out_info {
            return;
        }
        match title {
            Some(title) => self.line(&format!("{title}{message}")),
            None => self.line(message),
        }
    }

    pub fn error(&self, message: &str, code: Option<&str>) {
        if !self.params.out_errors {
            return;
        }
        match code {
            Some(code) => self.line(&format!("ERROR({code}): {message}")),
            None => self.line(&format!("ERROR: {message}")),
        }
    }

    pub fn warning(&self, message: &str) {
        if !self.params.out_warnings {
            return;
        }
        self.line(&format!("WARNING: {message}"));
    }

    fn line(&self, message: &str) {
        if self.params.timestamps {
            let now = OffsetDateTime::now_utc();
            self.append(&format!(
                "[{:02}:{:02}:{:02}] {message}\n",
                now.hour(),
                now.minute(),
                now.second()
            ));
        } else {
            self.append(&format!("{message}\n"));
        }
    }

    fn append(&self, text: &str) {
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.params.file)
            .and_then(|mut file| file.write_all(text.as_bytes()));
        if let Err(err) = written {
            eprintln!("[treesync] log write failed: {err}");
            eprint!("{text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(file: PathBuf) -> LogParams {
        LogParams {
            file,
            timestamps: false,
            ..LogParams::default()
        }
    }

    #[test]
    fn begin_separates_sessions_in_append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sync.log");
        let log = SessionLog::new(params(file.clone()));

        log.begin();
        log.service("first", None);
        log.begin();

        let text = std::fs::read_to_string(&file).unwrap();
        assert!(text.contains("first"));
        assert!(text.contains("═"));
    }

    #[test]
    fn rewrite_mode_truncates_the_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sync.log");
        std::fs::write(&file, "stale contents\n").unwrap();

        let log = SessionLog::new(LogParams {
            rewrite: true,
            ..params(file.clone())
        });
        log.begin();
        log.error("boom", Some("upload"));

        let text = std::fs::read_to_string(&file).unwrap();
        assert!(!text.contains("stale contents"));
        assert!(text.contains("ERROR(upload): boom"));
    }

    #[test]
    fn muted_channels_stay_silent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sync.log");
        let log = SessionLog::new(LogParams {
            out_info: false,
            out_warnings: false,
            ..params(file.clone())
        });

        log.service("hidden", None);
        log.warning("hidden too");
        log.error("kept", None);

        let text = std::fs::read_to_string(&file).unwrap();
        assert!(!text.contains("hidden"));
        assert!(text.contains("ERROR: kept"));
    }
}
