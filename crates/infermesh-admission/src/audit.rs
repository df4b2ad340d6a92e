//! Audit logging of admission decisions.
//!
//! One line per audited event, appended to a file when configured and
//! always emitted on the `audit` tracing target.

use std::fs::{File, OpenOptions};
use std::io::Write;

use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDecision {
    Allowed,
    Rejected,
}

impl AuditDecision {
    fn as_str(&self) -> &'static str {
        match self {
            AuditDecision::Allowed => "allow",
            AuditDecision::Rejected => "reject",
        }
    }
}

pub struct AuditLogger {
    file: Mutex<Option<File>>,
}

impl AuditLogger {
    /// Logger writing only to the tracing target.
    pub fn disabled() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    /// Logger appending to `path` in addition to the tracing target.
    pub fn with_file(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(Some(file)),
        })
    }

    pub fn log(&self, client: &str, method: &str, path: &str, decision: AuditDecision, reason: &str) {
        let request_id = Uuid::new_v4();
        tracing::info!(
            target: "audit",
            %request_id,
            client,
            method,
            path,
            decision = decision.as_str(),
            reason,
            "admission decision"
        );

        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "{} {} {} {} {} {} {}\n",
                chrono::Utc::now().to_rfc3339(),
                request_id,
                client,
                method,
                path,
                decision.as_str(),
                reason,
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!(error = %e, "audit file write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logger_appends_lines() {
        let dir = std::env::temp_dir().join(format!("audit-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("audit.log");
        let path_str = path.to_str().unwrap();

        let logger = AuditLogger::with_file(path_str).unwrap();
        logger.log("1.2.3.4", "GET", "/infer", AuditDecision::Rejected, "rate_limit");
        logger.log("1.2.3.4", "GET", "/infer", AuditDecision::Allowed, "");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("reject"));
        assert!(lines[0].contains("rate_limit"));
        assert!(lines[1].contains("allow"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn disabled_logger_does_not_panic() {
        let logger = AuditLogger::disabled();
        logger.log("::1", "POST", "/x", AuditDecision::Allowed, "");
    }
}
