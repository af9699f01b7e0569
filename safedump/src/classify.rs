//! Classification of engine-tool diagnostic lines.
//!
//! Restore and dump tools emit a stream of diagnostics on stderr. Each line
//! is mapped to a severity class plus a category and remediation hint, so
//! the orchestrators can decide whether to continue, fail one database, or
//! abort the whole run. Classification is a substring scan over a static
//! table and never allocates.

use serde::Serialize;
use std::fmt;

/// Severity of one diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Ignorable,
    Warning,
    Critical,
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Ignorable => "ignorable",
            ErrorClass::Warning => "warning",
            ErrorClass::Critical => "critical",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Result of classifying one diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: ErrorClass,
    pub category: &'static str,
    pub hint: &'static str,
    pub remediation: &'static str,
}

struct Rule {
    patterns: &'static [&'static str],
    class: ErrorClass,
    category: &'static str,
    hint: &'static str,
    remediation: &'static str,
}

static RULES: &[Rule] = &[
    Rule {
        patterns: &["already exists", "multiple primary keys"],
        class: ErrorClass::Ignorable,
        category: "duplicate",
        hint: "object already present in target",
        remediation: "continue",
    },
    Rule {
        patterns: &["no space left on device", "could not extend file", "disk full"],
        class: ErrorClass::Critical,
        category: "disk_space",
        hint: "target volume is full",
        remediation: "free space or increase quota",
    },
    Rule {
        patterns: &["out of shared memory", "max_locks_per_transaction"],
        class: ErrorClass::Critical,
        category: "locks",
        hint: "lock table exhausted",
        remediation: "raise max_locks_per_transaction; ensure sequential restore",
    },
    Rule {
        patterns: &["syntax error", "invalid command \\N", "unexpected end of file"],
        class: ErrorClass::Fatal,
        category: "corruption",
        hint: "dump content is not valid",
        remediation: "re-create the backup",
    },
    Rule {
        patterns: &["permission denied", "must be owner of", "must be superuser"],
        class: ErrorClass::Critical,
        category: "permissions",
        hint: "insufficient privileges on target",
        remediation: "run as superuser or restore with --no-owner",
    },
    Rule {
        patterns: &[
            "connection refused",
            "could not translate host name",
            "pg_hba",
            "connection to server",
            "access denied for user",
        ],
        class: ErrorClass::Critical,
        category: "network",
        hint: "server unreachable or authentication rejected",
        remediation: "verify host reachability and auth rules",
    },
    Rule {
        patterns: &[
            "unsupported version",
            "server version mismatch",
            "aborting because of server version mismatch",
            "archive format is not supported",
        ],
        class: ErrorClass::Warning,
        category: "version",
        hint: "tool and server versions differ",
        remediation: "use a compatible engine version",
    },
];

const UNKNOWN: Classification = Classification {
    class: ErrorClass::Warning,
    category: "unknown",
    hint: "unrecognized diagnostic",
    remediation: "inspect logs",
};

/// Classify a single diagnostic line. Hot path: substring matches against a
/// static table; the returned strings are `'static` and nothing allocates.
pub fn classify(line: &str) -> Classification {
    for rule in RULES {
        for pat in rule.patterns {
            if line.contains(pat) {
                return Classification {
                    class: rule.class,
                    category: rule.category,
                    hint: rule.hint,
                    remediation: rule.remediation,
                };
            }
        }
    }
    UNKNOWN
}

/// Running per-database tally of classified diagnostics.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DiagnosticTally {
    pub ignorable: u64,
    pub warning: u64,
    pub critical: u64,
    pub fatal: u64,
    /// Critical diagnostics whose category is not "duplicate"; these fail
    /// the enclosing per-database step.
    pub critical_non_duplicate: u64,
}

impl DiagnosticTally {
    pub fn record(&mut self, c: &Classification) {
        match c.class {
            ErrorClass::Ignorable => self.ignorable += 1,
            ErrorClass::Warning => self.warning += 1,
            ErrorClass::Critical => {
                self.critical += 1;
                if c.category != "duplicate" {
                    self.critical_non_duplicate += 1;
                }
            }
            ErrorClass::Fatal => self.fatal += 1,
        }
    }

    pub fn merge(&mut self, other: &DiagnosticTally) {
        self.ignorable += other.ignorable;
        self.warning += other.warning;
        self.critical += other.critical;
        self.fatal += other.fatal;
        self.critical_non_duplicate += other.critical_non_duplicate;
    }

    /// A step succeeded iff it saw no Fatal and no Critical outside the
    /// duplicate category.
    pub fn is_success(&self) -> bool {
        self.fatal == 0 && self.critical_non_duplicate == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_is_ignorable() {
        let c = classify("ERROR:  relation \"users\" already exists");
        assert_eq!(c.class, ErrorClass::Ignorable);
        assert_eq!(c.category, "duplicate");
        assert_eq!(c.remediation, "continue");
    }

    #[test]
    fn test_lock_exhaustion_is_critical() {
        let c = classify("ERROR:  out of shared memory");
        assert_eq!(c.class, ErrorClass::Critical);
        assert_eq!(c.category, "locks");

        let c = classify("HINT:  You might need to increase max_locks_per_transaction.");
        assert_eq!(c.category, "locks");
    }

    #[test]
    fn test_corruption_is_fatal() {
        assert_eq!(classify("invalid command \\N").class, ErrorClass::Fatal);
        assert_eq!(classify("ERROR:  syntax error at or near \"<\"").class, ErrorClass::Fatal);
    }

    #[test]
    fn test_unknown_is_warning() {
        let c = classify("something nobody has ever seen before");
        assert_eq!(c.class, ErrorClass::Warning);
        assert_eq!(c.category, "unknown");
    }

    #[test]
    fn test_classification_is_idempotent() {
        let line = "FATAL:  password authentication failed, pg_hba.conf rejects connection";
        assert_eq!(classify(line), classify(line));
    }

    #[test]
    fn test_tally_success_tolerates_duplicates() {
        let mut tally = DiagnosticTally::default();
        tally.record(&classify("ERROR: type \"status\" already exists"));
        tally.record(&classify("unrecognized noise"));
        assert!(tally.is_success());

        tally.record(&classify("ERROR: permission denied for table users"));
        assert!(!tally.is_success());
        assert_eq!(tally.critical_non_duplicate, 1);
    }
}
