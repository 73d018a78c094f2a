//! Classification of remote error messages.
//!
//! Remote errors only arrive as text, so they are sorted by signature:
//! a case-insensitive substring match against two configured lists.
//! Transient signatures are checked first.

use crate::config::RecoveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Network blip the connection recovers from by itself. Logged only.
    Transient,
    /// Remote-side fault worth a bounded reconnect.
    Recoverable,
    /// Anything else. Ends the session.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct FaultClassifier {
    transient: Vec<String>,
    recoverable: Vec<String>,
}

impl FaultClassifier {
    pub fn new<S: AsRef<str>>(transient: &[S], recoverable: &[S]) -> Self {
        let lower = |list: &[S]| -> Vec<String> {
            list.iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            transient: lower(transient),
            recoverable: lower(recoverable),
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(&config.transient_signatures, &config.recoverable_signatures)
    }

    pub fn classify(&self, message: &str) -> FaultClass {
        let message = message.to_lowercase();
        let matches = |list: &[String]| list.iter().any(|sig| message.contains(sig.as_str()));

        if matches(&self.transient) {
            FaultClass::Transient
        } else if matches(&self.recoverable) {
            FaultClass::Recoverable
        } else {
            FaultClass::Fatal
        }
    }
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_signatures() {
        let c = FaultClassifier::default();
        assert_eq!(c.classify("Network error while streaming"), FaultClass::Transient);
        assert_eq!(c.classify("TypeError: Failed to fetch"), FaultClass::Transient);
        assert_eq!(c.classify("Internal error encountered."), FaultClass::Recoverable);
        assert_eq!(
            c.classify("The service is currently unavailable."),
            FaultClass::Recoverable
        );
        assert_eq!(c.classify("API key not valid"), FaultClass::Fatal);
        assert_eq!(c.classify(""), FaultClass::Fatal);
    }

    #[test]
    fn transient_wins_over_recoverable() {
        let c = FaultClassifier::new(&["network"], &["internal"]);
        assert_eq!(c.classify("internal network failure"), FaultClass::Transient);
    }

    #[test]
    fn blank_signatures_match_nothing() {
        let c = FaultClassifier::new(&["", "  "], &["internal"]);
        assert_eq!(c.classify("anything"), FaultClass::Fatal);
    }
}
