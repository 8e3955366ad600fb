//! Failures that will never succeed on retry.

use crate::backend::ExecutionResult;

/// Lowercase signatures of terminal failures: missing executable, missing
/// credential, bad model identifier.
const TERMINAL_SIGNATURES: &[&str] = &[
    "enoent",
    "not installed",
    "command not found",
    "missing api key",
    "api key not configured",
    "unknown model identifier",
    "invalid model",
    "model not found",
];

/// Whether `result` failed in a way that retrying cannot fix.
pub fn is_terminal_failure(result: &ExecutionResult) -> bool {
    if result.is_success() || result.timed_out {
        return false;
    }
    let text = result.combined_output().to_lowercase();
    TERMINAL_SIGNATURES.iter().any(|sig| text.contains(sig))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn matches_known_signatures() {
        for message in [
            "Claude CLI is not installed: executable not found (ENOENT)",
            "Missing API key: OPENAI_API_KEY is not configured",
            "Unknown model identifier: mystery",
            "HTTP 404: model not found",
        ] {
            assert!(
                is_terminal_failure(&ExecutionResult::failure(message, Duration::ZERO)),
                "{}",
                message
            );
        }
    }

    #[test]
    fn transient_success_and_timeouts_are_not_terminal() {
        assert!(!is_terminal_failure(&ExecutionResult::failure(
            "HTTP 500: internal error",
            Duration::ZERO
        )));

        let mut timed_out = ExecutionResult::failure("ENOENT", Duration::ZERO);
        timed_out.timed_out = true;
        assert!(!is_terminal_failure(&timed_out));

        let ok = ExecutionResult {
            output: "ENOENT appears in a successful answer".into(),
            ..Default::default()
        };
        assert!(!is_terminal_failure(&ok));
    }
}
