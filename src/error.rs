use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::{Attempt, AttemptOutcome, Capability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Fatal,
    TimedOut,
    ResponseParse,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
            ErrorClass::TimedOut => "timed_out",
            ErrorClass::ResponseParse => "response_parse",
        };
        f.write_str(label)
    }
}

/// Failure local to one candidate provider. Never escapes the dispatcher on
/// its own; it ends up in the attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("fatal provider error: {0}")]
    Fatal(String),
    #[error("job timed out: {0}")]
    TimedOut(String),
    #[error("could not parse provider response: {0}")]
    ResponseParse(String),
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ProviderError::Fatal(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ProviderError::ResponseParse(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Transient(_) => ErrorClass::Transient,
            ProviderError::Fatal(_) => ErrorClass::Fatal,
            ProviderError::TimedOut(_) => ErrorClass::TimedOut,
            ProviderError::ResponseParse(_) => ErrorClass::ResponseParse,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Transient(message)
            | ProviderError::Fatal(message)
            | ProviderError::TimedOut(message)
            | ProviderError::ResponseParse(message) => message,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// What a caller of `Dispatcher::execute` can receive instead of a result.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("no eligible provider for {capability}: {reason}")]
    NoEligibleProvider {
        capability: Capability,
        reason: String,
    },
    #[error(
        "all {} providers failed for {capability}: {}",
        .attempts.len(),
        describe_attempts(.attempts)
    )]
    AllProvidersExhausted {
        capability: Capability,
        attempts: Vec<Attempt>,
    },
}

impl GenerationError {
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            GenerationError::NoEligibleProvider { .. } => &[],
            GenerationError::AllProvidersExhausted { attempts, .. } => attempts,
        }
    }
}

fn describe_attempts(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|attempt| match &attempt.outcome {
            AttemptOutcome::Succeeded => format!("{}: ok", attempt.provider_id),
            AttemptOutcome::Failed { class, message } => {
                format!("{} [{class}]: {message}", attempt.provider_id)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_lists_every_provider() {
        let err = GenerationError::AllProvidersExhausted {
            capability: Capability::Image,
            attempts: vec![
                Attempt::failed("fal-flux", &ProviderError::fatal("401 unauthorized"), 1, None),
                Attempt::failed("gemini-imagen", &ProviderError::transient("503"), 3, None),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("all 2 providers failed for image"));
        assert!(text.contains("fal-flux [fatal]: 401 unauthorized"));
        assert!(text.contains("gemini-imagen [transient]: 503"));
        assert_eq!(err.attempts().len(), 2);
    }

    #[test]
    fn classes_follow_variants() {
        assert!(ProviderError::transient("x").is_transient());
        assert_eq!(ProviderError::parse("bad").class(), ErrorClass::ResponseParse);
        assert_eq!(ProviderError::TimedOut("slow".into()).message(), "slow");
    }
}
