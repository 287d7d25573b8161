use crate::error::{WardenError, WardenResult};

/// Tagged result of an agent or step execution.
///
/// The orchestrator and workflow engine branch on this value instead of on
/// error types: `Retryable` outcomes go back through the retry policy, `Fatal`
/// ones are recorded and never retried.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The call produced a value.
    Success(T),
    /// The call failed with a transient error; trying again may succeed.
    Retryable(WardenError),
    /// The call failed permanently.
    Fatal(WardenError),
}

impl<T> Outcome<T> {
    /// Classify a plain result using [`WardenError::is_transient`].
    pub fn from_result(result: WardenResult<T>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) if e.is_transient() => Outcome::Retryable(e),
            Err(e) => Outcome::Fatal(e),
        }
    }

    /// Whether this is a `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The error carried by a failed outcome.
    pub fn error(&self) -> Option<&WardenError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Retryable(e) | Outcome::Fatal(e) => Some(e),
        }
    }

    /// Collapse back into a plain result.
    pub fn into_result(self) -> WardenResult<T> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Retryable(e) | Outcome::Fatal(e) => Err(e),
        }
    }

    /// Map the success value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Retryable(e) => Outcome::Retryable(e),
            Outcome::Fatal(e) => Outcome::Fatal(e),
        }
    }
}

impl<T> From<WardenResult<T>> for Outcome<T> {
    fn from(result: WardenResult<T>) -> Self {
        Outcome::from_result(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result_classification() {
        let ok: Outcome<u32> = Outcome::from_result(Ok(7));
        assert!(ok.is_success());

        let retry: Outcome<u32> = Outcome::from_result(Err(WardenError::RateLimited("429".into())));
        assert!(matches!(retry, Outcome::Retryable(_)));

        let fatal: Outcome<u32> =
            Outcome::from_result(Err(WardenError::AgentNotFound("ghost".into())));
        assert!(matches!(fatal, Outcome::Fatal(_)));
        assert_eq!(fatal.error().unwrap().kind(), "agent_not_found");
    }

    #[test]
    fn test_circuit_open_is_fatal() {
        let outcome: Outcome<()> = Outcome::from_result(Err(WardenError::CircuitOpen {
            agent: "stride".into(),
            retry_after_secs: 300,
        }));
        assert!(matches!(outcome, Outcome::Fatal(WardenError::CircuitOpen { .. })));
    }

    #[test]
    fn test_map_and_into_result() {
        let outcome = Outcome::Success(2).map(|v| v * 10);
        assert_eq!(outcome.into_result().unwrap(), 20);
    }
}
