use folio_core::{AggregateId, DomainResult, ExpectedVersion};

/// A command targets a specific aggregate (command abstraction).
///
/// Commands represent **intent**. They are transient (never persisted) and are
/// turned into events by the target aggregate, or rejected.
///
/// Commands must be cloneable (they are re-handled on concurrency retries) and
/// own all their data so they can cross worker threads.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable command name (e.g. "library.add_book"), used for logging.
    fn command_type(&self) -> &'static str;

    /// Aggregate instance this command is routed to.
    fn target_aggregate_id(&self) -> &AggregateId;

    /// Structural checks that need no aggregate state (required fields, formats).
    ///
    /// Failures here surface as validation errors before anything is loaded.
    fn validate(&self) -> DomainResult<()> {
        Ok(())
    }
}

/// A command plus the caller's optional optimistic-concurrency expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope<C> {
    command: C,
    expected_version: Option<ExpectedVersion>,
}

impl<C: Command> CommandEnvelope<C> {
    pub fn new(command: C) -> Self {
        Self {
            command,
            expected_version: None,
        }
    }

    /// Pin the stream version the caller observed.
    pub fn expecting(mut self, expected: ExpectedVersion) -> Self {
        self.expected_version = Some(expected);
        self
    }

    pub fn command(&self) -> &C {
        &self.command
    }

    pub fn expected_version(&self) -> Option<ExpectedVersion> {
        self.expected_version
    }

    pub fn into_command(self) -> C {
        self.command
    }
}

impl<C: Command> From<C> for CommandEnvelope<C> {
    fn from(command: C) -> Self {
        Self::new(command)
    }
}
