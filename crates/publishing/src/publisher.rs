use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult};
use folio_events::{Command, Event};

pub mod rejection {
    pub const PUBLISHER_EXISTS: &str = "PUBLISHER_EXISTS";
}

/// Aggregate root: Publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    id: AggregateId,
    name: String,
    registered: bool,
    version: u64,
}

impl Publisher {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

impl AggregateRoot for Publisher {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPublisher {
    pub publisher_id: AggregateId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamePublisher {
    pub publisher_id: AggregateId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PublisherCommand {
    RegisterPublisher(RegisterPublisher),
    RenamePublisher(RenamePublisher),
}

impl Command for PublisherCommand {
    fn command_type(&self) -> &'static str {
        match self {
            PublisherCommand::RegisterPublisher(_) => "publisher.register",
            PublisherCommand::RenamePublisher(_) => "publisher.rename",
        }
    }

    fn target_aggregate_id(&self) -> &AggregateId {
        match self {
            PublisherCommand::RegisterPublisher(c) => &c.publisher_id,
            PublisherCommand::RenamePublisher(c) => &c.publisher_id,
        }
    }

    fn validate(&self) -> DomainResult<()> {
        let name = match self {
            PublisherCommand::RegisterPublisher(c) => &c.name,
            PublisherCommand::RenamePublisher(c) => &c.name,
        };
        if name.trim().is_empty() {
            return Err(DomainError::validation("name is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherRegistered {
    pub publisher_id: AggregateId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherRenamed {
    pub publisher_id: AggregateId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PublisherEvent {
    #[serde(rename = "publisher.registered")]
    PublisherRegistered(PublisherRegistered),
    #[serde(rename = "publisher.renamed")]
    PublisherRenamed(PublisherRenamed),
}

impl PublisherEvent {
    pub const REGISTERED: &'static str = "publisher.registered";
    pub const RENAMED: &'static str = "publisher.renamed";

    pub fn publisher_id(&self) -> &AggregateId {
        match self {
            PublisherEvent::PublisherRegistered(e) => &e.publisher_id,
            PublisherEvent::PublisherRenamed(e) => &e.publisher_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PublisherEvent::PublisherRegistered(e) => &e.name,
            PublisherEvent::PublisherRenamed(e) => &e.name,
        }
    }
}

impl Event for PublisherEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PublisherEvent::PublisherRegistered(_) => Self::REGISTERED,
            PublisherEvent::PublisherRenamed(_) => Self::RENAMED,
        }
    }

    fn schema_revision(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PublisherEvent::PublisherRegistered(e) => e.occurred_at,
            PublisherEvent::PublisherRenamed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Publisher {
    const AGGREGATE_TYPE: &'static str = "publisher";

    type Command = PublisherCommand;
    type Event = PublisherEvent;
    type Error = DomainError;

    fn initial(id: AggregateId) -> Self {
        Self {
            id,
            name: String::new(),
            registered: false,
            version: 0,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PublisherEvent::PublisherRegistered(e) => {
                self.id = e.publisher_id.clone();
                self.name = e.name.clone();
                self.registered = true;
            }
            PublisherEvent::PublisherRenamed(e) => {
                self.name = e.name.clone();
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        command.validate()?;
        match command {
            PublisherCommand::RegisterPublisher(cmd) => {
                if self.registered {
                    return Err(DomainError::rejected(
                        rejection::PUBLISHER_EXISTS,
                        format!("publisher {} already exists", cmd.publisher_id),
                    ));
                }
                Ok(vec![PublisherEvent::PublisherRegistered(PublisherRegistered {
                    publisher_id: cmd.publisher_id.clone(),
                    name: cmd.name.trim().to_string(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            PublisherCommand::RenamePublisher(cmd) => {
                if !self.registered {
                    return Err(DomainError::not_found(format!("publisher {}", cmd.publisher_id)));
                }
                if cmd.name.trim() == self.name {
                    return Ok(vec![]);
                }
                Ok(vec![PublisherEvent::PublisherRenamed(PublisherRenamed {
                    publisher_id: cmd.publisher_id.clone(),
                    name: cmd.name.trim().to_string(),
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}
