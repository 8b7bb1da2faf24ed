use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, ValueObject};
use folio_events::{Command, Event};

/// Stable rule identities carried by rejections.
pub mod rejection {
    pub const LIBRARY_EXISTS: &str = "LIBRARY_EXISTS";
    pub const DUPLICATE_ISBN: &str = "DUPLICATE_ISBN";
    pub const BOOK_NOT_FOUND: &str = "BOOK_NOT_FOUND";
}

/// ISBN keyed by its digits: hyphens and whitespace are dropped and a
/// trailing check `x` is uppercased, so every spelling of one book compares
/// equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Isbn(String);

impl Isbn {
    /// Accepts ISBN-10 or ISBN-13, with or without hyphens.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("isbn is required"));
        }

        let digits = canonical_isbn(trimmed);
        let chars: Vec<char> = digits.chars().collect();
        let valid = match chars.len() {
            13 => chars.iter().all(|c| c.is_ascii_digit()),
            10 => chars[..9].iter().all(|c| c.is_ascii_digit()) && (chars[9].is_ascii_digit() || chars[9] == 'X'),
            _ => false,
        };
        if !valid {
            return Err(DomainError::validation(format!("malformed isbn: {trimmed}")));
        }

        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for Isbn {}

/// Key form of a raw ISBN, without validating it.
pub(crate) fn canonical_isbn(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

impl core::fmt::Display for Isbn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A book held by a library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub isbn: Isbn,
    pub title: String,
    pub publisher_id: Option<AggregateId>,
}

/// Aggregate root: Library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    id: AggregateId,
    name: String,
    created: bool,
    books: BTreeMap<Isbn, Book>,
    version: u64,
}

impl Library {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn book(&self, isbn: &Isbn) -> Option<&Book> {
        self.books.get(isbn)
    }

    pub fn books(&self) -> impl Iterator<Item = &Book> {
        self.books.values()
    }
}

impl AggregateRoot for Library {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateLibrary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLibrary {
    pub library_id: AggregateId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RenameLibrary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameLibrary {
    pub library_id: AggregateId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddBook.
///
/// `transfer_id` is set when the book arrives through a transfer (or returns
/// from a failed one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddBook {
    pub library_id: AggregateId,
    pub isbn: String,
    pub title: String,
    #[serde(default)]
    pub publisher_id: Option<AggregateId>,
    #[serde(default)]
    pub transfer_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveBook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveBook {
    pub library_id: AggregateId,
    pub isbn: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: TransferBook (hand a book over to another library).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBook {
    pub library_id: AggregateId,
    pub isbn: String,
    pub to_library_id: AggregateId,
    pub transfer_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum LibraryCommand {
    CreateLibrary(CreateLibrary),
    RenameLibrary(RenameLibrary),
    AddBook(AddBook),
    RemoveBook(RemoveBook),
    TransferBook(TransferBook),
}

impl Command for LibraryCommand {
    fn command_type(&self) -> &'static str {
        match self {
            LibraryCommand::CreateLibrary(_) => "library.create",
            LibraryCommand::RenameLibrary(_) => "library.rename",
            LibraryCommand::AddBook(_) => "library.add_book",
            LibraryCommand::RemoveBook(_) => "library.remove_book",
            LibraryCommand::TransferBook(_) => "library.transfer_book",
        }
    }

    fn target_aggregate_id(&self) -> &AggregateId {
        match self {
            LibraryCommand::CreateLibrary(c) => &c.library_id,
            LibraryCommand::RenameLibrary(c) => &c.library_id,
            LibraryCommand::AddBook(c) => &c.library_id,
            LibraryCommand::RemoveBook(c) => &c.library_id,
            LibraryCommand::TransferBook(c) => &c.library_id,
        }
    }

    fn validate(&self) -> DomainResult<()> {
        match self {
            LibraryCommand::CreateLibrary(c) => require("name", &c.name),
            LibraryCommand::RenameLibrary(c) => require("name", &c.name),
            LibraryCommand::AddBook(c) => {
                Isbn::parse(&c.isbn)?;
                require("title", &c.title)?;
                if let Some(transfer_id) = &c.transfer_id {
                    require("transfer_id", transfer_id)?;
                }
                Ok(())
            }
            LibraryCommand::RemoveBook(c) => Isbn::parse(&c.isbn).map(|_| ()),
            LibraryCommand::TransferBook(c) => {
                Isbn::parse(&c.isbn)?;
                require("transfer_id", &c.transfer_id)?;
                if c.to_library_id == c.library_id {
                    return Err(DomainError::validation(
                        "a book cannot be transferred to the library that holds it",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn require(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} is required")));
    }
    Ok(())
}

/// Event: LibraryCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryCreated {
    pub library_id: AggregateId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LibraryRenamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRenamed {
    pub library_id: AggregateId,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BookAdded (revision 3, see `upcast`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookAdded {
    pub library_id: AggregateId,
    pub isbn: Isbn,
    pub title: String,
    pub publisher_id: Option<AggregateId>,
    pub transfer_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BookRemoved.
///
/// Carries the publisher attribution the book had, so read models keyed by
/// publisher can retract it without looking anything up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRemoved {
    pub library_id: AggregateId,
    pub isbn: Isbn,
    pub publisher_id: Option<AggregateId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BookTransferredOut (the book left this library for another one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookTransferredOut {
    pub library_id: AggregateId,
    pub isbn: Isbn,
    pub title: String,
    pub publisher_id: Option<AggregateId>,
    pub to_library_id: AggregateId,
    pub transfer_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LibraryEvent {
    #[serde(rename = "library.created")]
    LibraryCreated(LibraryCreated),
    #[serde(rename = "library.renamed")]
    LibraryRenamed(LibraryRenamed),
    #[serde(rename = "library.book_added")]
    BookAdded(BookAdded),
    #[serde(rename = "library.book_removed")]
    BookRemoved(BookRemoved),
    #[serde(rename = "library.book_transferred_out")]
    BookTransferredOut(BookTransferredOut),
}

impl LibraryEvent {
    pub const CREATED: &'static str = "library.created";
    pub const RENAMED: &'static str = "library.renamed";
    pub const BOOK_ADDED: &'static str = "library.book_added";
    pub const BOOK_REMOVED: &'static str = "library.book_removed";
    pub const BOOK_TRANSFERRED_OUT: &'static str = "library.book_transferred_out";

    pub fn library_id(&self) -> &AggregateId {
        match self {
            LibraryEvent::LibraryCreated(e) => &e.library_id,
            LibraryEvent::LibraryRenamed(e) => &e.library_id,
            LibraryEvent::BookAdded(e) => &e.library_id,
            LibraryEvent::BookRemoved(e) => &e.library_id,
            LibraryEvent::BookTransferredOut(e) => &e.library_id,
        }
    }
}

impl Event for LibraryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LibraryEvent::LibraryCreated(_) => Self::CREATED,
            LibraryEvent::LibraryRenamed(_) => Self::RENAMED,
            LibraryEvent::BookAdded(_) => Self::BOOK_ADDED,
            LibraryEvent::BookRemoved(_) => Self::BOOK_REMOVED,
            LibraryEvent::BookTransferredOut(_) => Self::BOOK_TRANSFERRED_OUT,
        }
    }

    fn schema_revision(&self) -> u32 {
        match self {
            LibraryEvent::BookAdded(_) => crate::upcast::BOOK_ADDED_REVISION,
            _ => 1,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LibraryEvent::LibraryCreated(e) => e.occurred_at,
            LibraryEvent::LibraryRenamed(e) => e.occurred_at,
            LibraryEvent::BookAdded(e) => e.occurred_at,
            LibraryEvent::BookRemoved(e) => e.occurred_at,
            LibraryEvent::BookTransferredOut(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Library {
    const AGGREGATE_TYPE: &'static str = "library";

    type Command = LibraryCommand;
    type Event = LibraryEvent;
    type Error = DomainError;

    fn initial(id: AggregateId) -> Self {
        Self {
            id,
            name: String::new(),
            created: false,
            books: BTreeMap::new(),
            version: 0,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LibraryEvent::LibraryCreated(e) => {
                self.id = e.library_id.clone();
                self.name = e.name.clone();
                self.created = true;
            }
            LibraryEvent::LibraryRenamed(e) => {
                self.name = e.name.clone();
            }
            LibraryEvent::BookAdded(e) => {
                self.books.insert(
                    e.isbn.clone(),
                    Book {
                        isbn: e.isbn.clone(),
                        title: e.title.clone(),
                        publisher_id: e.publisher_id.clone(),
                    },
                );
            }
            LibraryEvent::BookRemoved(e) => {
                self.books.remove(&e.isbn);
            }
            LibraryEvent::BookTransferredOut(e) => {
                self.books.remove(&e.isbn);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        command.validate()?;
        match command {
            LibraryCommand::CreateLibrary(cmd) => self.handle_create(cmd),
            LibraryCommand::RenameLibrary(cmd) => self.handle_rename(cmd),
            LibraryCommand::AddBook(cmd) => self.handle_add_book(cmd),
            LibraryCommand::RemoveBook(cmd) => self.handle_remove_book(cmd),
            LibraryCommand::TransferBook(cmd) => self.handle_transfer(cmd),
        }
    }
}

impl Library {
    fn ensure_created(&self) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found(format!("library {}", self.id)));
        }
        Ok(())
    }

    fn held_book(&self, isbn: &Isbn) -> DomainResult<&Book> {
        self.books.get(isbn).ok_or_else(|| {
            DomainError::rejected(
                rejection::BOOK_NOT_FOUND,
                format!("library {} does not hold isbn {isbn}", self.id),
            )
        })
    }

    fn handle_create(&self, cmd: &CreateLibrary) -> DomainResult<Vec<LibraryEvent>> {
        if self.created {
            return Err(DomainError::rejected(
                rejection::LIBRARY_EXISTS,
                format!("library {} already exists", cmd.library_id),
            ));
        }
        Ok(vec![LibraryEvent::LibraryCreated(LibraryCreated {
            library_id: cmd.library_id.clone(),
            name: cmd.name.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_rename(&self, cmd: &RenameLibrary) -> DomainResult<Vec<LibraryEvent>> {
        self.ensure_created()?;
        let name = cmd.name.trim();
        if name == self.name {
            return Ok(vec![]);
        }
        Ok(vec![LibraryEvent::LibraryRenamed(LibraryRenamed {
            library_id: cmd.library_id.clone(),
            name: name.to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_book(&self, cmd: &AddBook) -> DomainResult<Vec<LibraryEvent>> {
        self.ensure_created()?;
        let isbn = Isbn::parse(&cmd.isbn)?;
        if self.books.contains_key(&isbn) {
            return Err(DomainError::rejected(
                rejection::DUPLICATE_ISBN,
                format!("isbn {isbn} is already held by library {}", self.id),
            ));
        }
        Ok(vec![LibraryEvent::BookAdded(BookAdded {
            library_id: cmd.library_id.clone(),
            isbn,
            title: cmd.title.trim().to_string(),
            publisher_id: cmd.publisher_id.clone(),
            transfer_id: cmd.transfer_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_book(&self, cmd: &RemoveBook) -> DomainResult<Vec<LibraryEvent>> {
        self.ensure_created()?;
        let isbn = Isbn::parse(&cmd.isbn)?;
        let book = self.held_book(&isbn)?;
        Ok(vec![LibraryEvent::BookRemoved(BookRemoved {
            library_id: cmd.library_id.clone(),
            isbn,
            publisher_id: book.publisher_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transfer(&self, cmd: &TransferBook) -> DomainResult<Vec<LibraryEvent>> {
        self.ensure_created()?;
        let isbn = Isbn::parse(&cmd.isbn)?;
        let book = self.held_book(&isbn)?;
        Ok(vec![LibraryEvent::BookTransferredOut(BookTransferredOut {
            library_id: cmd.library_id.clone(),
            isbn,
            title: book.title.clone(),
            publisher_id: book.publisher_id.clone(),
            to_library_id: cmd.to_library_id.clone(),
            transfer_id: cmd.transfer_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
