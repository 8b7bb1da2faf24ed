//! `folio-library` — the Library aggregate: holdings, book movements and transfers.

pub mod library;
pub mod upcast;

pub use library::{
    AddBook, Book, BookAdded, BookRemoved, BookTransferredOut, CreateLibrary, Isbn, Library,
    LibraryCommand, LibraryCreated, LibraryEvent, LibraryRenamed, RemoveBook, RenameLibrary,
    TransferBook, rejection,
};
pub use upcast::register_upcasters;
