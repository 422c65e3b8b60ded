//! Update commands and their flags.
//!
//! Commands are the unit of work flowing through the update log: a document
//! add (possibly an in-place partial update), a delete by id or by query,
//! and a commit. Op codes identify the record kind on disk; command flags
//! carry per-request routing information and are never persisted.

/// Op code for a full or in-place document add.
pub const ADD: u32 = 0x01;
/// Op code for a delete by id.
pub const DELETE: u32 = 0x02;
/// Op code for a delete by query.
pub const DELETE_BY_QUERY: u32 = 0x03;
/// Op code for a commit marker capping a log.
pub const COMMIT: u32 = 0x04;
/// Flag bit marking an ADD as an in-place partial update.
pub const UPDATE_INPLACE: u32 = 0x08;
/// Mask extracting the operation (including the in-place bit) from flags.
pub const OPERATION_MASK: u32 = 0x0f;

/// Command flags controlling how the update log treats a command.
pub mod flags {
    /// The command is being replayed from a log, not received fresh.
    pub const REPLAY: u32 = 0x01;
    /// The shard is buffering; route the command to the buffer log.
    pub const BUFFERING: u32 = 0x02;
    /// Do not touch the index writer (tlog-replica style ingestion).
    pub const IGNORE_INDEXWRITER: u32 = 0x04;
    /// Suppress auto-commit triggers for this command.
    pub const IGNORE_AUTOCOMMIT: u32 = 0x08;
}

/// A document add, full or in-place.
#[derive(Debug, Clone, PartialEq)]
pub struct AddCommand {
    /// Indexed id bytes of the document's unique key.
    pub id: Vec<u8>,
    /// The document; partial for in-place updates.
    pub doc: crate::document::Document,
    /// Version assigned to this update (positive).
    pub version: i64,
    /// Version of the update this one depends on; `<= 0` for a full add.
    pub prev_version: i64,
    /// Command flags (see [`flags`]).
    pub flags: u32,
}

impl AddCommand {
    /// A full-document add.
    pub fn new(id: impl Into<Vec<u8>>, doc: crate::document::Document, version: i64) -> Self {
        AddCommand {
            id: id.into(),
            doc,
            version,
            prev_version: -1,
            flags: 0,
        }
    }

    /// An in-place partial update depending on `prev_version`.
    pub fn in_place(
        id: impl Into<Vec<u8>>,
        doc: crate::document::Document,
        version: i64,
        prev_version: i64,
    ) -> Self {
        AddCommand {
            id: id.into(),
            doc,
            version,
            prev_version,
            flags: 0,
        }
    }

    /// Attach command flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Whether this add is an in-place partial update.
    pub fn is_in_place(&self) -> bool {
        self.prev_version > 0
    }

    /// Printable form of the id for logging.
    pub fn printable_id(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }
}

/// A delete, either by id or by query.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCommand {
    /// Indexed id bytes; present for delete-by-id.
    pub id: Option<Vec<u8>>,
    /// Query string; present for delete-by-query.
    pub query: Option<String>,
    /// Version assigned to this delete (negative: tombstone).
    pub version: i64,
    /// Command flags (see [`flags`]).
    pub flags: u32,
}

impl DeleteCommand {
    /// A delete by id.
    pub fn by_id(id: impl Into<Vec<u8>>, version: i64) -> Self {
        DeleteCommand {
            id: Some(id.into()),
            query: None,
            version,
            flags: 0,
        }
    }

    /// A delete by query.
    pub fn by_query(query: impl Into<String>, version: i64) -> Self {
        DeleteCommand {
            id: None,
            query: Some(query.into()),
            version,
            flags: 0,
        }
    }

    /// Attach command flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// A commit, hard or soft.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitCommand {
    /// Highest version known at commit time; 0 when unknown.
    pub version: i64,
    /// Soft commits rotate in-memory structures only.
    pub soft_commit: bool,
    /// Whether the caller waits for the new searcher to be registered.
    pub wait_searcher: bool,
    /// Command flags (see [`flags`]).
    pub flags: u32,
}

impl CommitCommand {
    /// A hard commit at the given version.
    pub fn hard(version: i64) -> Self {
        CommitCommand {
            version,
            soft_commit: false,
            wait_searcher: true,
            flags: 0,
        }
    }

    /// A soft commit.
    pub fn soft() -> Self {
        CommitCommand {
            version: 0,
            soft_commit: true,
            wait_searcher: false,
            flags: 0,
        }
    }

    /// Attach command flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    #[test]
    fn test_in_place_detection() {
        let full = AddCommand::new(b"a".to_vec(), Document::new(), 10);
        assert!(!full.is_in_place());

        let partial = AddCommand::in_place(b"a".to_vec(), Document::new(), 11, 10);
        assert!(partial.is_in_place());
    }

    #[test]
    fn test_op_code_composition() {
        let in_place_add = ADD | UPDATE_INPLACE;
        assert_eq!(in_place_add & OPERATION_MASK, in_place_add);
        assert_ne!(in_place_add & OPERATION_MASK, ADD);
        assert_eq!(DELETE_BY_QUERY & OPERATION_MASK, DELETE_BY_QUERY);
    }

    #[test]
    fn test_delete_forms() {
        let by_id = DeleteCommand::by_id(b"a".to_vec(), -12);
        assert!(by_id.id.is_some() && by_id.query.is_none());

        let by_query = DeleteCommand::by_query("*:*", -13);
        assert!(by_query.id.is_none() && by_query.query.is_some());
    }
}
