pub mod backend;
pub mod dump;
pub mod models;
pub mod mongo;
pub mod source;

pub use backend::{Document, SourceDb};
pub use dump::{dump_all, DumpFileDb};
pub use mongo::MongoExportDb;
pub use source::SourceState;
