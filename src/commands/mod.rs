//! CLI commands implementation

pub mod analyze;
pub mod ingest;
pub mod init;
pub mod jobs;
pub mod status;

pub use analyze::*;
pub use ingest::*;
pub use init::*;
pub use jobs::*;
pub use status::*;
