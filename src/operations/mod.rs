/// Module for querying remote file metadata
pub mod probe;

/// Module for planning transfer tasks from the local tree
pub mod plan;

/// Module for uploading files to remote server
pub mod upload;
