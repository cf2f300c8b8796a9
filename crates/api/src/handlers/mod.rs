pub mod dashboard;
pub mod ingest;
pub mod notification;
