//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods
//! that accept `&PgPool` as the first argument.

pub mod delivery_attempt_repo;
pub mod digest_repo;
pub mod notification_repo;
pub mod preference_repo;
pub mod suppression_repo;

pub use delivery_attempt_repo::DeliveryAttemptRepo;
pub use digest_repo::DigestRepo;
pub use notification_repo::NotificationRepo;
pub use preference_repo::PreferenceRepo;
pub use suppression_repo::SuppressionRepo;
