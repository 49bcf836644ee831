//! Repository layer for data access

pub mod accounts;
pub mod anchors;
pub mod bus;
pub mod message_cache;

// Re-export concrete repository implementations with simple names
pub use accounts::DbAccountRepository as AccountRepository;
pub use anchors::DbAnchorRepository as AnchorRepository;
pub use bus::DbBusRepository as BusRepository;
pub use message_cache::DbMessageCacheRepository as MessageCacheRepository;

// Re-export repository traits
pub use accounts::AccountRepository as AccountRepositoryTrait;
pub use anchors::AnchorRepository as AnchorRepositoryTrait;
pub use bus::BusRepository as BusRepositoryTrait;
pub use message_cache::MessageCacheRepository as MessageCacheRepositoryTrait;

pub use bus::NOTIFY_CHANNEL;
