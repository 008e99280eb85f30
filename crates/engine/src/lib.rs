pub mod broadcast;
pub mod cache;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod retry;

pub use broadcast::{
    Broadcaster, ChangeHandler, ChannelBroadcaster, ChannelHub, FlagChange, StorageBroadcaster,
    Subscription,
};
pub use cache::CacheStore;
pub use client::FlagClient;
pub use config::{EngineConfig, SameKeyPolicy, TransportKind};
pub use coordinator::{MutationCoordinator, PendingMutation};
pub use error::{EngineError, GatewayError};
pub use gateway::{FlagGateway, ServiceGateway};
pub use retry::RetryPolicy;
