pub mod broker_login;
pub mod memory;
pub mod postgres;
pub mod tick_ws;
pub mod webhook_notifier;

pub use broker_login::HttpBrokerGateway;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use tick_ws::WsTickFeed;
pub use webhook_notifier::WebhookChannelSender;
