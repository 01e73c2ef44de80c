//! Long-running agents
//!
//! Each agent owns its main loop, reports through an `AgentHealth` handle and
//! stops when the shared shutdown channel fires.

pub mod auth_refresh;
pub mod health;
pub mod market_data;
pub mod notification;

pub use auth_refresh::{
    AuthRefreshAgent, AuthRefreshSettings, BrokerGateway, BrokerLoginError, CycleReport,
    IdentityBook, RefreshOutcome, RefreshState, SkipReason,
};
pub use health::{AgentHealth, AgentHealthSnapshot};
pub use market_data::{
    BroadcastTickSink, MarketDataAgent, MarketDataSettings, Tick, TickFeed, TickSink, TickStream,
    TopicTick,
};
pub use notification::{
    ChannelSender, DedupeWindow, DispatchSettings, EntryOutcome, NotificationDispatcher,
    NotificationPayload, PreferenceSource,
};
