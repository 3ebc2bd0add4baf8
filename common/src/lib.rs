pub mod admin;
pub mod button;
pub mod calendar;
pub mod clock;
pub mod commands;
pub mod config;
pub mod controller;
pub mod forced_off;
pub mod hijri;
pub mod link;
pub mod notify;
pub mod persist;
pub mod provider;
pub mod refresh;
pub mod relay;
pub mod special_days;
pub mod topics;
pub mod types;
pub mod weekly;

pub use admin::{AdminAdd, AdminError, AdminSet, MAX_ADMINS};
pub use button::ButtonDebouncer;
pub use calendar::{CacheError, CalendarCache, DayRecord, CACHE_CAPACITY, MIN_VALID_RECORDS};
pub use clock::{Timestamp, Ymd};
pub use commands::{Command, InboundMessage};
pub use config::{
    EngineConfig, NetworkConfig, ProviderConfig, RelayHardwareConfig, RuntimeConfig,
    SpecialDaysConfig, TelegramConfig,
};
pub use controller::{CommandOutput, Controller, RefreshFailure, RefreshReport, TickOutput};
pub use forced_off::{ForcedOffEvent, ForcedOffScheduler};
pub use hijri::HijriDate;
pub use link::{LinkMonitor, LinkUpdate};
pub use notify::{Notice, Outbox};
pub use persist::{KeyValueStore, MemoryStore, StoreError};
pub use provider::ProviderError;
pub use refresh::{RefreshJob, RefreshWorker, RequestOutcome, Requester};
pub use relay::{EngineAction, OverrideState, RelayEngine};
pub use special_days::{ListedSpecialDay, SpecialDayResolver, SpecialWindow};
pub use topics::*;
pub use types::{ControllerStatus, RefreshPhase, Window};
pub use weekly::{DayOfWeek, WeeklyWindowResolver};
