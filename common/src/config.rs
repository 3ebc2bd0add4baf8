use serde::{Deserialize, Serialize};

use crate::clock::{Timestamp, CLOCK_SYNC_EPOCH};
use crate::types::WindowOffsets;
use crate::weekly::DayOfWeek;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub on_after_dusk_secs: i64,
    pub off_before_dawn_secs: i64,
    pub forced_off_stale_secs: i64,
    pub forced_off_tolerance_secs: i64,
    pub forced_off_block_secs: i64,
    pub forced_off_recompute_lead_secs: i64,
    pub refresh_cooldown_ms: u32,
    pub special_notice_lead_secs: i64,
    pub button_debounce_ms: u32,
    pub reconnect_interval_ms: u32,
    pub message_poll_interval_ms: u64,
    pub message_dedup_window_ms: u32,
    pub tick_interval_ms: u64,
    pub state_publish_interval_ms: u64,
    pub clock_sync_epoch: Timestamp,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            on_after_dusk_secs: 60,
            off_before_dawn_secs: 60,
            forced_off_stale_secs: 600,
            forced_off_tolerance_secs: 300,
            forced_off_block_secs: 120,
            forced_off_recompute_lead_secs: 2,
            refresh_cooldown_ms: 60_000,
            special_notice_lead_secs: 3_600,
            button_debounce_ms: 40,
            reconnect_interval_ms: 15_000,
            message_poll_interval_ms: 1_500,
            message_dedup_window_ms: 25_000,
            tick_interval_ms: 250,
            state_publish_interval_ms: 10_000,
            clock_sync_epoch: CLOCK_SYNC_EPOCH,
        }
    }
}

impl EngineConfig {
    pub fn offsets(&self) -> WindowOffsets {
        WindowOffsets {
            on_after_dusk_secs: self.on_after_dusk_secs,
            off_before_dawn_secs: self.off_before_dawn_secs,
        }
    }

    pub fn sanitize(&mut self) {
        self.on_after_dusk_secs = self.on_after_dusk_secs.clamp(0, 3_600);
        self.off_before_dawn_secs = self.off_before_dawn_secs.clamp(0, 3_600);
        self.forced_off_tolerance_secs = self.forced_off_tolerance_secs.clamp(1, 3_600);
        if self.forced_off_stale_secs <= self.forced_off_tolerance_secs {
            self.forced_off_stale_secs = self.forced_off_tolerance_secs * 2;
        }
        self.forced_off_block_secs = self.forced_off_block_secs.clamp(0, 3_600);
        self.forced_off_recompute_lead_secs = self.forced_off_recompute_lead_secs.clamp(1, 60);
        self.refresh_cooldown_ms = self.refresh_cooldown_ms.clamp(1_000, 3_600_000);
        self.special_notice_lead_secs = self.special_notice_lead_secs.clamp(0, 86_400);
        self.button_debounce_ms = self.button_debounce_ms.clamp(5, 1_000);
        self.reconnect_interval_ms = self.reconnect_interval_ms.max(1_000);
        self.message_poll_interval_ms = self.message_poll_interval_ms.max(250);
        self.tick_interval_ms = self.tick_interval_ms.clamp(50, 5_000);
        self.state_publish_interval_ms = self.state_publish_interval_ms.max(1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub district_id: u32,
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://ezanvakti.emushaf.net".to_string(),
            district_id: 9206,
            timeout_ms: 25_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
    pub owner_id: i64,
    pub reset_admins: bool,
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: 0,
            owner_id: 0,
            reset_admins: false,
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && self.chat_id != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayHardwareConfig {
    pub relay_pin: i32,
    pub active_low: bool,
    pub button_pin: i32,
}

impl Default for RelayHardwareConfig {
    fn default() -> Self {
        Self {
            relay_pin: 23,
            active_low: true,
            button_pin: 27,
        }
    }
}

impl RelayHardwareConfig {
    pub fn sanitize(&mut self) {
        if !(0..=39).contains(&self.relay_pin) {
            self.relay_pin = 23;
        }
        if !(0..=39).contains(&self.button_pin) || self.button_pin == self.relay_pin {
            self.button_pin = 27;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeeklyConfig {
    pub anchor: DayOfWeek,
}

impl Default for WeeklyConfig {
    fn default() -> Self {
        Self {
            anchor: DayOfWeek::Thu,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshScheduleConfig {
    pub weekday: DayOfWeek,
    pub hour: u8,
    pub minute: u8,
}

impl Default for RefreshScheduleConfig {
    fn default() -> Self {
        Self {
            weekday: DayOfWeek::Mon,
            hour: 3,
            minute: 5,
        }
    }
}

impl RefreshScheduleConfig {
    pub fn sanitize(&mut self) {
        self.hour = self.hour.min(23);
        self.minute = self.minute.min(59);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialDaysConfig {
    pub disabled: Vec<String>,
    pub whole_ramadan: bool,
}

impl Default for SpecialDaysConfig {
    fn default() -> Self {
        Self {
            disabled: Vec::new(),
            whole_ramadan: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub timezone: String,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub relay: RelayHardwareConfig,
    #[serde(default)]
    pub weekly: WeeklyConfig,
    #[serde(default)]
    pub refresh_schedule: RefreshScheduleConfig,
    #[serde(default)]
    pub special_days: SpecialDaysConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            timezone: "Europe/Istanbul".to_string(),
            provider: ProviderConfig::default(),
            telegram: TelegramConfig::default(),
            network: NetworkConfig::default(),
            relay: RelayHardwareConfig::default(),
            weekly: WeeklyConfig::default(),
            refresh_schedule: RefreshScheduleConfig::default(),
            special_days: SpecialDaysConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.engine.sanitize();
        self.relay.sanitize();
        self.refresh_schedule.sanitize();
        self.provider.timeout_ms = self.provider.timeout_ms.clamp(1_000, 120_000);
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            self.timezone = "Europe/Istanbul".to_string();
        }
        if self.telegram.owner_id <= 0 {
            self.telegram.owner_id = self.telegram.chat_id.max(0);
        }
    }

    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::Europe::Istanbul)
    }
}
