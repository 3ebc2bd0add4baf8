use chrono::{Datelike, Timelike};
use chrono_tz::Tz;
use log::debug;
use thiserror::Error;

use crate::admin::{AdminAdd, AdminSet};
use crate::calendar::{CacheError, CalendarCache, DayRecord};
use crate::clock::{format_timestamp, local_datetime, local_today, Timestamp, Ymd};
use crate::commands::{Command, InboundMessage, HELP_TEXT};
use crate::config::{EngineConfig, RefreshScheduleConfig, RuntimeConfig};
use crate::forced_off::{ForcedOffEvent, ForcedOffScheduler};
use crate::notify::{chunk_lines, Notice};
use crate::persist::{self, KeyValueStore, StoreError};
use crate::provider::ProviderError;
use crate::refresh::{RefreshJob, RefreshWorker, RequestOutcome, Requester};
use crate::relay::{EngineAction, ManualOnOutcome, OverrideState, RelayEngine};
use crate::special_days::{ListedSpecialDay, SpecialDayResolver, SpecialWindow};
use crate::types::{ActiveWindows, ControllerStatus, RefreshPhase, SpecialDayStatus, Window};
use crate::weekly::{DayOfWeek, WeeklyWindowResolver};

const MESSAGE_CHUNK_CHARS: usize = 3_300;

#[derive(Debug, Error)]
pub enum RefreshFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Default)]
pub struct TickOutput {
    pub actions: Vec<EngineAction>,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Default)]
pub struct CommandOutput {
    pub replies: Vec<String>,
    pub actions: Vec<EngineAction>,
    pub notices: Vec<Notice>,
    /// Set when a gated command was refused.
    pub denied: Option<&'static str>,
}

#[derive(Debug)]
pub struct RefreshReport {
    pub requester: Requester,
    pub outcome: Result<usize, RefreshFailure>,
    pub notices: Vec<Notice>,
}

/// Derived schedule: rebuilt after every refresh and whenever a window
/// expires.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub weekly: Option<Window>,
    pub special: Option<SpecialWindow>,
    pub forced_off: ForcedOffScheduler,
    pub last_special_notice: Option<Timestamp>,
}

impl ScheduleState {
    pub fn windows(&self) -> ActiveWindows {
        ActiveWindows {
            weekly: self.weekly,
            special: self.special.as_ref().map(|s| s.window),
        }
    }
}

/// Single owner of every piece of controller state. All mutation goes through
/// the tick, the refresh completion, and the two override inputs (messages and
/// the button).
#[derive(Debug)]
pub struct Controller {
    tz: Tz,
    engine_config: EngineConfig,
    refresh_schedule: RefreshScheduleConfig,
    chat_id: i64,
    cache: CalendarCache,
    last_refresh: Option<Ymd>,
    weekly: WeeklyWindowResolver,
    special: SpecialDayResolver,
    schedule: ScheduleState,
    relay: RelayEngine,
    admins: AdminSet,
    worker: RefreshWorker,
    last_schedule_check: Option<(Ymd, u32)>,
}

impl Controller {
    pub fn new(
        config: &RuntimeConfig,
        cache: CalendarCache,
        last_refresh: Option<Ymd>,
        admins: AdminSet,
    ) -> Self {
        let engine = &config.engine;
        Self {
            tz: config.tz(),
            engine_config: engine.clone(),
            refresh_schedule: config.refresh_schedule.clone(),
            chat_id: config.telegram.chat_id,
            cache,
            last_refresh,
            weekly: WeeklyWindowResolver::new(config.weekly.anchor, engine.offsets()),
            special: SpecialDayResolver::new(&config.special_days, engine.offsets()),
            schedule: ScheduleState {
                weekly: None,
                special: None,
                forced_off: ForcedOffScheduler::new(engine),
                last_special_notice: None,
            },
            relay: RelayEngine::new(engine.forced_off_block_secs),
            admins,
            worker: RefreshWorker::new(engine.refresh_cooldown_ms),
            last_schedule_check: None,
        }
    }

    /// Restores admins, the calendar cache and the last refresh date.
    pub fn load<S>(config: &RuntimeConfig, store: &mut S) -> Result<Self, StoreError>
    where
        S: KeyValueStore + ?Sized,
    {
        let admins = persist::load_admins(
            store,
            config.telegram.owner_id,
            config.telegram.reset_admins,
        )?;
        let cache = persist::load_calendar(store)?;
        let last_refresh = persist::load_last_refresh(&*store)?;
        Ok(Self::new(config, cache, last_refresh, admins))
    }

    pub fn tz(&self) -> &Tz {
        &self.tz
    }

    pub fn cache(&self) -> &CalendarCache {
        &self.cache
    }

    pub fn schedule(&self) -> &ScheduleState {
        &self.schedule
    }

    pub fn admins(&self) -> &AdminSet {
        &self.admins
    }

    pub fn overrides(&self) -> OverrideState {
        self.relay.overrides()
    }

    pub fn is_relay_on(&self) -> bool {
        self.relay.is_relay_on()
    }

    pub fn refresh_phase(&self) -> RefreshPhase {
        self.worker.phase()
    }

    pub fn last_refresh(&self) -> Option<Ymd> {
        self.last_refresh
    }

    /// Wall-clock readings below the configured epoch mean SNTP has not
    /// answered yet.
    pub fn synced(&self, now: Timestamp) -> bool {
        now >= self.engine_config.clock_sync_epoch
    }

    fn clock(&self, now: Timestamp) -> Option<Timestamp> {
        self.synced(now).then_some(now)
    }

    fn fmt_ts(&self, ts: Option<Timestamp>) -> String {
        format_timestamp(&self.tz, ts)
    }

    /// Boot sequence once the clock is usable: make sure today is cached,
    /// build every window, announce, and settle the relay.
    pub fn start(&mut self, now: Timestamp, now_ms: u32, connected: bool) -> TickOutput {
        let mut out = TickOutput::default();
        if self.synced(now) {
            self.ensure_today_cached(now, now_ms, connected);
            self.recompute_windows(now);
            out.notices.push(Notice::forced(self.init_summary()));
        }
        self.evaluate_relay(now, &mut out);
        out
    }

    pub fn recompute_windows(&mut self, now: Timestamp) {
        if !self.synced(now) {
            return;
        }
        self.schedule.weekly = self.weekly.resolve(now, &self.cache, &self.tz);
        self.schedule.special = self.special.select(now, &self.cache, &self.tz);
        self.schedule.forced_off.recompute(now, &self.cache, &self.tz);
    }

    pub fn request_refresh(&mut self, requester: Requester, now_ms: u32) -> RequestOutcome {
        self.worker.request(requester, now_ms)
    }

    pub fn begin_refresh(&mut self, now_ms: u32, connected: bool) -> Option<RefreshJob> {
        self.worker.begin(now_ms, connected)
    }

    /// Applies a fetch result: on success the cache is replaced, persisted and
    /// every derived window is rebuilt before the next relay evaluation.
    pub fn complete_refresh<S>(
        &mut self,
        job: RefreshJob,
        fetched: Result<Vec<DayRecord>, ProviderError>,
        now: Timestamp,
        store: &mut S,
    ) -> RefreshReport
    where
        S: KeyValueStore + ?Sized,
    {
        let requester = self.worker.finish(job);
        let mut notices = Vec::new();

        let outcome = fetched
            .map_err(RefreshFailure::from)
            .and_then(|records| self.cache.replace_all(records).map_err(RefreshFailure::from));

        let by = if requester.is_user() {
            format!("\n👤 {}", requester.display)
        } else {
            String::new()
        };

        match &outcome {
            Ok(count) => {
                if self.synced(now) {
                    self.last_refresh = local_today(&self.tz, now);
                }
                if let Err(err) = persist::save_calendar(store, &self.cache, self.last_refresh) {
                    notices.push(Notice::new(format!("⚠️ Takvim kaydedilemedi: {err}")));
                }
                self.recompute_windows(now);
                notices.push(Notice::new(format!(
                    "✅ Güncelleme tamam: {count} gün ({}){by}",
                    self.cache_range()
                )));
            }
            Err(err) => {
                notices.push(Notice::new(format!("❌ Güncelleme başarısız: {err}{by}")));
            }
        }

        RefreshReport {
            requester,
            outcome,
            notices,
        }
    }

    pub fn tick(&mut self, now: Timestamp, now_ms: u32, connected: bool) -> TickOutput {
        let mut out = TickOutput::default();

        if self.synced(now) {
            self.check_scheduled_refresh(now, now_ms);
            self.maintain_windows(now, now_ms, connected);
            if let Some(notice) = self.special_day_notice(now, connected) {
                out.notices.push(notice);
            }
            self.enforce_forced_off(now, &mut out);
        }

        self.evaluate_relay(now, &mut out);
        out
    }

    pub fn button_pressed(&mut self, now: Timestamp) -> TickOutput {
        let clock = self.clock(now);
        let actions = self.relay.button_pressed(clock);

        let mut out = TickOutput::default();
        let text = if actions.is_empty() && !self.relay.is_relay_on() {
            format!(
                "🔘 Buton: manuel ON kilidi kuruldu, ON engeli bitince açılacak ({})",
                self.fmt_ts(self.relay.overrides().block_on_until)
            )
        } else {
            "🔘 Buton: RÖLE AÇIK (manuel)".to_string()
        };
        out.notices.push(Notice::new(text));
        out.actions = actions;
        out
    }

    pub fn handle_message<S>(
        &mut self,
        msg: &InboundMessage,
        now: Timestamp,
        now_ms: u32,
        store: &mut S,
    ) -> CommandOutput
    where
        S: KeyValueStore + ?Sized,
    {
        let mut out = CommandOutput::default();
        if msg.chat_id != self.chat_id {
            return out;
        }
        let Some(command) = Command::parse(&msg.text) else {
            return out;
        };

        if command.requires_admin() && !self.admins.contains(msg.author_id) {
            out.denied = Some(command.name());
            out.replies
                .push(format!("⛔ Yetkisiz: {}\n👤 {}", command.name(), msg.who()));
            return out;
        }

        match command {
            Command::MyId => out.replies.push(format!(
                "🆔 {}\nid: {}\nadmin: {}",
                msg.who(),
                msg.author_id,
                if self.admins.contains(msg.author_id) { "evet" } else { "hayır" }
            )),
            Command::Help => out.replies.push(HELP_TEXT.to_string()),
            Command::Status => out.replies.push(self.status_text(now, msg)),
            Command::SpecialDays => out.replies.extend(self.special_days_text(now)),
            Command::AdminList => out.replies.push(self.admin_list_text()),
            Command::AdminAdd(None) => out.replies.push("Kullanım: /admin_add <id>".to_string()),
            Command::AdminDel(None) => out.replies.push("Kullanım: /admin_del <id>".to_string()),
            Command::AdminAdd(Some(id)) => {
                let reply = match self.admins.add(id) {
                    Ok(AdminAdd::Added) => {
                        format!("✅ Admin eklendi: {id}{}", self.persist_admins(store))
                    }
                    Ok(AdminAdd::AlreadyPresent) => format!("ℹ️ Zaten admin: {id}"),
                    Err(err) => format!("❌ Admin eklenemedi: {err}"),
                };
                out.replies.push(reply);
            }
            Command::AdminDel(Some(id)) => {
                let reply = match self.admins.remove(id) {
                    Ok(()) => format!("✅ Admin silindi: {id}{}", self.persist_admins(store)),
                    Err(err) => format!("❌ Admin silinemedi: {err}"),
                };
                out.replies.push(reply);
            }
            Command::On => self.command_on(now, msg, &mut out),
            Command::Off => self.command_off(now, msg, &mut out),
            Command::Refresh => {
                let requester = Requester::user(msg.author_id, msg.who());
                let reply = match self.worker.request(requester, now_ms) {
                    RequestOutcome::Queued => "⏳ Güncelleme sıraya alındı",
                    RequestOutcome::AlreadyInProgress => "⏳ Güncelleme zaten sürüyor",
                    RequestOutcome::AlreadyPending => "⏳ Güncelleme zaten sırada",
                    RequestOutcome::CoolingDown => "⏳ Çok sık istek, biraz sonra tekrar dene",
                };
                out.replies.push(reply.to_string());
            }
        }
        out
    }

    fn persist_admins<S>(&self, store: &mut S) -> String
    where
        S: KeyValueStore + ?Sized,
    {
        match persist::save_admins(store, &self.admins) {
            Ok(()) => String::new(),
            Err(err) => format!("\n⚠️ Kaydedilemedi: {err}"),
        }
    }

    fn command_on(&mut self, now: Timestamp, msg: &InboundMessage, out: &mut CommandOutput) {
        let clock = self.clock(now);
        if let Some(now) = clock {
            self.schedule.forced_off.recompute(now, &self.cache, &self.tz);
        }

        match self.relay.command_on(clock) {
            ManualOnOutcome::Blocked { until } => out.replies.push(format!(
                "⛔ ON reddedildi: zorunlu kapama sonrası engel {} tarihine kadar sürüyor",
                self.fmt_ts(Some(until))
            )),
            ManualOnOutcome::Applied(actions) => {
                out.actions.extend(actions);
                out.replies
                    .push(format!("✅ RÖLE AÇIK (manuel)\n👤 {}", msg.who()));
            }
        }
    }

    fn command_off(&mut self, now: Timestamp, msg: &InboundMessage, out: &mut CommandOutput) {
        let outcome = self
            .relay
            .command_off(self.clock(now), self.schedule.windows());
        out.actions.extend(outcome.actions);

        let until = match outcome.until {
            Some(until) => format!("pencere sonuna kadar: {}", self.fmt_ts(Some(until))),
            None => "aktif pencere yok".to_string(),
        };
        out.replies
            .push(format!("✅ RÖLE KAPALI (manuel), {until}\n👤 {}", msg.who()));
    }

    fn check_scheduled_refresh(&mut self, now: Timestamp, now_ms: u32) {
        let Some(local) = local_datetime(&self.tz, now) else {
            return;
        };
        let today = Ymd::from_date(local.date_naive());
        let minute_of_day = local.hour() * 60 + local.minute();
        let key = (today, minute_of_day);
        if self.last_schedule_check == Some(key) {
            return;
        }

        if DayOfWeek::from_chrono(local.weekday()) != self.refresh_schedule.weekday
            || self.last_refresh == Some(today)
        {
            self.last_schedule_check = Some(key);
            return;
        }

        let slot = u32::from(self.refresh_schedule.hour) * 60
            + u32::from(self.refresh_schedule.minute);
        let retry_slot =
            minute_of_day > slot && local.minute() == u32::from(self.refresh_schedule.minute);
        if minute_of_day == slot || retry_slot {
            let outcome = self
                .worker
                .request(Requester::system("haftalık güncelleme"), now_ms);
            if !outcome.is_queued() {
                // Slot stays open so a later tick in the same minute can retry.
                debug!("scheduled refresh deferred: {}", outcome.as_str());
                return;
            }
        }
        self.last_schedule_check = Some(key);
    }

    fn ensure_today_cached(&mut self, now: Timestamp, now_ms: u32, connected: bool) {
        if !connected {
            return;
        }
        let Some(today) = local_today(&self.tz, now) else {
            return;
        };
        if !self.cache.contains(today) {
            let outcome = self
                .worker
                .request(Requester::system("önbellekte bugün yok"), now_ms);
            debug!("refresh for missing day {today}: {}", outcome.as_str());
        }
    }

    fn maintain_windows(&mut self, now: Timestamp, now_ms: u32, connected: bool) {
        let mut failed = false;

        if self.schedule.weekly.map_or(true, |w| w.is_expired(now)) {
            self.schedule.weekly = self.weekly.resolve(now, &self.cache, &self.tz);
            failed |= self.schedule.weekly.is_none();
        }
        if self
            .schedule
            .special
            .as_ref()
            .map_or(true, |s| s.window.is_expired(now))
        {
            self.schedule.special = self.special.select(now, &self.cache, &self.tz);
        }
        self.schedule
            .forced_off
            .ensure_scheduled(now, &self.cache, &self.tz);
        failed |= self.schedule.forced_off.next_fire().is_none();

        if failed {
            self.ensure_today_cached(now, now_ms, connected);
        }
    }

    fn special_day_notice(&mut self, now: Timestamp, connected: bool) -> Option<Notice> {
        if !connected || self.worker.is_in_progress() {
            return None;
        }
        let special = self.schedule.special.as_ref()?;
        let window = special.window;
        if now >= window.off
            || now < window.on - self.engine_config.special_notice_lead_secs
            || self.schedule.last_special_notice == Some(window.on)
        {
            return None;
        }

        let text = format!(
            "🕌 Yaklaşan dini gün: {}\nHicri: {}\nON: {}\nOFF: {}\nKural: akşam +{} sn AÇ, imsak -{} sn KAPAT",
            special.name,
            special.religious_date,
            self.fmt_ts(Some(window.on)),
            self.fmt_ts(Some(window.off)),
            self.engine_config.on_after_dusk_secs,
            self.engine_config.off_before_dawn_secs,
        );
        self.schedule.last_special_notice = Some(window.on);
        Some(Notice::new(text))
    }

    fn enforce_forced_off(&mut self, now: Timestamp, out: &mut TickOutput) {
        match self.schedule.forced_off.tick(now, &self.cache, &self.tz) {
            ForcedOffEvent::Fired { scheduled } => {
                out.actions.extend(self.relay.force_off(now));
                out.notices.push(Notice::forced(format!(
                    "⛔ ZORUNLU KAPAMA (imsak öncesi)\nPlanlanan: {}\nON engeli: {}\nSonraki: {}",
                    self.fmt_ts(Some(scheduled)),
                    self.fmt_ts(self.relay.overrides().block_on_until),
                    self.fmt_ts(self.schedule.forced_off.next_fire()),
                )));
            }
            ForcedOffEvent::Missed { scheduled } => {
                out.notices.push(Notice::new(format!(
                    "⚠️ Zorunlu kapama zamanı kaçırıldı: {}\nSonraki: {}",
                    self.fmt_ts(Some(scheduled)),
                    self.fmt_ts(self.schedule.forced_off.next_fire()),
                )));
            }
            ForcedOffEvent::Stale { .. } | ForcedOffEvent::Idle => {}
        }
    }

    fn evaluate_relay(&mut self, now: Timestamp, out: &mut TickOutput) {
        let actions = self
            .relay
            .evaluate(self.clock(now), self.schedule.windows());
        for action in &actions {
            let text = match action {
                EngineAction::RelayOn => "🔔 RÖLE: AÇIK",
                EngineAction::RelayOff => "🔕 RÖLE: KAPALI",
            };
            out.notices.push(Notice::new(text));
        }
        out.actions.extend(actions);
    }

    fn cache_range(&self) -> String {
        match (self.cache.first_date(), self.cache.last_date()) {
            (Some(first), Some(last)) => format!("{} .. {}", first.format_dmy(), last.format_dmy()),
            _ => "boş".to_string(),
        }
    }

    fn special_line(&self) -> String {
        match &self.schedule.special {
            Some(s) => format!(
                "{} ({})\n  ON: {}\n  OFF: {}",
                s.name,
                s.religious_date,
                self.fmt_ts(Some(s.window.on)),
                self.fmt_ts(Some(s.window.off))
            ),
            None => "-".to_string(),
        }
    }

    pub fn init_summary(&self) -> String {
        let weekly = self.schedule.weekly;
        format!(
            "🚀 Röle kontrolcüsü başladı\nHaftalık ON: {}\nHaftalık OFF: {}\nZorunlu kapama: {}\nDini gün: {}\nÖnbellek: {} gün ({})",
            self.fmt_ts(weekly.map(|w| w.on)),
            self.fmt_ts(weekly.map(|w| w.off)),
            self.fmt_ts(self.schedule.forced_off.next_fire()),
            self.special_line(),
            self.cache.len(),
            self.cache_range(),
        )
    }

    pub fn status_text(&self, now: Timestamp, msg: &InboundMessage) -> String {
        let overrides = self.relay.overrides();
        let weekly = self.schedule.weekly;
        let clock = self.clock(now);
        let weekly_active = clock.is_some_and(|now| weekly.is_some_and(|w| w.contains(now)));
        let special_active = clock.is_some_and(|now| {
            self.schedule
                .special
                .as_ref()
                .is_some_and(|s| s.is_active(now))
        });

        format!(
            "📊 Durum\nRöle: {}\nManuel ON kilidi: {}\nManuel OFF bitiş: {}\nON engeli: {}\n\
Haftalık ON: {}\nHaftalık OFF: {}\nDini gün: {}\nZorunlu kapama: {}\n\
Aktif: haftalık={} dini={}\nSaat senkron: {}\nÖnbellek: {} gün ({}), son güncelleme: {}\n\
Adminler: {} (sahip {})\n👤 {}",
            if self.relay.is_relay_on() { "AÇIK" } else { "KAPALI" },
            if overrides.manual_on_latch { "evet" } else { "hayır" },
            self.fmt_ts(overrides.manual_off_until),
            self.fmt_ts(overrides.block_on_until),
            self.fmt_ts(weekly.map(|w| w.on)),
            self.fmt_ts(weekly.map(|w| w.off)),
            self.special_line(),
            self.fmt_ts(self.schedule.forced_off.next_fire()),
            u8::from(weekly_active),
            u8::from(special_active),
            if clock.is_some() { "evet" } else { "hayır" },
            self.cache.len(),
            self.cache_range(),
            self.last_refresh
                .map(|d| d.format_dmy())
                .unwrap_or_else(|| "-".to_string()),
            self.admins.len(),
            self.admins.owner(),
            msg.who(),
        )
    }

    pub fn special_listing(&self, now: Timestamp) -> Vec<ListedSpecialDay> {
        if !self.synced(now) {
            return Vec::new();
        }
        self.special.listing(now, &self.cache, &self.tz)
    }

    pub fn special_days_text(&self, now: Timestamp) -> Vec<String> {
        let listing = self.special_listing(now);
        if listing.is_empty() {
            return vec!["Yakın tarihte dini gün yok".to_string()];
        }
        let lines: Vec<String> = std::iter::once("📅 Dini günler".to_string())
            .chain(listing.iter().map(ListedSpecialDay::line))
            .collect();
        chunk_lines(lines.iter().map(String::as_str), MESSAGE_CHUNK_CHARS)
    }

    pub fn admin_list_text(&self) -> String {
        let mut text = format!("👥 Adminler ({}):", self.admins.len());
        for id in self.admins.ids() {
            text.push('\n');
            text.push_str(&id.to_string());
            if *id == self.admins.owner() {
                text.push_str(" (sahip)");
            }
        }
        text
    }

    pub fn status(&self, now: Timestamp) -> ControllerStatus {
        let overrides = self.relay.overrides();
        ControllerStatus {
            relay_on: self.relay.is_relay_on(),
            manual_on_latch: overrides.manual_on_latch,
            manual_off_until: overrides.manual_off_until,
            block_on_until: overrides.block_on_until,
            weekly_window: self.schedule.weekly,
            special_day: self.schedule.special.as_ref().map(|s| SpecialDayStatus {
                name: s.name.clone(),
                religious_date: s.religious_date.clone(),
                on: s.window.on,
                off: s.window.off,
            }),
            forced_off_next: self.schedule.forced_off.next_fire(),
            forced_off_last_fired: self.schedule.forced_off.last_fired(),
            cached_days: self.cache.len(),
            last_refresh: self.last_refresh.map(|d| d.to_string()),
            refresh_phase: self.worker.phase(),
            admin_count: self.admins.len(),
            time_synced: self.synced(now),
            timezone: self.tz.name().to_string(),
        }
    }
}
