use core::convert::TryInto;
use std::{
    sync::{mpsc, Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{AnyIOPin, AnyOutputPin},
        modem::Modem,
        prelude::Peripherals,
    },
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use prayer_relay_common::{
    clock::elapsed_ms, config::NetworkConfig, persist, provider, AdminSet, ButtonDebouncer,
    CalendarCache, Controller, DayRecord, EngineAction, KeyValueStore, LinkMonitor, Notice,
    Outbox, ProviderConfig, ProviderError, RefreshJob, Requester, RuntimeConfig, StoreError,
    TelegramConfig, TOPIC_CMD_BUTTON, TOPIC_CMD_REFRESH, TOPIC_CONTROLLER_AVAILABILITY,
    TOPIC_CONTROLLER_STATE,
};

use crate::telegram::{self, SendMessage};

const NVS_NAMESPACE: &str = "prayer_relay";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_RESPONSE: usize = 64 * 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 60;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const BUTTON_POLL_MS: u64 = 10;
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct SharedState {
    controller: Arc<Mutex<Controller>>,
    // Locked after `controller` when both are needed.
    store: Arc<Mutex<NvsStore>>,
    relay: Arc<Mutex<Relay>>,
    notices: mpsc::Sender<Notice>,
    runtime: Arc<RuntimeConfig>,
}

struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

struct Relay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    active_low: bool,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    outcome: &'static str,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore::new(nvs_partition.clone())?;

    let mut runtime = load_runtime_config(&store).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    apply_build_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, district={}, chat={}, relay=GPIO{} (active_low={}), button=GPIO{}",
        runtime.network.wifi_ssid,
        runtime.provider.district_id,
        runtime.telegram.chat_id,
        runtime.relay.relay_pin,
        runtime.relay.active_low,
        runtime.relay.button_pin,
    );

    let mut relay = Relay::new(runtime.relay.relay_pin, runtime.relay.active_low)?;
    relay.write(false)?;
    let button = init_button(runtime.relay.button_pin)?;

    let controller = Controller::load(&runtime, &mut store).unwrap_or_else(|err| {
        warn!("failed to restore controller state, starting empty: {err:#}");
        Controller::new(
            &runtime,
            CalendarCache::new(),
            None,
            AdminSet::new(runtime.telegram.owner_id),
        )
    });
    info!(
        "restored {} cached days and {} admins",
        controller.cache().len(),
        controller.admins().len()
    );
    let last_sequence = persist::load_last_message_id(&store).unwrap_or_else(|err| {
        warn!("failed to restore last message id: {err:#}");
        0
    });

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let (notice_tx, notice_rx) = mpsc::channel();
    let runtime = Arc::new(runtime);
    let shared_state = SharedState {
        controller: Arc::new(Mutex::new(controller)),
        store: Arc::new(Mutex::new(store)),
        relay: Arc::new(Mutex::new(relay)),
        notices: notice_tx,
        runtime: runtime.clone(),
    };

    let mqtt = match create_mqtt_client(&runtime.network) {
        Ok((client, conn)) => {
            let client = Arc::new(Mutex::new(client));
            spawn_mqtt_receiver(shared_state.clone(), conn, client.clone())?;
            Some(client)
        }
        Err(err) => {
            warn!("mqtt unavailable, state publishing disabled: {err:#}");
            None
        }
    };

    spawn_message_loop(shared_state.clone(), notice_rx, last_sequence)?;
    spawn_control_loop(shared_state.clone(), button, mqtt)?;

    let server = create_http_server(shared_state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn load_runtime_config(store: &NvsStore) -> anyhow::Result<RuntimeConfig> {
    match store.get(NVS_RUNTIME_KEY)? {
        Some(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        None => Ok(RuntimeConfig::default()),
    }
}

/// Credentials baked in at build time fill whatever NVS left empty.
fn apply_build_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }
    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
    if runtime.telegram.bot_token.is_empty() {
        if let Some(token) = option_env!("TELEGRAM_BOT_TOKEN") {
            runtime.telegram.bot_token = token.to_string();
        }
    }
    if runtime.telegram.chat_id == 0 {
        if let Some(chat_id) = option_env!("TELEGRAM_CHAT_ID").and_then(|v| v.parse().ok()) {
            runtime.telegram.chat_id = chat_id;
        }
    }
}

fn spawn_control_loop(
    state: SharedState,
    button: PinDriver<'static, AnyIOPin, Input>,
    mqtt: Option<Arc<Mutex<EspMqttClient<'static>>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let engine = state.runtime.engine.clone();
            let mut debouncer = ButtonDebouncer::new(engine.button_debounce_ms);
            let mut link = LinkMonitor::new(engine.reconnect_interval_ms);
            let mut link_lost = false;
            let mut booted = false;
            let mut last_tick_ms: Option<u32> = None;
            let mut last_publish_ms: Option<u32> = None;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if debouncer.update(button.is_low(), now_ms) {
                    info!("button pressed");
                    let now = Utc::now().timestamp();
                    let out = lock(&state.controller).button_pressed(now);
                    dispatch(&state, out.actions, out.notices);
                }

                let tick_due = last_tick_ms.map_or(true, |last| {
                    u64::from(elapsed_ms(now_ms, last)) >= engine.tick_interval_ms
                });
                if !tick_due {
                    thread::sleep(Duration::from_millis(BUTTON_POLL_MS));
                    continue;
                }
                last_tick_ms = Some(now_ms);

                let connected = is_wifi_station_connected();
                let update = link.observe(connected, now_ms);
                match update.changed {
                    Some(true) if link_lost => {
                        info!("wifi link restored");
                        link_lost = false;
                        queue_notice(&state, Notice::new("🌐 Bağlantı geri geldi"));
                    }
                    Some(false) => {
                        warn!("wifi link lost");
                        link_lost = true;
                    }
                    _ => {}
                }
                if update.reconnect {
                    reconnect_wifi();
                }

                let now = Utc::now().timestamp();
                let (out, job) = {
                    let mut controller = lock(&state.controller);
                    let out = if !booted && controller.synced(now) {
                        booted = true;
                        info!("clock synchronized, running boot sequence");
                        controller.start(now, now_ms, connected)
                    } else {
                        controller.tick(now, now_ms, connected)
                    };
                    (out, controller.begin_refresh(now_ms, connected))
                };
                dispatch(&state, out.actions, out.notices);

                if let Some(job) = job {
                    run_refresh(&state, job);
                }

                let publish_due = last_publish_ms.map_or(true, |last| {
                    u64::from(elapsed_ms(now_ms, last)) >= engine.state_publish_interval_ms
                });
                if let Some(client) = mqtt.as_ref().filter(|_| publish_due) {
                    last_publish_ms = Some(now_ms);
                    if let Err(err) = publish_state(&state, client) {
                        warn!("state publish failed: {err:#}");
                    }
                }

                thread::sleep(Duration::from_millis(BUTTON_POLL_MS));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

// Blocks the control loop for the duration of the download; the controller
// lock is not held meanwhile so commands keep being answered.
fn run_refresh(state: &SharedState, job: RefreshJob) {
    info!("calendar refresh started by {}", job.requester.display);
    queue_notice(state, job.started_notice());

    feed_watchdog();
    let fetched = fetch_calendar(&state.runtime.provider);
    feed_watchdog();
    let now = Utc::now().timestamp();

    let report = {
        let mut controller = lock(&state.controller);
        let mut store = lock(&state.store);
        controller.complete_refresh(job, fetched, now, &mut *store)
    };

    match &report.outcome {
        Ok(count) => info!("calendar refresh stored {count} days"),
        Err(err) => warn!("calendar refresh failed: {err}"),
    }
    for notice in report.notices {
        queue_notice(state, notice);
    }
}

fn fetch_calendar(config: &ProviderConfig) -> Result<Vec<DayRecord>, ProviderError> {
    let url = provider::calendar_url(&config.base_url, config.district_id);
    let timeout = Duration::from_millis(config.timeout_ms);

    let (status, body) =
        http_get(&url, timeout).map_err(|err| ProviderError::Transport(format!("{err:#}")))?;
    if !(200..300).contains(&status) {
        return Err(ProviderError::FetchFailed { code: status });
    }
    provider::parse_payload(&body)
}

fn spawn_message_loop(
    state: SharedState,
    notices: mpsc::Receiver<Notice>,
    mut last_sequence: i64,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("telegram".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            let telegram = state.runtime.telegram.clone();
            let engine = state.runtime.engine.clone();
            let mut outbox = Outbox::new(engine.message_dedup_window_ms);
            if !telegram.is_configured() {
                info!("telegram not configured, command polling disabled");
            }

            loop {
                while let Ok(notice) = notices.try_recv() {
                    info!("notice: {}", notice.text);
                    deliver_notice(&telegram, &mut outbox, &notice);
                }

                if telegram.is_configured() && is_wifi_station_connected() {
                    let url = telegram::updates_url(
                        &telegram.api_base,
                        &telegram.bot_token,
                        last_sequence + 1,
                    );
                    match http_get(&url, TELEGRAM_TIMEOUT)
                        .and_then(|(_, body)| telegram::parse_updates(&body))
                    {
                        Ok(batch) => {
                            for message in batch.messages.iter().filter(|m| m.sequence > last_sequence) {
                                handle_inbound(&state, message);
                            }
                            if let Some(sequence) = batch.last_sequence.filter(|s| *s > last_sequence) {
                                last_sequence = sequence;
                                if let Err(err) =
                                    persist::save_last_message_id(&mut *lock(&state.store), sequence)
                                {
                                    warn!("failed to persist last message id: {err:#}");
                                }
                            }
                        }
                        Err(err) => warn!("telegram poll failed: {err:#}"),
                    }
                }

                thread::sleep(Duration::from_millis(engine.message_poll_interval_ms));
            }
        })
        .context("failed to spawn telegram thread")?;
    Ok(())
}

fn handle_inbound(state: &SharedState, message: &prayer_relay_common::InboundMessage) {
    let now = Utc::now().timestamp();
    let now_ms = monotonic_ms();

    let out = {
        let mut controller = lock(&state.controller);
        let mut store = lock(&state.store);
        controller.handle_message(message, now, now_ms, &mut *store)
    };

    match out.denied {
        Some(command) => warn!("unauthorized {command} from {}", message.who()),
        None if !out.replies.is_empty() => {
            info!("command `{}` from {}", message.text.trim(), message.who())
        }
        None => {}
    }

    let replies = out.replies.into_iter().map(Notice::new);
    dispatch(state, out.actions, replies.chain(out.notices).collect());
}

fn deliver_notice(telegram: &TelegramConfig, outbox: &mut Outbox, notice: &Notice) {
    if !telegram.is_configured() || !is_wifi_station_connected() {
        return;
    }
    let now_ms = monotonic_ms();
    if !outbox.admits(notice, now_ms) {
        return;
    }

    let body = SendMessage {
        chat_id: telegram.chat_id,
        text: &notice.text,
        disable_web_page_preview: true,
    };
    let url = telegram::send_url(&telegram.api_base, &telegram.bot_token);
    let result = serde_json::to_vec(&body)
        .map_err(anyhow::Error::from)
        .and_then(|payload| http_post_json(&url, &payload, TELEGRAM_TIMEOUT))
        .and_then(|(status, response)| telegram::check_send_response(status, &response));

    match result {
        Ok(()) => outbox.record_sent(notice, now_ms),
        Err(err) => warn!("telegram send failed: {err:#}"),
    }
}

fn dispatch(state: &SharedState, actions: Vec<EngineAction>, notices: Vec<Notice>) {
    execute_engine_actions(state, actions);
    for notice in notices {
        queue_notice(state, notice);
    }
}

fn execute_engine_actions(state: &SharedState, actions: Vec<EngineAction>) {
    for action in actions {
        let on = matches!(action, EngineAction::RelayOn);
        if let Err(err) = lock(&state.relay).write(on) {
            warn!("engine action failed [{action:?}]: {err:#}");
        } else {
            info!("engine action applied [{action:?}]");
        }
    }
}

fn queue_notice(state: &SharedState, notice: Notice) {
    if state.notices.send(notice).is_err() {
        warn!("telegram thread stopped; dropping notice");
    }
}

fn http_client(timeout: Duration) -> anyhow::Result<HttpClient<EspHttpConnection>> {
    let conf = HttpClientConfiguration {
        timeout: Some(timeout),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        buffer_size_tx: Some(1024),
        ..Default::default()
    };
    Ok(HttpClient::wrap(EspHttpConnection::new(&conf)?))
}

fn http_get(url: &str, timeout: Duration) -> anyhow::Result<(u16, Vec<u8>)> {
    let mut client = http_client(timeout)?;
    let request = client.request(Method::Get, url, &[("Accept", "application/json")])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;
    let status = response.status();
    let body = read_body(&mut response)?;
    Ok((status, body))
}

fn http_post_json(url: &str, payload: &[u8], timeout: Duration) -> anyhow::Result<(u16, Vec<u8>)> {
    let mut client = http_client(timeout)?;
    let length = payload.len().to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("Content-Length", length.as_str()),
    ];
    let mut request = client.post(url, &headers)?;
    request.write_all(payload).map_err(|e| anyhow!("{e:?}"))?;
    request.flush().map_err(|e| anyhow!("{e:?}"))?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;
    let status = response.status();
    let body = read_body(&mut response)?;
    Ok((status, body))
}

fn read_body(response: &mut impl Read) -> anyhow::Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }
        if body.len() + read > MAX_HTTP_RESPONSE {
            return Err(anyhow!("response body exceeds {MAX_HTTP_RESPONSE} bytes"));
        }
        body.extend_from_slice(&chunk[..read]);
    }
    Ok(body)
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = lock(&state.controller).status(Utc::now().timestamp());
            write_json(req, 200, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/special-days", Method::Get, move |req| {
            let listing = lock(&state.controller).special_listing(Utc::now().timestamp());
            write_json(req, 200, &listing)
        })?;
    }

    server.fn_handler("/api/refresh", Method::Post, move |req| {
        let outcome =
            lock(&state.controller).request_refresh(Requester::system("http"), monotonic_ms());
        let body = RefreshResponse {
            outcome: outcome.as_str(),
        };
        if outcome.is_queued() {
            info!("refresh requested over http");
            write_json(req, 202, &body)
        } else {
            write_json(req, 409, &body)
        }
    })?;

    Ok(server)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    if network.mqtt_host.trim().is_empty() {
        return Err(anyhow!("mqtt host not configured"));
    }
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("prayer-relay-controller"),
        username: (!network.mqtt_user.is_empty()).then_some(network.mqtt_user.as_str()),
        password: (!network.mqtt_pass.is_empty()).then_some(network.mqtt_pass.as_str()),
        lwt: Some(LwtConfiguration {
            topic: TOPIC_CONTROLLER_AVAILABILITY,
            payload: b"offline",
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn on_mqtt_connected(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let mut mqtt = lock(mqtt);
    for topic in [TOPIC_CMD_BUTTON, TOPIC_CMD_REFRESH] {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }
    mqtt.publish(TOPIC_CONTROLLER_AVAILABILITY, QoS::AtLeastOnce, true, b"online")?;
    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        if let Err(err) = on_mqtt_connected(&mqtt) {
                            warn!("mqtt session setup failed: {err:#}");
                        }
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        if let Ok(message) = core::str::from_utf8(data) {
                            handle_mqtt_message(&state, topic, message);
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(state: &SharedState, topic: &str, message: &str) {
    match topic {
        TOPIC_CMD_BUTTON if message.trim().eq_ignore_ascii_case("press") => {
            info!("remote button press");
            let out = lock(&state.controller).button_pressed(Utc::now().timestamp());
            dispatch(state, out.actions, out.notices);
        }
        TOPIC_CMD_REFRESH => {
            let outcome =
                lock(&state.controller).request_refresh(Requester::system("mqtt"), monotonic_ms());
            info!("refresh requested over mqtt: {}", outcome.as_str());
        }
        _ => {}
    }
}

fn publish_state(
    state: &SharedState,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    let payload = {
        let controller = lock(&state.controller);
        serde_json::to_vec(&controller.status(Utc::now().timestamp()))?
    };
    lock(mqtt).publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                drop(wifi);
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }
        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    // The control loop keeps retrying in the background.
    warn!("wifi not connected after {WIFI_CONNECT_ATTEMPTS} attempts; continuing offline");
    drop(wifi);
    Ok(esp_wifi)
}

fn reconnect_wifi() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi reconnect requested");
    } else {
        warn!("wifi reconnect request failed: esp_err_t={rc}");
    }
}

fn init_button(pin: i32) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    let mut driver = PinDriver::input(unsafe { AnyIOPin::new(pin) })
        .with_context(|| format!("button unavailable on GPIO{pin}"))?;
    driver.set_pull(Pull::Up)?;
    Ok(driver)
}

impl Relay {
    fn new(pin: i32, active_low: bool) -> anyhow::Result<Self> {
        let pin = PinDriver::output(unsafe { AnyOutputPin::new(pin) })
            .with_context(|| format!("relay unavailable on GPIO{pin}"))?;
        Ok(Self { pin, active_low })
    }

    fn write(&mut self, on: bool) -> anyhow::Result<()> {
        if on != self.active_low {
            self.pin.set_high()?;
        } else {
            self.pin.set_low()?;
        }
        Ok(())
    }
}

impl NvsStore {
    fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .with_context(|| format!("failed to open NVS namespace `{NVS_NAMESPACE}`"))?;
        Ok(Self { nvs })
    }
}

impl KeyValueStore for NvsStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let backend = |err| StoreError::Backend(format!("nvs read `{key}`: {err:?}"));
        let Some(len) = self.nvs.blob_len(key).map_err(backend)? else {
            return Ok(None);
        };
        let mut buffer = vec![0_u8; len];
        let value = self.nvs.get_raw(key, &mut buffer).map_err(backend)?;
        Ok(value.map(<[u8]>::to_vec))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.nvs
            .set_raw(key, value)
            .map(|_| ())
            .map_err(|err| StoreError::Backend(format!("nvs write `{key}`: {err:?}")))
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.nvs
            .remove(key)
            .map(|_| ())
            .map_err(|err| StoreError::Backend(format!("nvs remove `{key}`: {err:?}")))
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn monotonic_ms() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    // Truncation is intended: every consumer compares with wrapping arithmetic.
    START.get_or_init(Instant::now).elapsed().as_millis() as u32
}
