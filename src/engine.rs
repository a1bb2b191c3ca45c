//! The runtime engine: owns the Transactor, Broker, Watchdog, and the
//! poll/command loops, and drives the broker connectivity / failsafe state
//! machine.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::config::AppConfig;
use crate::discovery;
use crate::failsafe;
use crate::pins::{A_CHAN_COUNT, P_PINS, S_PINS};
use crate::state_store;
use crate::transactor::{Transactor, WriteMode, HIGH_SENTINEL, ON_SENTINEL};
use crate::watchdog::Watchdog;

pub const EXIT_HANDSHAKE_FAILED: i32 = 2;
pub const EXIT_DIGITAL_POLL_FATAL: i32 = 4;
pub const EXIT_ANALOG_POLL_FATAL: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Online,
    Offline,
}

/// A poll-loop body hit a transactor fault treated as fatal. Carries the
/// reserved exit code for the loop that failed.
#[derive(Debug)]
pub struct FatalExit(pub i32);

fn on_off(v: bool) -> &'static str {
    if v {
        "ON"
    } else {
        "OFF"
    }
}

struct EngineState {
    s_state: Mutex<HashMap<u16, bool>>,
    p_state: Mutex<BTreeMap<u16, bool>>,
    a_state: Mutex<HashMap<u16, u16>>,
    broker_mode_tx: watch::Sender<BrokerMode>,
    broker_mode_rx: watch::Receiver<BrokerMode>,
    reconnect_notify: Notify,
    failsafe_map: BTreeMap<u16, u16>,
    alive: AtomicBool,
}

impl EngineState {
    fn mode(&self) -> BrokerMode {
        *self.broker_mode_rx.borrow()
    }

    fn set_mode(&self, mode: BrokerMode) {
        let _ = self.broker_mode_tx.send(mode);
        if mode == BrokerMode::Offline {
            self.reconnect_notify.notify_waiters();
        }
    }
}

/// Owns A–F and runs the poll loops, command loop, reconnection and
/// failsafe state machine, and restore-on-start.
pub struct Engine<T: Transactor + 'static, B: Broker + 'static, W: Watchdog + 'static> {
    config: AppConfig,
    transactor: Arc<T>,
    broker: Arc<B>,
    watchdog: Arc<W>,
    state: Arc<EngineState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transactor + 'static, B: Broker + 'static, W: Watchdog + 'static> Engine<T, B, W> {
    pub fn new(config: AppConfig, transactor: Arc<T>, broker: Arc<B>, watchdog: Arc<W>) -> Self {
        let (tx, rx) = watch::channel(BrokerMode::Offline);
        let failsafe_map = failsafe::load(&config.paths.failsafe_path);
        log::info!("Failsafe map: {:?}", failsafe_map);
        Self {
            config,
            transactor,
            broker,
            watchdog,
            state: Arc::new(EngineState {
                s_state: Mutex::new(HashMap::new()),
                p_state: Mutex::new(BTreeMap::new()),
                a_state: Mutex::new(HashMap::new()),
                broker_mode_tx: tx,
                broker_mode_rx: rx,
                reconnect_notify: Notify::new(),
                failsafe_map,
                alive: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn broker_mode(&self) -> BrokerMode {
        self.state.mode()
    }

    pub async fn output_states(&self) -> BTreeMap<u16, bool> {
        self.state.p_state.lock().await.clone()
    }

    /// Runs the full startup sequence: load failsafe map, connect
    /// broker, open+handshake the transactor, start the watchdog, restore
    /// pins, emit discovery, publish the current snapshot, subscribe, and
    /// launch the three long-running loops.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        log::info!("Engine starting...");

        self.broker.connect().await?;
        self.state.set_mode(BrokerMode::Online);

        self.transactor.open().await?;
        let handshake_ok = self
            .transactor
            .handshake(3, Duration::from_millis(2500), Duration::from_millis(500))
            .await
            .unwrap_or(false);
        if !handshake_ok {
            log::error!("Handshake failed, exiting.");
            std::process::exit(EXIT_HANDSHAKE_FAILED);
        }

        self.watchdog.start().await?;

        self.restore_pins().await;
        self.publish_discovery().await;
        self.publish_all_states(true).await;
        self.broker
            .subscribe(&format!("{}/+/set", self.config.mqtt.base_topic))
            .await?;

        self.state.alive.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(commands_task(self.clone_for_task())));
        tasks.push(tokio::spawn(digital_poll_task(self.clone_for_task())));
        tasks.push(tokio::spawn(analog_poll_task(self.clone_for_task())));

        log::info!("Engine started.");
        Ok(())
    }

    fn clone_for_task(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    /// Cancels all tasks, then closes the broker (best-effort offline
    /// publish), the transactor, and the watchdog, in that order.
    pub async fn stop(self: &Arc<Self>) {
        log::info!("Engine stopping...");
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.reconnect_notify.notify_waiters();

        let mut tasks = self.tasks.lock().await;
        for t in tasks.drain(..) {
            t.abort();
        }
        drop(tasks);

        let _ = self.broker.disconnect().await;
        self.state.set_mode(BrokerMode::Offline);
        let _ = self.transactor.close().await;
        self.watchdog.stop().await;
        log::info!("Engine stopped.");
    }

    async fn safe_publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) {
        if self.state.mode() != BrokerMode::Online {
            return;
        }
        if let Err(e) = self.broker.publish(topic, payload.as_bytes(), qos, retain).await {
            log::warn!("Broker publish failed ({}); entering failsafe.", e);
            self.state.set_mode(BrokerMode::Offline);
            let _ = self.broker.disconnect().await;
        }
    }

    async fn restore_pins(&self) {
        let saved = state_store::load(&self.config.paths.state_path);
        if saved.is_empty() {
            log::info!("No saved P states found at {}", self.config.paths.state_path.display());
            return;
        }
        log::info!("Restoring P states: {:?}", saved);
        for (pin, desired) in saved {
            if !P_PINS.contains(&pin) {
                continue;
            }
            let mode = if desired { WriteMode::High } else { WriteMode::Low };
            match self.transactor.digital_write(pin, mode).await {
                Ok(reply) => {
                    let new_state = reply == ON_SENTINEL;
                    self.state.p_state.lock().await.insert(pin, new_state);
                    let topic = format!("{}/P{pin}/state", self.config.mqtt.base_topic);
                    self.safe_publish(&topic, on_off(new_state), 1, true).await;
                }
                Err(e) => log::warn!("Failed to restore P{}: {}", pin, e),
            }
        }
    }

    async fn publish_discovery(&self) {
        let dev = &self.config.device;
        let prefix = &self.config.mqtt.discovery_prefix;
        let base = &self.config.mqtt.base_topic;
        let retain = self.config.mqtt.retain_discovery;

        for &pin in S_PINS.iter() {
            let (topic, payload) = discovery::binary_sensor_config(prefix, base, dev, pin);
            self.safe_publish(&topic, &payload, 1, retain).await;
        }
        for &pin in P_PINS.iter() {
            let (topic, payload) = discovery::switch_config(prefix, base, dev, pin);
            self.safe_publish(&topic, &payload, 1, retain).await;
        }
        for ch in 0..A_CHAN_COUNT as u16 {
            if !self.config.inputs.analog_enabled.get(ch as usize).copied().unwrap_or(false) {
                continue;
            }
            let (topic, payload) = discovery::analog_sensor_config(prefix, base, dev, ch);
            self.safe_publish(&topic, &payload, 1, retain).await;
        }
    }

    async fn publish_all_states(&self, retain: bool) {
        let base = &self.config.mqtt.base_topic;

        for &pin in S_PINS.iter() {
            match self.transactor.digital_read(pin).await {
                Ok(reply) => {
                    let is_high = reply == HIGH_SENTINEL;
                    self.state.s_state.lock().await.insert(pin, is_high);
                    let topic = format!("{base}/S{pin}/state");
                    self.safe_publish(&topic, on_off(is_high), 1, retain).await;
                }
                Err(e) => log::warn!("Initial S read failed for {}: {}", pin, e),
            }
        }

        let p_state = self.state.p_state.lock().await.clone();
        for &pin in P_PINS.iter() {
            if let Some(&known) = p_state.get(&pin) {
                let topic = format!("{base}/P{pin}/state");
                self.safe_publish(&topic, on_off(known), 1, retain).await;
            }
        }

        for ch in 0..A_CHAN_COUNT as u16 {
            if !self.config.inputs.analog_enabled.get(ch as usize).copied().unwrap_or(false) {
                continue;
            }
            match self.transactor.analog_read(ch).await {
                Ok(val) => {
                    self.state.a_state.lock().await.insert(ch, val);
                    let topic = format!("{base}/A{ch}/state");
                    self.safe_publish(&topic, &val.to_string(), 0, retain).await;
                }
                Err(e) => log::warn!("Initial A read failed for {}: {}", ch, e),
            }
        }
    }

    async fn ensure_broker_online(&self) {
        let mut backoff = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        while self.state.alive.load(Ordering::SeqCst) && self.state.mode() != BrokerMode::Online {
            match self.broker.connect().await {
                Ok(()) => {
                    self.state.set_mode(BrokerMode::Online);
                    let _ = self
                        .broker
                        .subscribe(&format!("{}/+/set", self.config.mqtt.base_topic))
                        .await;
                    self.publish_discovery().await;
                    self.publish_all_states(true).await;
                    log::info!("Reconnected to broker, leaving failsafe.");
                    return;
                }
                Err(e) => {
                    log::warn!("Reconnect failed: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(cap);
                }
            }
        }
    }

    fn parse_set_topic(&self, topic: &str) -> Option<u16> {
        let base = self.config.mqtt.base_topic.trim_end_matches('/');
        let rest = topic.strip_prefix(base)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let pin_part = parts.next()?;
        let action = parts.next()?;
        if parts.next().is_some() || action != "set" {
            return None;
        }
        let pin_str = pin_part.strip_prefix('P')?;
        let pin: u16 = pin_str.parse().ok()?;
        if P_PINS.contains(&pin) {
            Some(pin)
        } else {
            None
        }
    }

    fn parse_command_payload(payload: &[u8]) -> Option<WriteMode> {
        let s = std::str::from_utf8(payload).ok()?.trim();
        if s.eq_ignore_ascii_case("toggle") {
            return Some(WriteMode::Invert);
        }
        match s.to_lowercase().as_str() {
            "1" | "on" | "true" | "high" => Some(WriteMode::High),
            "0" | "off" | "false" | "low" => Some(WriteMode::Low),
            _ => None,
        }
    }

    async fn handle_command(&self, pin: u16, mode: WriteMode) {
        match self.transactor.digital_write(pin, mode).await {
            Ok(reply) => {
                let new_state = reply == ON_SENTINEL;
                self.state.p_state.lock().await.insert(pin, new_state);

                let snapshot = self.state.p_state.lock().await.clone();
                if let Err(e) = state_store::save(&self.config.paths.state_path, &snapshot) {
                    log::warn!("Failed to persist P states: {}", e);
                }

                let topic = format!("{}/P{pin}/state", self.config.mqtt.base_topic);
                self.safe_publish(&topic, on_off(new_state), 1, true).await;
            }
            Err(e) => {
                log::warn!("Command write failed for P{}: {}", pin, e);
            }
        }
    }

    async fn failsafe_mirror(&self, s_pin: u16, input_value: bool) {
        let Some(&p_pin) = self.state.failsafe_map.get(&s_pin) else {
            return;
        };
        let already_matches = self.state.p_state.lock().await.get(&p_pin).copied() == Some(input_value);
        if already_matches {
            return;
        }
        let mode = if input_value { WriteMode::High } else { WriteMode::Low };
        match self.transactor.digital_write(p_pin, mode).await {
            Ok(reply) => {
                let new_state = reply == ON_SENTINEL;
                self.state.p_state.lock().await.insert(p_pin, new_state);
                let snapshot = self.state.p_state.lock().await.clone();
                if let Err(e) = state_store::save(&self.config.paths.state_path, &snapshot) {
                    log::warn!("Persist P states failed (failsafe): {}", e);
                }
            }
            Err(e) => log::warn!("Failsafe write P{} from S{} failed: {}", p_pin, s_pin, e),
        }
    }
}

async fn commands_task<T: Transactor + 'static, B: Broker + 'static, W: Watchdog + 'static>(engine: Arc<Engine<T, B, W>>) {
    while engine.state.alive.load(Ordering::SeqCst) {
        if engine.state.mode() != BrokerMode::Online {
            engine.ensure_broker_online().await;
            if engine.state.mode() != BrokerMode::Online {
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        let msg = tokio::select! {
            m = engine.broker.next_message() => m,
            _ = engine.state.reconnect_notify.notified() => continue,
        };

        match msg {
            Ok((topic, payload)) => {
                let Some(pin) = engine.parse_set_topic(&topic) else {
                    log::warn!("Unknown or malformed command topic: {}", topic);
                    continue;
                };
                let Some(mode) = Engine::<T, B, W>::parse_command_payload(&payload) else {
                    log::warn!("Unrecognized command payload for P{}: {:?}", pin, payload);
                    continue;
                };
                engine.handle_command(pin, mode).await;
            }
            Err(e) => {
                log::warn!("Broker receive failed, going offline: {}", e);
                engine.state.set_mode(BrokerMode::Offline);
            }
        }
    }
}

async fn digital_poll_task<T: Transactor + 'static, B: Broker + 'static, W: Watchdog + 'static>(engine: Arc<Engine<T, B, W>>) {
    if let Err(FatalExit(code)) = digital_poll_loop(&engine).await {
        log::error!("Digital poll fatal, exiting with code {}", code);
        std::process::exit(code);
    }
}

async fn digital_poll_loop<T: Transactor + 'static, B: Broker + 'static, W: Watchdog + 'static>(
    engine: &Arc<Engine<T, B, W>>,
) -> Result<(), FatalExit> {
    let hz = engine.config.polling.digital_hz.max(1);
    let period = Duration::from_secs_f64(1.0 / hz as f64);

    while engine.state.alive.load(Ordering::SeqCst) {
        let start = tokio::time::Instant::now();
        for &pin in S_PINS.iter() {
            let val = engine
                .transactor
                .digital_read(pin)
                .await
                .map_err(|_| FatalExit(EXIT_DIGITAL_POLL_FATAL))?;
            let is_high = val == HIGH_SENTINEL;

            let prev = engine.state.s_state.lock().await.insert(pin, is_high);
            if prev != Some(is_high) {
                let topic = format!("{}/S{pin}/state", engine.config.mqtt.base_topic);
                engine.safe_publish(&topic, on_off(is_high), 1, true).await;

                if engine.state.mode() == BrokerMode::Offline {
                    engine.failsafe_mirror(pin, is_high).await;
                }
            }
        }
        let elapsed = start.elapsed();
        if elapsed < period {
            tokio::time::sleep(period - elapsed).await;
        }
    }
    Ok(())
}

async fn analog_poll_task<T: Transactor + 'static, B: Broker + 'static, W: Watchdog + 'static>(engine: Arc<Engine<T, B, W>>) {
    if let Err(FatalExit(code)) = analog_poll_loop(&engine).await {
        log::error!("Analog poll fatal, exiting with code {}", code);
        std::process::exit(code);
    }
}

async fn analog_poll_loop<T: Transactor + 'static, B: Broker + 'static, W: Watchdog + 'static>(
    engine: &Arc<Engine<T, B, W>>,
) -> Result<(), FatalExit> {
    let threshold = engine.config.polling.analog_threshold as i32;
    let period = Duration::from_millis(engine.config.polling.analog_interval_ms.max(50));

    while engine.state.alive.load(Ordering::SeqCst) {
        for ch in 0..A_CHAN_COUNT as u16 {
            if !engine
                .config
                .inputs
                .analog_enabled
                .get(ch as usize)
                .copied()
                .unwrap_or(false)
            {
                continue;
            }
            let val = engine
                .transactor
                .analog_read(ch)
                .await
                .map_err(|_| FatalExit(EXIT_ANALOG_POLL_FATAL))?;

            let prev = engine.state.a_state.lock().await.get(&ch).copied();
            let changed = match prev {
                None => true,
                Some(p) => (val as i32 - p as i32).abs() >= threshold,
            };
            if changed {
                engine.state.a_state.lock().await.insert(ch, val);
                let topic = format!("{}/A{ch}/state", engine.config.mqtt.base_topic);
                engine.safe_publish(&topic, &val.to_string(), 0, true).await;
            }
        }
        tokio::time::sleep(period).await;
    }
    Ok(())
}
