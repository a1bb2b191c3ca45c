//! Library surface for the Arduino/MQTT bridge: the runtime engine and the
//! components it owns (Transactor, Broker, Watchdog, State Store, Failsafe
//! Map, Discovery). `main.rs` is a thin process supervisor built on top of
//! this crate; integration tests exercise end-to-end scenarios against the
//! fakes in `broker::fakes` and `transactor::fakes`.

pub mod broker;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod failsafe;
pub mod pins;
pub mod state_store;
pub mod transactor;
pub mod watchdog;

pub use broker::Broker;
pub use config::AppConfig;
pub use engine::Engine;
pub use transactor::Transactor;
pub use watchdog::{SerialWatchdogTicker, Watchdog};
