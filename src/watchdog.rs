//! Periodic tickle of a hardware watchdog over its own serial port,
//! independent of the Transactor's link and lock.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;

const TICKLE: &[u8; 2] = b"~U";

/// The watchdog component's boundary, mirroring the Transactor/Broker
/// fakeable-capability pattern so the Engine never needs a real serial
/// port in tests.
#[async_trait]
pub trait Watchdog: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self);
}

/// Production watchdog, ticking a real serial port.
pub struct SerialWatchdogTicker {
    port_name: String,
    baud_rate: u32,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SerialWatchdogTicker {
    pub fn new(port_name: impl Into<String>, baud_rate: u32, interval: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            interval,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Watchdog for SerialWatchdogTicker {
    async fn start(&self) -> anyhow::Result<()> {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        log::info!("Opening watchdog serial: {} @ {}", self.port_name, self.baud_rate);
        let mut stream = tokio_serial::new(&self.port_name, self.baud_rate).open_native_async()?;
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = stream.write_all(TICKLE).await {
                    log::error!("Watchdog write failed: {}", e);
                } else if let Err(e) = stream.flush().await {
                    log::error!("Watchdog flush failed: {}", e);
                }
                tokio::time::sleep(interval).await;
            }
        });
        *guard = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

/// Fake watchdog for the Engine's tests: records start/stop without
/// touching a serial port.
pub mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct NullWatchdog {
        pub started: AtomicBool,
    }

    impl NullWatchdog {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Watchdog for NullWatchdog {
        async fn start(&self) -> anyhow::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {
            self.started.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickle_bytes_are_ascii_tilde_u() {
        assert_eq!(TICKLE, b"~U");
        assert_eq!(TICKLE[0], 0x7E);
        assert_eq!(TICKLE[1], 0x55);
    }

    #[tokio::test]
    async fn null_watchdog_tracks_start_stop() {
        use fakes::NullWatchdog;
        use std::sync::atomic::Ordering;

        let wd = NullWatchdog::new();
        wd.start().await.unwrap();
        assert!(wd.started.load(Ordering::SeqCst));
        wd.stop().await;
        assert!(!wd.started.load(Ordering::SeqCst));
    }
}
