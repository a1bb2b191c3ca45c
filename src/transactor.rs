//! Framed request/reply protocol over the board's serial link.
//!
//! Frame: `[0xDE][cmd][hi][lo][arg]`. Reply: 2 bytes, big-endian u16.
//! All operations serialize through a single lock; see DESIGN.md for why
//! that lock is a `tokio::sync::Mutex` rather than a `std::sync::Mutex`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use crate::error::TransactorError;

pub const START_FLAG: u8 = 0xDE;

pub const HANDSHAKE_CVAL: u16 = 666;
pub const HANDSHAKE_ARG: u8 = 1;

pub const ON_SENTINEL: u16 = 3333;
pub const OFF_SENTINEL: u16 = 4444;
pub const HIGH_SENTINEL: u16 = 1111;
pub const LOW_SENTINEL: u16 = 2222;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Low = 0,
    High = 1,
    Invert = 2,
}

fn frame(cmd: u8, cval: u16, arg: u8) -> [u8; 5] {
    [START_FLAG, cmd, (cval >> 8) as u8, (cval & 0xFF) as u8, arg]
}

/// The board's request/reply transactor: `Open`, `Close`, `Handshake`,
/// `DigitalRead`, `DigitalWrite`, `AnalogRead`, per the fakeable boundary
/// named in the design notes.
#[async_trait]
pub trait Transactor: Send + Sync {
    async fn open(&self) -> Result<(), TransactorError>;
    async fn close(&self) -> Result<(), TransactorError>;
    async fn handshake(
        &self,
        retries: u32,
        attempt_timeout: Duration,
        retry_gap: Duration,
    ) -> Result<bool, TransactorError>;
    async fn digital_write(&self, pin: u16, mode: WriteMode) -> Result<u16, TransactorError>;
    async fn digital_read(&self, pin: u16) -> Result<u16, TransactorError>;
    async fn analog_read(&self, ch: u16) -> Result<u16, TransactorError>;
}

/// Production transactor, backed by a real serial port via `tokio-serial`.
pub struct SerialTransactor {
    port_name: String,
    baud_rate: u32,
    write_timeout: Duration,
    read_timeout: Duration,
    port: Mutex<Option<tokio_serial::SerialStream>>,
}

impl SerialTransactor {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            write_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(300),
            port: Mutex::new(None),
        }
    }

    async fn transact(&self, cmd: u8, cval: u16, arg: u8, op_timeout: Duration) -> Result<u16, TransactorError> {
        let mut guard = self.port.lock().await;
        let stream = guard.as_mut().ok_or(TransactorError::NotOpen)?;

        // Discard any stale bytes left over from a prior timeout before issuing
        // a fresh request; never partially consume a framed reply.
        let mut scratch = [0u8; 64];
        loop {
            match timeout(Duration::from_millis(1), stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(TransactorError::Io(e)),
            }
        }

        let payload = frame(cmd, cval, arg);
        timeout(op_timeout, stream.write_all(&payload))
            .await
            .map_err(|_| TransactorError::Timeout)?
            .map_err(TransactorError::Io)?;

        let mut reply = [0u8; 2];
        timeout(op_timeout, stream.read_exact(&mut reply))
            .await
            .map_err(|_| TransactorError::Timeout)?
            .map_err(|_| TransactorError::Timeout)?;

        Ok(u16::from_be_bytes(reply))
    }
}

#[async_trait]
impl Transactor for SerialTransactor {
    async fn open(&self) -> Result<(), TransactorError> {
        let mut builder = tokio_serial::new(&self.port_name, self.baud_rate);
        builder = builder.timeout(self.read_timeout);
        let stream = builder.open_native_async().map_err(|e| {
            TransactorError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        *self.port.lock().await = Some(stream);

        // The board resets when the port is opened; give it time to settle
        // before flushing and issuing any requests.
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut guard = self.port.lock().await;
        if let Some(stream) = guard.as_mut() {
            stream
                .clear(tokio_serial::ClearBuffer::All)
                .map_err(|e| TransactorError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransactorError> {
        *self.port.lock().await = None;
        Ok(())
    }

    async fn handshake(
        &self,
        retries: u32,
        attempt_timeout: Duration,
        retry_gap: Duration,
    ) -> Result<bool, TransactorError> {
        let mut last_err = None;
        for attempt in 0..retries.max(1) {
            match self
                .transact(b'I', HANDSHAKE_CVAL, HANDSHAKE_ARG, attempt_timeout)
                .await
            {
                Ok(reply) if reply == HANDSHAKE_CVAL => return Ok(true),
                Ok(_) => return Ok(false),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < retries {
                        tokio::time::sleep(retry_gap).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(TransactorError::Timeout))
    }

    async fn digital_write(&self, pin: u16, mode: WriteMode) -> Result<u16, TransactorError> {
        self.transact(b'P', pin, mode as u8, self.write_timeout).await
    }

    async fn digital_read(&self, pin: u16) -> Result<u16, TransactorError> {
        self.transact(b'S', pin, 0, self.read_timeout).await
    }

    async fn analog_read(&self, ch: u16) -> Result<u16, TransactorError> {
        self.transact(b'A', ch, 0, self.read_timeout).await
    }
}

/// Deterministic fake that replays scripted replies, keyed by the frame
/// that would have produced them. Enables end-to-end scenario tests
/// without hardware.
pub mod fakes {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct ScriptedFrame {
        pub cmd: u8,
        pub cval: u16,
        pub arg: u8,
    }

    pub struct ScriptedTransactor {
        replies: StdMutex<std::collections::HashMap<ScriptedFrame, VecDeque<Result<u16, ()>>>>,
        // Sticky last-known-good reply per frame, returned once a frame's
        // scripted queue runs dry — lets poll-loop tests script only the
        // interesting transitions instead of every sweep.
        last_ok: StdMutex<std::collections::HashMap<ScriptedFrame, u16>>,
        pub calls: StdMutex<Vec<ScriptedFrame>>,
        handshake_ok: bool,
    }

    impl ScriptedTransactor {
        pub fn new(handshake_ok: bool) -> Self {
            Self {
                replies: StdMutex::new(std::collections::HashMap::new()),
                last_ok: StdMutex::new(std::collections::HashMap::new()),
                calls: StdMutex::new(Vec::new()),
                handshake_ok,
            }
        }

        pub fn script(&self, cmd: u8, cval: u16, arg: u8, reply: u16) {
            self.replies
                .lock()
                .unwrap()
                .entry(ScriptedFrame { cmd, cval, arg })
                .or_default()
                .push_back(Ok(reply));
        }

        pub fn script_timeout(&self, cmd: u8, cval: u16, arg: u8) {
            self.replies
                .lock()
                .unwrap()
                .entry(ScriptedFrame { cmd, cval, arg })
                .or_default()
                .push_back(Err(()));
        }

        fn next_reply(&self, f: ScriptedFrame) -> Result<u16, TransactorError> {
            self.calls.lock().unwrap().push(f.clone());
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(&f).and_then(|q| q.pop_front()) {
                Some(Ok(v)) => {
                    self.last_ok.lock().unwrap().insert(f, v);
                    Ok(v)
                }
                Some(Err(())) => Err(TransactorError::Timeout),
                None => match self.last_ok.lock().unwrap().get(&f).copied() {
                    Some(v) => Ok(v),
                    None => Err(TransactorError::Timeout),
                },
            }
        }
    }

    #[async_trait]
    impl Transactor for ScriptedTransactor {
        async fn open(&self) -> Result<(), TransactorError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), TransactorError> {
            Ok(())
        }

        async fn handshake(
            &self,
            _retries: u32,
            _attempt_timeout: Duration,
            _retry_gap: Duration,
        ) -> Result<bool, TransactorError> {
            Ok(self.handshake_ok)
        }

        async fn digital_write(&self, pin: u16, mode: WriteMode) -> Result<u16, TransactorError> {
            self.next_reply(ScriptedFrame {
                cmd: b'P',
                cval: pin,
                arg: mode as u8,
            })
        }

        async fn digital_read(&self, pin: u16) -> Result<u16, TransactorError> {
            self.next_reply(ScriptedFrame {
                cmd: b'S',
                cval: pin,
                arg: 0,
            })
        }

        async fn analog_read(&self, ch: u16) -> Result<u16, TransactorError> {
            self.next_reply(ScriptedFrame {
                cmd: b'A',
                cval: ch,
                arg: 0,
            })
        }
    }
}
