//! ESP32 peripheral sources and the background reader that drains them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::protocol::{self, BlePacket, LineAssembler};
use crate::{KineticError, Result};

/// Poll interval of the reader thread, bounds stop latency.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Notification chunks buffered between the BLE callback and the reader.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// A byte stream from the peripheral.
///
/// `read_chunk` returns `Ok(None)` on timeout and
/// `Err(KineticError::StreamStopped)` once the source is gone for good.
pub trait DeviceSource: Send {
    fn name(&self) -> &str;

    fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// Source fed by the platform's BLE notification callback.
pub struct ChannelDevice {
    name: String,
    receiver: Receiver<Vec<u8>>,
}

/// Producer half handed to the platform callback.
#[derive(Clone)]
pub struct NotificationSender {
    sender: Sender<Vec<u8>>,
}

impl ChannelDevice {
    pub fn new(name: impl Into<String>, capacity: usize) -> (ChannelDevice, NotificationSender) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        (
            ChannelDevice {
                name: name.into(),
                receiver,
            },
            NotificationSender { sender },
        )
    }
}

impl DeviceSource for ChannelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(KineticError::StreamStopped),
        }
    }
}

impl NotificationSender {
    /// Forward one notification. Never blocks: a full queue drops the chunk.
    pub fn notify(&self, bytes: &[u8]) -> Result<()> {
        match self.sender.try_send(bytes.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::trace!("Notification queue full, dropping {} bytes", bytes.len());
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(KineticError::ChannelDisconnected),
        }
    }
}

/// Replays canned payload lines, for tests and demos.
pub struct ScriptedDevice {
    name: String,
    chunks: VecDeque<Vec<u8>>,
    pace: Option<Duration>,
    next_due: Option<Instant>,
}

impl ScriptedDevice {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let chunks = lines
            .into_iter()
            .map(|line| format!("{}\n", line.as_ref()).into_bytes())
            .collect();
        Self {
            name: "scripted".to_string(),
            chunks,
            pace: None,
            next_due: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Space chunks `interval` apart to mimic a live notification rate. The
    /// interval may exceed the reader's poll timeout.
    pub fn paced(mut self, interval: Duration) -> Self {
        self.pace = Some(interval);
        self
    }

    /// Re-split the script into chunks of at most `size` bytes, ignoring line
    /// boundaries, the way BLE MTU limits cut notifications.
    pub fn chunked(mut self, size: usize) -> Self {
        let size = size.max(1);
        let bytes: Vec<u8> = self.chunks.drain(..).flatten().collect();
        self.chunks = bytes.chunks(size).map(|c| c.to_vec()).collect();
        self
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }
}

impl DeviceSource for ScriptedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if self.chunks.is_empty() {
            return Err(KineticError::StreamStopped);
        }
        if let Some(pace) = self.pace {
            let now = Instant::now();
            let due = *self.next_due.get_or_insert(now + pace);
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(None);
                }
                std::thread::sleep(wait);
            }
            self.next_due = Some(due + pace);
        }
        Ok(self.chunks.pop_front())
    }
}

/// Cloneable view of whether a [`DeviceStream`] reader has finished.
#[derive(Debug, Clone)]
pub struct StreamCompletion(Arc<AtomicBool>);

impl StreamCompletion {
    pub fn is_finished(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Poll until finished or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

/// Background reader turning a [`DeviceSource`] into parsed packets.
pub struct DeviceStream {
    name: String,
    stop_flag: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    packets: Arc<AtomicU64>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceStream {
    /// Spawn the reader. `handler` runs on the reader thread for every
    /// packet, in arrival order.
    pub fn start<D, H>(device: D, handler: H) -> Result<DeviceStream>
    where
        D: DeviceSource + 'static,
        H: FnMut(BlePacket) + Send + 'static,
    {
        let name = device.name().to_string();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let packets = Arc::new(AtomicU64::new(0));

        let reader = Reader {
            stop_flag: stop_flag.clone(),
            finished: finished.clone(),
            packets: packets.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("kinetic-ble".into())
            .spawn(move || reader.run(device, handler))?;

        Ok(DeviceStream {
            name,
            stop_flag,
            finished,
            packets,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once stopped or the source has gone away.
    pub fn is_active(&self) -> bool {
        !self.stop_flag.load(Ordering::Relaxed) && !self.finished.load(Ordering::Acquire)
    }

    /// Packets handed to the handler so far.
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Block until the source is exhausted or `timeout` passes. Returns
    /// whether the source finished.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.completion().wait(timeout)
    }

    /// Completion flag that outlives a borrow of the stream.
    pub fn completion(&self) -> StreamCompletion {
        StreamCompletion(self.finished.clone())
    }

    /// Stop the reader and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Reader {
    stop_flag: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    packets: Arc<AtomicU64>,
}

impl Reader {
    fn run<D, H>(self, mut device: D, mut handler: H)
    where
        D: DeviceSource,
        H: FnMut(BlePacket),
    {
        let mut assembler = LineAssembler::new();
        log::info!("BLE reader started ({})", device.name());

        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                log::info!("BLE reader stopping (stop flag set)");
                break;
            }

            let chunk = match device.read_chunk(READ_TIMEOUT) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => continue,
                Err(KineticError::StreamStopped) | Err(KineticError::ChannelDisconnected) => {
                    log::info!("BLE source {} closed", device.name());
                    break;
                }
                Err(e) => {
                    log::warn!("BLE read error: {}", e);
                    continue;
                }
            };

            for line in assembler.push(&chunk) {
                log::trace!("[RX] {}", line);
                match protocol::parse_payload(&line) {
                    Ok(packet) => {
                        self.packets.fetch_add(1, Ordering::Relaxed);
                        handler(packet);
                    }
                    Err(e) => log::warn!("{}", e),
                }
            }
        }

        self.finished.store(true, Ordering::Release);
    }
}
