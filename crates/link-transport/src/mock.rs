use crate::{LinkDriver, LinkPort, PortInfo, Result, TransportError};
use device_engine::{DeviceEngine, EngineConfig, SimulatedImu};
use knee_protocol::DeviceMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// In-process backend whose ports are backed by a simulated knee sensor.
///
/// Each `open` boots a fresh [`DeviceEngine`] (calibration included), so the
/// host sees the same `CALIBRATING` / `CALIBRATION_COMPLETE` / `SYSTEM_READY`
/// sequence a real board prints after reset.
pub struct MockDriver {
    ports: Vec<String>,
    engine: EngineConfig,
    seed: u64,
    open_delay: Option<Duration>,
    opened: Mutex<Vec<(String, Weak<Mutex<SimDevice>>)>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new(vec!["sim0".to_string()])
    }
}

impl MockDriver {
    pub fn new(ports: Vec<String>) -> Self {
        Self {
            ports,
            engine: EngineConfig::default(),
            seed: 7,
            open_delay: None,
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Make `open` block for `delay`, to exercise connect timeouts.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Number of simulated devices that still have a live port handle.
    pub fn live_ports(&self) -> usize {
        let mut opened = self.opened.lock();
        opened.retain(|(_, dev)| dev.strong_count() > 0);
        opened.len()
    }

    /// Make every live port on `path` fail its next read, as if unplugged.
    pub fn inject_fault(&self, path: &str, reason: &str) -> bool {
        let opened = self.opened.lock();
        let mut hit = false;
        for (p, dev) in opened.iter() {
            if p == path {
                if let Some(dev) = dev.upgrade() {
                    dev.lock().fault = Some(reason.to_string());
                    hit = true;
                }
            }
        }
        hit
    }
}

impl LinkDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn list(&self) -> Result<Vec<PortInfo>> {
        Ok(self
            .ports
            .iter()
            .map(|p| {
                let mut info = PortInfo::new(p.clone(), "mock");
                info.manufacturer = Some("KneeTrack".to_string());
                info.product = Some("Simulated knee sensor".to_string());
                info
            })
            .collect())
    }

    fn open(&self, path: &str, _baud_rate: u32, read_timeout: Duration) -> Result<Box<dyn LinkPort>> {
        if !self.ports.iter().any(|p| p == path) {
            return Err(TransportError::PortNotFound(path.to_string()));
        }
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        let period_s = self.engine.tick_ms as f32 / 1000.0;
        let imu = SimulatedImu::new(self.seed, period_s)
            .with_still_samples(self.engine.calibration_samples);
        let engine = DeviceEngine::new(imu, self.engine.clone())
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let device = Arc::new(Mutex::new(SimDevice::boot(engine)));
        self.opened
            .lock()
            .push((path.to_string(), Arc::downgrade(&device)));
        debug!(path, "mock device opened");
        Ok(Box::new(MockPort {
            device,
            read_timeout,
        }))
    }
}

struct SimDevice {
    engine: DeviceEngine<SimulatedImu>,
    started: Instant,
    next_tick: Instant,
    tick: Duration,
    inbox: Vec<String>,
    partial: String,
    outbox: VecDeque<u8>,
    fault: Option<String>,
}

impl SimDevice {
    fn boot(engine: DeviceEngine<SimulatedImu>) -> Self {
        let tick = Duration::from_millis(engine.config().tick_ms.max(1));
        let now = Instant::now();
        let mut dev = Self {
            engine,
            started: now,
            next_tick: now + tick,
            tick,
            inbox: Vec::new(),
            partial: String::new(),
            outbox: VecDeque::new(),
            fault: None,
        };
        let boot = dev.engine.boot();
        dev.emit(boot);
        dev
    }

    fn emit(&mut self, messages: Vec<DeviceMessage>) {
        for msg in messages {
            match msg.encode() {
                Ok(line) => self.outbox.extend(line.into_bytes()),
                Err(e) => warn!(error = %e, "simulated device could not encode message"),
            }
        }
    }

    fn run_tick(&mut self, now: Instant) {
        let now_ms = now.duration_since(self.started).as_millis() as u64;
        let pending = std::mem::take(&mut self.inbox);
        let out = self.engine.step(now_ms, pending);
        self.emit(out);
        self.next_tick += self.tick;
        // Do not try to catch up on ticks missed while nobody was reading.
        if self.next_tick < now {
            self.next_tick = now + self.tick;
        }
    }
}

struct MockPort {
    device: Arc<Mutex<SimDevice>>,
    read_timeout: Duration,
}

impl LinkPort for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let wait = {
                let mut dev = self.device.lock();
                if let Some(reason) = dev.fault.clone() {
                    return Err(TransportError::Io(reason));
                }
                if !dev.outbox.is_empty() {
                    let n = buf.len().min(dev.outbox.len());
                    for (slot, b) in buf.iter_mut().zip(dev.outbox.drain(..n)) {
                        *slot = b;
                    }
                    return Ok(n);
                }
                let now = Instant::now();
                if now >= dev.next_tick {
                    dev.run_tick(now);
                    continue;
                }
                if now >= deadline {
                    return Err(TransportError::Timeout);
                }
                (dev.next_tick - now).min(deadline - now)
            };
            std::thread::sleep(wait);
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut dev = self.device.lock();
        if let Some(reason) = dev.fault.clone() {
            return Err(TransportError::Io(reason));
        }
        dev.partial.push_str(&String::from_utf8_lossy(data));
        while let Some(idx) = dev.partial.find('\n') {
            let line: String = dev.partial.drain(..=idx).collect();
            dev.inbox.push(line.trim_end().to_string());
        }
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn LinkPort>> {
        Ok(Box::new(MockPort {
            device: Arc::clone(&self.device),
            read_timeout: self.read_timeout,
        }))
    }
}
