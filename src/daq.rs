//! Acquisition coordinator: a named registry of instruments with parallel
//! fan-out reads and writes.
//!
//! Fan-outs are structured: the sibling reads for one call are joined
//! together, and the first failure cancels the rest before it surfaces.
//! Each device's sub-result is annotated with wall-clock request/response
//! timestamps so downstream consumers can reconstruct sample times.

use std::time::SystemTime;

use futures::future::try_join_all;
use indexmap::IndexMap;
use log::debug;

use crate::device::{self, Device};
use crate::schema::{DataFrame, Value};
use crate::serial;
use crate::transport::SerialConfig;
use crate::{Error, Result};

/// Annotation key for the instant a device read was issued.
pub const REQUEST_SENT_KEY: &str = "Request Sent";
/// Annotation key for the instant the device's reply was in hand.
pub const RESPONSE_RECEIVED_KEY: &str = "Response Received";

/// Where a registry entry comes from: a port to open, or an already
/// discovered handle to adopt.
pub enum DeviceSource {
    /// Open this port with default link settings, then discover.
    Port(String),
    /// Open with explicit link settings, then discover.
    Config(SerialConfig),
    /// Adopt an existing handle.
    Device(Device),
}

impl From<&str> for DeviceSource {
    fn from(port: &str) -> Self {
        Self::Port(port.to_string())
    }
}

impl From<String> for DeviceSource {
    fn from(port: String) -> Self {
        Self::Port(port)
    }
}

impl From<SerialConfig> for DeviceSource {
    fn from(config: SerialConfig) -> Self {
        Self::Config(config)
    }
}

impl From<Device> for DeviceSource {
    fn from(device: Device) -> Self {
        Self::Device(device)
    }
}

/// Ordered registry of named instruments.
///
/// Names are unique; a handle is owned by exactly one registry entry and is
/// closed before de-registration.
#[derive(Default)]
pub struct Daq {
    devices: IndexMap<String, Device>,
}

impl Daq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry, opening or adopting every source.
    ///
    /// The whole operation fails if any open fails; sources opened by this
    /// call are released again on the way out.
    pub async fn init(sources: IndexMap<String, DeviceSource>) -> Result<Self> {
        let mut daq = Self::new();
        daq.add(sources).await?;
        Ok(daq)
    }

    /// Opens or adopts each source and registers it under its name.
    pub async fn add(&mut self, sources: IndexMap<String, DeviceSource>) -> Result<()> {
        let mut opened: Vec<(String, Device)> = Vec::with_capacity(sources.len());
        let mut failure = None;

        for (name, source) in sources {
            if self.devices.contains_key(&name) || opened.iter().any(|(n, _)| n == &name) {
                failure = Some(Error::invalid_argument(format!(
                    "device name already registered: {name}"
                )));
                break;
            }

            match open_source(source).await {
                Ok(device) => opened.push((name, device)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for (name, device) in opened {
                debug!("releasing {name} after failed registry add");
                let _ = device.close().await;
            }

            return Err(err);
        }

        self.devices.extend(opened);
        Ok(())
    }

    /// Closes and de-registers the named devices.
    pub async fn remove(&mut self, names: &[&str]) -> Result<()> {
        for name in names {
            let device = self
                .devices
                .get(*name)
                .ok_or_else(|| Error::invalid_argument(format!("no such device: {name}")))?;

            device.close().await?;
            self.devices.shift_remove(*name);
        }

        Ok(())
    }

    /// Get the current name-to-handle mapping.
    pub fn list(&self) -> &IndexMap<String, Device> {
        &self.devices
    }

    /// Get one registered device by name.
    pub fn device(&self, name: &str) -> Result<&Device> {
        self.devices
            .get(name)
            .ok_or_else(|| Error::invalid_argument(format!("no such device: {name}")))
    }

    fn select<'a>(&'a self, ids: &[&'a str]) -> Result<Vec<(&'a str, &'a Device)>> {
        if ids.is_empty() {
            return Ok(self
                .devices
                .iter()
                .map(|(name, device)| (name.as_str(), device))
                .collect());
        }

        ids.iter()
            .map(|id| self.device(id).map(|device| (*id, device)))
            .collect()
    }

    /// Concurrent aggregate read across the selected devices (all devices
    /// when `ids` is empty).
    ///
    /// Each device's result carries `Request Sent` and `Response Received`
    /// wall-clock annotations. The snapshot is consistent per device but
    /// not globally atomic.
    pub async fn get(&self, stats: &[&str], ids: &[&str]) -> Result<IndexMap<String, DataFrame>> {
        let tasks = self.select(ids)?.into_iter().map(|(name, device)| async move {
            let sent = SystemTime::now();
            let mut frame = device.get(stats).await?;
            let received = SystemTime::now();

            frame.insert(REQUEST_SENT_KEY.to_string(), Value::Timestamp(sent));
            frame.insert(RESPONSE_RECEIVED_KEY.to_string(), Value::Timestamp(received));

            Ok::<_, Error>((name.to_string(), frame))
        });

        Ok(try_join_all(tasks).await?.into_iter().collect())
    }

    /// Concurrent aggregate write across the selected devices (all devices
    /// when `ids` is empty).
    pub async fn set(
        &self,
        commands: &IndexMap<String, Vec<String>>,
        ids: &[&str],
    ) -> Result<IndexMap<String, DataFrame>> {
        let tasks = self.select(ids)?.into_iter().map(|(name, device)| async move {
            let frame = device.set(commands).await?;
            Ok::<_, Error>((name.to_string(), frame))
        });

        Ok(try_join_all(tasks).await?.into_iter().collect())
    }
}

async fn open_source(source: DeviceSource) -> Result<Device> {
    match source {
        DeviceSource::Device(device) => Ok(device),
        DeviceSource::Port(port) => open_config(SerialConfig::new(port)).await,
        DeviceSource::Config(config) => open_config(config).await,
    }
}

async fn open_config(config: SerialConfig) -> Result<Device> {
    let transport = serial::connect(&config)?;
    device::connect(transport, device::DEFAULT_UNIT_ID).await
}
