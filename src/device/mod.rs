//! Typed instrument handles.
//!
//! [connect] identifies the instrument on a transport via `??M*`, selects
//! the capability tier from the model number, eagerly discovers the
//! data-frame schema, and returns a [Device]. Passive meters answer the
//! measurement surface; controllers add the setpoint, loop, and valve
//! surface by composing the meter command set.
//!
//! A handle owns exactly one transport. Commands are serialized by the
//! handle's own mutex, so at most one frame is in flight per instrument and
//! callers observe strict FIFO order.

pub mod controller;
pub mod meter;

pub use controller::Controller;
pub use meter::{Meter, TotalizerConfig};

use std::fmt;

use indexmap::IndexMap;
use log::debug;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::schema::{DataFrame, DfSchema};
use crate::transport::Transport;
use crate::{codes, Error, Result, MAX_REQUEST_STATS};

/// Bus address assigned by discovery when none is configured.
pub const DEFAULT_UNIT_ID: char = 'A';

/// Averaging window used for request frames issued on behalf of an
/// aggregate [get](Device::get).
pub const DEFAULT_AVG_TIME_MS: u32 = 1;

/// Minimum firmware for the `GS` gas select form; older devices route to
/// the legacy `G` form.
pub const GAS_COMMAND_MIN: FirmwareVersion = FirmwareVersion::new(10.05);

/// Minimum firmware for the `LS` setpoint form; older devices route to the
/// legacy `S` form.
pub const SETPOINT_COMMAND_MIN: FirmwareVersion = FirmwareVersion::new(9.00);

/// Minimum firmware for gas-mix management. No fallback form exists.
pub const GAS_MIX_MIN: FirmwareVersion = FirmwareVersion::new(5.00);

/// Instrument identity, immutable after discovery.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DevInfo {
    manufacturer: String,
    website: String,
    phone: String,
    model: String,
    serial: String,
    manufactured: String,
    calibrated: String,
    calibrated_by: String,
    software: String,
}

impl DevInfo {
    /// Parses the multi-line `??M*` identify reply.
    ///
    /// Each line carries an `M<dd>` record tag; the text after the tag is
    /// assigned positionally to the identity fields.
    pub fn parse(lines: &[String]) -> Self {
        let values: Vec<String> = lines.iter().map(|line| strip_record(line)).collect();
        let field = |idx: usize| values.get(idx).cloned().unwrap_or_default();

        Self {
            manufacturer: field(0),
            // The identify record carries the website twice, last one wins.
            website: if values.len() > 3 { field(3) } else { field(1) },
            phone: field(2),
            model: field(4),
            serial: field(5),
            manufactured: field(6),
            calibrated: field(7),
            calibrated_by: field(8),
            software: field(9),
        }
    }

    pub fn manufacturer(&self) -> &str {
        self.manufacturer.as_str()
    }

    pub fn website(&self) -> &str {
        self.website.as_str()
    }

    pub fn phone(&self) -> &str {
        self.phone.as_str()
    }

    pub fn model(&self) -> &str {
        self.model.as_str()
    }

    pub fn serial(&self) -> &str {
        self.serial.as_str()
    }

    pub fn manufactured(&self) -> &str {
        self.manufactured.as_str()
    }

    pub fn calibrated(&self) -> &str {
        self.calibrated.as_str()
    }

    pub fn calibrated_by(&self) -> &str {
        self.calibrated_by.as_str()
    }

    pub fn software(&self) -> &str {
        self.software.as_str()
    }
}

/// Drops everything up to and including the `M<dd> ` record tag.
fn strip_record(line: &str) -> String {
    let bytes = line.as_bytes();

    for i in 0..bytes.len() {
        if bytes[i] == b'M'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_digit()
            && bytes[i + 2].is_ascii_digit()
        {
            return line.get(i + 4..).unwrap_or_default().to_string();
        }
    }

    String::new()
}

/// Numeric firmware version derived from the software string.
///
/// The software field embeds a `<major>v<minor>` marker, e.g. `10v05` parses
/// as `10.05`. Commands gate on this value at dispatch time.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct FirmwareVersion(f64);

impl FirmwareVersion {
    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    /// Scans `software` for the first `<digits>v<digits>` marker.
    pub fn parse(software: &str) -> Option<Self> {
        let bytes = software.as_bytes();

        for (i, &b) in bytes.iter().enumerate() {
            if b != b'v' && b != b'V' {
                continue;
            }

            let major_start = bytes[..i]
                .iter()
                .rposition(|c| !c.is_ascii_digit())
                .map(|p| p + 1)
                .unwrap_or(0);
            let minor_end = bytes[i + 1..]
                .iter()
                .position(|c| !c.is_ascii_digit())
                .map(|p| i + 1 + p)
                .unwrap_or(bytes.len());

            if major_start == i || minor_end == i + 1 {
                continue;
            }

            let major = &software[major_start..i];
            let minor = &software[i + 1..minor_end];

            if let Ok(value) = format!("{major}.{minor}").parse::<f64>() {
                return Some(Self(value));
            }
        }

        None
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability tiers of the instrument family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Passive meter: measurement surface only.
    Meter,
    /// Active controller: meter surface plus setpoint, loop, and valves.
    Controller,
}

impl Capability {
    /// Meter model prefixes.
    pub const METER_MODELS: [&'static str; 4] = ["M-", "MS-", "MQ-", "MW-"];
    /// Controller model prefixes; controllers are a superset of meters.
    pub const CONTROLLER_MODELS: [&'static str; 4] = ["MC-", "MCS-", "MCQ-", "MCW-"];

    /// Gets whether `model` belongs to this capability tier.
    pub fn is_model(self, model: &str) -> bool {
        let prefixes = match self {
            Self::Meter => &Self::METER_MODELS,
            Self::Controller => &Self::CONTROLLER_MODELS,
        };

        prefixes.iter().any(|prefix| model.starts_with(prefix))
    }

    /// Selects the most specific capability tier for a model number.
    pub fn of_model(model: &str) -> Option<Self> {
        if Self::Controller.is_model(model) {
            Some(Self::Controller)
        } else if Self::Meter.is_model(model) {
            Some(Self::Meter)
        } else {
            None
        }
    }

    pub fn is_controller(self) -> bool {
        self == Self::Controller
    }
}

impl From<Capability> for &'static str {
    fn from(c: Capability) -> Self {
        match c {
            Capability::Meter => "meter",
            Capability::Controller => "controller",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

#[derive(Debug)]
pub(crate) struct Inner {
    transport: Transport,
    id: char,
    schema: DfSchema,
}

impl Inner {
    async fn command_line(&mut self, body: &str) -> Result<Vec<String>> {
        let command = format!("{}{}", self.id, body);
        let line = self.transport.write_read_line(&command).await?;
        split_reply(self.id, &line)
    }

    async fn command_frame(&mut self, body: &str) -> Result<DataFrame> {
        let tokens = self.command_line(body).await?;
        let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
        self.schema.frame(&refs)
    }

    async fn command_all(&mut self, body: &str) -> Result<Vec<String>> {
        let command = format!("{}{}", self.id, body);
        self.transport.write_read_all(&command).await
    }

    async fn refresh_schema(&mut self) -> Result<()> {
        let lines = self.command_all("??D*").await?;
        self.schema = DfSchema::parse(&lines)?;
        Ok(())
    }
}

/// Splits a reply line into tokens, dropping the echoed unit id.
fn split_reply(id: char, line: &str) -> Result<Vec<String>> {
    let trimmed = line.trim();

    if trimmed == "?" {
        return Err(Error::decode("device answered with the error sentinel"));
    }

    let mut tokens = trimmed.split_whitespace();

    match tokens.next() {
        Some(first) if first.len() == 1 && first.starts_with(id) => {
            Ok(tokens.map(str::to_string).collect())
        }
        Some(first) => Err(Error::decode(format!(
            "expected unit id {id}, have: {first}"
        ))),
        None => Err(Error::decode("empty response line")),
    }
}

/// Shared plumbing under [Meter] and [Controller].
#[derive(Debug)]
pub(crate) struct Handle {
    inner: Mutex<Inner>,
    info: DevInfo,
    version: Option<FirmwareVersion>,
}

impl Handle {
    pub(crate) fn new(transport: Transport, id: char, info: DevInfo) -> Self {
        let version = FirmwareVersion::parse(info.software());

        Self {
            inner: Mutex::new(Inner {
                transport,
                id,
                schema: DfSchema::default(),
            }),
            info,
            version,
        }
    }

    pub(crate) fn info(&self) -> &DevInfo {
        &self.info
    }

    pub(crate) fn version(&self) -> Option<FirmwareVersion> {
        self.version
    }

    pub(crate) fn version_at_least(&self, min: FirmwareVersion) -> bool {
        self.version.map(|v| v >= min).unwrap_or(false)
    }

    pub(crate) fn require_version(&self, min: FirmwareVersion, what: &str) -> Result<()> {
        if self.version_at_least(min) {
            Ok(())
        } else {
            Err(Error::version(format!(
                "{what} requires firmware {min}, have: {}",
                self.version
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )))
        }
    }

    pub(crate) async fn unit_id(&self) -> char {
        self.inner.lock().await.id
    }

    pub(crate) async fn schema(&self) -> DfSchema {
        self.inner.lock().await.schema.clone()
    }

    pub(crate) async fn line(&self, body: &str) -> Result<Vec<String>> {
        self.inner.lock().await.command_line(body).await
    }

    pub(crate) async fn frame(&self, body: &str) -> Result<DataFrame> {
        self.inner.lock().await.command_frame(body).await
    }

    pub(crate) async fn refresh_schema(&self) -> Result<()> {
        self.inner.lock().await.refresh_schema().await
    }

    /// Reconfigures the frame layout, then re-discovers the schema under the
    /// same lock so no poll can race the stale field list.
    pub(crate) async fn configure_frame(&self, mode: u8) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let command = format!("{}FDF {mode}", inner.id);
        inner.transport.write_read_all(&command).await?;
        inner.refresh_schema().await
    }

    /// Reassigns the bus address. Subsequent frames use the new id.
    ///
    /// The wire form doubles as the streaming toggle: assigning `@` starts
    /// unsolicited streaming, assigning a letter while at `@` stops it.
    pub(crate) async fn assign_id(&self, new_id: char) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let command = format!("{}@ {new_id}", inner.id);
        inner.transport.write(command.as_bytes()).await?;
        inner.id = new_id;
        Ok(())
    }

    pub(crate) async fn close(&self) -> Result<()> {
        self.inner.lock().await.transport.close().await
    }
}

/// Identifies the instrument on `transport` and builds a typed handle.
///
/// Issues `??M*`, matches the model number against the capability predicate
/// tables (most specific tier wins), then eagerly populates the data-frame
/// schema. The transport is released again if no instrument answers.
pub async fn connect(mut transport: Transport, id: char) -> Result<Device> {
    if !id.is_ascii_uppercase() {
        return Err(Error::invalid_argument(format!(
            "unit id must be A..Z, have: {id}"
        )));
    }

    let lines = transport.write_read_all(&format!("{id}??M*")).await?;

    if lines.is_empty() {
        let _ = transport.close().await;
        return Err(Error::no_device("identify returned no lines"));
    }

    let info = DevInfo::parse(&lines);

    let Some(capability) = Capability::of_model(info.model()) else {
        let model = info.model().to_string();
        let _ = transport.close().await;
        return Err(Error::no_device(format!("unknown device model: {model}")));
    };

    debug!("identified {} {} on unit id {id}", capability, info.model());

    let handle = Handle::new(transport, id, info);
    handle.refresh_schema().await?;

    let meter = Meter::new(handle);

    Ok(match capability {
        Capability::Meter => Device::Meter(meter),
        Capability::Controller => Device::Controller(Controller::new(meter)),
    })
}

/// A discovered instrument of either capability tier.
#[derive(Debug)]
pub enum Device {
    Meter(Meter),
    Controller(Controller),
}

impl Device {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Meter(_) => Capability::Meter,
            Self::Controller(_) => Capability::Controller,
        }
    }

    /// Get the meter command surface (present on both tiers).
    pub fn meter(&self) -> &Meter {
        match self {
            Self::Meter(meter) => meter,
            Self::Controller(controller) => controller.meter(),
        }
    }

    /// Get the controller surface, if this instrument has one.
    pub fn as_controller(&self) -> Option<&Controller> {
        match self {
            Self::Controller(controller) => Some(controller),
            Self::Meter(_) => None,
        }
    }

    pub fn info(&self) -> &DevInfo {
        self.meter().info()
    }

    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.meter().firmware_version()
    }

    pub async fn unit_id(&self) -> char {
        self.meter().unit_id().await
    }

    pub async fn poll(&self) -> Result<DataFrame> {
        self.meter().poll().await
    }

    pub async fn close(&self) -> Result<()> {
        self.meter().close().await
    }

    /// Aggregate read.
    ///
    /// Names are partitioned into statistic codes (batched into averaged
    /// requests), the synthetic `GAS` and `SETPOINT` fields, and anything
    /// else, which triggers a single poll whose fields merge into the
    /// result. Poll fields land first, then synthetic fields, then request
    /// batches; duplicate keys collapse with the last writer winning.
    pub async fn get(&self, names: &[&str]) -> Result<DataFrame> {
        let mut stats = Vec::new();
        let mut want_gas = false;
        let mut want_setpoint = false;
        let mut want_poll = names.is_empty();

        for name in names {
            if name.eq_ignore_ascii_case("GAS") {
                want_gas = true;
            } else if name.eq_ignore_ascii_case("SETPOINT") {
                want_setpoint = true;
            } else if codes::tables().statistic(name).is_some() {
                stats.push(*name);
            } else {
                want_poll = true;
            }
        }

        let mut result = DataFrame::new();

        if want_poll {
            result.extend(self.meter().poll().await?);
        }

        if want_gas {
            result.extend(self.meter().gas(None, None).await?);
        }

        if want_setpoint {
            match self.as_controller() {
                Some(controller) => result.extend(controller.setpoint(None, None).await?),
                None => debug!("SETPOINT requested from a meter, skipping"),
            }
        }

        for batch in stats.chunks(MAX_REQUEST_STATS) {
            result.extend(self.meter().request(batch, DEFAULT_AVG_TIME_MS).await?);
        }

        Ok(result)
    }

    /// Aggregate write.
    ///
    /// Recognized command names (case-insensitive): `GAS`, `SETPOINT` /
    /// `SETPT`, `LOOP` / `LOOP_CTRL`. Unknown names are skipped silently so
    /// the map may carry values produced by [get](Self::get) round-trips.
    pub async fn set(&self, commands: &IndexMap<String, Vec<String>>) -> Result<DataFrame> {
        let mut result = DataFrame::new();

        for (name, args) in commands {
            match name.to_ascii_uppercase().as_str() {
                "GAS" => {
                    let gas = args.first().map(String::as_str);
                    let save = args.get(1).map(|raw| parse_flag(raw)).transpose()?;
                    result.extend(self.meter().gas(gas, save).await?);
                }
                "SETPOINT" | "SETPT" => {
                    let Some(controller) = self.as_controller() else {
                        debug!("SETPOINT sent to a meter, skipping");
                        continue;
                    };
                    let value = args.first().map(|raw| parse_number(raw)).transpose()?;
                    let unit = args.get(1).map(String::as_str);
                    result.extend(controller.setpoint(value, unit).await?);
                }
                "LOOP" | "LOOP_CTRL" => {
                    let Some(controller) = self.as_controller() else {
                        debug!("LOOP sent to a meter, skipping");
                        continue;
                    };
                    let stat = args.first().map(String::as_str);
                    result.extend(controller.loop_control_var(stat).await?);
                }
                other => debug!("ignoring unrecognized set command: {other}"),
            }
        }

        Ok(result)
    }
}

fn parse_number(raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| Error::invalid_argument(format!("expected a number, have: {raw}")))
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(Error::invalid_argument(format!(
            "expected a boolean flag, have: {other}"
        ))),
    }
}
