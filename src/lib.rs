//! # Alicat Serial Driver & Acquisition Layer
//!
//! This crate implements the line-oriented ASCII serial protocol spoken by
//! Alicat mass-flow and pressure instruments, and the host-side acquisition
//! layer built on top of it.
//!
//! Instruments come in two capability tiers: passive meters and active
//! controllers. [device::connect] identifies the instrument on a transport,
//! selects the tier from the model number, and learns the device's
//! self-described data-frame schema, so every subsequent poll parses into a
//! typed record without per-model tables.
//!
//! On top of single-device handles, [daq::Daq] keeps a named registry of
//! instruments and fans reads and writes out to all of them in parallel,
//! and [logger] drives a rate-paced sampling loop that forwards timestamped
//! rows to a pluggable persistence sink.
//!
//! The concrete byte stream is pluggable: anything `AsyncRead + AsyncWrite`
//! works as a [transport::ByteStream], and [serial] adapts a blocking
//! `serialport` stream for the common USB-serial case.

/// Read-only statistic/unit/gas code tables
pub mod codes;
/// Acquisition coordinator: named registry with parallel fan-out
pub mod daq;
/// Typed device handles, discovery, and the command surface
pub mod device;
/// Library error types
pub mod error;
/// Rate-paced logging loop and the persistence sink contract
pub mod logger;
/// Logging convenience helpers
pub mod logging;
/// Data-frame schema discovery and field values
pub mod schema;
/// Blocking serial-port adapter
pub mod serial;
/// Deadline-bounded framing over a raw byte stream
pub mod transport;

pub use codes::{code_for, tables, CodeTables, Table};
pub use daq::{Daq, DeviceSource};
pub use device::{
    connect, Capability, Controller, DevInfo, Device, FirmwareVersion, Meter, TotalizerConfig,
};
pub use error::{Error, ErrorCode, Result};
pub use logger::{LogCommand, LogReply, LoggerConfig, LoggerHandle, Sink, SqlParam};
pub use logging::*;
pub use schema::{DataFrame, DfField, DfSchema, FieldKind, Value};
pub use serial::SerialStream;
pub use transport::{ByteStream, SerialConfig, Transport};

/// End-of-line sentinel for instrument frames
pub const EOL: u8 = 0x0D;
/// Default link speed for factory-configured instruments
pub const DEFAULT_BAUD: u32 = 115_200;
/// Link speeds the instrument family supports
pub const BAUD_RATES: [u32; 7] = [2400, 4800, 9600, 19200, 38400, 57600, 115200];
/// Default per-operation deadline in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 150;
/// An averaged request frame carries at most this many statistic codes
pub const MAX_REQUEST_STATS: usize = 13;
