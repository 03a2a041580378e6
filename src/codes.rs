//! Read-only code tables mapping statistic, engineering-unit, and gas names
//! to their wire codes.
//!
//! The tables are deserialized once from an embedded JSON asset and shared
//! process-wide. Unit symbols and unit long names deliberately collide:
//! `SCCM` and `Std cm3/min` both resolve to code 12, mirroring the
//! instrument's own code space.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use serde::Deserialize;

/// Embedded code-table asset.
///
/// Top-level keys `statistics`, `units`, `gases`, each a list whose first
/// element is the name-to-code map.
const CODE_TABLE_JSON: &str = include_str!("../assets/codes.json");

static TABLES: OnceLock<CodeTables> = OnceLock::new();

#[derive(Debug, Deserialize)]
struct RawTables {
    statistics: Vec<HashMap<String, u16>>,
    units: Vec<HashMap<String, u8>>,
    gases: Vec<HashMap<String, u16>>,
}

/// The three instrument code spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    Statistics,
    Units,
    Gases,
}

impl From<Table> for &'static str {
    fn from(t: Table) -> Self {
        match t {
            Table::Statistics => "statistics",
            Table::Units => "units",
            Table::Gases => "gases",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Process-wide read-only name-to-code registries.
#[derive(Debug)]
pub struct CodeTables {
    statistics: HashMap<String, u16>,
    units: HashMap<String, u8>,
    gases: HashMap<String, u16>,
}

impl CodeTables {
    fn from_embedded() -> Self {
        let raw: RawTables =
            serde_json::from_str(CODE_TABLE_JSON).expect("embedded code-table asset is valid JSON");

        Self {
            statistics: raw.statistics.into_iter().next().unwrap_or_default(),
            units: raw.units.into_iter().next().unwrap_or_default(),
            gases: raw.gases.into_iter().next().unwrap_or_default(),
        }
    }

    /// Look up a statistic code by name.
    pub fn statistic(&self, name: &str) -> Option<u16> {
        self.statistics.get(name).copied()
    }

    /// Look up an engineering-unit code by symbol or long name.
    pub fn unit(&self, name: &str) -> Option<u8> {
        self.units.get(name).copied()
    }

    /// Look up a gas code by formula or name.
    pub fn gas(&self, name: &str) -> Option<u16> {
        self.gases.get(name).copied()
    }

    /// Reverse lookup of a statistic name by code.
    ///
    /// Prefers the underscore spelling when a code has several names.
    pub fn statistic_name(&self, code: u16) -> Option<&str> {
        self.statistics
            .iter()
            .filter(|(_, &c)| c == code)
            .map(|(name, _)| name.as_str())
            .max_by_key(|name| name.contains('_'))
    }
}

/// Get the process-wide code tables, loading the embedded asset on first use.
pub fn tables() -> &'static CodeTables {
    TABLES.get_or_init(CodeTables::from_embedded)
}

/// Look up a wire code in one of the three tables.
///
/// Unit codes occupy a u8 code space but are widened here so the three
/// tables share one signature.
pub fn code_for(table: Table, name: &str) -> Option<u16> {
    let tables = tables();

    match table {
        Table::Statistics => tables.statistic(name),
        Table::Units => tables.unit(name).map(u16::from),
        Table::Gases => tables.gas(name),
    }
}
