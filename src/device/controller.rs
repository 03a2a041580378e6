//! Controller command surface.
//!
//! Controllers compose the full [Meter] surface and add the loop-control
//! side: setpoint management, loop variable selection, and valve overrides.

use crate::device::{Meter, SETPOINT_COMMAND_MIN};
use crate::schema::{DataFrame, FieldKind, Value};
use crate::{codes, Error, Result};

/// An active flow or pressure controller.
#[derive(Debug)]
pub struct Controller {
    meter: Meter,
}

impl Controller {
    pub(crate) fn new(meter: Meter) -> Self {
        Self { meter }
    }

    /// Get the composed meter command surface.
    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    /// Sets the loop setpoint, or reads the current one when `value` is
    /// empty. `unit` selects the engineering unit of the written value.
    ///
    /// Firmware 9.00 introduced the `LS` form, which answers with the
    /// current and requested setpoints and their unit; older devices route
    /// transparently to the legacy `S` form, which answers with a standard
    /// data frame.
    pub async fn setpoint(&self, value: Option<f64>, unit: Option<&str>) -> Result<DataFrame> {
        let unit_code = unit
            .map(|name| {
                codes::tables()
                    .unit(name)
                    .ok_or_else(|| Error::unknown_unit(name))
            })
            .transpose()?;

        let handle = &self.meter.handle;

        if !handle.version_at_least(SETPOINT_COMMAND_MIN) {
            let body = match value {
                Some(value) => format!("S {value}"),
                None => "S".to_string(),
            };

            return handle.frame(&body).await;
        }

        let mut body = "LS".to_string();

        if let Some(value) = value {
            body.push_str(&format!(" {value}"));

            if let Some(code) = unit_code {
                body.push_str(&format!(" {code}"));
            }
        }

        let tokens = handle.line(&body).await?;

        if tokens.len() < 4 {
            return Err(Error::decode(format!(
                "expected current/requested setpoint and unit, have: {tokens:?}"
            )));
        }

        let mut frame = DataFrame::with_capacity(4);
        frame.insert(
            "Curr_Setpt".to_string(),
            Value::coerce(&tokens[0], FieldKind::Decimal)?,
        );
        frame.insert(
            "Requested_Setpt".to_string(),
            Value::coerce(&tokens[1], FieldKind::Decimal)?,
        );
        frame.insert("Unit_Code".to_string(), Value::Text(tokens[2].clone()));
        frame.insert("Unit_Label".to_string(), Value::Text(tokens[3..].join(" ")));

        Ok(frame)
    }

    /// Selects the statistic the control loop tracks, or reads the current
    /// selection when `stat` is empty.
    pub async fn loop_control_var(&self, stat: Option<&str>) -> Result<DataFrame> {
        let code = stat
            .map(|name| {
                codes::tables()
                    .statistic(name)
                    .ok_or_else(|| Error::unknown_stat(name))
            })
            .transpose()?;

        let body = match code {
            Some(code) => format!("LV {code}"),
            None => "LV".to_string(),
        };

        let tokens = self.meter.handle.line(&body).await?;
        let echoed = tokens
            .first()
            .ok_or_else(|| Error::decode("expected loop variable code"))?;

        let name = echoed
            .parse::<u16>()
            .ok()
            .and_then(|code| codes::tables().statistic_name(code))
            .unwrap_or(echoed.as_str());

        let mut frame = DataFrame::with_capacity(1);
        frame.insert("Loop_Var".to_string(), Value::Text(name.to_string()));

        Ok(frame)
    }

    /// Reads or sets the setpoint deadband in the loop variable's unit.
    pub async fn setpoint_deadband(&self, value: Option<f64>) -> Result<DataFrame> {
        let body = match value {
            Some(value) => format!("LCDB {value}"),
            None => "LCDB".to_string(),
        };

        let tokens = self.meter.handle.line(&body).await?;
        let deadband = tokens
            .first()
            .ok_or_else(|| Error::decode("expected deadband value"))?;

        let mut frame = DataFrame::with_capacity(1);
        frame.insert(
            "Deadband".to_string(),
            Value::coerce(deadband, FieldKind::Decimal)?,
        );

        Ok(frame)
    }

    /// Drives both valves closed and holds them.
    pub async fn hold_valves_closed(&self) -> Result<DataFrame> {
        self.meter.handle.frame("HC").await
    }

    /// Holds both valves at their current drive.
    pub async fn hold_valves_current(&self) -> Result<DataFrame> {
        self.meter.handle.frame("HP").await
    }

    /// Opens the exhaust valve to vent downstream pressure.
    pub async fn exhaust(&self) -> Result<DataFrame> {
        self.meter.handle.frame("E").await
    }

    /// Releases any active valve hold, returning control to the loop.
    pub async fn cancel_valve_hold(&self) -> Result<DataFrame> {
        self.meter.handle.frame("C").await
    }
}
