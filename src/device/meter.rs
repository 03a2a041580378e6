//! Command surface shared by every instrument tier.
//!
//! Every command serializes its arguments to an ASCII body, sends one frame,
//! and coerces the reply tokens either by the device's data-frame schema or
//! by a per-command label list. Optional arguments left empty are omitted
//! from the body, in which case the device answers with its current value:
//! the same method reads and writes.

use crate::device::{DevInfo, FirmwareVersion, Handle, GAS_COMMAND_MIN, GAS_MIX_MIN};
use crate::schema::{DataFrame, DfSchema, FieldKind, Value};
use crate::{codes, Error, Result, BAUD_RATES, MAX_REQUEST_STATS};

/// Gas-mix slots live above the fixed gas table.
pub const GAS_MIX_SLOTS: std::ops::RangeInclusive<u16> = 236..=255;
/// A custom mix blends at most five constituents.
pub const GAS_MIX_MAX_PARTS: usize = 5;
/// Mix percentages must sum to 100.00 within this tolerance.
pub const GAS_MIX_SUM_TOLERANCE: f64 = 0.01;

/// Totalizer accumulation and limit policy.
///
/// Ranges follow the instrument's configuration frame: `mode` and
/// `limit_mode` in `-1..=3`, `digits` in `7..=10`, `decimals` in `0..=9`.
#[derive(Clone, Debug, PartialEq)]
pub struct TotalizerConfig {
    pub totalizer: u8,
    pub statistic: String,
    pub mode: i8,
    pub limit_mode: i8,
    pub digits: u8,
    pub decimals: u8,
}

impl TotalizerConfig {
    fn validate(&self) -> Result<u16> {
        if !(1..=2).contains(&self.totalizer) {
            return Err(Error::invalid_argument(format!(
                "totalizer must be 1 or 2, have: {}",
                self.totalizer
            )));
        }

        if !(-1..=3).contains(&self.mode) {
            return Err(Error::invalid_argument(format!(
                "totalizer mode must be in -1..=3, have: {}",
                self.mode
            )));
        }

        if !(-1..=3).contains(&self.limit_mode) {
            return Err(Error::invalid_argument(format!(
                "totalizer limit mode must be in -1..=3, have: {}",
                self.limit_mode
            )));
        }

        if !(7..=10).contains(&self.digits) {
            return Err(Error::invalid_argument(format!(
                "totalizer digits must be in 7..=10, have: {}",
                self.digits
            )));
        }

        if self.decimals > 9 {
            return Err(Error::invalid_argument(format!(
                "totalizer decimals must be in 0..=9, have: {}",
                self.decimals
            )));
        }

        codes::tables()
            .statistic(&self.statistic)
            .ok_or_else(|| Error::unknown_stat(&self.statistic))
    }
}

/// A passive flow or pressure meter.
#[derive(Debug)]
pub struct Meter {
    pub(crate) handle: Handle,
}

impl Meter {
    pub(crate) fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn info(&self) -> &DevInfo {
        self.handle.info()
    }

    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.handle.version()
    }

    /// Get the current bus address.
    pub async fn unit_id(&self) -> char {
        self.handle.unit_id().await
    }

    /// Get a copy of the discovered data-frame schema.
    pub async fn schema(&self) -> DfSchema {
        self.handle.schema().await
    }

    /// Releases the transport. The handle is unusable afterwards.
    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }

    /// Reads the standard data frame.
    pub async fn poll(&self) -> Result<DataFrame> {
        self.handle.frame("").await
    }

    /// Ad-hoc averaged readout of up to [MAX_REQUEST_STATS] statistics.
    ///
    /// Fails with `TooManyStats` before any byte is sent when the caller
    /// supplies more names; names are never silently truncated.
    pub async fn request(&self, stats: &[&str], avg_time_ms: u32) -> Result<DataFrame> {
        if stats.len() > MAX_REQUEST_STATS {
            return Err(Error::too_many_stats(stats.len(), MAX_REQUEST_STATS));
        }

        let mut body = format!("DV {avg_time_ms}");

        for name in stats {
            let code = codes::tables()
                .statistic(name)
                .ok_or_else(|| Error::unknown_stat(name))?;
            body.push_str(&format!(" {code}"));
        }

        let tokens = self.handle.line(&body).await?;

        if tokens.len() != stats.len() {
            return Err(Error::decode(format!(
                "expected {} request values, have: {}",
                stats.len(),
                tokens.len()
            )));
        }

        let mut frame = DataFrame::with_capacity(stats.len());

        for (name, token) in stats.iter().zip(&tokens) {
            frame.insert(name.to_string(), Value::coerce(token, FieldKind::Decimal)?);
        }

        Ok(frame)
    }

    /// Switches the device into unsolicited streaming mode.
    ///
    /// The bus address becomes `@`; no request/response command is valid on
    /// this transport until [stop_stream](Self::stop_stream) assigns a new
    /// address.
    pub async fn start_stream(&self) -> Result<()> {
        self.handle.assign_id('@').await
    }

    /// Leaves streaming mode, assigning `new_id` as the bus address.
    pub async fn stop_stream(&self, new_id: char) -> Result<()> {
        validate_unit_id(new_id)?;
        self.handle.assign_id(new_id).await
    }

    /// Reassigns the bus address; subsequent frames use `new_id`.
    pub async fn change_unit_id(&self, new_id: char) -> Result<()> {
        validate_unit_id(new_id)?;
        self.handle.assign_id(new_id).await
    }

    /// Selects the process gas, or reads the current selection when `gas`
    /// is empty. `save` persists the selection across power cycles.
    ///
    /// Firmware 10.05 introduced the `GS` form; older devices route
    /// transparently to the legacy `G` form, which answers with a standard
    /// data frame instead of the gas record.
    pub async fn gas(&self, gas: Option<&str>, save: Option<bool>) -> Result<DataFrame> {
        let code = gas
            .map(|name| {
                codes::tables()
                    .gas(name)
                    .ok_or_else(|| Error::unknown_gas(name))
            })
            .transpose()?;

        if !self.handle.version_at_least(GAS_COMMAND_MIN) {
            let body = match code {
                Some(code) => format!("G {code}"),
                None => "G".to_string(),
            };

            return self.handle.frame(&body).await;
        }

        let mut body = "GS".to_string();

        if let Some(code) = code {
            body.push_str(&format!(" {code}"));

            if let Some(save) = save {
                body.push_str(if save { " 1" } else { " 0" });
            }
        }

        let tokens = self.handle.line(&body).await?;

        if tokens.len() < 2 {
            return Err(Error::decode(format!(
                "expected gas code and name, have: {tokens:?}"
            )));
        }

        Ok(labeled([
            ("Gas_Code", Value::Text(tokens[0].clone())),
            ("Gas", Value::Text(tokens[1].clone())),
            ("Gas_Long", Value::Text(tokens[2..].join(" "))),
        ]))
    }

    /// Programs a custom gas mix into one of the mix slots.
    pub async fn create_gas_mix(
        &self,
        name: &str,
        number: u16,
        composition: &[(&str, f64)],
    ) -> Result<DataFrame> {
        self.handle.require_version(GAS_MIX_MIN, "gas mix")?;

        if !GAS_MIX_SLOTS.contains(&number) {
            return Err(Error::invalid_argument(format!(
                "gas mix slot must be in {GAS_MIX_SLOTS:?}, have: {number}"
            )));
        }

        if composition.is_empty() || composition.len() > GAS_MIX_MAX_PARTS {
            return Err(Error::invalid_argument(format!(
                "gas mix takes 1..={GAS_MIX_MAX_PARTS} constituents, have: {}",
                composition.len()
            )));
        }

        let total: f64 = composition.iter().map(|(_, percent)| percent).sum();

        if (total - 100.0).abs() > GAS_MIX_SUM_TOLERANCE {
            return Err(Error::invalid_argument(format!(
                "gas mix percentages must sum to 100.00, have: {total:.2}"
            )));
        }

        let mut body = format!("GM {name} {number}");

        for (gas, percent) in composition {
            let code = codes::tables()
                .gas(gas)
                .ok_or_else(|| Error::unknown_gas(gas))?;
            body.push_str(&format!(" {percent:.2} {code}"));
        }

        let tokens = self.handle.line(&body).await?;

        if tokens.len() < 2 {
            return Err(Error::decode(format!(
                "expected mix number and name, have: {tokens:?}"
            )));
        }

        Ok(labeled([
            ("Mix_Number", Value::Text(tokens[0].clone())),
            ("Mix_Name", Value::Text(tokens[1..].join(" "))),
        ]))
    }

    /// Deletes a custom gas mix slot.
    pub async fn delete_gas_mix(&self, number: u16) -> Result<DataFrame> {
        self.handle.require_version(GAS_MIX_MIN, "gas mix")?;

        if !GAS_MIX_SLOTS.contains(&number) {
            return Err(Error::invalid_argument(format!(
                "gas mix slot must be in {GAS_MIX_SLOTS:?}, have: {number}"
            )));
        }

        let tokens = self.handle.line(&format!("GD {number}")).await?;

        Ok(labeled([(
            "Mix_Number",
            Value::Text(tokens.first().cloned().unwrap_or_default()),
        )]))
    }

    /// Tares absolute pressure against the internal barometer.
    pub async fn tare_absolute_pressure(&self) -> Result<DataFrame> {
        self.handle.frame("PC").await
    }

    /// Tares flow at a verified zero-flow condition.
    pub async fn tare_flow(&self) -> Result<DataFrame> {
        self.handle.frame("V").await
    }

    /// Tares gauge pressure against ambient.
    pub async fn tare_gauge_pressure(&self) -> Result<DataFrame> {
        self.handle.frame("P").await
    }

    /// Reconfigures a totalizer's accumulation and limit policy.
    pub async fn config_totalizer(&self, config: TotalizerConfig) -> Result<DataFrame> {
        let stat_code = config.validate()?;

        let tokens = self
            .handle
            .line(&format!(
                "TC {} {stat_code} {} {} {} {}",
                config.totalizer, config.mode, config.limit_mode, config.digits, config.decimals
            ))
            .await?;

        if tokens.len() < 6 {
            return Err(Error::decode(format!(
                "expected echoed totalizer config, have: {tokens:?}"
            )));
        }

        Ok(labeled([
            ("Totalizer", Value::Text(tokens[0].clone())),
            ("Stat", Value::Text(tokens[1].clone())),
            ("Mode", Value::Text(tokens[2].clone())),
            ("Limit_Mode", Value::Text(tokens[3].clone())),
            ("Digits", Value::Text(tokens[4].clone())),
            ("Decimals", Value::Text(tokens[5].clone())),
        ]))
    }

    /// Zeroes a totalizer's accumulated count.
    pub async fn reset_totalizer(&self, totalizer: u8) -> Result<DataFrame> {
        if !(1..=2).contains(&totalizer) {
            return Err(Error::invalid_argument(format!(
                "totalizer must be 1 or 2, have: {totalizer}"
            )));
        }

        self.handle.frame(&format!("T {totalizer}")).await
    }

    /// Reads the engineering unit label for a statistic.
    pub async fn engineering_units(&self, stat: &str) -> Result<String> {
        let code = codes::tables()
            .statistic(stat)
            .ok_or_else(|| Error::unknown_stat(stat))?;

        let tokens = self.handle.line(&format!("DCU {code}")).await?;

        if tokens.len() < 2 {
            return Err(Error::decode(format!(
                "expected statistic code and unit label, have: {tokens:?}"
            )));
        }

        Ok(tokens[1..].join(" "))
    }

    /// Switches the data-frame layout, then re-discovers the schema so
    /// subsequent polls parse against the new field list.
    pub async fn configure_data_frame(&self, mode: u8) -> Result<()> {
        self.handle.configure_frame(mode).await
    }

    /// Reads or sets the unsolicited streaming interval in milliseconds.
    pub async fn streaming_rate(&self, ms: Option<u32>) -> Result<DataFrame> {
        let body = match ms {
            Some(ms) => format!("NCR {ms}"),
            None => "NCR".to_string(),
        };

        let tokens = self.handle.line(&body).await?;
        let rate = tokens
            .first()
            .ok_or_else(|| Error::decode("expected streaming interval"))?;

        Ok(labeled([(
            "Stream_Rate",
            Value::coerce(rate, FieldKind::Decimal)?,
        )]))
    }

    /// Switches the link baud rate. Takes effect on the device immediately;
    /// the host transport must be reopened at the new rate.
    pub async fn set_baud(&self, baud: u32) -> Result<u32> {
        if !BAUD_RATES.contains(&baud) {
            return Err(Error::invalid_argument(format!(
                "unsupported baud rate: {baud}, valid: {BAUD_RATES:?}"
            )));
        }

        let tokens = self.handle.line(&format!("NCB {baud}")).await?;

        tokens
            .first()
            .and_then(|token| token.parse::<u32>().ok())
            .ok_or_else(|| Error::decode(format!("expected echoed baud rate, have: {tokens:?}")))
    }

    /// Restores the factory configuration. Returns the acknowledgement line.
    pub async fn factory_restore(&self) -> Result<String> {
        let tokens = self.handle.line("FACTORY RESTORE ALL").await?;
        Ok(tokens.join(" "))
    }
}

fn validate_unit_id(id: char) -> Result<()> {
    if id.is_ascii_uppercase() {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "unit id must be A..Z, have: {id}"
        )))
    }
}

fn labeled<const N: usize>(pairs: [(&str, Value); N]) -> DataFrame {
    pairs
        .into_iter()
        .map(|(label, value)| (label.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{init_logger, mock_device, reply, sent_after_discovery, STANDARD_FRAME};
    use crate::ErrorCode;

    #[tokio::test]
    async fn test_poll_standard_frame() -> Result<()> {
        init_logger();

        let (device, sent) =
            mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![reply(&[STANDARD_FRAME])]).await;

        let frame = device.meter().poll().await?;

        assert_eq!(frame["Abs_Press"], Value::Decimal(14.7));
        assert_eq!(frame["Flow_Temp"], Value::Decimal(25.0));
        assert_eq!(frame["Volu_Flow"], Value::Decimal(0.0));
        assert_eq!(frame["Mass_Flow"], Value::Decimal(0.0));
        assert_eq!(frame["Mass_Flow_Setpt"], Value::Decimal(50.0));
        assert_eq!(frame["Gas"], Value::Text("Air".into()));

        assert_eq!(sent_after_discovery(&sent), ["A".to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn test_request_two_stats() -> Result<()> {
        init_logger();

        let (device, sent) =
            mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![reply(&["A 0.0 14.7"])]).await;

        let frame = device
            .meter()
            .request(&["Mass_Flow", "Abs_Press"], 100)
            .await?;

        assert_eq!(sent_after_discovery(&sent), ["ADV 100 5 2".to_string()]);
        assert_eq!(frame["Mass_Flow"], Value::Decimal(0.0));
        assert_eq!(frame["Abs_Press"], Value::Decimal(14.7));

        Ok(())
    }

    #[tokio::test]
    async fn test_request_too_many_stats_sends_nothing() -> Result<()> {
        init_logger();

        let (device, sent) = mock_device("M-500SCCM-D", "GP05 10v05.0", vec![]).await;

        let names = ["Mass_Flow"; 14];
        let err = device
            .meter()
            .request(&names, 1)
            .await
            .expect_err("fourteen names");

        assert_eq!(err.code(), ErrorCode::TooManyStats);
        assert!(sent_after_discovery(&sent).is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_request_unknown_stat() -> Result<()> {
        init_logger();

        let (device, sent) = mock_device("M-500SCCM-D", "GP05 10v05.0", vec![]).await;

        let err = device
            .meter()
            .request(&["Warp_Factor"], 1)
            .await
            .expect_err("unknown name");

        assert_eq!(err.code(), ErrorCode::UnknownStat);
        assert!(sent_after_discovery(&sent).is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_gas_select_current_firmware() -> Result<()> {
        init_logger();

        let (device, sent) = mock_device(
            "MC-500SCCM-D",
            "GP05 10v05.0",
            vec![reply(&["A 4 CO2 Carbon Dioxide"])],
        )
        .await;

        let frame = device.meter().gas(Some("CO2"), Some(true)).await?;

        assert_eq!(sent_after_discovery(&sent), ["AGS 4 1".to_string()]);
        assert_eq!(frame["Gas_Code"], Value::Text("4".into()));
        assert_eq!(frame["Gas"], Value::Text("CO2".into()));
        assert_eq!(frame["Gas_Long"], Value::Text("Carbon Dioxide".into()));

        Ok(())
    }

    #[tokio::test]
    async fn test_gas_read_form_omits_arguments() -> Result<()> {
        init_logger();

        let (device, sent) =
            mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![reply(&["A 0 Air Clean Dry Air"])])
                .await;

        let frame = device.meter().gas(None, None).await?;

        assert_eq!(sent_after_discovery(&sent), ["AGS".to_string()]);
        assert_eq!(frame["Gas"], Value::Text("Air".into()));

        Ok(())
    }

    #[tokio::test]
    async fn test_gas_routes_to_legacy_form() -> Result<()> {
        init_logger();

        let (device, sent) =
            mock_device("MC-500SCCM-D", "GP05 8v28.0", vec![reply(&[STANDARD_FRAME])]).await;

        let frame = device.meter().gas(Some("Air"), None).await?;

        assert_eq!(sent_after_discovery(&sent), ["AG 0".to_string()]);
        assert_eq!(frame["Gas"], Value::Text("Air".into()));

        Ok(())
    }

    #[tokio::test]
    async fn test_gas_unknown_name() -> Result<()> {
        init_logger();

        let (device, _sent) = mock_device("M-500SCCM-D", "GP05 10v05.0", vec![]).await;
        let err = device
            .meter()
            .gas(Some("Unobtainium"), None)
            .await
            .expect_err("unknown gas");
        assert_eq!(err.code(), ErrorCode::UnknownGas);

        Ok(())
    }

    #[tokio::test]
    async fn test_tare_commands() -> Result<()> {
        init_logger();

        let (device, sent) = mock_device(
            "MC-500SCCM-D",
            "GP05 10v05.0",
            vec![
                reply(&[STANDARD_FRAME]),
                reply(&[STANDARD_FRAME]),
                reply(&[STANDARD_FRAME]),
            ],
        )
        .await;

        device.meter().tare_absolute_pressure().await?;
        device.meter().tare_flow().await?;
        let frame = device.meter().tare_gauge_pressure().await?;

        assert_eq!(
            sent_after_discovery(&sent),
            ["APC".to_string(), "AV".to_string(), "AP".to_string()]
        );
        assert_eq!(frame["Abs_Press"], Value::Decimal(14.7));

        Ok(())
    }

    #[tokio::test]
    async fn test_change_unit_id_rewrites_frames() -> Result<()> {
        init_logger();

        let (device, sent) =
            mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![String::new(), reply(&["B 4 CO2 Carbon Dioxide"])])
                .await;

        device.meter().change_unit_id('B').await?;
        assert_eq!(device.meter().unit_id().await, 'B');

        device.meter().gas(None, None).await?;

        assert_eq!(
            sent_after_discovery(&sent),
            ["A@ B".to_string(), "BGS".to_string()]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_toggle() -> Result<()> {
        init_logger();

        let (device, sent) = mock_device(
            "MC-500SCCM-D",
            "GP05 10v05.0",
            vec![String::new(), String::new()],
        )
        .await;

        device.meter().start_stream().await?;
        assert_eq!(device.meter().unit_id().await, '@');

        device.meter().stop_stream('C').await?;
        assert_eq!(device.meter().unit_id().await, 'C');

        assert_eq!(
            sent_after_discovery(&sent),
            ["A@ @".to_string(), "@@ C".to_string()]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_create_gas_mix_validation() -> Result<()> {
        init_logger();

        let (device, sent) = mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![]).await;
        let meter = device.meter();

        let err = meter
            .create_gas_mix("MyMix", 100, &[("N2", 50.0), ("O2", 50.0)])
            .await
            .expect_err("slot below range");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = meter
            .create_gas_mix("MyMix", 240, &[("N2", 60.0), ("O2", 50.0)])
            .await
            .expect_err("sum != 100");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let parts = [("N2", 20.0); 6];
        let err = meter
            .create_gas_mix("MyMix", 240, &parts)
            .await
            .expect_err("six constituents");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        assert!(sent_after_discovery(&sent).is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_gas_mix_create_and_delete() -> Result<()> {
        init_logger();

        let (device, sent) = mock_device(
            "MC-500SCCM-D",
            "GP05 10v05.0",
            vec![reply(&["A 240 MyMix"]), reply(&["A 240"])],
        )
        .await;

        let frame = device
            .meter()
            .create_gas_mix("MyMix", 240, &[("N2", 79.0), ("O2", 21.0)])
            .await?;

        assert_eq!(frame["Mix_Number"], Value::Text("240".into()));
        assert_eq!(frame["Mix_Name"], Value::Text("MyMix".into()));

        let deleted = device.meter().delete_gas_mix(240).await?;
        assert_eq!(deleted["Mix_Number"], Value::Text("240".into()));

        assert_eq!(
            sent_after_discovery(&sent),
            [
                "AGM MyMix 240 79.00 8 21.00 11".to_string(),
                "AGD 240".to_string()
            ]
        );

        let err = device
            .meter()
            .delete_gas_mix(100)
            .await
            .expect_err("slot below range");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        Ok(())
    }

    #[tokio::test]
    async fn test_gas_mix_requires_firmware() -> Result<()> {
        init_logger();

        let (device, _sent) = mock_device("MC-500SCCM-D", "GP05 4v12.0", vec![]).await;

        let err = device
            .meter()
            .create_gas_mix("MyMix", 240, &[("N2", 100.0)])
            .await
            .expect_err("ancient firmware");
        assert_eq!(err.code(), ErrorCode::Version);

        Ok(())
    }

    #[tokio::test]
    async fn test_config_totalizer_validation() -> Result<()> {
        init_logger();

        let (device, _sent) = mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![]).await;

        let bad_digits = TotalizerConfig {
            totalizer: 1,
            statistic: "Mass_Flow".to_string(),
            mode: 1,
            limit_mode: 0,
            digits: 11,
            decimals: 2,
        };
        let err = device
            .meter()
            .config_totalizer(bad_digits)
            .await
            .expect_err("digits out of range");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let bad_mode = TotalizerConfig {
            totalizer: 1,
            statistic: "Mass_Flow".to_string(),
            mode: 4,
            limit_mode: 0,
            digits: 8,
            decimals: 2,
        };
        let err = device
            .meter()
            .config_totalizer(bad_mode)
            .await
            .expect_err("mode out of range");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        Ok(())
    }

    #[tokio::test]
    async fn test_config_totalizer() -> Result<()> {
        init_logger();

        let (device, sent) = mock_device(
            "MC-500SCCM-D",
            "GP05 10v05.0",
            vec![reply(&["A 1 5 1 0 8 2"])],
        )
        .await;

        let config = TotalizerConfig {
            totalizer: 1,
            statistic: "Mass_Flow".to_string(),
            mode: 1,
            limit_mode: 0,
            digits: 8,
            decimals: 2,
        };
        let frame = device.meter().config_totalizer(config).await?;

        assert_eq!(sent_after_discovery(&sent), ["ATC 1 5 1 0 8 2".to_string()]);
        assert_eq!(frame["Stat"], Value::Text("5".into()));

        Ok(())
    }

    #[tokio::test]
    async fn test_reset_totalizer() -> Result<()> {
        init_logger();

        let (device, sent) =
            mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![reply(&[STANDARD_FRAME])]).await;

        device.meter().reset_totalizer(1).await?;
        assert_eq!(sent_after_discovery(&sent), ["AT 1".to_string()]);

        let err = device
            .meter()
            .reset_totalizer(3)
            .await
            .expect_err("only two totalizers");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        Ok(())
    }

    #[tokio::test]
    async fn test_engineering_units() -> Result<()> {
        init_logger();

        let (device, sent) =
            mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![reply(&["A 5 SCCM"])]).await;

        let label = device.meter().engineering_units("Mass_Flow").await?;

        assert_eq!(sent_after_discovery(&sent), ["ADCU 5".to_string()]);
        assert_eq!(label, "SCCM");

        Ok(())
    }

    #[tokio::test]
    async fn test_configure_data_frame_rediscovers_schema() -> Result<()> {
        init_logger();

        let new_table = reply(&[
            "A INDEX NAME            TYPE",
            "A 1     Mass_Flow       decimal (5,2)",
            "A 2     Gas             string",
        ]);

        let (device, sent) = mock_device(
            "MC-500SCCM-D",
            "GP05 10v05.0",
            vec![String::new(), new_table, reply(&["A +000.00 Air"])],
        )
        .await;

        device.meter().configure_data_frame(2).await?;

        let schema = device.meter().schema().await;
        assert_eq!(schema.standard_len(), 2);

        let frame = device.meter().poll().await?;
        assert_eq!(frame.len(), 2);
        assert_eq!(frame["Mass_Flow"], Value::Decimal(0.0));

        assert_eq!(
            sent_after_discovery(&sent),
            ["AFDF 2".to_string(), "A??D*".to_string(), "A".to_string()]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_streaming_rate_round_trip() -> Result<()> {
        init_logger();

        let (device, sent) = mock_device(
            "MC-500SCCM-D",
            "GP05 10v05.0",
            vec![reply(&["A 50"]), reply(&["A 50"])],
        )
        .await;

        let set = device.meter().streaming_rate(Some(50)).await?;
        let read = device.meter().streaming_rate(None).await?;

        assert_eq!(
            sent_after_discovery(&sent),
            ["ANCR 50".to_string(), "ANCR".to_string()]
        );
        assert_eq!(set["Stream_Rate"], read["Stream_Rate"]);
        assert_eq!(read["Stream_Rate"], Value::Decimal(50.0));

        Ok(())
    }

    #[tokio::test]
    async fn test_set_baud() -> Result<()> {
        init_logger();

        let (device, sent) =
            mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![reply(&["A 19200"])]).await;

        assert_eq!(device.meter().set_baud(19200).await?, 19200);
        assert_eq!(sent_after_discovery(&sent), ["ANCB 19200".to_string()]);

        let err = device
            .meter()
            .set_baud(31337)
            .await
            .expect_err("invalid baud");
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        Ok(())
    }

    #[tokio::test]
    async fn test_factory_restore() -> Result<()> {
        init_logger();

        let (device, sent) =
            mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![reply(&["A FACTORY RESTORE DONE"])])
                .await;

        let ack = device.meter().factory_restore().await?;

        assert_eq!(sent_after_discovery(&sent), ["AFACTORY RESTORE ALL".to_string()]);
        assert_eq!(ack, "FACTORY RESTORE DONE");

        Ok(())
    }

    #[tokio::test]
    async fn test_error_sentinel_is_decode() -> Result<()> {
        init_logger();

        let (device, _sent) =
            mock_device("MC-500SCCM-D", "GP05 10v05.0", vec![reply(&["?"])]).await;

        let err = device.meter().poll().await.expect_err("error sentinel");
        assert_eq!(err.code(), ErrorCode::Decode);

        Ok(())
    }

    #[tokio::test]
    async fn test_usable_after_device_timeout() -> Result<()> {
        init_logger();

        // First poll gets no reply, the handle stays usable for the next.
        let (device, _sent) = mock_device(
            "MC-500SCCM-D",
            "GP05 10v05.0",
            vec![String::new(), reply(&[STANDARD_FRAME])],
        )
        .await;

        let err = device.meter().poll().await.expect_err("silent tick");
        assert!(err.is_timeout());

        let frame = device.meter().poll().await?;
        assert_eq!(frame["Gas"], Value::Text("Air".into()));

        Ok(())
    }
}
