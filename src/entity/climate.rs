//! The unit presented as a single climate device.
//!
//! Home Assistant expects a climate entity to remember a few things the unit does not report
//! directly: the HVAC mode last requested and the last sensible temperature readings. These are
//! kept in [`Climate`] between updates.

use super::{
    Descriptor, Device, Entity, Error, MANUAL_SPEED, Platform, State, Traits, USER_MODE,
    VentilationMode, read_register, read_ventilation_mode, write_register,
};
use crate::connection::RegisterAccess;
use crate::registers::{Register, Scale, round_to};
use futures::future::BoxFuture;
use std::sync::Mutex;
use tracing::debug;

const SUPPLY_TEMPERATURE: Register = Register::input(12102);
const TARGET_TEMPERATURE: Register = Register::holding(2000);
const HEATER_OUTPUT: Register = Register::holding(2148);

const MIN_TEMPERATURE: f64 = 12.0;
const MAX_TEMPERATURE: f64 = 30.0;
const TEMPERATURE_STEP: f64 = 1.0;
/// Heater output is reported in percent of a 1670 W element.
const HEATER_WATTS_PER_PERCENT: f64 = 16.7;

/// Manual airflow levels written when switching the HVAC mode.
const SPEED_OFF: u16 = 1;
const SPEED_NORMAL: u16 = 3;

pub const MODE: &str = "mode";
pub const TEMPERATURE: &str = "temperature";
pub const PRESET_MODE: &str = "preset_mode";
pub const CURRENT_TEMPERATURE: &str = "current_temperature";
pub const ACTION: &str = "action";
pub const ATTRIBUTES: &str = "attributes";

const HVAC_MODES: &[&str] = &["fan_only", "heat", "off"];
const PRESETS: &[&str] = &[
    "Auto",
    "Manual Low",
    "Manual Normal",
    "Manual High",
    "Crowded",
    "Refresh",
    "Fireplace",
    "Away",
    "Holiday",
];

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    #[default]
    FanOnly,
    Heat,
    Off,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HvacAction {
    Heating,
    #[default]
    Idle,
    Off,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct ClimateState {
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub hvac_mode: HvacMode,
    pub hvac_action: HvacAction,
    #[serde(serialize_with = "serialize_preset")]
    pub preset: Option<VentilationMode>,
    pub heater_power_w: Option<f64>,
}

fn serialize_preset<S: serde::Serializer>(
    preset: &Option<VentilationMode>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serde::Serialize::serialize(&preset.map(VentilationMode::preset_label), serializer)
}

fn or_unknown(value: Option<f64>) -> String {
    value.map_or_else(|| super::UNKNOWN.to_string(), |v| v.to_string())
}

impl ClimateState {
    pub fn channels(&self) -> Vec<(&'static str, String)> {
        let attributes = serde_json::json!({ "heater_power_w": self.heater_power_w });
        vec![
            (CURRENT_TEMPERATURE, or_unknown(self.current_temperature)),
            (TEMPERATURE, or_unknown(self.target_temperature)),
            (MODE, self.hvac_mode.to_string()),
            (ACTION, self.hvac_action.to_string()),
            (
                PRESET_MODE,
                self.preset.map_or(super::UNKNOWN, VentilationMode::preset_label).to_string(),
            ),
            (ATTRIBUTES, attributes.to_string()),
        ]
    }

    /// Fold in a fresh set of readings.
    fn observe(&mut self, readings: Readings) {
        let Readings { current, target, mode, heater } = readings;
        // The unit briefly reports zero while its sensors initialise.
        if current != 0.0 {
            self.current_temperature = Some(current);
        }
        if target != 0.0 {
            self.target_temperature = Some(target);
        }
        self.preset = mode;
        self.heater_power_w = Some(round_to(f64::from(heater) * HEATER_WATTS_PER_PERCENT, 1));
        if heater > 0 {
            self.hvac_action = HvacAction::Heating;
            self.hvac_mode = HvacMode::Heat;
        } else {
            self.hvac_action =
                if self.hvac_mode == HvacMode::Off { HvacAction::Off } else { HvacAction::Idle };
            if self.hvac_mode == HvacMode::Heat {
                self.hvac_mode = HvacMode::FanOnly;
            }
        }
    }
}

impl std::fmt::Display for ClimateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} °C, target {} °C, {} ({}), preset {}",
            or_unknown(self.current_temperature),
            or_unknown(self.target_temperature),
            self.hvac_mode,
            self.hvac_action,
            self.preset.map_or("-", VentilationMode::preset_label),
        )
    }
}

struct Readings {
    current: f64,
    target: f64,
    mode: Option<VentilationMode>,
    heater: u16,
}

pub struct Climate {
    state: Mutex<ClimateState>,
}

impl Climate {
    pub fn new() -> Self {
        Climate { state: Mutex::new(ClimateState::default()) }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ClimateState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    async fn read(&self, hub: &dyn RegisterAccess) -> Result<Readings, Error> {
        let current = Scale::TENTHS.decode(read_register(hub, SUPPLY_TEMPERATURE).await?, true);
        let target = Scale::TENTHS.decode(read_register(hub, TARGET_TEMPERATURE).await?, false);
        let mode = read_ventilation_mode(hub).await?;
        let heater = read_register(hub, HEATER_OUTPUT).await?;
        Ok(Readings { current, target, mode, heater })
    }

    pub async fn set_hvac_mode(&self, hub: &dyn RegisterAccess, mode: HvacMode) -> Result<(), Error> {
        let speed = if mode == HvacMode::Off { SPEED_OFF } else { SPEED_NORMAL };
        write_register(hub, MANUAL_SPEED.address, speed).await?;
        self.with_state(|state| state.hvac_mode = mode);
        Ok(())
    }

    pub async fn set_temperature(&self, hub: &dyn RegisterAccess, value: f64) -> Result<(), Error> {
        if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&value) {
            return Err(Error::OutOfRange {
                key: self.key(),
                value,
                min: MIN_TEMPERATURE,
                max: MAX_TEMPERATURE,
            });
        }
        let raw = Scale::TENTHS
            .encode(value)
            .map_err(|source| Error::Encode { key: self.key(), source })?;
        write_register(hub, TARGET_TEMPERATURE.address, raw).await?;
        self.with_state(|state| state.target_temperature = Some(value));
        Ok(())
    }

    pub async fn set_preset(
        &self,
        hub: &dyn RegisterAccess,
        preset: VentilationMode,
    ) -> Result<(), Error> {
        preset.apply(hub).await?;
        self.with_state(|state| state.preset = Some(preset));
        Ok(())
    }

    fn invalid(&self, payload: &str) -> Error {
        Error::InvalidPayload { key: self.key(), payload: payload.to_string() }
    }
}

impl Default for Climate {
    fn default() -> Self {
        Self::new()
    }
}

impl Entity for Climate {
    fn platform(&self) -> Platform {
        Platform::Climate
    }

    fn key(&self) -> &'static str {
        "climate"
    }

    fn name(&self) -> String {
        String::new()
    }

    fn unique_id(&self, device: &Device) -> String {
        device.unique_id(format_args!("climate"))
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            key: self.key(),
            registers: vec![
                SUPPLY_TEMPERATURE,
                TARGET_TEMPERATURE,
                USER_MODE,
                MANUAL_SPEED,
                HEATER_OUTPUT,
            ],
            scale: Some(Scale::TENTHS),
            icon: "mdi:hvac",
            category: None,
            traits: Traits::Climate {
                min: MIN_TEMPERATURE,
                max: MAX_TEMPERATURE,
                step: TEMPERATURE_STEP,
                modes: HVAC_MODES,
                presets: PRESETS,
            },
        }
    }

    fn update<'a>(&'a self, hub: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>> {
        Box::pin(async move {
            let readings = self.read(hub).await?;
            let state = self.with_state(|state| {
                state.observe(readings);
                state.clone()
            });
            debug!(message = "climate updated", ?state);
            Ok(State::Climate(state))
        })
    }

    fn command<'a>(
        &'a self,
        hub: &'a dyn RegisterAccess,
        channel: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let payload = payload.trim();
            match channel {
                MODE => {
                    let mode = payload.parse::<HvacMode>().map_err(|_| self.invalid(payload))?;
                    self.set_hvac_mode(hub, mode).await
                }
                TEMPERATURE => {
                    let value = payload.parse::<f64>().map_err(|_| self.invalid(payload))?;
                    self.set_temperature(hub, value).await
                }
                PRESET_MODE => {
                    let preset = VentilationMode::from_preset_label(payload)
                        .ok_or_else(|| self.invalid(payload))?;
                    self.set_preset(hub, preset).await
                }
                _ => Err(Error::UnknownChannel { key: self.key(), channel: channel.to_string() }),
            }
        })
    }

    fn command_channels(&self) -> &'static [&'static str] {
        &[MODE, TEMPERATURE, PRESET_MODE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterKind;
    use crate::testing::FakeHub;

    fn unit() -> FakeHub {
        FakeHub::default()
            .with_input(12102, 195)
            .with_holding(2000, 210)
            .with_input(1160, 1)
            .with_holding(1130, 2)
            .with_holding(2148, 0)
    }

    async fn update(climate: &Climate, hub: &FakeHub) -> ClimateState {
        match climate.update(hub).await.unwrap() {
            State::Climate(state) => state,
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn reads_temperatures_and_preset() {
        let climate = Climate::new();
        let state = update(&climate, &unit()).await;
        assert_eq!(state.current_temperature, Some(19.5));
        assert_eq!(state.target_temperature, Some(21.0));
        assert_eq!(state.preset, Some(VentilationMode::ManualLow));
        assert_eq!(state.hvac_mode, HvacMode::FanOnly);
        assert_eq!(state.hvac_action, HvacAction::Idle);
    }

    #[tokio::test]
    async fn zero_readings_keep_the_previous_value() {
        let climate = Climate::new();
        let hub = unit();
        update(&climate, &hub).await;
        hub.set(RegisterKind::Input, 12102, 0);
        hub.set(RegisterKind::Holding, 2000, 0);
        let state = update(&climate, &hub).await;
        assert_eq!(state.current_temperature, Some(19.5));
        assert_eq!(state.target_temperature, Some(21.0));
    }

    #[tokio::test]
    async fn heating_follows_the_heater_output() {
        let climate = Climate::new();
        let hub = unit().with_holding(2148, 40);
        let state = update(&climate, &hub).await;
        assert_eq!((state.hvac_mode, state.hvac_action), (HvacMode::Heat, HvacAction::Heating));
        assert_eq!(state.heater_power_w, Some(668.0));
        hub.set(RegisterKind::Holding, 2148, 0);
        let state = update(&climate, &hub).await;
        assert_eq!((state.hvac_mode, state.hvac_action), (HvacMode::FanOnly, HvacAction::Idle));
    }

    #[tokio::test]
    async fn off_is_remembered() {
        let climate = Climate::new();
        let hub = unit();
        climate.command(&hub, MODE, "off").await.unwrap();
        let state = update(&climate, &hub).await;
        assert_eq!((state.hvac_mode, state.hvac_action), (HvacMode::Off, HvacAction::Off));
        climate.command(&hub, MODE, "heat").await.unwrap();
        assert_eq!(hub.writes(), [(1130, 1), (1130, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn temperature_and_preset_commands() {
        let climate = Climate::new();
        let hub = FakeHub::default();
        climate.command(&hub, TEMPERATURE, "22.5").await.unwrap();
        climate.command(&hub, PRESET_MODE, "Manual High").await.unwrap();
        climate.command(&hub, PRESET_MODE, "Away").await.unwrap();
        assert_eq!(hub.writes(), [(2000, 225), (1161, 2), (1130, 4), (1161, 6)]);
        assert!(climate.command(&hub, TEMPERATURE, "35").await.is_err());
        assert!(climate.command(&hub, PRESET_MODE, "Turbo").await.is_err());
        assert!(climate.command(&hub, "fan_mode", "low").await.is_err());
    }

    #[test]
    fn channels() {
        let state = ClimateState {
            current_temperature: Some(19.5),
            target_temperature: None,
            hvac_mode: HvacMode::Heat,
            hvac_action: HvacAction::Heating,
            preset: Some(VentilationMode::ManualNormal),
            heater_power_w: Some(835.0),
        };
        let channels = state.channels();
        assert_eq!(
            channels,
            [
                (CURRENT_TEMPERATURE, "19.5".to_string()),
                (TEMPERATURE, "None".to_string()),
                (MODE, "heat".to_string()),
                (ACTION, "heating".to_string()),
                (PRESET_MODE, "Manual Normal".to_string()),
                (ATTRIBUTES, r#"{"heater_power_w":835.0}"#.to_string()),
            ]
        );
    }

    #[test]
    fn presets_match_modes() {
        use strum::VariantArray as _;
        let labels = VentilationMode::VARIANTS.iter().map(|m| m.preset_label()).collect::<Vec<_>>();
        assert_eq!(labels, PRESETS);
    }
}
