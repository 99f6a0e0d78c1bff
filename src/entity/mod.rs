//! Home Assistant entities backed by the unit's Modbus registers.
//!
//! Each platform is a static table. Every row turns into one [`Entity`] that knows how to read
//! its current [`State`] through a [`RegisterAccess`] hub and, if writable, how to apply a command
//! received for one of its channels.

pub mod binary_sensor;
pub mod button;
pub mod climate;
pub mod number;
pub mod select;
pub mod sensor;
pub mod switch;
pub mod time;

use crate::connection::{self, RegisterAccess};
use crate::registers::{EncodeError, Register, Scale};
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::debug;

/// Name of the channel carrying the value of single-valued entities.
pub const STATE: &str = "state";

/// `USERMODE_MODE`, the currently active user mode (0 = auto, 1 = manual, 2 = crowded, ...).
pub const USER_MODE: Register = Register::input(1160);
/// `USERMODE_HMI_CHANGE_REQUEST`, written with the user mode plus one.
pub const USER_MODE_REQUEST: u16 = 1161;
/// `USERMODE_MANUAL_AIRFLOW_LEVEL_SAF`, the airflow level used while in the manual mode.
pub const MANUAL_SPEED: Register = Register::holding(1130);
/// The unit needs some time to switch modes before the manual airflow level is accepted.
pub const MODE_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display, serde::Serialize,
)]
pub enum Model {
    #[default]
    #[strum(serialize = "VSR 300")]
    Vsr300,
    #[strum(serialize = "VSR 400")]
    Vsr400,
    #[strum(serialize = "VSR 500")]
    Vsr500,
    #[strum(serialize = "VTR 300")]
    Vtr300,
    #[strum(serialize = "VTR 400")]
    Vtr400,
    #[strum(serialize = "VTR 500")]
    Vtr500,
    #[strum(serialize = "VTC 300")]
    Vtc300,
    #[strum(serialize = "VTC 500")]
    Vtc500,
    #[strum(serialize = "VTC 700")]
    Vtc700,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "entity::DeviceArgs")]
pub struct DeviceArgs {
    /// The model of the unit. Only affects how the device is named.
    #[arg(long, value_enum, default_value_t = Model::Vsr300)]
    model: Model,
}

impl DeviceArgs {
    pub fn device(&self, slave: u8) -> Device {
        Device { model: self.model, slave }
    }
}

/// Identity of a physical unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub model: Model,
    pub slave: u8,
}

impl Device {
    pub fn identifier(&self) -> String {
        format!("{}_{}", self.model, self.slave)
    }

    /// [`Self::identifier`] reduced to characters that are safe to use in MQTT topics.
    pub fn node_id(&self) -> String {
        self.identifier()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect()
    }

    pub fn name(&self) -> String {
        format!("Systemair {}", self.model)
    }

    pub fn manufacturer(&self) -> &'static str {
        "Systemair"
    }

    pub fn model_name(&self) -> String {
        format!("SAVE {}", self.model)
    }

    /// Prefix shared by all unique ids of this device's entities.
    pub fn unique_id(&self, suffix: std::fmt::Arguments) -> String {
        format!("systemair_{}_{}", self.slave, suffix)
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Sensor,
    BinarySensor,
    Number,
    Select,
    Button,
    Switch,
    Time,
    Climate,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

/// Platform specific presentation metadata.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum Traits {
    Sensor {
        device_class: Option<&'static str>,
        state_class: Option<&'static str>,
        unit: Option<&'static str>,
    },
    BinarySensor {
        device_class: Option<&'static str>,
    },
    Number {
        min: f64,
        max: f64,
        step: f64,
        unit: &'static str,
    },
    Select {
        options: &'static [&'static str],
    },
    Button,
    Switch,
    Time,
    Climate {
        min: f64,
        max: f64,
        step: f64,
        modes: &'static [&'static str],
        presets: &'static [&'static str],
    },
}

impl Traits {
    pub fn unit(&self) -> Option<&'static str> {
        match self {
            Traits::Sensor { unit, .. } => *unit,
            Traits::Number { unit, .. } => Some(*unit).filter(|u| !u.is_empty()),
            Traits::Climate { .. } => Some("°C"),
            _ => None,
        }
    }
}

/// Static description of an entity, for listing and for discovery documents.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Descriptor {
    pub key: &'static str,
    pub registers: Vec<Register>,
    pub scale: Option<Scale>,
    pub icon: &'static str,
    pub category: Option<EntityCategory>,
    #[serde(flatten)]
    pub traits: Traits,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read register {0}")]
    Read(Register, #[source] connection::Error),
    #[error("reading register {register} produced {got} values")]
    ShortRead { register: Register, got: usize },
    #[error("could not write {value} to holding register {address}")]
    Write {
        address: u16,
        value: u16,
        #[source]
        source: connection::Error,
    },
    #[error("{payload:?} is not a valid value for {key}")]
    InvalidPayload { key: &'static str, payload: String },
    #[error("{value} is outside of the {min}..={max} range accepted by {key}")]
    OutOfRange { key: &'static str, value: f64, min: f64, max: f64 },
    #[error("could not encode the value for {key}")]
    Encode {
        key: &'static str,
        #[source]
        source: EncodeError,
    },
    #[error("{key} does not accept commands on the `{channel}` channel")]
    UnknownChannel { key: &'static str, channel: String },
}

pub trait Entity: Send + Sync {
    fn platform(&self) -> Platform;
    fn key(&self) -> &'static str;
    fn unique_id(&self, device: &Device) -> String;
    fn descriptor(&self) -> Descriptor;

    /// Display name, derived from the key unless the table names the entity explicitly.
    fn name(&self) -> String {
        let mut name = self.key().replace('_', " ");
        if let Some(first) = name.get_mut(..1) {
            first.make_ascii_uppercase();
        }
        name
    }

    fn icon(&self) -> &'static str {
        self.descriptor().icon
    }

    fn category(&self) -> Option<EntityCategory> {
        self.descriptor().category
    }

    /// Read the current state from the unit.
    fn update<'a>(&'a self, hub: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>>;

    /// Apply a command received on `channel`. The new state is observed by a subsequent
    /// [`Self::update`].
    fn command<'a>(
        &'a self,
        hub: &'a dyn RegisterAccess,
        channel: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Channels that accept commands.
    fn command_channels(&self) -> &'static [&'static str] {
        &[]
    }
}

/// A sensor reading, either numeric or one of a fixed set of labels.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Reading {
    Number(f64),
    Label(&'static str),
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reading::Number(n) => write!(f, "{n}"),
            Reading::Label(l) => f.write_str(l),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum State {
    Sensor(Option<Reading>),
    Binary(bool),
    Number(f64),
    Select(Option<&'static str>),
    #[serde(serialize_with = "serialize_time")]
    Time(Option<jiff::civil::Time>),
    Climate(climate::ClimateState),
    /// Buttons have nothing to report.
    Stateless,
}

/// Payload Home Assistant interprets as "unknown" for sensors, selects and texts.
const UNKNOWN: &str = "None";

fn on_off(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

pub fn format_time(time: jiff::civil::Time) -> String {
    format!("{:02}:{:02}", time.hour(), time.minute())
}

fn serialize_time<S: serde::Serializer>(
    time: &Option<jiff::civil::Time>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serde::Serialize::serialize(&time.map(format_time), serializer)
}

impl State {
    /// MQTT payloads for each state channel.
    pub fn channels(&self) -> Vec<(&'static str, String)> {
        match self {
            State::Sensor(reading) => {
                vec![(STATE, reading.map_or_else(|| UNKNOWN.to_string(), |r| r.to_string()))]
            }
            State::Binary(on) => vec![(STATE, on_off(*on).to_string())],
            State::Number(value) => vec![(STATE, value.to_string())],
            State::Select(option) => vec![(STATE, option.unwrap_or(UNKNOWN).to_string())],
            State::Time(time) => {
                vec![(STATE, time.map_or_else(|| UNKNOWN.to_string(), format_time))]
            }
            State::Climate(climate) => climate.channels(),
            State::Stateless => Vec::new(),
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Sensor(Some(reading)) => write!(f, "{reading}"),
            State::Binary(on) => f.write_str(if *on { "on" } else { "off" }),
            State::Number(value) => write!(f, "{value}"),
            State::Select(Some(option)) => f.write_str(option),
            State::Time(Some(time)) => f.write_str(&format_time(*time)),
            State::Climate(climate) => write!(f, "{climate}"),
            State::Sensor(None) | State::Select(None) | State::Time(None) => f.write_str("-"),
            State::Stateless => Ok(()),
        }
    }
}

/// Every entity the unit exposes, in a stable order.
pub fn all_entities() -> Vec<Box<dyn Entity>> {
    let mut entities: Vec<Box<dyn Entity>> = vec![Box::new(climate::Climate::new())];
    entities.extend(sensor::SENSORS.iter().map(|e| Box::new(*e) as Box<dyn Entity>));
    entities.extend(binary_sensor::BINARY_SENSORS.iter().map(|e| Box::new(*e) as Box<dyn Entity>));
    entities.extend(number::NUMBERS.iter().map(|e| Box::new(*e) as Box<dyn Entity>));
    entities.push(Box::new(select::VentilationModeSelect));
    entities.extend(select::SELECTS.iter().map(|e| Box::new(*e) as Box<dyn Entity>));
    entities.extend(button::BUTTONS.iter().map(|e| Box::new(*e) as Box<dyn Entity>));
    entities.extend(switch::SWITCHES.iter().map(|e| Box::new(*e) as Box<dyn Entity>));
    entities.extend(time::TIMES.iter().map(|e| Box::new(*e) as Box<dyn Entity>));
    entities
}

pub(crate) async fn read_registers(
    hub: &dyn RegisterAccess,
    register: Register,
    count: u16,
) -> Result<Vec<u16>, Error> {
    let values = hub
        .read(register.kind, register.address, count)
        .await
        .map_err(|e| Error::Read(register, e))?;
    if values.len() < usize::from(count) {
        return Err(Error::ShortRead { register, got: values.len() });
    }
    Ok(values)
}

pub(crate) async fn read_register(hub: &dyn RegisterAccess, register: Register) -> Result<u16, Error> {
    let values = read_registers(hub, register, 1).await?;
    match values.first() {
        Some(value) => Ok(*value),
        None => Err(Error::ShortRead { register, got: 0 }),
    }
}

pub(crate) async fn write_register(
    hub: &dyn RegisterAccess,
    address: u16,
    value: u16,
) -> Result<(), Error> {
    debug!(message = "writing", address, value);
    hub.write(address, value).await.map_err(|source| Error::Write { address, value, source })
}

/// The ventilation modes a user can request, shared by the mode select, the buttons and the
/// climate presets.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::VariantArray,
)]
#[strum(serialize_all = "snake_case")]
pub enum VentilationMode {
    Auto,
    ManualLow,
    ManualNormal,
    ManualHigh,
    Crowded,
    Refresh,
    Fireplace,
    Away,
    Holiday,
}

impl VentilationMode {
    /// Derive the mode from `USERMODE_MODE` and the manual airflow level.
    pub fn from_registers(user_mode: u16, manual_speed: u16) -> Option<Self> {
        Some(match user_mode {
            0 => Self::Auto,
            1 => match manual_speed {
                2 => Self::ManualLow,
                4 => Self::ManualHigh,
                _ => Self::ManualNormal,
            },
            2 => Self::Crowded,
            3 => Self::Refresh,
            4 => Self::Fireplace,
            5 => Self::Away,
            6 => Self::Holiday,
            _ => return None,
        })
    }

    /// The value for the mode change request register and the manual airflow level, if any.
    pub fn request(self) -> (u16, Option<u16>) {
        match self {
            Self::Auto => (1, None),
            Self::ManualLow => (2, Some(2)),
            Self::ManualNormal => (2, Some(3)),
            Self::ManualHigh => (2, Some(4)),
            Self::Crowded => (3, None),
            Self::Refresh => (4, None),
            Self::Fireplace => (5, None),
            Self::Away => (6, None),
            Self::Holiday => (7, None),
        }
    }

    pub fn preset_label(self) -> &'static str {
        match self {
            Self::Auto => "Auto",
            Self::ManualLow => "Manual Low",
            Self::ManualNormal => "Manual Normal",
            Self::ManualHigh => "Manual High",
            Self::Crowded => "Crowded",
            Self::Refresh => "Refresh",
            Self::Fireplace => "Fireplace",
            Self::Away => "Away",
            Self::Holiday => "Holiday",
        }
    }

    pub fn from_preset_label(label: &str) -> Option<Self> {
        <Self as strum::VariantArray>::VARIANTS.iter().copied().find(|m| m.preset_label() == label)
    }

    /// Write the mode change request and, for the manual modes, the airflow level once the unit
    /// has settled into the new mode.
    pub async fn apply(self, hub: &dyn RegisterAccess) -> Result<(), Error> {
        let (mode, speed) = self.request();
        write_register(hub, USER_MODE_REQUEST, mode).await?;
        if let Some(speed) = speed {
            tokio::time::sleep(MODE_SETTLE_DELAY).await;
            write_register(hub, MANUAL_SPEED.address, speed).await?;
        }
        Ok(())
    }
}

pub(crate) async fn read_ventilation_mode(
    hub: &dyn RegisterAccess,
) -> Result<Option<VentilationMode>, Error> {
    let user_mode = read_register(hub, USER_MODE).await?;
    let speed = match read_register(hub, MANUAL_SPEED).await {
        Ok(speed) => speed,
        Err(e) => {
            debug!(
                message = "manual airflow level unavailable, assuming normal",
                error = (&e as &dyn std::error::Error)
            );
            3
        }
    };
    Ok(VentilationMode::from_registers(user_mode, speed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHub;
    use std::collections::HashSet;

    #[test]
    fn device_identity() {
        let device = Device { model: Model::Vtr500, slave: 3 };
        assert_eq!(device.identifier(), "VTR 500_3");
        assert_eq!(device.node_id(), "vtr_500_3");
        assert_eq!(device.name(), "Systemair VTR 500");
        assert_eq!(device.model_name(), "SAVE VTR 500");
        assert_eq!(device.unique_id(format_args!("climate")), "systemair_3_climate");
    }

    #[test]
    fn unique_ids_do_not_collide() {
        let device = Device { model: Model::default(), slave: 1 };
        let entities = all_entities();
        let ids = entities.iter().map(|e| e.unique_id(&device)).collect::<HashSet<_>>();
        assert_eq!(ids.len(), entities.len());
        assert_eq!(entities.len(), 1 + 24 + 9 + 42 + 1 + 15 + 9 + 17 + 30);
    }

    #[test]
    fn ventilation_mode_mapping() {
        assert_eq!(VentilationMode::from_registers(0, 4), Some(VentilationMode::Auto));
        assert_eq!(VentilationMode::from_registers(1, 2), Some(VentilationMode::ManualLow));
        assert_eq!(VentilationMode::from_registers(1, 0), Some(VentilationMode::ManualNormal));
        assert_eq!(VentilationMode::from_registers(6, 3), Some(VentilationMode::Holiday));
        assert_eq!(VentilationMode::from_registers(7, 3), None);
        assert_eq!(VentilationMode::ManualHigh.request(), (2, Some(4)));
        assert_eq!(VentilationMode::Holiday.request(), (7, None));
        assert_eq!(
            VentilationMode::from_preset_label("Manual Low"),
            Some(VentilationMode::ManualLow)
        );
        assert_eq!("manual_high".parse::<VentilationMode>().ok(), Some(VentilationMode::ManualHigh));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_mode_waits_before_setting_the_speed() {
        let hub = FakeHub::default();
        let started = tokio::time::Instant::now();
        VentilationMode::ManualLow.apply(&hub).await.unwrap();
        assert_eq!(hub.writes(), [(1161, 2), (1130, 2)]);
        assert!(started.elapsed() >= MODE_SETTLE_DELAY);
    }

    #[tokio::test]
    async fn speed_defaults_to_normal() {
        let hub = FakeHub::default().with_input(1160, 1);
        assert_eq!(read_ventilation_mode(&hub).await.unwrap(), Some(VentilationMode::ManualNormal));
    }

    #[test]
    fn state_channels() {
        assert_eq!(State::Binary(true).channels(), [(STATE, "ON".to_string())]);
        assert_eq!(State::Sensor(None).channels(), [(STATE, "None".to_string())]);
        assert_eq!(
            State::Sensor(Some(Reading::Number(21.5))).channels(),
            [(STATE, "21.5".to_string())]
        );
        let time = jiff::civil::Time::new(7, 5, 0, 0).unwrap();
        assert_eq!(State::Time(Some(time)).channels(), [(STATE, "07:05".to_string())]);
        assert!(State::Stateless.channels().is_empty());
    }

    #[test]
    fn states_serialize_like_their_channels() {
        let time = jiff::civil::Time::new(7, 5, 0, 0).unwrap();
        assert_eq!(serde_json::to_string(&State::Time(Some(time))).unwrap(), r#""07:05""#);
        assert_eq!(serde_json::to_string(&State::Time(None)).unwrap(), "null");
        assert_eq!(serde_json::to_string(&State::Binary(true)).unwrap(), "true");
    }
}
