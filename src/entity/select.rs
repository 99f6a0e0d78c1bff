use super::{
    Descriptor, Device, Entity, EntityCategory, Error, MANUAL_SPEED, Platform, STATE, State,
    Traits, USER_MODE, VentilationMode, read_register, read_ventilation_mode, write_register,
};
use crate::connection::RegisterAccess;
use crate::registers::Register;
use futures::future::BoxFuture;

/// A label set mapping option names onto register values.
pub type Labels = &'static [(&'static str, u16)];

pub const AIRFLOW_LEVELS: Labels = &[("normal", 3), ("high", 4), ("maximum", 5)];
pub const AWAY_LEVELS: Labels = &[("off", 0), ("minimum", 1), ("low", 2), ("normal", 3)];
pub const SCHEDULE_LEVELS: Labels =
    &[("off", 1), ("low", 2), ("normal", 3), ("high", 4), ("demand", 5)];
pub const TEMP_CONTROL_MODES: Labels = &[("supply", 0), ("room", 1), ("extract", 2)];

const AIRFLOW_OPTIONS: &[&str] = &["normal", "high", "maximum"];
const AWAY_OPTIONS: &[&str] = &["off", "minimum", "low", "normal"];
const SCHEDULE_OPTIONS: &[&str] = &["off", "low", "normal", "high", "demand"];
const TEMP_CONTROL_OPTIONS: &[&str] = &["supply", "room", "extract"];

const VENTILATION_MODE_OPTIONS: &[&str] = &[
    "auto",
    "manual_low",
    "manual_normal",
    "manual_high",
    "crowded",
    "refresh",
    "fireplace",
    "away",
    "holiday",
];

/// A holding register restricted to one of a few labelled values.
#[derive(Clone, Copy, Debug)]
pub struct Select {
    key: &'static str,
    register: Register,
    labels: Labels,
    options: &'static [&'static str],
    icon: &'static str,
}

impl Select {
    const fn new(
        key: &'static str,
        address: u16,
        (labels, options): (Labels, &'static [&'static str]),
        icon: &'static str,
    ) -> Self {
        Select { key, register: Register::holding(address), labels, options, icon }
    }

    fn label(&self, raw: u16) -> Option<&'static str> {
        self.labels.iter().find(|(_, v)| *v == raw).map(|(l, _)| *l)
    }

    fn value(&self, label: &str) -> Option<u16> {
        self.labels.iter().find(|(l, _)| *l == label).map(|(_, v)| *v)
    }
}

const AIRFLOW: (Labels, &[&str]) = (AIRFLOW_LEVELS, AIRFLOW_OPTIONS);
const AWAY: (Labels, &[&str]) = (AWAY_LEVELS, AWAY_OPTIONS);
const SCHEDULE: (Labels, &[&str]) = (SCHEDULE_LEVELS, SCHEDULE_OPTIONS);
const TEMP_CONTROL: (Labels, &[&str]) = (TEMP_CONTROL_MODES, TEMP_CONTROL_OPTIONS);

#[rustfmt::skip]
pub static SELECTS: [Select; 15] = [
    Select::new("crowded_supply_level", 1134, AIRFLOW, "mdi:gauge-full"),
    Select::new("crowded_extract_level", 1135, AIRFLOW, "mdi:gauge-full"),
    Select::new("refresh_supply_level", 1136, AIRFLOW, "mdi:gauge-full"),
    Select::new("refresh_extract_level", 1137, AIRFLOW, "mdi:gauge-full"),
    Select::new("fireplace_supply_level", 1138, AIRFLOW, "mdi:gauge-full"),
    Select::new("fireplace_extract_level", 1139, AIRFLOW, "mdi:gauge-full"),
    Select::new("free_cooling_supply", 4111, AIRFLOW, "mdi:gauge-full"),
    Select::new("free_cooling_extract", 4112, AIRFLOW, "mdi:gauge-full"),
    Select::new("away_supply_level", 1140, AWAY, "mdi:fan-minus"),
    Select::new("away_extract_level", 1141, AWAY, "mdi:fan-minus"),
    Select::new("holiday_supply_level", 1142, AWAY, "mdi:fan-off"),
    Select::new("holiday_extract_level", 1143, AWAY, "mdi:fan-off"),
    Select::new("temp_control_mode", 2030, TEMP_CONTROL, "mdi:tune-vertical"),
    Select::new("sched_airflow_level", 5059, SCHEDULE, "mdi:gauge-full"),
    Select::new("unsched_airflow_level", 5060, SCHEDULE, "mdi:gauge-full"),
];

impl Entity for Select {
    fn platform(&self) -> Platform {
        Platform::Select
    }

    fn key(&self) -> &'static str {
        self.key
    }

    fn unique_id(&self, device: &Device) -> String {
        device.unique_id(format_args!("select_{}", self.register.address))
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            key: self.key,
            registers: vec![self.register],
            scale: None,
            icon: self.icon,
            category: Some(EntityCategory::Config),
            traits: Traits::Select { options: self.options },
        }
    }

    fn update<'a>(&'a self, hub: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>> {
        Box::pin(async move {
            let raw = read_register(hub, self.register).await?;
            Ok(State::Select(self.label(raw)))
        })
    }

    fn command<'a>(
        &'a self,
        hub: &'a dyn RegisterAccess,
        channel: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if channel != STATE {
                return Err(Error::UnknownChannel { key: self.key, channel: channel.to_string() });
            }
            let Some(value) = self.value(payload.trim()) else {
                return Err(Error::InvalidPayload { key: self.key, payload: payload.to_string() });
            };
            write_register(hub, self.register.address, value).await
        })
    }

    fn command_channels(&self) -> &'static [&'static str] {
        &[STATE]
    }
}

/// The combined user mode and manual airflow level.
#[derive(Clone, Copy, Debug)]
pub struct VentilationModeSelect;

impl Entity for VentilationModeSelect {
    fn platform(&self) -> Platform {
        Platform::Select
    }

    fn key(&self) -> &'static str {
        "ventilation_mode"
    }

    fn unique_id(&self, device: &Device) -> String {
        device.unique_id(format_args!("vent_mode"))
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            key: self.key(),
            registers: vec![USER_MODE, MANUAL_SPEED],
            scale: None,
            icon: "mdi:fan",
            category: None,
            traits: Traits::Select { options: VENTILATION_MODE_OPTIONS },
        }
    }

    fn update<'a>(&'a self, hub: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>> {
        Box::pin(async move {
            let mode = read_ventilation_mode(hub).await?;
            Ok(State::Select(mode.map(<&'static str>::from)))
        })
    }

    fn command<'a>(
        &'a self,
        hub: &'a dyn RegisterAccess,
        channel: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if channel != STATE {
                return Err(Error::UnknownChannel { key: self.key(), channel: channel.to_string() });
            }
            let mode = payload.trim().parse::<VentilationMode>().map_err(|_| {
                Error::InvalidPayload { key: self.key(), payload: payload.to_string() }
            })?;
            mode.apply(hub).await
        })
    }

    fn command_channels(&self) -> &'static [&'static str] {
        &[STATE]
    }
}
