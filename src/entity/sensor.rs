use super::{
    Descriptor, Device, Entity, Error, MANUAL_SPEED, Platform, Reading, State, Traits, USER_MODE,
    read_register, read_registers,
};
use crate::connection::RegisterAccess;
use crate::registers::{Register, RegisterKind, Scale, combine_u32, round_to};
use futures::future::BoxFuture;

const MEASUREMENT: Option<&str> = Some("measurement");

/// `FILTER_REMAINING_TIME_L` and `_H`, seconds until the filter is due.
const FILTER_TIME_REMAINING: Register = Register::holding(7004);
/// `USERMODE_REMAINING_TIME_L` and `_H`, seconds left in a timed user mode.
const MODE_TIME_REMAINING: Register = Register::input(1110);

const SECONDS_PER_DAY: f64 = 86400.0;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Decode {
    /// A single register, scaled and rounded to one decimal.
    Scaled { signed: bool },
    /// The active user mode combined with the manual airflow level.
    FanMode,
    SummerWinter,
    FilterTime,
    ModeTime,
}

#[derive(Clone, Copy, Debug)]
pub struct Sensor {
    key: &'static str,
    register: Register,
    device_class: Option<&'static str>,
    unit: Option<&'static str>,
    scale: Scale,
    icon: &'static str,
    state_class: Option<&'static str>,
    decode: Decode,
}

impl Sensor {
    const fn new(
        key: &'static str,
        address: u16,
        device_class: Option<&'static str>,
        unit: Option<&'static str>,
        scale: Scale,
        icon: &'static str,
        state_class: Option<&'static str>,
    ) -> Self {
        let register = Register::inferred(address);
        Sensor {
            key,
            register,
            device_class,
            unit,
            scale,
            icon,
            state_class,
            // Only the input block carries two's-complement values.
            decode: Decode::Scaled { signed: matches!(register.kind, RegisterKind::Input) },
        }
    }

    const fn temperature(key: &'static str, address: u16) -> Self {
        Self::new(
            key,
            address,
            Some("temperature"),
            Some("°C"),
            Scale::TENTHS,
            "mdi:home-thermometer",
            MEASUREMENT,
        )
    }

    const fn unsigned(mut self) -> Self {
        self.decode = Decode::Scaled { signed: false };
        self
    }

    const fn decoded(mut self, decode: Decode) -> Self {
        self.decode = decode;
        self
    }

    fn registers(&self) -> Vec<Register> {
        match self.decode {
            Decode::Scaled { .. } | Decode::SummerWinter => vec![self.register],
            Decode::FanMode => vec![USER_MODE, MANUAL_SPEED],
            Decode::FilterTime => {
                vec![FILTER_TIME_REMAINING, Register::holding(FILTER_TIME_REMAINING.address + 1)]
            }
            Decode::ModeTime => {
                vec![MODE_TIME_REMAINING, Register::input(MODE_TIME_REMAINING.address + 1)]
            }
        }
    }

    /// `None` when the registers hold a value with no known meaning.
    async fn read(&self, hub: &dyn RegisterAccess) -> Result<Option<Reading>, Error> {
        Ok(match self.decode {
            Decode::Scaled { signed } => {
                let raw = read_register(hub, self.register).await?;
                Some(Reading::Number(round_to(self.scale.decode(raw, signed), 1)))
            }
            Decode::FanMode => {
                let user_mode = read_register(hub, USER_MODE).await?;
                let speed = read_register(hub, MANUAL_SPEED).await.ok();
                fan_mode_label(user_mode, speed).map(Reading::Label)
            }
            Decode::SummerWinter => match read_register(hub, self.register).await? {
                0 => Some(Reading::Label("summer")),
                1 => Some(Reading::Label("winter")),
                _ => None,
            },
            Decode::FilterTime => {
                let [low, high] = two_registers(hub, FILTER_TIME_REMAINING).await?;
                let seconds = f64::from(combine_u32(low, high));
                Some(Reading::Number(round_to(seconds / SECONDS_PER_DAY, 1)))
            }
            Decode::ModeTime => {
                let [low, high] = two_registers(hub, MODE_TIME_REMAINING).await?;
                let seconds = f64::from(combine_u32(low, high));
                Some(Reading::Number(round_to(seconds / 60.0, 1)))
            }
        })
    }
}

async fn two_registers(hub: &dyn RegisterAccess, register: Register) -> Result<[u16; 2], Error> {
    let values = read_registers(hub, register, 2).await?;
    match values[..] {
        [low, high, ..] => Ok([low, high]),
        _ => Err(Error::ShortRead { register, got: values.len() }),
    }
}

fn fan_mode_label(user_mode: u16, speed: Option<u16>) -> Option<&'static str> {
    Some(match (user_mode, speed) {
        (0, Some(2)) => "auto_low",
        (0, Some(3)) => "auto_normal",
        (0, Some(4)) => "auto_high",
        (0, _) => "auto",
        (1, Some(0)) => "manual_stop",
        (1, Some(2)) => "manual_low",
        (1, Some(3)) => "manual_normal",
        (1, Some(4)) => "manual_high",
        (1, _) => "manual",
        (2, _) => "crowded",
        (3, _) => "refresh",
        (4, _) => "fireplace",
        (5, _) => "away",
        (6, _) => "holiday",
        (7, _) => "cooker_hood",
        (8, _) => "vacuum_cleaner",
        (9, _) => "cdi_1",
        (10, _) => "cdi_2",
        (11, _) => "cdi_3",
        (12, _) => "pressure_guard",
        _ => return None,
    })
}

#[rustfmt::skip]
pub static SENSORS: [Sensor; 24] = [
    Sensor::temperature("outdoor_temp", 12101),
    Sensor::temperature("supply_temp", 12102),
    Sensor::temperature("extract_temp", 12105),
    Sensor::temperature("eff_temp", 12106),
    Sensor::temperature("overheat_temp", 12107),
    Sensor::temperature("exhaust_temp", 12543),
    Sensor::new("rel_moisture", 12135, Some("humidity"), Some("%"), Scale::ONE, "mdi:water-percent", MEASUREMENT).unsigned(),
    Sensor::new("calc_moisture_extract", 2210, Some("humidity"), Some("%"), Scale::ONE, "mdi:water-plus", MEASUREMENT),
    Sensor::new("calc_moisture_intake", 2211, Some("humidity"), Some("%"), Scale::ONE, "mdi:water-minus", MEASUREMENT),
    Sensor::new("sf_rpm", 12400, None, Some("rpm"), Scale::ONE, "mdi:speedometer", MEASUREMENT).unsigned(),
    Sensor::new("ef_rpm", 12401, None, Some("rpm"), Scale::ONE, "mdi:speedometer", MEASUREMENT).unsigned(),
    Sensor::new("sf_speed_pct", 14000, None, Some("%"), Scale::ONE, "mdi:fan", MEASUREMENT).unsigned(),
    Sensor::new("ef_speed_pct", 14001, None, Some("%"), Scale::ONE, "mdi:fan", MEASUREMENT).unsigned(),
    Sensor::new("sf_flow_rate", 14000, None, Some("m³/h"), Scale::multiply_by(3.0), "mdi:home-switch", MEASUREMENT).unsigned(),
    Sensor::new("ef_flow_rate", 14001, None, Some("m³/h"), Scale::multiply_by(3.0), "mdi:home-switch", MEASUREMENT).unsigned(),
    Sensor::new("fan_mode", 1160, None, None, Scale::ONE, "mdi:air-conditioner", None).decoded(Decode::FanMode),
    Sensor::new("mode_time_rem", 1111, None, Some("min"), Scale::ONE, "mdi:timer-sand", None).decoded(Decode::ModeTime),
    Sensor::new("summer_winter", 1038, None, None, Scale::ONE, "mdi:sun-snowflake-variant", None).decoded(Decode::SummerWinter),
    Sensor::new("heat_recovery_efficiency", 14102, Some("power_factor"), Some("%"), Scale::ONE, "mdi:sync", MEASUREMENT).unsigned(),
    Sensor::new("heater_pct", 2148, None, Some("%"), Scale::ONE, "mdi:heating-coil", MEASUREMENT),
    Sensor::new("heater_watts", 2148, Some("power"), Some("W"), Scale::multiply_by(16.7), "mdi:lightning-bolt", MEASUREMENT),
    Sensor::new("filter_time_rem", 7005, None, Some("days"), Scale::ONE, "mdi:clock-end", MEASUREMENT).decoded(Decode::FilterTime),
    Sensor::new("filter_alarm_code", 15141, None, None, Scale::ONE, "mdi:alert-circle", None),
    Sensor::new("manual_fan_reg", 1130, None, None, Scale::ONE, "mdi:cog-clockwise", None),
];

impl Entity for Sensor {
    fn platform(&self) -> Platform {
        Platform::Sensor
    }

    fn key(&self) -> &'static str {
        self.key
    }

    fn unique_id(&self, device: &Device) -> String {
        device.unique_id(format_args!("sensor_{}_{}", self.register.address, self.key))
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            key: self.key,
            registers: self.registers(),
            scale: matches!(self.decode, Decode::Scaled { .. }).then_some(self.scale),
            icon: self.icon,
            category: None,
            traits: Traits::Sensor {
                device_class: self.device_class,
                state_class: self.state_class,
                unit: self.unit,
            },
        }
    }

    fn update<'a>(&'a self, hub: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>> {
        Box::pin(async move { Ok(State::Sensor(self.read(hub).await?)) })
    }

    fn command<'a>(
        &'a self,
        _: &'a dyn RegisterAccess,
        channel: &'a str,
        _: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            Err(Error::UnknownChannel { key: self.key, channel: channel.to_string() })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHub;

    fn sensor(key: &str) -> &'static Sensor {
        SENSORS.iter().find(|s| s.key == key).unwrap()
    }

    async fn reading(hub: &FakeHub, key: &str) -> Option<Reading> {
        match sensor(key).update(hub).await.unwrap() {
            State::Sensor(reading) => reading,
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn temperatures_are_signed_tenths() {
        let hub = FakeHub::default().with_input(12101, 65486).with_input(12102, 215);
        assert_eq!(reading(&hub, "outdoor_temp").await, Some(Reading::Number(-5.0)));
        assert_eq!(reading(&hub, "supply_temp").await, Some(Reading::Number(21.5)));
    }

    #[tokio::test]
    async fn fan_speeds_are_unsigned() {
        let hub = FakeHub::default().with_input(12400, 40000).with_input(14000, 40);
        assert_eq!(reading(&hub, "sf_rpm").await, Some(Reading::Number(40000.0)));
        assert_eq!(reading(&hub, "sf_flow_rate").await, Some(Reading::Number(120.0)));
        assert_eq!(reading(&hub, "sf_speed_pct").await, Some(Reading::Number(40.0)));
    }

    #[tokio::test]
    async fn heater_power() {
        let hub = FakeHub::default().with_holding(2148, 50);
        assert_eq!(reading(&hub, "heater_watts").await, Some(Reading::Number(835.0)));
        assert_eq!(reading(&hub, "heater_pct").await, Some(Reading::Number(50.0)));
    }

    #[tokio::test]
    async fn fan_mode_labels() {
        let hub = FakeHub::default().with_input(1160, 1).with_holding(1130, 2);
        assert_eq!(reading(&hub, "fan_mode").await, Some(Reading::Label("manual_low")));
        hub.set(RegisterKind::Input, 1160, 0);
        hub.set(RegisterKind::Holding, 1130, 4);
        assert_eq!(reading(&hub, "fan_mode").await, Some(Reading::Label("auto_high")));
        hub.set(RegisterKind::Input, 1160, 7);
        assert_eq!(reading(&hub, "fan_mode").await, Some(Reading::Label("cooker_hood")));
        assert_eq!(fan_mode_label(1, None), Some("manual"));
    }

    #[tokio::test]
    async fn undecodable_values_have_no_reading() {
        let hub = FakeHub::default().with_input(1160, 42).with_holding(1130, 3);
        assert_eq!(reading(&hub, "fan_mode").await, None);
        hub.set(RegisterKind::Holding, 1038, 2);
        assert_eq!(reading(&hub, "summer_winter").await, None);
    }

    #[tokio::test]
    async fn summer_winter() {
        let hub = FakeHub::default().with_holding(1038, 0);
        assert_eq!(reading(&hub, "summer_winter").await, Some(Reading::Label("summer")));
        hub.set(RegisterKind::Holding, 1038, 1);
        assert_eq!(reading(&hub, "summer_winter").await, Some(Reading::Label("winter")));
    }

    #[tokio::test]
    async fn filter_time_in_days() {
        // 0x0001_5180 seconds is exactly one day.
        let hub = FakeHub::default().with_holding(7004, 0x5180).with_holding(7005, 1);
        assert_eq!(reading(&hub, "filter_time_rem").await, Some(Reading::Number(1.0)));
        hub.set(RegisterKind::Holding, 7004, 0x5180 + 8640);
        assert_eq!(reading(&hub, "filter_time_rem").await, Some(Reading::Number(1.1)));
    }

    #[tokio::test]
    async fn mode_time_in_minutes() {
        let hub = FakeHub::default().with_input(1110, 5400).with_input(1111, 0);
        assert_eq!(reading(&hub, "mode_time_rem").await, Some(Reading::Number(90.0)));
    }

    #[tokio::test]
    async fn read_failures_are_reported() {
        let hub = FakeHub::default();
        let error = sensor("extract_temp").update(&hub).await.unwrap_err();
        assert!(matches!(error, Error::Read(register, _) if register == Register::input(12105)));
    }

    #[test]
    fn unique_ids() {
        let device = Device { model: crate::entity::Model::default(), slave: 1 };
        assert_eq!(
            sensor("supply_temp").unique_id(&device),
            "systemair_1_sensor_12102_supply_temp"
        );
        assert_eq!(
            sensor("filter_time_rem").unique_id(&device),
            "systemair_1_sensor_7005_filter_time_rem"
        );
    }
}
