use super::{
    Descriptor, Device, Entity, EntityCategory, Error, Platform, STATE, State, Traits,
    read_register, write_register,
};
use crate::connection::RegisterAccess;
use crate::registers::{Register, Scale};
use futures::future::BoxFuture;

const CONFIG: Option<EntityCategory> = Some(EntityCategory::Config);

/// A writable holding register holding a scaled, possibly negative, number.
#[derive(Clone, Copy, Debug)]
pub struct Number {
    key: &'static str,
    register: Register,
    min: f64,
    max: f64,
    step: f64,
    unit: &'static str,
    scale: Scale,
    icon: &'static str,
    category: Option<EntityCategory>,
}

macro_rules! numbers {
    ($(($key: literal at $address: literal, $min: literal ..= $max: literal step $step: literal,
        $unit: literal, / $scale: literal, $icon: literal, $category: expr),)*) => {
        [$(Number {
            key: $key,
            register: Register::holding($address),
            min: $min as f64,
            max: $max as f64,
            step: $step as f64,
            unit: $unit,
            scale: Scale::divide_by($scale as f64),
            icon: $icon,
            category: $category,
        }),*]
    }
}

#[rustfmt::skip]
pub static NUMBERS: [Number; 42] = numbers![
    ("supply_air_setpoint" at 2000, 12 ..= 30 step 0.5, "°C", /10, "mdi:thermometer-lines", None),
    ("holiday_duration" at 1100, 1 ..= 365 step 1, "days", /1, "mdi:airplane-takeoff", None),
    ("away_duration" at 1101, 1 ..= 72 step 1, "h", /1, "mdi:exit-run", None),
    ("fireplace_duration" at 1102, 1 ..= 60 step 1, "min", /1, "mdi:fireplace", None),
    ("refresh_duration" at 1103, 1 ..= 240 step 1, "min", /1, "mdi:air-filter", None),
    ("crowded_duration" at 1104, 1 ..= 8 step 1, "h", /1, "mdi:account-multiple-plus", None),
    ("eco_offset" at 2503, 0 ..= 10 step 0.5, "°C", /10, "mdi:leaf", None),

    ("exhaust_setpoint" at 2012, 12 ..= 30 step 0.5, "°C", /10, "mdi:thermometer-low", CONFIG),
    ("exhaust_min_setpoint" at 2020, 10 ..= 20 step 0.5, "°C", /10, "mdi:thermometer-chevron-down", CONFIG),
    ("exhaust_max_setpoint" at 2021, 20 ..= 40 step 0.5, "°C", /10, "mdi:thermometer-chevron-up", CONFIG),

    ("fan_comp_read" at 1254, -50 ..= 50 step 1, "%", /1, "mdi:fan-alert", CONFIG),
    ("fan_comp_winter" at 1251, -50 ..= 50 step 1, "%", /1, "mdi:snowflake-alert", CONFIG),
    ("winter_comp_temp" at 1252, -20 ..= 20 step 0.5, "°C", /10, "mdi:thermometer-check", CONFIG),
    ("winter_comp_start" at 1255, -20 ..= 10 step 0.5, "°C", /10, "mdi:snowflake-thermometer", CONFIG),
    ("winter_comp_max" at 1253, -20 ..= 20 step 0.5, "°C", /10, "mdi:thermometer-chevron-up", CONFIG),
    ("fan_comp_summer" at 1258, -50 ..= 50 step 1, "%", /1, "mdi:sun-angle", CONFIG),
    ("summer_comp_start" at 1256, 15 ..= 40 step 0.5, "°C", /10, "mdi:sun-thermometer", CONFIG),
    ("summer_comp_max" at 1257, 20 ..= 50 step 0.5, "°C", /10, "mdi:thermometer-chevron-up", CONFIG),

    ("sf_min_rpm" at 1410, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-minus", CONFIG),
    ("ef_min_rpm" at 1411, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-minus", CONFIG),
    ("sf_low_rpm" at 1302, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-speed-1", CONFIG),
    ("ef_low_rpm" at 1303, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-speed-1", CONFIG),
    ("sf_normal_rpm" at 1414, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-speed-2", CONFIG),
    ("ef_normal_rpm" at 1415, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-speed-2", CONFIG),
    ("sf_high_rpm" at 1416, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-speed-3", CONFIG),
    ("ef_high_rpm" at 1417, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-speed-3", CONFIG),
    ("sf_max_rpm" at 1418, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-chevron-up", CONFIG),
    ("ef_max_rpm" at 1419, 500 ..= 4500 step 10, "rpm", /1, "mdi:fan-chevron-up", CONFIG),

    ("sf_holiday_setpoint" at 1220, 500 ..= 3500 step 10, "rpm", /1, "mdi:speedometer-slow", CONFIG),
    ("ef_holiday_setpoint" at 1221, 500 ..= 3500 step 10, "rpm", /1, "mdi:speedometer-slow", CONFIG),
    ("sf_hood_setpoint" at 1222, 500 ..= 4500 step 10, "rpm", /1, "mdi:speedometer", CONFIG),
    ("ef_hood_setpoint" at 1223, 500 ..= 4500 step 10, "rpm", /1, "mdi:speedometer", CONFIG),
    ("sf_vacuum_setpoint" at 1224, 500 ..= 4500 step 10, "rpm", /1, "mdi:vacuum", CONFIG),
    ("ef_vacuum_setpoint" at 1225, 500 ..= 4500 step 10, "rpm", /1, "mdi:vacuum", CONFIG),
    ("moisture_setpoint" at 2202, 10 ..= 90 step 1, "%", /1, "mdi:water-percent", CONFIG),

    ("filter_interval" at 7000, 1 ..= 12 step 1, "months", /1, "mdi:calendar-clock", CONFIG),

    ("fc_outdoor_day_min" at 4101, 12 ..= 30 step 0.5, "°C", /10, "mdi:sun-thermometer", CONFIG),
    ("fc_outdoor_night_high" at 4102, 7 ..= 30 step 0.5, "°C", /10, "mdi:sun-thermometer", CONFIG),
    ("fc_outdoor_night_low" at 4103, 7 ..= 30 step 0.5, "°C", /10, "mdi:sun-thermometer", CONFIG),
    ("fc_indoor_low_limit" at 4104, 12 ..= 30 step 0.5, "°C", /10, "mdi:sun-thermometer", CONFIG),

    ("sched_active_offset" at 5000, -10 ..= 0 step 0.5, "°C", /10, "mdi:sun-thermometer", CONFIG),
    ("sched_inactive_offset" at 5001, -10 ..= 0 step 0.5, "°C", /10, "mdi:sun-thermometer", CONFIG),
];

impl Number {
    /// Validate `value` against the accepted range and write it out.
    pub async fn set(&self, hub: &dyn RegisterAccess, value: f64) -> Result<(), Error> {
        if !(self.min..=self.max).contains(&value) {
            return Err(Error::OutOfRange { key: self.key, value, min: self.min, max: self.max });
        }
        let raw = self.scale.encode(value).map_err(|source| Error::Encode { key: self.key, source })?;
        write_register(hub, self.register.address, raw).await
    }
}

impl Entity for Number {
    fn platform(&self) -> Platform {
        Platform::Number
    }

    fn key(&self) -> &'static str {
        self.key
    }

    fn unique_id(&self, device: &Device) -> String {
        device.unique_id(format_args!("num_{}_{}", self.register.address, self.key))
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            key: self.key,
            registers: vec![self.register],
            scale: Some(self.scale),
            icon: self.icon,
            category: self.category,
            traits: Traits::Number { min: self.min, max: self.max, step: self.step, unit: self.unit },
        }
    }

    fn update<'a>(&'a self, hub: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>> {
        Box::pin(async move {
            let raw = read_register(hub, self.register).await?;
            Ok(State::Number(self.scale.decode(raw, true)))
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
            let value = payload.trim().parse::<f64>().map_err(|_| Error::InvalidPayload {
                key: self.key,
                payload: payload.to_string(),
            })?;
            self.set(hub, value).await
        })
    }

    fn command_channels(&self) -> &'static [&'static str] {
        &[STATE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHub;

    fn number(key: &str) -> &'static Number {
        NUMBERS.iter().find(|n| n.key == key).unwrap()
    }

    #[tokio::test]
    async fn reads_signed_scaled_values() {
        let hub = FakeHub::default().with_holding(2000, 215).with_holding(5000, 65486);
        assert_eq!(number("supply_air_setpoint").update(&hub).await.unwrap(), State::Number(21.5));
        assert_eq!(number("sched_active_offset").update(&hub).await.unwrap(), State::Number(-5.0));
    }

    #[tokio::test]
    async fn writes_fold_negative_values() {
        let hub = FakeHub::default();
        number("fan_comp_winter").command(&hub, STATE, "-50").await.unwrap();
        number("supply_air_setpoint").command(&hub, STATE, "21.5").await.unwrap();
        number("sched_inactive_offset").set(&hub, -2.5).await.unwrap();
        assert_eq!(hub.writes(), [(1251, 65486), (2000, 215), (5001, 65511)]);
    }

    #[tokio::test]
    async fn rejects_values_out_of_range() {
        let hub = FakeHub::default();
        let error = number("supply_air_setpoint").set(&hub, 31.0).await.unwrap_err();
        assert!(matches!(error, Error::OutOfRange { max: 30.0, .. }));
        let error = number("away_duration").command(&hub, STATE, "soon").await.unwrap_err();
        assert!(matches!(error, Error::InvalidPayload { key: "away_duration", .. }));
        assert!(hub.writes().is_empty());
    }

    #[test]
    fn table_is_consistent() {
        for number in &NUMBERS {
            assert!(number.min < number.max, "{}", number.key);
            assert!(number.step > 0.0, "{}", number.key);
            // Every value in range must be representable on the wire.
            number.scale.encode(number.min).unwrap();
            number.scale.encode(number.max).unwrap();
        }
        let device = Device { model: crate::entity::Model::default(), slave: 1 };
        assert_eq!(number("eco_offset").unique_id(&device), "systemair_1_num_2503_eco_offset");
    }
}
