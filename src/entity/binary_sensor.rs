use super::{
    Descriptor, Device, Entity, EntityCategory, Error, Platform, State, Traits, read_register,
};
use crate::connection::RegisterAccess;
use crate::registers::Register;
use futures::future::BoxFuture;

const DIAGNOSTIC: Option<EntityCategory> = Some(EntityCategory::Diagnostic);

#[derive(Clone, Copy, Debug)]
pub struct BinarySensor {
    key: &'static str,
    register: Register,
    device_class: Option<&'static str>,
    icon: &'static str,
    category: Option<EntityCategory>,
}

macro_rules! binary_sensors {
    ($(($key: literal at $address: literal, $class: expr, $icon: literal, $category: expr),)*) => {
        [$(BinarySensor {
            key: $key,
            register: Register::holding($address),
            device_class: $class,
            icon: $icon,
            category: $category,
        }),*]
    }
}

pub static BINARY_SENSORS: [BinarySensor; 9] = binary_sensors![
    ("a_alarm" at 15900, Some("problem"), "mdi:alert-octagon", DIAGNOSTIC),
    ("b_alarm" at 15901, Some("problem"), "mdi:alert-circle", DIAGNOSTIC),
    ("c_alarm" at 15902, Some("problem"), "mdi:alert", DIAGNOSTIC),
    ("filter_alarm" at 15543, Some("problem"), "mdi:air-filter", DIAGNOSTIC),
    ("temp_low_alarm" at 15176, Some("problem"), "mdi:thermometer-alert", DIAGNOSTIC),
    ("hood_status" at 12305, Some("running"), "mdi:stove", None),
    ("free_cooling" at 4110, Some("running"), "mdi:snowflake-check", None),
    ("triac_signal" at 14380, Some("power"), "mdi:sine-wave", DIAGNOSTIC),
    ("maintenance_mode" at 15000, None, "mdi:wrench-clock", DIAGNOSTIC),
];

impl Entity for BinarySensor {
    fn platform(&self) -> Platform {
        Platform::BinarySensor
    }

    fn key(&self) -> &'static str {
        self.key
    }

    fn unique_id(&self, device: &Device) -> String {
        device.unique_id(format_args!("bin_{}_{}", self.register.address, self.key))
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            key: self.key,
            registers: vec![self.register],
            scale: None,
            icon: self.icon,
            category: self.category,
            traits: Traits::BinarySensor { device_class: self.device_class },
        }
    }

    fn update<'a>(&'a self, hub: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>> {
        Box::pin(async move {
            let raw = read_register(hub, self.register).await?;
            Ok(State::Binary(raw > 0))
        })
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

    #[tokio::test]
    async fn any_non_zero_value_is_on() {
        let hub = FakeHub::default()
            .with_holding(15900, 0)
            .with_holding(15901, 1)
            .with_holding(15902, 3);
        let states = futures::future::try_join_all(
            BINARY_SENSORS[..3].iter().map(|sensor| sensor.update(&hub)),
        )
        .await
        .unwrap();
        assert_eq!(states, [State::Binary(false), State::Binary(true), State::Binary(true)]);
    }

    #[tokio::test]
    async fn binary_sensors_are_read_only() {
        let hub = FakeHub::default();
        let error = BINARY_SENSORS[0].command(&hub, "state", "ON").await.unwrap_err();
        assert!(matches!(error, Error::UnknownChannel { key: "a_alarm", .. }));
        assert!(hub.writes().is_empty());
    }

    #[test]
    fn unique_id() {
        let device = Device { model: crate::entity::Model::default(), slave: 2 };
        assert_eq!(BINARY_SENSORS[5].unique_id(&device), "systemair_2_bin_12305_hood_status");
    }
}
