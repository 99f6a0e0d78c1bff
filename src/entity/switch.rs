use super::{
    Descriptor, Device, Entity, EntityCategory, Error, Platform, STATE, State, Traits,
    read_register, write_register,
};
use crate::connection::RegisterAccess;
use crate::registers::Register;
use futures::future::BoxFuture;

const CONFIG: Option<EntityCategory> = Some(EntityCategory::Config);

#[derive(Clone, Copy, Debug)]
pub struct Switch {
    key: &'static str,
    name: &'static str,
    register: Register,
    icon: &'static str,
    category: Option<EntityCategory>,
}

macro_rules! switches {
    ($(($key: literal is $name: literal at $address: literal, $icon: literal, $category: expr),)*) => {
        [$(Switch {
            key: $key,
            name: $name,
            register: Register::holding($address),
            icon: $icon,
            category: $category,
        }),*]
    }
}

#[rustfmt::skip]
pub static SWITCHES: [Switch; 17] = switches![
    ("eco_mode" is "Eco Mode" at 2504, "mdi:leaf", None),
    ("free_cooling" is "Free Cooling" at 4100, "mdi:snowflake-thermometer", None),
    ("fan_manual_stop_allowed" is "Fan Manual Stop Allowed" at 1352, "mdi:fan-off", CONFIG),
    ("monday_period_1" is "Monday Period 1" at 5100, "mdi:calendar-check", CONFIG),
    ("monday_period_2" is "Monday Period 2" at 5101, "mdi:calendar-check", CONFIG),
    ("tuesday_period_1" is "Tuesday Period 1" at 5102, "mdi:calendar-check", CONFIG),
    ("tuesday_period_2" is "Tuesday Period 2" at 5103, "mdi:calendar-check", CONFIG),
    ("wednesday_period_1" is "Wednesday Period 1" at 5104, "mdi:calendar-check", CONFIG),
    ("wednesday_period_2" is "Wednesday Period 2" at 5105, "mdi:calendar-check", CONFIG),
    ("thursday_period_1" is "Thursday Period 1" at 5106, "mdi:calendar-check", CONFIG),
    ("thursday_period_2" is "Thursday Period 2" at 5107, "mdi:calendar-check", CONFIG),
    ("friday_period_1" is "Friday Period 1" at 5108, "mdi:calendar-check", CONFIG),
    ("friday_period_2" is "Friday Period 2" at 5109, "mdi:calendar-check", CONFIG),
    ("saturday_period_1" is "Saturday Period 1" at 5110, "mdi:calendar-check", CONFIG),
    ("saturday_period_2" is "Saturday Period 2" at 5111, "mdi:calendar-check", CONFIG),
    ("sunday_period_1" is "Sunday Period 1" at 5112, "mdi:calendar-check", CONFIG),
    ("sunday_period_2" is "Sunday Period 2" at 5113, "mdi:calendar-check", CONFIG),
];

impl Switch {
    pub async fn turn(&self, hub: &dyn RegisterAccess, on: bool) -> Result<(), Error> {
        write_register(hub, self.register.address, u16::from(on)).await
    }
}

impl Entity for Switch {
    fn platform(&self) -> Platform {
        Platform::Switch
    }

    fn key(&self) -> &'static str {
        self.key
    }

    fn name(&self) -> String {
        self.name.to_string()
    }

    fn unique_id(&self, device: &Device) -> String {
        device.unique_id(format_args!("sw_{}", self.register.address))
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            key: self.key,
            registers: vec![self.register],
            scale: None,
            icon: self.icon,
            category: self.category,
            traits: Traits::Switch,
        }
    }

    fn update<'a>(&'a self, hub: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>> {
        Box::pin(async move {
            let raw = read_register(hub, self.register).await?;
            Ok(State::Binary(raw == 1))
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
            let on = match payload.trim() {
                p if p.eq_ignore_ascii_case("on") || p == "1" => true,
                p if p.eq_ignore_ascii_case("off") || p == "0" => false,
                _ => {
                    return Err(Error::InvalidPayload {
                        key: self.key,
                        payload: payload.to_string(),
                    });
                }
            };
            self.turn(hub, on).await
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

    #[tokio::test]
    async fn only_one_is_on() {
        let hub = FakeHub::default().with_holding(2504, 1).with_holding(4100, 2);
        assert_eq!(SWITCHES[0].update(&hub).await.unwrap(), State::Binary(true));
        assert_eq!(SWITCHES[1].update(&hub).await.unwrap(), State::Binary(false));
    }

    #[tokio::test]
    async fn commands_write_one_or_zero() {
        let hub = FakeHub::default();
        SWITCHES[0].command(&hub, STATE, "ON").await.unwrap();
        SWITCHES[3].command(&hub, STATE, "OFF").await.unwrap();
        assert!(SWITCHES[3].command(&hub, STATE, "maybe").await.is_err());
        assert_eq!(hub.writes(), [(2504, 1), (5100, 0)]);
    }

    #[test]
    fn names_and_ids() {
        let device = Device { model: crate::entity::Model::default(), slave: 1 };
        assert_eq!(SWITCHES[16].unique_id(&device), "systemair_1_sw_5113");
        assert_eq!(SWITCHES[16].name(), "Sunday Period 2");
        for (idx, switch) in SWITCHES[3..].iter().enumerate() {
            assert_eq!(switch.register.address, 5100 + idx as u16);
        }
    }
}
