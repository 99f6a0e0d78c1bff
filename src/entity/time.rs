use super::{
    Descriptor, Device, Entity, EntityCategory, Error, Platform, STATE, State, Traits,
    read_register, write_register,
};
use crate::connection::RegisterAccess;
use crate::registers::Register;
use futures::future::BoxFuture;
use jiff::civil::Time;
use std::time::Duration;

/// Time for the unit to process the hour before the minute is written.
pub const HOUR_MINUTE_DELAY: Duration = Duration::from_millis(300);

/// A time of day spread over an hour and a minute register.
#[derive(Clone, Copy, Debug)]
pub struct TimeOfDay {
    key: &'static str,
    name: &'static str,
    hour: Register,
    minute: Register,
}

macro_rules! times {
    ($(($key: literal is $name: literal at $hour: literal : $minute: literal),)*) => {
        [$(TimeOfDay {
            key: $key,
            name: $name,
            hour: Register::holding($hour),
            minute: Register::holding($minute),
        }),*]
    }
}

#[rustfmt::skip]
pub static TIMES: [TimeOfDay; 30] = times![
    ("free_cooling_start" is "Free Cooling Start Time" at 4105:4106),
    ("free_cooling_end" is "Free Cooling End Time" at 4107:4108),
    ("monday_period_1_start" is "Monday Period 1 Start" at 5002:5003),
    ("monday_period_1_end" is "Monday Period 1 End" at 5004:5005),
    ("monday_period_2_start" is "Monday Period 2 Start" at 5006:5007),
    ("monday_period_2_end" is "Monday Period 2 End" at 5008:5009),
    ("tuesday_period_1_start" is "Tuesday Period 1 Start" at 5010:5011),
    ("tuesday_period_1_end" is "Tuesday Period 1 End" at 5012:5013),
    ("tuesday_period_2_start" is "Tuesday Period 2 Start" at 5014:5015),
    ("tuesday_period_2_end" is "Tuesday Period 2 End" at 5016:5017),
    ("wednesday_period_1_start" is "Wednesday Period 1 Start" at 5018:5019),
    ("wednesday_period_1_end" is "Wednesday Period 1 End" at 5020:5021),
    ("wednesday_period_2_start" is "Wednesday Period 2 Start" at 5022:5023),
    ("wednesday_period_2_end" is "Wednesday Period 2 End" at 5024:5025),
    ("thursday_period_1_start" is "Thursday Period 1 Start" at 5026:5027),
    ("thursday_period_1_end" is "Thursday Period 1 End" at 5028:5029),
    ("thursday_period_2_start" is "Thursday Period 2 Start" at 5030:5031),
    ("thursday_period_2_end" is "Thursday Period 2 End" at 5032:5033),
    ("friday_period_1_start" is "Friday Period 1 Start" at 5034:5035),
    ("friday_period_1_end" is "Friday Period 1 End" at 5036:5037),
    ("friday_period_2_start" is "Friday Period 2 Start" at 5038:5039),
    ("friday_period_2_end" is "Friday Period 2 End" at 5040:5041),
    ("saturday_period_1_start" is "Saturday Period 1 Start" at 5042:5043),
    ("saturday_period_1_end" is "Saturday Period 1 End" at 5044:5045),
    ("saturday_period_2_start" is "Saturday Period 2 Start" at 5046:5047),
    ("saturday_period_2_end" is "Saturday Period 2 End" at 5048:5049),
    ("sunday_period_1_start" is "Sunday Period 1 Start" at 5050:5051),
    ("sunday_period_1_end" is "Sunday Period 1 End" at 5052:5053),
    ("sunday_period_2_start" is "Sunday Period 2 Start" at 5054:5055),
    ("sunday_period_2_end" is "Sunday Period 2 End" at 5056:5057),
];

/// Parse `HH:MM`, optionally followed by `:SS` which is ignored. Every field is exactly two
/// digits.
pub fn parse_time(payload: &str) -> Option<Time> {
    fn field(part: &str) -> Option<i8> {
        let &[tens @ b'0'..=b'9', ones @ b'0'..=b'9'] = part.as_bytes() else {
            return None;
        };
        i8::try_from((tens - b'0') * 10 + (ones - b'0')).ok()
    }
    let mut parts = payload.trim().split(':');
    let hour = field(parts.next()?)?;
    let minute = field(parts.next()?)?;
    if let Some(seconds) = parts.next() {
        field(seconds).filter(|s| *s < 60)?;
    }
    if parts.next().is_some() {
        return None;
    }
    Time::new(hour, minute, 0, 0).ok()
}

impl TimeOfDay {
    pub async fn set(&self, hub: &dyn RegisterAccess, time: Time) -> Result<(), Error> {
        write_register(hub, self.hour.address, time.hour().unsigned_abs().into()).await?;
        tokio::time::sleep(HOUR_MINUTE_DELAY).await;
        write_register(hub, self.minute.address, time.minute().unsigned_abs().into()).await
    }
}

impl Entity for TimeOfDay {
    fn platform(&self) -> Platform {
        Platform::Time
    }

    fn key(&self) -> &'static str {
        self.key
    }

    fn name(&self) -> String {
        self.name.to_string()
    }

    fn unique_id(&self, device: &Device) -> String {
        device.unique_id(format_args!("time_{}", self.hour.address))
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            key: self.key,
            registers: vec![self.hour, self.minute],
            scale: None,
            icon: "mdi:clock-outline",
            category: Some(EntityCategory::Config),
            traits: Traits::Time,
        }
    }

    fn update<'a>(&'a self, hub: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>> {
        Box::pin(async move {
            let hour = read_register(hub, self.hour).await?;
            let minute = read_register(hub, self.minute).await?;
            let time = match (i8::try_from(hour), i8::try_from(minute)) {
                (Ok(h), Ok(m)) => Time::new(h, m, 0, 0).ok(),
                _ => None,
            };
            Ok(State::Time(time))
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
            let Some(time) = parse_time(payload) else {
                return Err(Error::InvalidPayload { key: self.key, payload: payload.to_string() });
            };
            self.set(hub, time).await
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

    #[test]
    fn parses_times() {
        assert_eq!(parse_time("07:30"), Time::new(7, 30, 0, 0).ok());
        assert_eq!(parse_time("23:59:00"), Time::new(23, 59, 0, 0).ok());
        assert_eq!(parse_time("24:00"), None);
        assert_eq!(parse_time("12:60"), None);
        assert_eq!(parse_time("noon"), None);
        assert_eq!(parse_time("-1:30"), None);
        assert_eq!(parse_time("+7:30"), None);
        assert_eq!(parse_time("7:30"), None);
        assert_eq!(parse_time("07:+3"), None);
        assert_eq!(parse_time("07:30:60"), None);
        assert_eq!(parse_time("07:30:00:00"), None);
    }

    #[tokio::test]
    async fn out_of_range_registers_give_no_time() {
        let hub = FakeHub::default()
            .with_holding(4105, 6)
            .with_holding(4106, 45)
            .with_holding(4107, 24)
            .with_holding(4108, 0);
        let start = TIMES[0].update(&hub).await.unwrap();
        assert_eq!(start, State::Time(Time::new(6, 45, 0, 0).ok()));
        assert_eq!(TIMES[1].update(&hub).await.unwrap(), State::Time(None));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_hour_then_minute() {
        let hub = FakeHub::default();
        let started = tokio::time::Instant::now();
        TIMES[2].command(&hub, STATE, "08:15").await.unwrap();
        assert_eq!(hub.writes(), [(5002, 8), (5003, 15)]);
        assert!(started.elapsed() >= HOUR_MINUTE_DELAY);
    }

    #[test]
    fn weekly_schedule_layout() {
        for (idx, time) in TIMES[2..].iter().enumerate() {
            let hour = 5002 + 2 * idx as u16;
            assert_eq!((time.hour.address, time.minute.address), (hour, hour + 1), "{}", time.key);
        }
        let device = Device { model: crate::entity::Model::default(), slave: 1 };
        assert_eq!(TIMES[29].unique_id(&device), "systemair_1_time_5056");
    }
}
