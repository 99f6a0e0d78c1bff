use super::{
    Descriptor, Device, Entity, Error, MANUAL_SPEED, Platform, State, Traits, USER_MODE_REQUEST,
    VentilationMode,
};
use crate::connection::RegisterAccess;
use crate::registers::Register;
use futures::future::BoxFuture;

/// Channel on which Home Assistant sends button presses.
pub const PRESS: &str = "press";

/// Requests a ventilation mode when pressed.
#[derive(Clone, Copy, Debug)]
pub struct Button {
    key: &'static str,
    mode: VentilationMode,
}

pub static BUTTONS: [Button; 9] = [
    Button { key: "btn_auto", mode: VentilationMode::Auto },
    Button { key: "btn_low_speed", mode: VentilationMode::ManualLow },
    Button { key: "btn_normal_mode", mode: VentilationMode::ManualNormal },
    Button { key: "btn_high_speed", mode: VentilationMode::ManualHigh },
    Button { key: "btn_crowded", mode: VentilationMode::Crowded },
    Button { key: "btn_refresh", mode: VentilationMode::Refresh },
    Button { key: "btn_fireplace", mode: VentilationMode::Fireplace },
    Button { key: "btn_away", mode: VentilationMode::Away },
    Button { key: "btn_holiday", mode: VentilationMode::Holiday },
];

impl Entity for Button {
    fn platform(&self) -> Platform {
        Platform::Button
    }

    fn key(&self) -> &'static str {
        self.key
    }

    fn unique_id(&self, device: &Device) -> String {
        device.unique_id(format_args!("btn_{}", self.key))
    }

    fn descriptor(&self) -> Descriptor {
        let mut registers = vec![Register::holding(USER_MODE_REQUEST)];
        if self.mode.request().1.is_some() {
            registers.push(MANUAL_SPEED);
        }
        Descriptor {
            key: self.key,
            registers,
            scale: None,
            icon: "mdi:play-box-outline",
            category: None,
            traits: Traits::Button,
        }
    }

    fn update<'a>(&'a self, _: &'a dyn RegisterAccess) -> BoxFuture<'a, Result<State, Error>> {
        Box::pin(async { Ok(State::Stateless) })
    }

    fn command<'a>(
        &'a self,
        hub: &'a dyn RegisterAccess,
        channel: &'a str,
        _: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if channel != PRESS {
                return Err(Error::UnknownChannel { key: self.key, channel: channel.to_string() });
            }
            self.mode.apply(hub).await
        })
    }

    fn command_channels(&self) -> &'static [&'static str] {
        &[PRESS]
    }
}
