//! Register addressing and the arithmetic that turns raw 16-bit words into readings.
//!
//! Addresses used throughout this crate are the zero-based protocol addresses that go out on the
//! wire. Systemair documentation numbers its registers from one, so e.g. the documented
//! `USERMODE_MODE` register 1161 is read at address 1160 here.

/// Which Modbus function code is used to read a register.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Read with function code 3, writable with function code 6.
    Holding,
    /// Read with function code 4.
    Input,
}

impl RegisterKind {
    /// SAVE units expose the sensor, output and alarm blocks as input registers.
    pub const fn for_address(address: u16) -> Self {
        if address >= 12000 && address <= 16000 { Self::Input } else { Self::Holding }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Register {
    pub address: u16,
    pub kind: RegisterKind,
}

impl Register {
    pub const fn holding(address: u16) -> Self {
        Self { address, kind: RegisterKind::Holding }
    }

    pub const fn input(address: u16) -> Self {
        Self { address, kind: RegisterKind::Input }
    }

    pub const fn inferred(address: u16) -> Self {
        Self { address, kind: RegisterKind::for_address(address) }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            RegisterKind::Holding => write!(f, "H{}", self.address),
            RegisterKind::Input => write!(f, "I{}", self.address),
        }
    }
}

/// Reinterpret a raw word as a 16-bit two's-complement number.
pub const fn to_signed(raw: u16) -> i32 {
    if raw > 32767 { raw as i32 - 65536 } else { raw as i32 }
}

/// Inverse of [`to_signed`]. `value` must be within `-32768..=65535`.
pub const fn from_signed(value: i32) -> u16 {
    if value < 0 { (value + 65536) as u16 } else { value as u16 }
}

/// Systemair spreads 32-bit counters over a low and a high register.
pub const fn combine_u32(low: u16, high: u16) -> u32 {
    (high as u32) << 16 | low as u32
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum EncodeError {
    #[error("{0} is not a finite number")]
    NotFinite(f64),
    #[error("{value} does not fit into a 16-bit register when scaled by {scale}")]
    OutOfRange { value: f64, scale: Scale },
}

/// Conversion between the integer wire value and the human-readable number.
///
/// `value = raw / divisor`, `raw = value * divisor`.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct Scale(f64);

impl Scale {
    pub const ONE: Self = Self(1.0);
    /// Temperatures and most other fractional values are transmitted in tenths.
    pub const TENTHS: Self = Self(10.0);

    pub const fn divide_by(divisor: f64) -> Self {
        Self(divisor)
    }

    /// Readings that are derived by multiplying the raw value (e.g. `%` into `W`).
    pub const fn multiply_by(factor: f64) -> Self {
        Self(1.0 / factor)
    }

    pub const fn divisor(self) -> f64 {
        self.0
    }

    pub fn decode(self, raw: u16, signed: bool) -> f64 {
        let raw = if signed { to_signed(raw) } else { i32::from(raw) };
        f64::from(raw) / self.0
    }

    pub fn encode(self, value: f64) -> Result<u16, EncodeError> {
        if !value.is_finite() {
            return Err(EncodeError::NotFinite(value));
        }
        let scaled = (value * self.0).round();
        if scaled < -32768.0 || scaled > 65535.0 {
            return Err(EncodeError::OutOfRange { value, scale: self });
        }
        Ok(from_signed(scaled as i32))
    }
}

impl std::fmt::Display for Scale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= 1.0 {
            write!(f, "/{}", self.0)
        } else {
            write!(f, "*{}", round_to(1.0 / self.0, 3))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twos_complement_correction() {
        assert_eq!(to_signed(0), 0);
        assert_eq!(to_signed(32767), 32767);
        assert_eq!(to_signed(32768), -32768);
        assert_eq!(to_signed(65535), -1);
        assert_eq!(to_signed(65486), -50);
        assert_eq!(from_signed(-50), 65486);
        assert_eq!(from_signed(-1), 65535);
        assert_eq!(from_signed(215), 215);
    }

    #[test]
    fn decode_temperature_tenths() {
        assert_eq!(Scale::TENTHS.decode(215, true), 21.5);
        assert_eq!(Scale::TENTHS.decode(65436, true), -10.0);
        // Unsigned registers never get the correction applied.
        assert_eq!(Scale::ONE.decode(40000, false), 40000.0);
    }

    #[test]
    fn decode_multiplied_readings() {
        let watts = Scale::multiply_by(16.7);
        assert_eq!(round_to(watts.decode(50, false), 1), 835.0);
        let flow = Scale::multiply_by(3.0);
        assert_eq!(round_to(flow.decode(40, false), 1), 120.0);
    }

    #[test]
    fn encode_folds_negative_values() {
        assert_eq!(Scale::TENTHS.encode(-5.0), Ok(65486));
        assert_eq!(Scale::TENTHS.encode(21.5), Ok(215));
        assert_eq!(Scale::ONE.encode(-50.0), Ok(65486));
        assert_eq!(Scale::TENTHS.encode(0.1 + 0.2), Ok(3));
    }

    #[test]
    fn encode_rejects_unrepresentable_values() {
        assert!(matches!(Scale::TENTHS.encode(7000.0), Err(EncodeError::OutOfRange { .. })));
        assert!(matches!(Scale::ONE.encode(f64::NAN), Err(EncodeError::NotFinite(_))));
    }

    #[test]
    fn combine_counters() {
        assert_eq!(combine_u32(0x5180, 0x0001), 86400);
        assert_eq!(combine_u32(0, 0), 0);
    }

    #[test]
    fn kind_by_address() {
        assert_eq!(RegisterKind::for_address(12102), RegisterKind::Input);
        assert_eq!(RegisterKind::for_address(16000), RegisterKind::Input);
        assert_eq!(RegisterKind::for_address(2000), RegisterKind::Holding);
        assert_eq!(Register::inferred(14000).to_string(), "I14000");
        assert_eq!(Register::holding(1130).to_string(), "H1130");
    }

    #[test]
    fn scale_display() {
        assert_eq!(Scale::TENTHS.to_string(), "/10");
        assert_eq!(Scale::multiply_by(16.7).to_string(), "*16.7");
    }
}
