// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

pub const MIN_TEMPERATURE: u32 = 1000;
pub const MAX_TEMPERATURE: u32 = 10000;
pub const NEUTRAL_TEMPERATURE: u32 = 6500;

/// The last successfully applied color setting.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorState {
    /// Color temperature in kelvin, within `[1000, 10000]`.
    pub temperature: u32,
    /// Brightness multiplier, within `[0.0, 1.0]`.
    pub brightness: f64,
}

impl Default for ColorState {
    fn default() -> Self {
        Self {
            temperature: NEUTRAL_TEMPERATURE,
            brightness: 1.0,
        }
    }
}

impl ColorState {
    /// Checks both fields against their ranges without adjusting either.
    ///
    /// # Errors
    ///
    /// Returns error if the temperature or brightness is out of range.
    pub fn validate(&self) -> Result<(), ColorError> {
        if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&self.temperature) {
            return Err(ColorError::TemperatureOutOfRange(i64::from(self.temperature)));
        }

        if !(0.0..=1.0).contains(&self.brightness) {
            return Err(ColorError::BrightnessOutOfRange(self.brightness));
        }

        Ok(())
    }
}

impl fmt::Display for ColorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.2}", self.temperature, self.brightness)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ColorError {
    TemperatureOutOfRange(i64),
    BrightnessOutOfRange(f64),
    InvalidTemperature,
    InvalidBrightness,
}

impl fmt::Display for ColorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TemperatureOutOfRange(value) => write!(
                f,
                "temperature must be in range [{MIN_TEMPERATURE}, {MAX_TEMPERATURE}], but was {value}"
            ),
            Self::BrightnessOutOfRange(value) => write!(
                f,
                "brightness must be in range [0.0, 1.0], but was {value}"
            ),
            Self::InvalidTemperature => f.write_str("temperature is not an integer"),
            Self::InvalidBrightness => f.write_str("brightness is not a number"),
        }
    }
}

impl std::error::Error for ColorError {}

/// A field update that either replaces the previous value or offsets it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Adjust<T> {
    Absolute(T),
    Relative(T),
}

/// A client-supplied color update. Absent fields leave the value unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ColorDelta {
    pub temperature: Option<Adjust<i64>>,
    pub brightness: Option<Adjust<f64>>,
}

impl ColorDelta {
    /// Parses textual fields, where a `+` or `-` prefix marks a relative value.
    /// Empty strings are treated the same as absent fields.
    ///
    /// # Errors
    ///
    /// Returns error if a present field cannot be parsed as a number.
    pub fn parse(temperature: Option<&str>, brightness: Option<&str>) -> Result<Self, ColorError> {
        let temperature = match temperature.map(str::trim).filter(|s| !s.is_empty()) {
            Some(text) => {
                let value = text
                    .parse::<i64>()
                    .map_err(|_| ColorError::InvalidTemperature)?;
                Some(adjust(text, value))
            }
            None => None,
        };

        let brightness = match brightness.map(str::trim).filter(|s| !s.is_empty()) {
            Some(text) => {
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ColorError::InvalidBrightness)?;
                Some(adjust(text, value))
            }
            None => None,
        };

        Ok(Self {
            temperature,
            brightness,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.brightness.is_none()
    }
}

fn adjust<T>(text: &str, value: T) -> Adjust<T> {
    if text.starts_with('+') || text.starts_with('-') {
        Adjust::Relative(value)
    } else {
        Adjust::Absolute(value)
    }
}

/// Combines a delta with the previous state into a new absolute state.
///
/// Brightness is clamped into `[0.0, 1.0]`. Temperature is not clamped: a
/// result outside `[1000, 10000]` is rejected.
///
/// # Errors
///
/// Returns error if the resulting temperature is out of range or the
/// resulting brightness is not a finite number.
pub fn resolve(delta: &ColorDelta, previous: ColorState) -> Result<ColorState, ColorError> {
    let temperature = match delta.temperature {
        None => i64::from(previous.temperature),
        Some(Adjust::Absolute(value)) => value,
        Some(Adjust::Relative(offset)) => i64::from(previous.temperature).saturating_add(offset),
    };

    let brightness = match delta.brightness {
        None => previous.brightness,
        Some(Adjust::Absolute(value)) => value,
        Some(Adjust::Relative(offset)) => previous.brightness + offset,
    };

    if !brightness.is_finite() {
        return Err(ColorError::BrightnessOutOfRange(brightness));
    }

    let resolved = ColorState {
        temperature: u32::try_from(temperature)
            .map_err(|_| ColorError::TemperatureOutOfRange(temperature))?,
        brightness: brightness.clamp(0.0, 1.0),
    };

    match resolved.validate() {
        Ok(()) => Ok(resolved),
        Err(_) => Err(ColorError::TemperatureOutOfRange(temperature)),
    }
}
