// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Client wire messages, exchanged as JSON objects over the daemon socket.
//!
//! Requests may be split or joined arbitrarily. Every reply and broadcast is
//! written as one object followed by a newline.

use crate::color::{ColorDelta, ColorError, ColorState};
use serde::{Deserialize, Serialize};

/// Textual color fields. A `+` or `-` prefix marks a relative value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<String>,
}

impl From<ColorState> for Color {
    fn from(color: ColorState) -> Self {
        Self {
            temperature: Some(color.temperature.to_string()),
            brightness: Some(format!("{:.2}", color.brightness)),
        }
    }
}

impl TryFrom<&Color> for ColorDelta {
    type Error = ColorError;

    fn try_from(color: &Color) -> Result<Self, Self::Error> {
        ColorDelta::parse(color.temperature.as_deref(), color.brightness.as_deref())
    }
}

impl TryFrom<&Color> for ColorState {
    type Error = ColorError;

    fn try_from(color: &Color) -> Result<Self, Self::Error> {
        let temperature = color
            .temperature
            .as_deref()
            .ok_or(ColorError::InvalidTemperature)?
            .parse::<u32>()
            .map_err(|_| ColorError::InvalidTemperature)?;

        let brightness = color
            .brightness
            .as_deref()
            .ok_or(ColorError::InvalidBrightness)?
            .parse::<f64>()
            .map_err(|_| ColorError::InvalidBrightness)?;

        Ok(Self {
            temperature,
            brightness,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKey {
    Color,
}

/// A request exactly as it appears on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<Vec<SubscriptionKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<Vec<SubscriptionKey>>,
}

impl RequestMessage {
    #[must_use]
    pub fn color(temperature: Option<String>, brightness: Option<String>) -> Self {
        Self {
            color: Some(Color {
                temperature,
                brightness,
            }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn subscribe(keys: Vec<SubscriptionKey>) -> Self {
        Self {
            subscribe: Some(keys),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn unsubscribe(keys: Vec<SubscriptionKey>) -> Self {
        Self {
            unsubscribe: Some(keys),
            ..Self::default()
        }
    }
}

/// A decoded request. A message must carry exactly one kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Color(Color),
    Subscribe(Vec<SubscriptionKey>),
    Unsubscribe(Vec<SubscriptionKey>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownRequest;

impl TryFrom<RequestMessage> for Request {
    type Error = UnknownRequest;

    fn try_from(message: RequestMessage) -> Result<Self, Self::Error> {
        match message {
            RequestMessage {
                color: Some(color),
                subscribe: None,
                unsubscribe: None,
            } => Ok(Self::Color(color)),
            RequestMessage {
                color: None,
                subscribe: Some(keys),
                unsubscribe: None,
            } => Ok(Self::Subscribe(keys)),
            RequestMessage {
                color: None,
                subscribe: None,
                unsubscribe: Some(keys),
            } => Ok(Self::Unsubscribe(keys)),
            _ => Err(UnknownRequest),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub key: SubscriptionKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Set when the request was unsuccessful.
    #[serde(rename = "message", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The current absolute color after a color request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<Vec<Update>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribed: Option<Vec<SubscriptionKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribed: Option<Vec<SubscriptionKey>>,
}

impl Response {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn color(color: ColorState) -> Self {
        Self {
            color: Some(color.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn updates(updates: Vec<Update>) -> Self {
        Self {
            updates: Some(updates),
            ..Self::default()
        }
    }

    /// Whether this message is an unsolicited broadcast rather than a reply.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.updates.is_some()
            && self.error.is_none()
            && self.color.is_none()
            && self.subscribed.is_none()
            && self.unsubscribed.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_response_encoding() {
        let response = Response::color(ColorState {
            temperature: 6600,
            brightness: 1.0,
        });

        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"color":{"temperature":"6600","brightness":"1.00"}}"#
        );
    }

    #[test]
    fn error_uses_message_field() {
        assert_eq!(
            serde_json::to_string(&Response::error("Unknown request")).unwrap(),
            r#"{"message":"Unknown request"}"#
        );
    }

    #[test]
    fn request_kinds_are_exclusive() {
        let message: RequestMessage =
            serde_json::from_str(r#"{"color":{"temperature":"+100"}}"#).unwrap();
        assert_eq!(
            Request::try_from(message),
            Ok(Request::Color(Color {
                temperature: Some("+100".into()),
                brightness: None,
            }))
        );

        let message: RequestMessage = serde_json::from_str(r#"{"subscribe":["color"]}"#).unwrap();
        assert_eq!(
            Request::try_from(message),
            Ok(Request::Subscribe(vec![SubscriptionKey::Color]))
        );

        let message: RequestMessage =
            serde_json::from_str(r#"{"subscribe":["color"],"unsubscribe":["color"]}"#).unwrap();
        assert_eq!(Request::try_from(message), Err(UnknownRequest));

        let message: RequestMessage = serde_json::from_str("{}").unwrap();
        assert_eq!(Request::try_from(message), Err(UnknownRequest));
    }

    #[test]
    fn unknown_subscription_key_is_a_decode_error() {
        assert!(serde_json::from_str::<RequestMessage>(r#"{"subscribe":["gamma"]}"#).is_err());
    }

    #[test]
    fn broadcasts_are_distinguished_from_replies() {
        let update = Update {
            key: SubscriptionKey::Color,
            color: Some(ColorState::default().into()),
        };

        assert!(Response::updates(vec![update.clone()]).is_broadcast());

        let subscribed = Response {
            subscribed: Some(vec![SubscriptionKey::Color]),
            updates: Some(vec![update]),
            ..Response::default()
        };
        assert!(!subscribed.is_broadcast());
    }

    #[test]
    fn absolute_color_from_wire() {
        let color = Color {
            temperature: Some("4500".into()),
            brightness: Some("0.75".into()),
        };
        assert_eq!(
            ColorState::try_from(&color),
            Ok(ColorState {
                temperature: 4500,
                brightness: 0.75,
            })
        );
    }
}
