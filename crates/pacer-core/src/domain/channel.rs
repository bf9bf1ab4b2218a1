//! Delivery channels.
//!
//! A channel is either one of the built-in destinations or an operator-defined
//! custom one. On the wire both are plain strings: built-ins use their snake
//! case name, custom channels carry a `custom_` prefix.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const CUSTOM_PREFIX: &str = "custom_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuiltinChannel {
    /// Public feed post.
    Feed,
    AgentGroup,
    CustomerGroup,
}

impl BuiltinChannel {
    pub const ALL: [BuiltinChannel; 3] = [
        BuiltinChannel::Feed,
        BuiltinChannel::AgentGroup,
        BuiltinChannel::CustomerGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinChannel::Feed => "feed",
            BuiltinChannel::AgentGroup => "agent_group",
            BuiltinChannel::CustomerGroup => "customer_group",
        }
    }
}

/// Name of a custom channel, stored without the `custom_` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomChannelId(String);

impl CustomChannelId {
    pub fn new(name: impl Into<String>) -> Result<Self, ChannelParseError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ChannelParseError::EmptyCustomName);
        }
        if name.chars().any(char::is_whitespace) {
            return Err(ChannelParseError::InvalidCustomName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelParseError {
    #[error("unknown channel: {0}")]
    Unknown(String),

    #[error("custom channel name must not be empty")]
    EmptyCustomName,

    #[error("custom channel name contains whitespace: {0:?}")]
    InvalidCustomName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    Builtin(BuiltinChannel),
    Custom(CustomChannelId),
}

impl Channel {
    pub fn custom(name: impl Into<String>) -> Result<Self, ChannelParseError> {
        CustomChannelId::new(name).map(Channel::Custom)
    }

    pub fn builtins() -> impl Iterator<Item = Channel> {
        BuiltinChannel::ALL.into_iter().map(Channel::Builtin)
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Channel::Custom(_))
    }
}

impl From<BuiltinChannel> for Channel {
    fn from(value: BuiltinChannel) -> Self {
        Channel::Builtin(value)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Builtin(b) => f.write_str(b.as_str()),
            Channel::Custom(id) => write!(f, "{CUSTOM_PREFIX}{}", id.as_str()),
        }
    }
}

impl FromStr for Channel {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix(CUSTOM_PREFIX) {
            return Channel::custom(name);
        }
        BuiltinChannel::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .map(Channel::Builtin)
            .ok_or_else(|| ChannelParseError::Unknown(s.to_string()))
    }
}

impl TryFrom<String> for Channel {
    type Error = ChannelParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("feed", Channel::Builtin(BuiltinChannel::Feed))]
    #[case("agent_group", Channel::Builtin(BuiltinChannel::AgentGroup))]
    #[case("customer_group", Channel::Builtin(BuiltinChannel::CustomerGroup))]
    fn parses_builtin_names(#[case] raw: &str, #[case] expected: Channel) {
        assert_eq!(raw.parse::<Channel>().unwrap(), expected);
        assert_eq!(expected.to_string(), raw);
    }

    #[test]
    fn custom_channels_keep_their_prefix_on_the_wire() {
        let ch: Channel = "custom_vip".parse().unwrap();
        assert!(ch.is_custom());
        assert_eq!(ch.to_string(), "custom_vip");

        let json = serde_json::to_string(&ch).unwrap();
        assert_eq!(json, "\"custom_vip\"");
        let back: Channel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ch);
    }

    #[rstest]
    #[case("newsletter")]
    #[case("custom_")]
    #[case("custom_a b")]
    fn rejects_unknown_or_malformed(#[case] raw: &str) {
        assert!(raw.parse::<Channel>().is_err());
    }
}
