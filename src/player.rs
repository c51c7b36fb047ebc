// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Epic,
    Steam,
    #[serde(rename = "PS4")]
    Ps4,
    XboxOne,
    Switch,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Epic => "Epic",
            Platform::Steam => "Steam",
            Platform::Ps4 => "PS4",
            Platform::XboxOne => "XboxOne",
            Platform::Switch => "Switch",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ParsePlayerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Epic" => Ok(Platform::Epic),
            "Steam" => Ok(Platform::Steam),
            "PS4" => Ok(Platform::Ps4),
            "XboxOne" => Ok(Platform::XboxOne),
            "Switch" => Ok(Platform::Switch),
            other => Err(ParsePlayerIdError::UnknownPlatform(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParsePlayerIdError {
    #[error("invalid player id format: {0}")]
    Format(String),
    #[error("invalid player id suffix: expected '0', got '{0}'")]
    Suffix(String),
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
}

/// A platform-qualified account id, written `Platform|id|0` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlayerId {
    platform: Platform,
    id: String,
}

impl PlayerId {
    pub fn new<S: Into<String>>(platform: Platform, id: S) -> PlayerId {
        PlayerId {
            platform,
            id: id.into(),
        }
    }

    pub fn parse(s: &str) -> Result<PlayerId, ParsePlayerIdError> {
        let parts: Vec<&str> = s.split('|').collect();
        let (platform, id, suffix) = match parts.as_slice() {
            [platform, id, suffix] => (*platform, *id, *suffix),
            _ => return Err(ParsePlayerIdError::Format(s.to_string())),
        };
        if suffix != "0" {
            return Err(ParsePlayerIdError::Suffix(suffix.to_string()));
        }
        Ok(PlayerId::new(platform.parse()?, id))
    }

    /// Whether `s` is a well-formed player id.
    pub fn is_valid(s: &str) -> bool {
        PlayerId::parse(s).is_ok()
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_epic(&self) -> bool {
        self.platform == Platform::Epic
    }

    pub fn is_steam(&self) -> bool {
        self.platform == Platform::Steam
    }

    pub fn is_ps4(&self) -> bool {
        self.platform == Platform::Ps4
    }

    pub fn is_xbox(&self) -> bool {
        self.platform == Platform::XboxOne
    }

    pub fn is_switch(&self) -> bool {
        self.platform == Platform::Switch
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|0", self.platform, self.id)
    }
}

impl FromStr for PlayerId {
    type Err = ParsePlayerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlayerId::parse(s)
    }
}

impl TryFrom<String> for PlayerId {
    type Error = ParsePlayerIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        PlayerId::parse(&s)
    }
}

impl From<PlayerId> for String {
    fn from(id: PlayerId) -> String {
        id.to_string()
    }
}
