//! Channel layouts: parsing `[ FL, FR ]`, validating against a channel
//! count, and emitting the canonical `audio.position` value.

use std::fmt;
use std::str::FromStr;

use crate::error::{LoopbackError, Result};

/// Upper bound on channels per stream, matching the daemon's format limit.
pub const MAX_CHANNELS: usize = 64;

/// The map used when the user doesn't supply one.
pub const DEFAULT_CHANNEL_MAP: &str = loopconf::DEFAULT_CHANNEL_MAP;

/// A spatial role for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPosition {
    Unknown,
    NotAssociated,
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    SideLeft,
    SideRight,
    FrontLeftCenter,
    FrontRightCenter,
    RearCenter,
    RearLeft,
    RearRight,
    TopCenter,
    TopFrontLeft,
    TopFrontCenter,
    TopFrontRight,
    TopRearLeft,
    TopRearCenter,
    TopRearRight,
    RearLeftCenter,
    RearRightCenter,
    FrontLeftWide,
    FrontRightWide,
    LowFrequency2,
    FrontLeftHigh,
    FrontCenterHigh,
    FrontRightHigh,
    TopFrontLeftCenter,
    TopFrontRightCenter,
    TopSideLeft,
    TopSideRight,
    LeftLowFrequency,
    RightLowFrequency,
    BottomCenter,
    BottomLeftCenter,
    BottomRightCenter,
    Aux(u8),
}

const NAMED: &[(ChannelPosition, &str)] = &[
    (ChannelPosition::Unknown, "UNKNOWN"),
    (ChannelPosition::NotAssociated, "NA"),
    (ChannelPosition::Mono, "MONO"),
    (ChannelPosition::FrontLeft, "FL"),
    (ChannelPosition::FrontRight, "FR"),
    (ChannelPosition::FrontCenter, "FC"),
    (ChannelPosition::LowFrequency, "LFE"),
    (ChannelPosition::SideLeft, "SL"),
    (ChannelPosition::SideRight, "SR"),
    (ChannelPosition::FrontLeftCenter, "FLC"),
    (ChannelPosition::FrontRightCenter, "FRC"),
    (ChannelPosition::RearCenter, "RC"),
    (ChannelPosition::RearLeft, "RL"),
    (ChannelPosition::RearRight, "RR"),
    (ChannelPosition::TopCenter, "TC"),
    (ChannelPosition::TopFrontLeft, "TFL"),
    (ChannelPosition::TopFrontCenter, "TFC"),
    (ChannelPosition::TopFrontRight, "TFR"),
    (ChannelPosition::TopRearLeft, "TRL"),
    (ChannelPosition::TopRearCenter, "TRC"),
    (ChannelPosition::TopRearRight, "TRR"),
    (ChannelPosition::RearLeftCenter, "RLC"),
    (ChannelPosition::RearRightCenter, "RRC"),
    (ChannelPosition::FrontLeftWide, "FLW"),
    (ChannelPosition::FrontRightWide, "FRW"),
    (ChannelPosition::LowFrequency2, "LFE2"),
    (ChannelPosition::FrontLeftHigh, "FLH"),
    (ChannelPosition::FrontCenterHigh, "FCH"),
    (ChannelPosition::FrontRightHigh, "FRH"),
    (ChannelPosition::TopFrontLeftCenter, "TFLC"),
    (ChannelPosition::TopFrontRightCenter, "TFRC"),
    (ChannelPosition::TopSideLeft, "TSL"),
    (ChannelPosition::TopSideRight, "TSR"),
    (ChannelPosition::LeftLowFrequency, "LLFE"),
    (ChannelPosition::RightLowFrequency, "RLFE"),
    (ChannelPosition::BottomCenter, "BC"),
    (ChannelPosition::BottomLeftCenter, "BLC"),
    (ChannelPosition::BottomRightCenter, "BRC"),
];

impl ChannelPosition {
    /// Look up a position by its short name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        if let Some(n) = upper.strip_prefix("AUX") {
            return n
                .parse::<u8>()
                .ok()
                .filter(|n| (*n as usize) < MAX_CHANNELS)
                .map(ChannelPosition::Aux);
        }
        NAMED
            .iter()
            .find(|(_, short)| *short == upper)
            .map(|(pos, _)| *pos)
    }
}

impl fmt::Display for ChannelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let ChannelPosition::Aux(n) = self {
            return write!(f, "AUX{n}");
        }
        let name = NAMED
            .iter()
            .find(|(pos, _)| pos == self)
            .map(|(_, short)| *short)
            .unwrap_or("UNKNOWN");
        f.write_str(name)
    }
}

/// Ordered channel layout; the channel count is the number of positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    positions: Vec<ChannelPosition>,
}

impl ChannelMap {
    /// Parse `[ FL, FR ]` or `FL,FR`; whitespace-tolerant, names case-insensitive.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let body = match trimmed.strip_prefix('[') {
            Some(rest) => rest
                .strip_suffix(']')
                .ok_or_else(|| LoopbackError::invalid(format!("unbalanced channel map {text:?}")))?,
            None => trimmed,
        };

        let positions = body
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|name| !name.is_empty())
            .map(|name| {
                ChannelPosition::from_name(name).ok_or_else(|| {
                    LoopbackError::invalid(format!("unknown channel position {name:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        check_count(positions.len())?;
        Ok(Self { positions })
    }

    /// The layout for `channels` when none was given: the default map when
    /// the count matches it, otherwise all positions unknown.
    pub fn default_for(channels: u32) -> Result<Self> {
        check_count(channels as usize)?;
        let default = Self::parse(DEFAULT_CHANNEL_MAP)?;
        if default.channels() == channels {
            return Ok(default);
        }
        Ok(Self {
            positions: vec![ChannelPosition::Unknown; channels as usize],
        })
    }

    pub fn channels(&self) -> u32 {
        self.positions.len() as u32
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions
    }

    /// Enforce `len(positions) == channels`.
    pub fn validate(&self, channels: u32) -> Result<()> {
        check_count(channels as usize)?;
        if self.positions.len() != channels as usize {
            return Err(LoopbackError::ChannelMismatch {
                channels,
                positions: self.positions.len(),
            });
        }
        Ok(())
    }

    /// Canonical comma-separated form, the value of `audio.position`.
    pub fn positions_string(&self) -> String {
        self.to_string()
    }
}

fn check_count(channels: usize) -> Result<()> {
    if channels == 0 {
        return Err(LoopbackError::invalid("channel count must be at least 1"));
    }
    if channels > MAX_CHANNELS {
        return Err(LoopbackError::invalid(format!(
            "channel count {channels} exceeds the maximum of {MAX_CHANNELS}"
        )));
    }
    Ok(())
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pos) in self.positions.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{pos}")?;
        }
        Ok(())
    }
}

impl FromStr for ChannelMap {
    type Err = LoopbackError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_bracketed() {
        let map = ChannelMap::parse("[ FL, FR ]").unwrap();
        assert_eq!(
            map.positions(),
            &[ChannelPosition::FrontLeft, ChannelPosition::FrontRight]
        );
        assert_eq!(map.positions_string(), "FL,FR");
    }

    #[test]
    fn test_parse_bare_and_case_insensitive() {
        let map = ChannelMap::parse("fl,fr , lfe aux3").unwrap();
        assert_eq!(map.channels(), 4);
        assert_eq!(map.to_string(), "FL,FR,LFE,AUX3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["[ FL, XX ]", "[ FL", "", "[ ]", "AUX64"] {
            let err = ChannelMap::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "input {bad:?}");
        }
    }

    #[test]
    fn test_parse_rejects_too_many() {
        let text = vec!["FL"; MAX_CHANNELS + 1].join(",");
        assert!(ChannelMap::parse(&text).is_err());
    }

    #[test]
    fn test_validate() {
        let map = ChannelMap::parse("[ FL ]").unwrap();
        assert!(map.validate(1).is_ok());
        let err = map.validate(2).unwrap_err();
        assert!(matches!(
            err,
            LoopbackError::ChannelMismatch {
                channels: 2,
                positions: 1
            }
        ));
        assert_eq!(map.validate(0).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_default_for() {
        assert_eq!(ChannelMap::default_for(2).unwrap().to_string(), "FL,FR");
        assert_eq!(
            ChannelMap::default_for(3).unwrap().to_string(),
            "UNKNOWN,UNKNOWN,UNKNOWN"
        );
        assert!(ChannelMap::default_for(0).is_err());
        assert!(ChannelMap::default_for(MAX_CHANNELS as u32 + 1).is_err());
    }

    #[test]
    fn test_emit_then_parse_is_identity() {
        for text in ["MONO", "FL,FR,FC,LFE,SL,SR", "UNKNOWN,NA,AUX0,TFLC,BRC"] {
            let map = ChannelMap::parse(text).unwrap();
            assert_eq!(ChannelMap::parse(&map.to_string()).unwrap(), map);
        }
    }
}
