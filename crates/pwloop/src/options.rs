//! Translate user options into the per-direction stream configuration.

use crate::channel_map::ChannelMap;
use crate::daemon::{AudioFormat, Direction};
use crate::error::{LoopbackError, Result};
use crate::properties::{keys, Properties};
use crate::stream::StreamConfig;

/// Options as the user supplied them, after config and CLI layering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackOptions {
    pub remote: Option<String>,
    /// Node group shared by both streams; `None` leaves them ungrouped.
    pub group: Option<String>,
    pub channels: u32,
    /// Explicit layout, validated against `channels`.
    pub channel_map: Option<String>,
    pub latency_ms: Option<u32>,
    /// Rate used to convert `latency_ms` into frames.
    pub rate: u32,
    pub capture_target: Option<String>,
    pub playback_target: Option<String>,
    /// Property bag merged into the capture stream last.
    pub capture_props: Option<String>,
    /// Property bag merged into the playback stream last.
    pub playback_props: Option<String>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            remote: None,
            group: None,
            channels: loopconf::DEFAULT_CHANNELS,
            channel_map: None,
            latency_ms: None,
            rate: loopconf::DEFAULT_RATE,
            capture_target: None,
            playback_target: None,
            capture_props: None,
            playback_props: None,
        }
    }
}

/// Resolved configuration for both streams of one loopback.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPlan {
    pub capture: StreamConfig,
    pub playback: StreamConfig,
    pub rate: u32,
    pub latency_frames: Option<u32>,
}

impl LoopbackOptions {
    /// Validate and build both stream configs. Nothing touches the daemon.
    pub fn resolve(&self) -> Result<StreamPlan> {
        let channel_map = match &self.channel_map {
            Some(text) => {
                let map = ChannelMap::parse(text)?;
                map.validate(self.channels)?;
                map
            }
            None => ChannelMap::default_for(self.channels)?,
        };
        if self.rate == 0 {
            return Err(LoopbackError::invalid("rate must be positive"));
        }

        let latency_frames = self
            .latency_ms
            .map(|ms| latency_frames(ms, self.rate))
            .filter(|frames| *frames > 0);

        let capture_overlay = parse_overlay("capture", self.capture_props.as_deref())?;
        let playback_overlay = parse_overlay("playback", self.playback_props.as_deref())?;
        let pinned = pinned_rate(&capture_overlay, &playback_overlay)?;
        let format = AudioFormat::planar_f32(self.channels).with_rate(pinned);

        let side = |direction: Direction, target: &Option<String>, overlay: &Properties| {
            let role = match direction {
                Direction::Input => "capture",
                Direction::Output => "playback",
            };
            let mut props = Properties::new();
            if let Some(group) = &self.group {
                props.set_fmt(keys::NODE_NAME, format_args!("{group}.{role}"));
                props.insert(keys::NODE_GROUP, group.as_str());
            }
            props.set_fmt(keys::NODE_DESCRIPTION, format_args!("Loopback {role}"));
            props.insert(keys::MEDIA_TYPE, "Audio");
            if let Some(frames) = latency_frames {
                props.set_fmt(keys::NODE_LATENCY, format_args!("{}/{}", frames, self.rate));
            }
            props.set(keys::NODE_TARGET, target.as_deref());
            props.set_fmt(keys::AUDIO_CHANNELS, format_args!("{}", self.channels));
            props.insert(keys::AUDIO_POSITION, channel_map.positions_string());
            props.extend_from(overlay);

            // An overlay may restate the layout, but not change the count.
            let channel_map = match overlay.get(keys::AUDIO_POSITION) {
                Some(positions) => ChannelMap::parse(positions)?,
                None => channel_map.clone(),
            };
            props.insert(keys::AUDIO_POSITION, channel_map.positions_string());
            let config = StreamConfig {
                direction,
                role: role.to_string(),
                target: props.get(keys::NODE_TARGET).map(str::to_string),
                group: props.get(keys::NODE_GROUP).map(str::to_string),
                latency_frames,
                format,
                channel_map,
                props,
            };
            config.validate()?;
            Ok::<_, LoopbackError>(config)
        };

        Ok(StreamPlan {
            capture: side(Direction::Input, &self.capture_target, &capture_overlay)?,
            playback: side(Direction::Output, &self.playback_target, &playback_overlay)?,
            rate: self.rate,
            latency_frames,
        })
    }
}

/// `round(ms * rate / 1000)`.
pub fn latency_frames(ms: u32, rate: u32) -> u32 {
    let frames = (u64::from(ms) * u64::from(rate) + 500) / 1000;
    u32::try_from(frames).unwrap_or(u32::MAX)
}

fn parse_overlay(side: &str, text: Option<&str>) -> Result<Properties> {
    let mut props = Properties::new();
    if let Some(text) = text {
        props
            .update_from_string(text)
            .map_err(|e| LoopbackError::invalid(format!("{side} properties: {e}")))?;
    }
    Ok(props)
}

/// A rate both overlays agree on. Differing explicit rates would play back
/// pitched, so they are refused.
fn pinned_rate(capture: &Properties, playback: &Properties) -> Result<Option<u32>> {
    let parse = |props: &Properties| -> Result<Option<u32>> {
        props
            .get(keys::AUDIO_RATE)
            .map(|v| {
                v.trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|rate| *rate > 0)
                    .ok_or_else(|| LoopbackError::invalid(format!("bad audio.rate {v:?}")))
            })
            .transpose()
    };

    match (parse(capture)?, parse(playback)?) {
        (Some(a), Some(b)) if a != b => Err(LoopbackError::invalid(format!(
            "capture rate {a} and playback rate {b} differ; no resampling is done"
        ))),
        (Some(a), Some(_)) => Ok(Some(a)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let opts = LoopbackOptions {
            group: Some("pw-loopback-42".into()),
            ..Default::default()
        };
        let plan = opts.resolve().unwrap();

        for cfg in [&plan.capture, &plan.playback] {
            assert_eq!(cfg.props.get(keys::NODE_GROUP), Some("pw-loopback-42"));
            assert_eq!(cfg.props.get(keys::AUDIO_CHANNELS), Some("2"));
            assert_eq!(cfg.props.get(keys::AUDIO_POSITION), Some("FL,FR"));
            assert_eq!(cfg.props.get(keys::NODE_LATENCY), None);
            assert_eq!(cfg.props.get(keys::NODE_TARGET), None);
            assert_eq!(cfg.format, AudioFormat::planar_f32(2));
        }
        assert_eq!(plan.capture.direction, Direction::Input);
        assert_eq!(plan.playback.direction, Direction::Output);
        assert_eq!(
            plan.capture.props.get(keys::NODE_NAME),
            Some("pw-loopback-42.capture")
        );
    }

    #[test]
    fn test_explicit_endpoints_and_latency() {
        let opts = LoopbackOptions {
            channels: 1,
            channel_map: Some("[ MONO ]".into()),
            latency_ms: Some(20),
            capture_target: Some("source-A".into()),
            playback_target: Some("sink-B".into()),
            ..Default::default()
        };
        let plan = opts.resolve().unwrap();

        assert_eq!(plan.capture.props.get(keys::NODE_TARGET), Some("source-A"));
        assert_eq!(plan.playback.props.get(keys::NODE_TARGET), Some("sink-B"));
        assert_eq!(plan.capture.target.as_deref(), Some("source-A"));
        for cfg in [&plan.capture, &plan.playback] {
            assert_eq!(cfg.props.get(keys::NODE_LATENCY), Some("960/48000"));
            assert_eq!(cfg.props.get(keys::AUDIO_CHANNELS), Some("1"));
            assert_eq!(cfg.props.get(keys::AUDIO_POSITION), Some("MONO"));
        }
        assert_eq!(plan.latency_frames, Some(960));
    }

    #[test]
    fn test_map_mismatch_is_invalid() {
        let opts = LoopbackOptions {
            channels: 2,
            channel_map: Some("[ FL ]".into()),
            ..Default::default()
        };
        let err = opts.resolve().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_channel_bounds() {
        for channels in [0, 65] {
            let opts = LoopbackOptions {
                channels,
                ..Default::default()
            };
            assert_eq!(
                opts.resolve().unwrap_err().kind(),
                ErrorKind::InvalidArgument
            );
        }
        let opts = LoopbackOptions {
            channels: 6,
            ..Default::default()
        };
        let plan = opts.resolve().unwrap();
        assert_eq!(
            plan.capture.props.get(keys::AUDIO_POSITION),
            Some("UNKNOWN,UNKNOWN,UNKNOWN,UNKNOWN,UNKNOWN,UNKNOWN")
        );
    }

    #[test]
    fn test_latency_rounding() {
        assert_eq!(latency_frames(20, 48000), 960);
        assert_eq!(latency_frames(1, 44100), 44);
        assert_eq!(latency_frames(0, 48000), 0);

        // Rounds to zero frames: accepted and omitted.
        let opts = LoopbackOptions {
            latency_ms: Some(1),
            rate: 400,
            ..Default::default()
        };
        let plan = opts.resolve().unwrap();
        assert_eq!(plan.latency_frames, None);
        assert_eq!(plan.capture.props.get(keys::NODE_LATENCY), None);
    }

    #[test]
    fn test_overlay_wins() {
        let opts = LoopbackOptions {
            group: Some("mygroup".into()),
            capture_props: Some("node.group=other".into()),
            ..Default::default()
        };
        let plan = opts.resolve().unwrap();
        assert_eq!(plan.capture.props.get(keys::NODE_GROUP), Some("other"));
        assert_eq!(plan.capture.group.as_deref(), Some("other"));
        assert_eq!(plan.playback.props.get(keys::NODE_GROUP), Some("mygroup"));
    }

    #[test]
    fn test_overlay_target_overrides_flag() {
        let opts = LoopbackOptions {
            capture_target: Some("source-A".into()),
            capture_props: Some("{ node.target = \"source-B\" }".into()),
            ..Default::default()
        };
        let plan = opts.resolve().unwrap();
        assert_eq!(plan.capture.target.as_deref(), Some("source-B"));
    }

    #[test]
    fn test_malformed_overlay() {
        let opts = LoopbackOptions {
            playback_props: Some("media.role=\"unterminated".into()),
            ..Default::default()
        };
        assert_eq!(
            opts.resolve().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_overlay_cannot_change_channel_count() {
        let opts = LoopbackOptions {
            capture_props: Some("audio.position=FL audio.channels=3".into()),
            ..Default::default()
        };
        assert_eq!(
            opts.resolve().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let short_map = LoopbackOptions {
            playback_props: Some("audio.position=FL".into()),
            ..Default::default()
        };
        assert_eq!(
            short_map.resolve().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let bad_count = LoopbackOptions {
            capture_props: Some("audio.channels=two".into()),
            ..Default::default()
        };
        assert_eq!(
            bad_count.resolve().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_overlay_may_restate_layout() {
        let opts = LoopbackOptions {
            capture_props: Some("audio.channels=2 audio.position=[ FR FL ]".into()),
            ..Default::default()
        };
        let plan = opts.resolve().unwrap();
        assert_eq!(plan.capture.channel_map.to_string(), "FR,FL");
        assert_eq!(plan.capture.props.get(keys::AUDIO_POSITION), Some("FR,FL"));
        assert_eq!(plan.playback.channel_map.to_string(), "FL,FR");
        assert_eq!(plan.capture.format.channels, plan.playback.format.channels);
    }

    #[test]
    fn test_rate_pinning() {
        let conflicting = LoopbackOptions {
            capture_props: Some("audio.rate=44100".into()),
            playback_props: Some("audio.rate=48000".into()),
            ..Default::default()
        };
        assert_eq!(
            conflicting.resolve().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let agreeing = LoopbackOptions {
            capture_props: Some("audio.rate=44100".into()),
            playback_props: Some("audio.rate=44100".into()),
            ..Default::default()
        };
        let plan = agreeing.resolve().unwrap();
        assert_eq!(plan.capture.format.rate, Some(44100));
        assert_eq!(plan.playback.format, plan.capture.format);

        let one_sided = LoopbackOptions {
            capture_props: Some("audio.rate=44100".into()),
            ..Default::default()
        };
        assert_eq!(one_sided.resolve().unwrap().capture.format.rate, None);
    }
}
