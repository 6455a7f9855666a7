use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// What `start_source` was asked to open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceSpec {
    /// Local capture device, `/dev/videoN` or an explicit path
    Device(PathBuf),
    /// Network stream, anything with a scheme
    Url(String),
    /// Synthetic moving test pattern
    Pattern { width: u32, height: u32 },
}

impl SourceSpec {
    pub const DEFAULT_PATTERN: (u32, u32) = (640, 360);

    /// Accepts a device index (`0`), a device path, a URL containing `://`,
    /// or `pattern[:WxH]`
    pub fn parse(spec: &str) -> Result<Self, SourceError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(SourceError::unavailable(spec, "empty source"));
        }

        if spec.contains("://") {
            return Ok(Self::Url(spec.to_string()));
        }

        if let Some(rest) = spec.strip_prefix("pattern") {
            let (width, height) = match rest.strip_prefix(':') {
                None if rest.is_empty() => Self::DEFAULT_PATTERN,
                Some(size) => parse_size(size)
                    .ok_or_else(|| SourceError::unavailable(spec, "pattern size must be WxH"))?,
                None => return Err(SourceError::unavailable(spec, "unknown source")),
            };
            return Ok(Self::Pattern { width, height });
        }

        if let Ok(index) = spec.parse::<u32>() {
            return Ok(Self::Device(PathBuf::from(format!("/dev/video{index}"))));
        }

        if spec.starts_with('/') {
            return Ok(Self::Device(PathBuf::from(spec)));
        }

        Err(SourceError::unavailable(
            spec,
            "expected a device index, device path, stream URL or pattern[:WxH]",
        ))
    }
}

fn parse_size(size: &str) -> Option<(u32, u32)> {
    let (w, h) = size.split_once(['x', 'X'])?;
    let (w, h) = (w.parse().ok()?, h.parse().ok()?);
    (w > 0 && h > 0).then_some((w, h))
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
            Self::Pattern { width, height } => write!(f, "pattern:{width}x{height}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_form() {
        assert_eq!(
            SourceSpec::parse("0").unwrap(),
            SourceSpec::Device("/dev/video0".into())
        );
        assert_eq!(
            SourceSpec::parse("/dev/video2").unwrap(),
            SourceSpec::Device("/dev/video2".into())
        );
        assert_eq!(
            SourceSpec::parse("rtsp://cam.local/stream").unwrap(),
            SourceSpec::Url("rtsp://cam.local/stream".into())
        );
        assert_eq!(
            SourceSpec::parse("pattern").unwrap(),
            SourceSpec::Pattern {
                width: 640,
                height: 360
            }
        );
        assert_eq!(
            SourceSpec::parse("pattern:320x240").unwrap(),
            SourceSpec::Pattern {
                width: 320,
                height: 240
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "camera", "pattern:0x10", "pattern:wide", "patterns", "-1"] {
            assert!(
                matches!(SourceSpec::parse(bad), Err(SourceError::Unavailable { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn display_round_trips_for_logs() {
        let spec = SourceSpec::parse("pattern:8x4").unwrap();
        assert_eq!(spec.to_string(), "pattern:8x4");
    }
}
