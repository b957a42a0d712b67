//! Messages between the controlling application and the media worker
//!
//! Inbound:
//!   initialize (hands over the render surface)
//!   play       (source locator, starts pipeline + render loop)
//!   stop       (halts the render loop and tears the session down)
//!
//! Outbound notifications are serializable so a front-end can forward them
//! as JSON lines.

use crate::render::SharedSurface;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("Empty source locator")]
    Empty,
    #[error("Unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("Invalid file URL: {0}")]
    InvalidFileUrl(String),
}

/// Where the video comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// http:// or https:// resource
    Http(Url),
    /// Local file, either a plain path or a file:// URL
    File(PathBuf),
}

impl FromStr for SourceLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocatorError::Empty);
        }

        match Url::parse(s) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(SourceLocator::Http(url)),
                "file" => url
                    .to_file_path()
                    .map(SourceLocator::File)
                    .map_err(|_| LocatorError::InvalidFileUrl(s.to_string())),
                // Windows drive letters parse as a one-letter scheme
                scheme if scheme.len() == 1 => Ok(SourceLocator::File(PathBuf::from(s))),
                scheme => Err(LocatorError::UnsupportedScheme(scheme.to_string())),
            },
            Err(_) => Ok(SourceLocator::File(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Http(url) => write!(f, "{}", url),
            SourceLocator::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Controller → worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Hand over the surface frames are painted into
    Initialize { surface: SharedSurface },
    /// Start streaming from `source`
    Play { source: String },
    /// Halt the render loop
    Stop,
}

/// Worker → controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum WorkerEvent {
    InitializeDone,
    /// Pipeline primed, render loop running
    Playing {
        codec: String,
        width: u32,
        height: u32,
    },
    /// Every frame of the stream was presented
    Ended,
    /// Render loop halted after a stop request
    Stopped,
    /// Fatal pipeline failure; the session is gone
    Error { message: String },
}
