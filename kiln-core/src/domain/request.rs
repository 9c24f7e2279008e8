//! Generation request types and their validation

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_PROMPT_CHARS: usize = 3;
const MAX_PROMPT_CHARS: usize = 500;
const MIN_STEPS: u32 = 10;
const MAX_STEPS: u32 = 100;
const MIN_CFG_SCALE: f32 = 1.0;
const MAX_CFG_SCALE: f32 = 20.0;

/// Request parameters rejected before a job is created
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Art style understood by the backend workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Style {
    #[serde(rename = "pixel_art")]
    PixelArt,
    #[serde(rename = "16bit")]
    SixteenBit,
    #[serde(rename = "8bit")]
    EightBit,
    #[serde(rename = "retro")]
    Retro,
    #[serde(rename = "game_sprite")]
    GameSprite,
}

impl Style {
    pub const ALL: [Style; 5] = [
        Style::PixelArt,
        Style::SixteenBit,
        Style::EightBit,
        Style::Retro,
        Style::GameSprite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Style::PixelArt => "pixel_art",
            Style::SixteenBit => "16bit",
            Style::EightBit => "8bit",
            Style::Retro => "retro",
            Style::GameSprite => "game_sprite",
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Style {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Style::ALL
            .into_iter()
            .find(|style| style.as_str() == normalized)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Style::ALL.iter().map(Style::as_str).collect();
                ValidationError::new("style", format!("must be one of: {}", allowed.join(", ")))
            })
    }
}

/// Output image size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const ALLOWED: [Resolution; 3] = [
        Resolution::square(512),
        Resolution::square(1024),
        Resolution::square(2048),
    ];

    pub const fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }

    pub fn is_allowed(&self) -> bool {
        Self::ALLOWED.contains(self)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::square(1024)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ValidationError::new(
                "resolution",
                "must be in format WIDTHxHEIGHT (e.g. 1024x1024)",
            )
        };
        let (width, height) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        Ok(Self {
            width: width.parse().map_err(|_| invalid())?,
            height: height.parse().map_err(|_| invalid())?,
        })
    }
}

/// Generation parameters shared by every job of a request or batch
///
/// Missing fields deserialize to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub style: Style,
    pub resolution: Resolution,
    pub steps: u32,
    pub cfg_scale: f32,
    pub lora: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            style: Style::PixelArt,
            resolution: Resolution::default(),
            steps: 30,
            cfg_scale: 7.5,
            lora: None,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.resolution.is_allowed() {
            let allowed: Vec<String> = Resolution::ALLOWED.iter().map(|r| r.to_string()).collect();
            return Err(ValidationError::new(
                "resolution",
                format!("must be one of: {}", allowed.join(", ")),
            ));
        }

        if !(MIN_STEPS..=MAX_STEPS).contains(&self.steps) {
            return Err(ValidationError::new(
                "steps",
                format!("must be between {MIN_STEPS} and {MAX_STEPS}"),
            ));
        }

        if !self.cfg_scale.is_finite() || !(MIN_CFG_SCALE..=MAX_CFG_SCALE).contains(&self.cfg_scale)
        {
            return Err(ValidationError::new(
                "cfg_scale",
                format!("must be between {MIN_CFG_SCALE} and {MAX_CFG_SCALE}"),
            ));
        }

        if self.lora.as_deref().is_some_and(|lora| lora.trim().is_empty()) {
            return Err(ValidationError::new("lora", "cannot be blank"));
        }

        Ok(())
    }
}

/// The immutable parameters of one generation job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub prompt: String,
    #[serde(default)]
    pub params: GenerationParams,
}

impl JobRequest {
    /// Creates a request with default generation parameters
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: GenerationParams::default(),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Checks every field; a request that fails never becomes a job
    pub fn validate(&self) -> Result<(), ValidationError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(ValidationError::new("prompt", "cannot be empty"));
        }

        let chars = prompt.chars().count();
        if chars < MIN_PROMPT_CHARS {
            return Err(ValidationError::new(
                "prompt",
                format!("must be at least {MIN_PROMPT_CHARS} characters"),
            ));
        }
        if chars > MAX_PROMPT_CHARS {
            return Err(ValidationError::new(
                "prompt",
                format!("must be at most {MAX_PROMPT_CHARS} characters"),
            ));
        }

        self.params.validate()
    }
}
