// Normalized (0..1000) model coordinates → viewport pixels.
use serde::{Deserialize, Serialize};

use crate::errors::{WebClawError, WebClawResult};

/// Upper bound (exclusive) of the normalized coordinate space the model speaks in.
pub const NORMALIZED_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Converts a normalized pair to pixels: `floor(n * dim / 1000)` per axis.
///
/// Inputs outside `[0, 1000)` are rejected rather than clamped, so a bad
/// coordinate never lands on a neighbouring element.
pub fn denormalize(x_norm: f64, y_norm: f64, viewport: Viewport) -> WebClawResult<(u32, u32)> {
    let x = denormalize_axis("x", x_norm, viewport.width)?;
    let y = denormalize_axis("y", y_norm, viewport.height)?;
    Ok((x, y))
}

fn denormalize_axis(axis: &str, value: f64, dim: u32) -> WebClawResult<u32> {
    if !value.is_finite() || !(0.0..NORMALIZED_SCALE).contains(&value) {
        return Err(WebClawError::InvalidCoordinate(format!(
            "{axis}={value} is outside [0, 1000)"
        )));
    }
    let px = (value * dim as f64 / NORMALIZED_SCALE).floor() as u32;
    // Guard against float rounding pushing a 999.999.. input onto `dim`.
    Ok(px.min(dim.saturating_sub(1)))
}

/// Reads `x`/`y` style keys from tool-call arguments and maps them to pixels.
pub fn denormalize_args(
    args: &serde_json::Map<String, serde_json::Value>,
    x_key: &str,
    y_key: &str,
    viewport: Viewport,
) -> WebClawResult<(u32, u32)> {
    let x = number_arg(args, x_key)?;
    let y = number_arg(args, y_key)?;
    denormalize(x, y, viewport)
}

fn number_arg(args: &serde_json::Map<String, serde_json::Value>, key: &str) -> WebClawResult<f64> {
    match args.get(key) {
        Some(v) => v.as_f64().ok_or_else(|| {
            WebClawError::InvalidCoordinate(format!("'{key}' must be a number, got {v}"))
        }),
        None => Err(WebClawError::ActionExecution(format!(
            "missing '{key}' argument"
        ))),
    }
}

/// Scales a normalized scroll magnitude against one viewport dimension.
pub fn scale_magnitude(magnitude: f64, dim: u32) -> i64 {
    (magnitude.max(0.0) * dim as f64 / NORMALIZED_SCALE).round() as i64
}
