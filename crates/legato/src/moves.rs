// Move lists for the harness, in millimeters

use anyhow::{Context, Result, bail};
use legato_core::{
    axis::{Axis, AxisMap},
    path::{Movement, Path},
};
use serde::Deserialize;
use std::{fs, path::Path as FsPath};

const MM: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveKind {
    Absolute,
    Relative,
    SetPosition,
}

/// One entry of a move list. Positions are millimeters, `feed_rate` is
/// mm/s and `acceleration` mm/s².
#[derive(Debug, Clone, Deserialize)]
pub struct Move {
    pub kind: MoveKind,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
    pub h: Option<f64>,
    #[serde(default = "default_feed_rate")]
    pub feed_rate: f64,
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    #[serde(default)]
    pub cancellable: bool,
}

fn default_feed_rate() -> f64 {
    50.0
}

fn default_acceleration() -> f64 {
    500.0
}

#[derive(Debug, Deserialize)]
pub struct MoveList {
    #[serde(rename = "move", default)]
    pub moves: Vec<Move>,
}

impl MoveList {
    pub fn from_file(path: &FsPath) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read move list {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse move list {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

impl Move {
    /// Convert to a planner path in SI units.
    pub fn to_path(&self) -> Result<Path> {
        let axes: AxisMap = [
            (Axis::X, self.x),
            (Axis::Y, self.y),
            (Axis::Z, self.z),
            (Axis::E, self.e),
            (Axis::H, self.h),
        ]
        .into_iter()
        .filter_map(|(axis, value)| value.map(|v| (axis, v / MM)))
        .collect();
        if axes.is_empty() {
            bail!("move names no axis");
        }

        let movement = match self.kind {
            MoveKind::Absolute => Movement::Absolute,
            MoveKind::Relative => Movement::Relative,
            MoveKind::SetPosition => return Ok(Path::set_position(axes)),
        };
        Ok(Path::new(
            movement,
            axes,
            self.feed_rate / MM,
            self.acceleration / MM,
            self.cancellable,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_converts_to_meters() {
        let list = MoveList::from_toml(
            r#"
[[move]]
kind = "set_position"
x = 0.0

[[move]]
kind = "absolute"
x = 10.0
y = 5.0
feed_rate = 100.0
acceleration = 1000.0

[[move]]
kind = "relative"
e = 1.5
cancellable = true
"#,
        )
        .unwrap();
        assert_eq!(list.moves.len(), 3);

        let reset = list.moves[0].to_path().unwrap();
        assert!(reset.is_set_position());

        let absolute = list.moves[1].to_path().unwrap();
        assert_eq!(absolute.movement(), Movement::Absolute);
        assert_eq!(absolute.axes()[&Axis::X], 0.01);
        assert_eq!(absolute.axes()[&Axis::Y], 0.005);
        assert_eq!(absolute.requested_speed(), 0.1);
        assert_eq!(absolute.requested_acceleration(), 1.0);

        let relative = list.moves[2].to_path().unwrap();
        assert!(relative.is_cancellable());
        assert_eq!(relative.requested_speed(), 0.05);
    }

    #[test]
    fn rejects_moves_without_axes() {
        let list = MoveList::from_toml("[[move]]\nkind = \"absolute\"\n").unwrap();
        assert!(list.moves[0].to_path().is_err());
    }
}
