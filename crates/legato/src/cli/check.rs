use anyhow::{Context, Result};
use clap::Args;
use legato_core::{axis::Axis, config::MachineConfig, kinematics::KinematicMode};
use std::path::PathBuf;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the machine configuration (TOML or JSON).
    pub config: PathBuf,
}

impl CheckArgs {
    pub fn run(&self) -> Result<()> {
        let config = MachineConfig::from_file(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration {}", self.config.display()))?;

        println!("kinematics: {:?}", config.kinematics);
        match config.kinematics {
            KinematicMode::Cartesian => {}
            KinematicMode::BeltXy => println!("belt matrix: {:?}", config.belt.0),
            KinematicMode::Delta => {
                let delta = &config.delta;
                let columns = delta.radius - delta.effector_offset - delta.carriage_offset;
                println!(
                    "delta: rod {:.1} mm, column radius {:.1} mm, reachable radius {:.1} mm",
                    delta.rod_length * 1000.0,
                    columns * 1000.0,
                    (delta.rod_length - columns) * 1000.0
                );
            }
        }

        for (axis, limits) in Axis::ALL.into_iter().zip(config.axes.to_array()) {
            println!(
                "{axis}: {:.0} steps/m, speed {}..{} m/s, accel {} m/s², jerk {} m/s",
                limits.steps_per_meter,
                limits.min_speed,
                limits.max_speed,
                limits.acceleration,
                limits.jerk
            );
            if limits.soft_min.is_some() || limits.soft_max.is_some() {
                println!(
                    "   travel {} .. {} m",
                    limits.soft_min.unwrap_or(f64::NEG_INFINITY),
                    limits.soft_max.unwrap_or(f64::INFINITY)
                );
            }
            if limits.backlash > 0.0 {
                println!("   backlash {} m", limits.backlash);
            }
        }
        if !config.bed.is_flat() {
            println!("bed compensation: {:?}", config.bed.coefficients());
        }
        println!(
            "queue depth {}, ring {} records ({:.0}% watermark)",
            config.planner.queue_capacity,
            config.channel.ring_capacity,
            config.channel.high_watermark * 100.0
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn accepts_valid_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("machine.toml");
        fs::write(
            &config,
            "kinematics = \"delta\"\n[axes.z]\nsoft_min = 0.0\nsoft_max = 0.25\nbacklash = 0.0001\n",
        )
        .unwrap();
        CheckArgs { config }.run().unwrap();
    }

    #[test]
    fn rejects_invalid_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("machine.toml");
        fs::write(&config, "[axes.y]\nmax_speed = 0.0\n").unwrap();
        let err = CheckArgs { config }.run().unwrap_err();
        assert!(err.to_string().starts_with("invalid configuration"), "{err}");

        let missing = dir.path().join("missing.toml");
        let err = CheckArgs { config: missing }.run().unwrap_err();
        assert!(err.to_string().starts_with("failed to load"), "{err}");
    }
}
