use crate::moves::MoveList;
use anyhow::{Context, Result};
use clap::Args;
use legato_core::{
    PathPlanner,
    axis::AxisMap,
    config::MachineConfig,
    pru::{Coprocessor, SimulatedPru, sim::SIMULATOR_IMAGE},
    shared_mem::SharedRing,
};
use std::{path::PathBuf, time::Instant};
use tracing::info;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the machine configuration (TOML or JSON).
    pub config: PathBuf,

    /// Path to the move list (TOML).
    pub moves: PathBuf,

    /// Firmware image for the coprocessor. The simulator runs without one.
    #[arg(long)]
    pub firmware: Option<PathBuf>,

    /// Slow the simulated coprocessor down (>1) or speed it up (<1).
    #[arg(long, default_value_t = 1.0)]
    pub time_scale: f64,

    /// Drive a real PRU through this remoteproc sysfs directory instead of
    /// the simulator, e.g. `/sys/class/remoteproc/remoteproc1`.
    #[arg(long, requires_all = ["uio_map", "firmware"])]
    pub remoteproc: Option<PathBuf>,

    /// UIO map holding the shared ring, e.g. `/sys/class/uio/uio0/maps/map1`.
    #[arg(long)]
    pub uio_map: Option<PathBuf>,

    /// Directory remoteproc loads firmware from.
    #[arg(long, default_value = "/lib/firmware")]
    pub firmware_dir: PathBuf,
}

impl RunArgs {
    pub fn run(&self) -> Result<()> {
        let config = MachineConfig::from_file(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        let moves = MoveList::from_file(&self.moves)?;

        let (ring, coprocessor) = self.coprocessor(&config)?;
        let planner = PathPlanner::from_config(&config, ring, coprocessor)
            .context("failed to start the planner")?;
        planner.on_alarm(|alarm| eprintln!("alarm: {alarm}"));

        match &self.firmware {
            Some(path) => planner
                .load_firmware(path)
                .with_context(|| format!("failed to load firmware {}", path.display()))?,
            None => planner.load_firmware_image(SIMULATOR_IMAGE.to_vec())?,
        }

        let started = Instant::now();
        for (i, mv) in moves.moves.iter().enumerate() {
            let path = mv.to_path().with_context(|| format!("move {i}"))?;
            planner
                .add_path(path)
                .with_context(|| format!("move {i} rejected"))?;
        }
        planner.wait_until_done()?;
        info!(moves = moves.moves.len(), elapsed = ?started.elapsed(), "move list done");

        println!("ideal:    {}", format_position(&planner.get_current_pos(true, true)?));
        println!("executed: {}", format_position(&planner.get_current_pos(true, false)?));
        Ok(())
    }

    fn coprocessor(&self, config: &MachineConfig) -> Result<(SharedRing, Box<dyn Coprocessor>)> {
        let capacity = config.channel.ring_capacity;
        if let (Some(sysfs), Some(uio_map)) = (&self.remoteproc, &self.uio_map) {
            return remoteproc(sysfs, uio_map, &self.firmware_dir, capacity);
        }

        let ring = SharedRing::anonymous(capacity).context("failed to allocate the step ring")?;
        let pru = SimulatedPru::new(ring.clone(), config.channel.timing())
            .with_time_scale(self.time_scale);
        Ok((ring, Box::new(pru)))
    }
}

#[cfg(target_os = "linux")]
fn remoteproc(
    sysfs: &std::path::Path,
    uio_map: &std::path::Path,
    firmware_dir: &std::path::Path,
    capacity: u32,
) -> Result<(SharedRing, Box<dyn Coprocessor>)> {
    use legato_core::pru::RemoteProc;

    let ring = SharedRing::map_uio(uio_map, capacity)
        .with_context(|| format!("failed to map {}", uio_map.display()))?;
    let unit = RemoteProc::new(sysfs, firmware_dir, "legato-pru0.out");
    Ok((ring, Box::new(unit)))
}

#[cfg(not(target_os = "linux"))]
fn remoteproc(
    _sysfs: &std::path::Path,
    _uio_map: &std::path::Path,
    _firmware_dir: &std::path::Path,
    _capacity: u32,
) -> Result<(SharedRing, Box<dyn Coprocessor>)> {
    anyhow::bail!("remoteproc coprocessors are only available on Linux")
}

fn format_position(position: &AxisMap) -> String {
    position
        .iter()
        .map(|(axis, value)| format!("{axis}={value:.3}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(config: PathBuf, moves: PathBuf) -> RunArgs {
        RunArgs {
            config,
            moves,
            firmware: None,
            time_scale: 1.0,
            remoteproc: None,
            uio_map: None,
            firmware_dir: PathBuf::from("/lib/firmware"),
        }
    }

    #[test]
    fn runs_a_move_list_on_the_simulator() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("machine.toml");
        fs::write(&config, "[planner]\nqueue_capacity = 4\n").unwrap();
        let moves = dir.path().join("moves.toml");
        fs::write(
            &moves,
            "[[move]]\nkind = \"absolute\"\nx = 1.0\n\n[[move]]\nkind = \"relative\"\ny = 0.5\n",
        )
        .unwrap();
        args(config, moves).run().unwrap();
    }

    #[test]
    fn rejected_move_names_its_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("machine.toml");
        fs::write(&config, "[axes.x]\nsoft_max = 0.005\n").unwrap();
        let moves = dir.path().join("moves.toml");
        fs::write(
            &moves,
            "[[move]]\nkind = \"absolute\"\nx = 1.0\n\n[[move]]\nkind = \"absolute\"\nx = 10.0\n",
        )
        .unwrap();
        let err = args(config, moves).run().unwrap_err();
        assert_eq!(err.to_string(), "move 1 rejected");
    }
}
