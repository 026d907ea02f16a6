// Shared setup for the planner integration tests

#![allow(dead_code)]

use legato_core::{
    PathPlanner,
    axis::{Axis, AxisMap},
    config::{MachineConfig, PlannerConfig},
    pru::{SimHandle, SimulatedPru, sim::SIMULATOR_IMAGE},
    shared_mem::SharedRing,
    step_channel::ChannelConfig,
};
use std::{
    thread,
    time::{Duration, Instant},
};

pub struct Rig {
    pub planner: PathPlanner<SimulatedPru>,
    pub sim: SimHandle,
}

pub fn rig(config: MachineConfig, time_scale: f64) -> Rig {
    let ring = SharedRing::anonymous(config.channel.ring_capacity).unwrap();
    let pru = SimulatedPru::new(ring.clone(), config.channel.timing()).with_time_scale(time_scale);
    let sim = pru.handle();
    let planner = PathPlanner::from_config(&config, ring, pru).unwrap();
    planner.load_firmware_image(SIMULATOR_IMAGE.to_vec()).unwrap();
    Rig { planner, sim }
}

pub fn config(ring_capacity: u32, queue_capacity: usize) -> MachineConfig {
    MachineConfig {
        planner: PlannerConfig {
            queue_capacity,
            ..PlannerConfig::default()
        },
        channel: ChannelConfig {
            ring_capacity,
            ..ChannelConfig::default()
        },
        ..MachineConfig::default()
    }
}

pub fn axes(values: &[(Axis, f64)]) -> AxisMap {
    values.iter().copied().collect()
}

pub fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}
