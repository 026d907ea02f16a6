// Linux remoteproc backend - drives a PRU through its sysfs attributes

use crate::{pru::Coprocessor, step_channel::ChannelError};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// A coprocessor managed by the kernel's remoteproc framework.
///
/// `sysfs_dir` is the unit's directory, e.g.
/// `/sys/class/remoteproc/remoteproc1`; images are installed into
/// `firmware_dir` (normally `/lib/firmware`) under `firmware_name`.
#[derive(Debug, Clone)]
pub struct RemoteProc {
    sysfs_dir: PathBuf,
    firmware_dir: PathBuf,
    firmware_name: String,
}

impl RemoteProc {
    pub fn new(
        sysfs_dir: impl Into<PathBuf>,
        firmware_dir: impl Into<PathBuf>,
        firmware_name: impl Into<String>,
    ) -> Self {
        Self {
            sysfs_dir: sysfs_dir.into(),
            firmware_dir: firmware_dir.into(),
            firmware_name: firmware_name.into(),
        }
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.sysfs_dir.join(name)
    }

    pub fn state(&self) -> Result<String, ChannelError> {
        let path = self.attr("state");
        fs::read_to_string(&path)
            .map(|s| s.trim().to_owned())
            .map_err(|source| ChannelError::io("read", &path, source))
    }

    fn write(path: &Path, contents: &[u8]) -> Result<(), ChannelError> {
        fs::write(path, contents).map_err(|source| ChannelError::io("write", path, source))
    }
}

impl Coprocessor for RemoteProc {
    fn halt(&mut self) -> Result<(), ChannelError> {
        if self.state()? == "running" {
            debug!(unit = %self.sysfs_dir.display(), "stopping coprocessor");
            Self::write(&self.attr("state"), b"stop")?;
        }
        Ok(())
    }

    fn load(&mut self, image: &[u8]) -> Result<(), ChannelError> {
        if self.is_running() {
            return Err(ChannelError::CoprocessorRunning);
        }
        let target = self.firmware_dir.join(&self.firmware_name);
        Self::write(&target, image)?;
        Self::write(&self.attr("firmware"), self.firmware_name.as_bytes())?;
        info!(
            unit = %self.sysfs_dir.display(),
            firmware = %target.display(),
            bytes = image.len(),
            "installed coprocessor firmware"
        );
        Ok(())
    }

    fn start(&mut self) -> Result<(), ChannelError> {
        Self::write(&self.attr("state"), b"start")
    }

    fn is_running(&self) -> bool {
        matches!(self.state().as_deref(), Ok("running"))
    }
}
