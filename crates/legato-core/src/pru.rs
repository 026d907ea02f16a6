// Coprocessor control

use crate::step_channel::ChannelError;

pub mod remoteproc;
pub mod sim;

pub use remoteproc::RemoteProc;
pub use sim::{SimHandle, SimulatedPru};

/// Lifecycle of the unit that consumes the step ring.
pub trait Coprocessor: Send {
    /// Stop executing. Returns once the unit no longer touches the ring.
    fn halt(&mut self) -> Result<(), ChannelError>;

    /// Install a firmware image. The unit must be halted.
    fn load(&mut self, image: &[u8]) -> Result<(), ChannelError>;

    fn start(&mut self) -> Result<(), ChannelError>;

    fn is_running(&self) -> bool;
}

impl<C: Coprocessor + ?Sized> Coprocessor for Box<C> {
    fn halt(&mut self) -> Result<(), ChannelError> {
        (**self).halt()
    }

    fn load(&mut self, image: &[u8]) -> Result<(), ChannelError> {
        (**self).load(image)
    }

    fn start(&mut self) -> Result<(), ChannelError> {
        (**self).start()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}
