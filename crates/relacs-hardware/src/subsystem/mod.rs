//! Subsystem capability traits.
//!
//! One trait per subdevice kind, all extending the base [`Device`]
//! capability set.
//!
//! [`Device`]: crate::device::Device

pub mod analog_input;
pub mod analog_output;
pub mod attenuator;
pub mod digital_io;

pub use analog_input::AnalogInput;
pub use analog_output::AnalogOutput;
pub use attenuator::{AttStatus, Attenuator};
pub use digital_io::DigitalIo;
