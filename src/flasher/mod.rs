//! Flash and wipe drivers for K210-based signing devices.
//!
//! This module provides:
//! - Serial port discovery and liveness probing
//! - Port resolution with a single bounded retry
//! - The programmer primitive contract and its `ktool` runner
//! - Flash and wipe drivers built on top of those
//!
//! # Example
//!
//! ```ignore
//! use flasher::{FlashDriver, FlasherBackend};
//!
//! let backend = FlasherBackend::system(Path::new("ktool"));
//! let driver = FlashDriver::new(
//!     backend,
//!     "krux-v24.03.0/maixpy_amigo/kboot.kfpkg",
//!     Device::Amigo,
//!     1_500_000,
//!     Box::new(|event| println!("{}", event.text())),
//! )?;
//! let port = driver.run()?;
//! ```

pub mod driver;
pub mod flash;
pub mod port;
pub mod programmer;
pub mod resolver;
pub mod session;
pub mod wipe;

pub use driver::FlasherBackend;
pub use flash::FlashDriver;
pub use port::{
    list_usb_ports, CandidatePort, PortEnumerator, PortProbe, SerialPortEnumerator,
    SerialPortProbe,
};
pub use programmer::{
    normalize_output, read_frames, KtoolProgrammer, Programmer, ProgrammerError,
    ProgrammerInvocation, ProgressCallback, ProgressEvent,
};
pub use resolver::PortResolver;
pub use session::{FlashSession, SessionMode};
pub use wipe::WipeDriver;
