// cati - probe a terminal for the Kitty graphics protocol and stream images to it
pub mod logger;
pub mod config;
pub mod base64_codec;
pub mod kitty_native;
pub mod kitty_probe;
pub mod kitty_graphics;

pub use kitty_graphics::{ChunkedTransmitter, TransmitError};
pub use kitty_native::{TerminalConfigError, TerminalDevice, TerminalModeGuard, TtyDevice};
pub use kitty_probe::{ProbeOptions, ProbeResult, ProtocolDetector};
