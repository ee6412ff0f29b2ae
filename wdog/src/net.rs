//! Descriptor passing over Unix domain sockets.

mod fd;
mod stream;

pub(crate) use fd::set_cloexec;
pub use fd::Fd;
pub use stream::{UnixStream, UnixStreamExt};
