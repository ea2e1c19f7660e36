pub mod serial;
pub mod udp;

pub use serial::SerialTransport;
pub use udp::UdpTransport;
