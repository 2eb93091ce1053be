pub mod icmp;
pub mod ping;
pub mod socket;

pub use icmp::*;
pub use ping::*;
pub use socket::*;
