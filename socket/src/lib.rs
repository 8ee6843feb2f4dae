pub mod addr;
pub mod filter;
pub mod forward;
pub mod server;
pub mod socks5;
