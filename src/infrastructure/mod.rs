pub mod bluetooth;
pub mod ipc;
pub mod logging;
pub mod serial;
pub mod server;
