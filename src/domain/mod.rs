pub mod ankle;
pub mod frame;
pub mod math;
pub mod models;
pub mod registry;
pub mod settings;
pub mod tracker_settings;
