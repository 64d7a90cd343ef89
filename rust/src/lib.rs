pub mod backend;
pub mod config_store;
pub mod dimensions;
pub mod error;
pub mod gallery;
pub mod logging;
pub mod main_ui_html;
pub mod orchestrator;
pub mod path_utils;
pub mod server;

/// Upper bound on images per batch, whatever the config allows.
pub const MAX_IMAGE_COUNT: usize = 10;
