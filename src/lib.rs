pub mod app;

pub use app::adb::session::DeviceSession;
pub use app::config::{load_config, KitConfig};
pub use app::context::ToolContext;
pub use app::error::AppError;
pub use app::ios::kit::IosSession;
pub use app::logging::init_logging;
