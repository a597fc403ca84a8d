pub mod background;
pub mod route_refresh;

pub use background::{BackgroundTask, BackgroundWorker, TaskQueue};
pub use route_refresh::RouteRefreshWorker;
