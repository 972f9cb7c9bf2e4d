pub mod fetcher;
pub mod html;
pub mod presets;
pub mod robots;

pub use fetcher::ReqwestFetcher;
pub use html::HtmlRecordParser;
pub use presets::{AdapterFactory, builtin_sources};
pub use robots::RobotsFetcher;
