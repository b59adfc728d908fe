pub mod launch;
pub mod page_driver;

pub use launch::{launch_browser, LaunchOptions};
pub use page_driver::{ChromeDriver, ChromeSession};
