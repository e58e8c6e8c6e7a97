//! Headless browser support.
//!
//! [`driver`] defines the backend-neutral handles, [`chrome`] implements them
//! over the DevTools protocol client in [`cdp`], [`session`] owns the single
//! shared page and [`tool`] exposes it to the agent.

pub mod cdp;
pub mod chrome;
pub mod driver;
pub mod session;
pub mod tool;

pub use chrome::ChromeDriver;
pub use driver::{BrowserDriver, BrowserError, BrowserResult, PageLink};
pub use session::{BrowserSessionManager, BrowserSettings, PageLease, SessionState};
