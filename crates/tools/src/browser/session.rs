//! The single shared browser page.
//!
//! One browser process, one context, one page. Callers borrow the page per
//! operation through a [`PageLease`]; the lease holds the session lock, so
//! concurrent requests serialize on the page.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::driver::{BrowserDriver, BrowserError, BrowserHandle, BrowserResult, ContextHandle, PageHandle};
use crate::fetch::random_user_agent;
use crate::url_guard::UrlGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No browser process yet.
    Unstarted,
    /// Browser running; a context and page exist or will be recreated on demand.
    Ready,
    /// Launch failed. Browser tools stay disabled for the life of the process.
    Broken,
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,
    pub nav_timeout: Duration,
    pub action_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            nav_timeout: Duration::from_millis(60_000),
            action_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Default)]
struct Live {
    browser: Option<Box<dyn BrowserHandle>>,
    context: Option<Box<dyn ContextHandle>>,
    page: Option<Box<dyn PageHandle>>,
}

pub struct BrowserSessionManager {
    driver: Arc<dyn BrowserDriver>,
    settings: BrowserSettings,
    guard: UrlGuard,
    state: StdMutex<SessionState>,
    live: Mutex<Live>,
}

impl BrowserSessionManager {
    pub fn new(driver: Arc<dyn BrowserDriver>, settings: BrowserSettings, guard: UrlGuard) -> Self {
        Self {
            driver,
            settings,
            guard,
            state: StdMutex::new(SessionState::Unstarted),
            live: Mutex::new(Live::default()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().map(|s| *s).unwrap_or(SessionState::Broken)
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut s) = self.state.lock() {
            *s = next;
        }
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    /// Screen for navigation targets.
    pub fn guard(&self) -> &UrlGuard {
        &self.guard
    }

    /// Launch the browser and open the first page. A launch failure leaves the
    /// session `Broken`; the caller decides whether that matters.
    pub async fn start(&self) -> BrowserResult<()> {
        match self.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Broken => {
                return Err(BrowserError::Unavailable("browser failed to start earlier".to_string()))
            }
            SessionState::Unstarted => {}
        }

        let mut live = self.live.lock().await;
        let browser = match self.driver.launch(self.settings.headless).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Browser launch failed; browser tools disabled");
                self.set_state(SessionState::Broken);
                return Err(e);
            }
        };
        live.browser = Some(browser);
        self.set_state(SessionState::Ready);

        if let Err(e) = reset_locked(&mut live).await {
            warn!(error = %e, "Initial browser page could not be opened; will retry on first use");
        }
        info!(headless = self.settings.headless, "Browser session started");
        Ok(())
    }

    /// Borrow the live page, recreating context and page first if the old one
    /// is gone.
    pub async fn get_page(&self) -> BrowserResult<PageLease<'_>> {
        if self.state() != SessionState::Ready {
            return Err(BrowserError::Unavailable("browser is not running".to_string()));
        }
        let mut live = self.live.lock().await;
        match live.browser.as_ref() {
            Some(b) if b.is_connected() => {}
            _ => return Err(BrowserError::Unavailable("browser disconnected".to_string())),
        }
        let usable = live.page.as_ref().map_or(false, |p| !p.is_closed());
        if !usable {
            debug!("No usable page; resetting browser context");
            reset_locked(&mut live).await?;
        }
        Ok(PageLease { live })
    }

    /// Throw away the current context and page and open fresh ones.
    pub async fn reset(&self) -> BrowserResult<()> {
        if self.state() != SessionState::Ready {
            return Err(BrowserError::Unavailable("browser is not running".to_string()));
        }
        let mut live = self.live.lock().await;
        reset_locked(&mut live).await
    }

    /// Release page, context and browser. Every step is best effort.
    pub async fn stop(&self) {
        let mut live = self.live.lock().await;
        if let Some(page) = live.page.take() {
            if let Err(e) = page.close().await {
                debug!(error = %e, "Page close failed during stop");
            }
        }
        if let Some(context) = live.context.take() {
            if let Err(e) = context.close().await {
                debug!(error = %e, "Context close failed during stop");
            }
        }
        if let Some(browser) = live.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Browser close failed during stop");
            }
        }
        if self.state() == SessionState::Ready {
            self.set_state(SessionState::Unstarted);
        }
        info!("Browser session stopped");
    }

    /// Ready with a connected browser. Does not wait for a busy page.
    pub fn is_alive(&self) -> bool {
        if self.state() != SessionState::Ready {
            return false;
        }
        match self.live.try_lock() {
            Ok(live) => live.browser.as_ref().map_or(false, |b| b.is_connected()),
            // Someone holds a lease, so the browser was connected moments ago.
            Err(_) => true,
        }
    }
}

async fn reset_locked(live: &mut Live) -> BrowserResult<()> {
    if let Some(old) = live.page.take() {
        if let Err(e) = old.close().await {
            debug!(error = %e, "Closing stale page failed");
        }
    }
    if let Some(old) = live.context.take() {
        if let Err(e) = old.close().await {
            debug!(error = %e, "Closing stale context failed");
        }
    }
    let browser = live
        .browser
        .as_ref()
        .ok_or_else(|| BrowserError::Unavailable("browser is not running".to_string()))?;
    let context = browser.new_context(random_user_agent()).await?;
    let page = context.new_page().await?;
    debug!(page = %page.id(), "Fresh browser page ready");
    live.context = Some(context);
    live.page = Some(page);
    Ok(())
}

/// Exclusive use of the session page for one tool operation.
pub struct PageLease<'a> {
    live: MutexGuard<'a, Live>,
}

impl PageLease<'_> {
    pub fn page(&self) -> BrowserResult<&dyn PageHandle> {
        self.live
            .page
            .as_deref()
            .ok_or_else(|| BrowserError::Unavailable("no page open".to_string()))
    }

    /// Replace the context and page without releasing the lease.
    pub async fn reset(&mut self) -> BrowserResult<()> {
        reset_locked(&mut self.live).await
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{manager, FakeDriver};
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_start_opens_page_and_becomes_ready() {
        let driver = FakeDriver::default();
        let session = manager(driver.clone());
        assert_eq!(session.state(), SessionState::Unstarted);
        assert!(!session.is_alive());

        session.start().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.is_alive());
        assert_eq!(driver.control.pages_created.load(Ordering::SeqCst), 1);

        // Idempotent.
        session.start().await.unwrap();
        assert_eq!(driver.control.pages_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_broken_and_sticky() {
        let driver = FakeDriver::default();
        driver.control.fail_launch.store(true, Ordering::SeqCst);
        let session = manager(driver.clone());

        assert!(session.start().await.is_err());
        assert_eq!(session.state(), SessionState::Broken);
        assert!(matches!(session.get_page().await, Err(BrowserError::Unavailable(_))));

        driver.control.fail_launch.store(false, Ordering::SeqCst);
        assert!(session.start().await.is_err());
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_get_page_before_start_is_unavailable() {
        let session = manager(FakeDriver::default());
        assert!(matches!(session.get_page().await, Err(BrowserError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_context_destroyed_then_reset_yields_fresh_page() {
        let driver = FakeDriver::default();
        let session = manager(driver.clone());
        session.start().await.unwrap();

        let first_id = {
            let mut lease = session.get_page().await.unwrap();
            let id = lease.page().unwrap().id();
            driver.control.destroy_next.store(true, Ordering::SeqCst);
            let err = lease.page().unwrap().goto("https://example.com").await.unwrap_err();
            assert!(matches!(err, BrowserError::ContextDestroyed(_)));
            lease.reset().await.unwrap();
            id
        };

        let lease = session.get_page().await.unwrap();
        let page = lease.page().unwrap();
        assert_ne!(page.id(), first_id);
        assert!(!page.is_closed());
        assert_eq!(driver.control.pages_created.load(Ordering::SeqCst), 2);
        assert_eq!(driver.control.contexts_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_page_is_replaced_on_next_get_page() {
        let driver = FakeDriver::default();
        let session = manager(driver.clone());
        session.start().await.unwrap();

        {
            let lease = session.get_page().await.unwrap();
            lease.page().unwrap().close().await.unwrap();
        }
        let lease = session.get_page().await.unwrap();
        assert_eq!(lease.page().unwrap().id(), "page-2");
    }

    #[tokio::test]
    async fn test_stop_tolerates_close_failures() {
        let driver = FakeDriver::default();
        driver.control.fail_context_close.store(true, Ordering::SeqCst);
        let session = manager(driver.clone());
        session.start().await.unwrap();

        session.stop().await;
        assert_eq!(driver.control.browsers_closed.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Unstarted);
        assert!(!session.is_alive());
    }
}
