use std::sync::atomic::{AtomicBool, Ordering};

/// Connectivity signal consulted before a non-forced flush.
pub trait NetworkStatus {
    fn is_online(&self) -> bool;
}

/// Host-driven flag, online until told otherwise.
#[derive(Debug)]
pub struct OnlineFlag {
    online: AtomicBool,
}

impl OnlineFlag {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

impl Default for OnlineFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkStatus for OnlineFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}
