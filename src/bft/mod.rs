//! This module contains the implementation details of `basalt-bft`.

pub mod checkpoint;
pub mod collections;
pub mod communication;
pub mod config;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod error;
pub mod executable;
pub mod globals;
pub mod kvservice;
pub mod message_log;
pub mod message_manager;
pub mod ordering;
pub mod recovery;
pub mod response;
pub mod storage;
pub mod sysinfo;
pub mod threadpool;
pub mod timeouts;
pub mod view_change;

use std::ops::Drop;

use error::*;
use globals::Flag;

static INITIALIZED: Flag = Flag::new();

/// Configure the init process of the library.
pub struct InitConfig {
    /// Whether to install a process-wide `tracing` subscriber. Disable this
    /// if the host application already manages its own subscriber.
    pub install_tracing: bool,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            install_tracing: true,
        }
    }
}

/// Handle to the global data.
///
/// When dropped, the data is deinitialized.
pub struct InitGuard;

/// Initializes global data.
///
/// Should always be called before other methods, otherwise runtime
/// panics may ensue.
pub fn init(c: InitConfig) -> Result<Option<InitGuard>> {
    if INITIALIZED.test() {
        return Ok(None);
    }
    if c.install_tracing {
        let _ = tracing_subscriber::fmt::try_init();
    }
    INITIALIZED.set();
    Ok(Some(InitGuard))
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        INITIALIZED.unset();
    }
}
