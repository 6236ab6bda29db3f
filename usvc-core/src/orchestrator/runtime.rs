use std::{future::Future, io};

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};

use crate::config::{RuntimeConfig, RuntimeType};

/// A monoio runtime of whichever driver the host supports.
pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl RuntimeWrapper {
    /// Build a timer-enabled runtime. io_uring falls back to the legacy
    /// driver when the kernel does not support it.
    pub fn new(config: &RuntimeConfig) -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        let runtime_type =
            if config.runtime_type == RuntimeType::IoUring && monoio::utils::detect_uring() {
                RuntimeType::IoUring
            } else {
                RuntimeType::Legacy
            };
        #[cfg(not(target_os = "linux"))]
        let runtime_type = RuntimeType::Legacy;

        match runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => RuntimeBuilder::<IoUringDriver>::new()
                .enable_timer()
                .with_entries(config.entries)
                .build()
                .map(RuntimeWrapper::IoUring),
            RuntimeType::Legacy => RuntimeBuilder::<LegacyDriver>::new()
                .enable_timer()
                .build()
                .map(RuntimeWrapper::Legacy),
        }
    }

    pub fn is_io_uring(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(_) => true,
            RuntimeWrapper::Legacy(_) => false,
        }
    }

    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future,
    {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(driver) => driver.block_on(future),
            RuntimeWrapper::Legacy(driver) => driver.block_on(future),
        }
    }
}
