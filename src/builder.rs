//! Fluent builder for Driver construction.

use crate::backend::{create_backend, Backend};
use crate::driver::Driver;

use std::io;

/// Builder for constructing [`Driver`] instances.
///
/// By default the best backend available on the platform is used (epoll on
/// Linux, `poll(2)` elsewhere); tests and embedders can inject their own.
///
/// # Example
/// ```ignore
/// let driver = DriverBuilder::new().build()?;
/// ```
pub struct DriverBuilder {
    backend: Option<Box<dyn Backend>>,
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self { backend: None }
    }

    /// Uses `backend` instead of the platform default.
    pub fn backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Builds the driver.
    ///
    /// # Errors
    /// Returns the underlying I/O error when the default backend cannot be
    /// constructed.
    pub fn build(self) -> io::Result<Driver> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => create_backend()?,
        };

        Ok(Driver::with_backend(backend))
    }
}
