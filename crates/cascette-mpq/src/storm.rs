//! Engine session and one-time initialization
//!
//! The engine needs a one-time setup (loading the native library, preparing
//! its virtual filesystem) before any call. [`EngineLoader`] runs that setup
//! exactly once, no matter how many tasks wait on it, and hands out a
//! [`Storm`] session. After that every operation is an ordinary blocking
//! call.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::archive::Archive;
use crate::config::{CreateMode, OpenMode};
use crate::engine::Engine;
use crate::error::{MpqError, Result};
use crate::locale::{self, LocaleRef};

/// Handle to an initialized engine
///
/// Cloning is cheap; every clone shares the engine and its global locale.
pub struct Storm<E: Engine> {
    engine: Arc<E>,
}

impl<E: Engine> Clone for Storm<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<E: Engine> std::fmt::Debug for Storm<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storm").finish_non_exhaustive()
    }
}

impl<E: Engine> Storm<E> {
    /// Wrap an engine that is ready for calls
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Wrap a shared engine
    pub const fn from_shared(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// The underlying engine
    pub const fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Locale used for opens and inserts, as a culture name
    pub fn locale(&self) -> Result<&'static str> {
        locale::format(Some(self.engine.locale()))
    }

    /// Change the locale used for opens and inserts
    ///
    /// Returns the canonical name of the new locale. Codes without a table
    /// entry are rejected before the engine is touched.
    pub fn set_locale<'a>(&self, locale: impl Into<LocaleRef<'a>>) -> Result<&'static str> {
        apply_locale(self.engine.as_ref(), locale)
    }

    /// Open an existing archive
    pub fn open(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<Archive<E>> {
        Archive::open(Arc::clone(&self.engine), path, mode)
    }

    /// Create a new archive
    pub fn create(&self, path: impl AsRef<Path>, mode: CreateMode) -> Result<Archive<E>> {
        Archive::create(Arc::clone(&self.engine), path, mode)
    }

    /// Write `bytes` to `path` and open the result as an archive
    pub fn from_bytes(
        &self,
        bytes: &[u8],
        path: impl AsRef<Path>,
        mode: OpenMode,
    ) -> Result<Archive<E>> {
        Archive::from_bytes(Arc::clone(&self.engine), bytes, path, mode)
    }
}

/// Resolve a locale, hand it to the engine and return its canonical name
pub(crate) fn apply_locale<'a, E: Engine + ?Sized>(
    engine: &E,
    locale: impl Into<LocaleRef<'a>>,
) -> Result<&'static str> {
    let code = locale::resolve(Some(locale))?;
    let name = locale::format(Some(code))?;
    engine.set_locale(code);
    Ok(name)
}

/// One-time engine initialization shared by every caller
pub struct EngineLoader<E: Engine> {
    cell: OnceCell<Storm<E>>,
}

impl<E: Engine> EngineLoader<E> {
    /// Loader that has not run yet
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Wait for the engine, running `init` if nobody has yet
    ///
    /// Concurrent callers wait for the same initialization. If `init` fails
    /// the error goes to the caller that ran it and the next caller tries
    /// again.
    pub async fn ready<F, Fut>(&self, init: F) -> Result<Storm<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<E>>,
    {
        self.cell
            .get_or_try_init(|| async move {
                let engine = init().await?;
                info!("Archive engine ready");
                Ok::<_, MpqError>(Storm::new(engine))
            })
            .await
            .cloned()
    }

    /// Session, if initialization already finished
    pub fn get(&self) -> Option<Storm<E>> {
        self.cell.get().cloned()
    }

    /// Check if initialization already finished
    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }
}

impl<E: Engine> Default for EngineLoader<E> {
    fn default() -> Self {
        Self::new()
    }
}
