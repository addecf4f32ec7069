//! Typed access to MPQ archives through the StormLib engine.
//!
//! The engine does all the format work: hash and block tables, sector
//! compression, encryption, signatures. This crate sits on top of its C
//! function table and gives it a Rust shape:
//!
//! - **Handles**: [`Archive`] and [`ArchiveFile`] own engine handles, close
//!   them on drop and reject every call once closed.
//! - **Flags**: named flag sets ([`FileFlags`], [`VerifyFlags`], ...) and
//!   codec names translate to the engine's bit values.
//! - **Info queries**: [`InfoClass`] covers every archive and file info
//!   class, with the engine's grow-and-retry buffer protocol handled
//!   internally.
//! - **Locales**: culture names such as `"de_DE"` map to the engine's
//!   numeric locale codes and back.
//!
//! # Example
//!
//! ```rust,ignore
//! use cascette_mpq::{CreateMode, MemoryEngine, Storm};
//!
//! let storm = Storm::new(MemoryEngine::new());
//! let mut archive = storm.create("maps.mpq", CreateMode::Default)?;
//! archive.add_file_from_bytes("readme.txt", b"hello", None)?;
//! assert_eq!(archive.read_file_to_string("readme.txt")?, "hello");
//! archive.close()?;
//! # Ok::<(), cascette_mpq::MpqError>(())
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

// Archive handles
pub mod archive;

// Files inside an archive
pub mod file;

// Engine boundary and bundled engines
pub mod engine;

// Flag sets and codec names
pub mod flags;

// Info classes and the buffer protocol
pub mod info;

// Locale names and codes
pub mod locale;

// Open and create options
pub mod config;

// Archive enumeration
pub mod search;

// Verification status codes
pub mod verify;

// Engine session and readiness
pub mod storm;

pub mod error;

pub use archive::Archive;
pub use config::{CreateMode, CreateOptions, OpenMode, OpenOptions};
pub use engine::{Engine, ErrorCode, MemoryEngine, RawHandle};
#[cfg(all(feature = "stormlib", not(windows)))]
pub use engine::StormLibEngine;
pub use error::{MpqError, Result};
pub use file::ArchiveFile;
pub use flags::{
    AttributeFlags, Codec, CodecSelection, CompressionInput, EntryFlags, FileFlags, FlagInput,
    VerifyFlags,
};
pub use info::{InfoClass, InfoScope, InfoValue};
pub use locale::LocaleRef;
pub use search::SearchRecord;
pub use storm::{EngineLoader, Storm};
