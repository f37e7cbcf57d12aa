//! # bedrock
//!
//! Foundation services for Rust game engines.
//!
//! Bedrock is the substrate a renderer, asset pipeline and application shell
//! are built on. It provides four cooperating subsystems:
//!
//! - A tiered allocator family: scoped temp arenas, a virtual-memory bump
//!   allocator, a two-level segregated-fit pool, proxy and thread-safe
//!   wrappers, and a single-shot composite builder
//! - Generational handle pools and a Fibonacci-hashed lookup table
//! - A virtual file system with mount points, an async I/O worker, directory
//!   watching, and remote round-tripping over a framed TCP protocol
//! - A remote-services layer carrying VFS traffic and developer commands
//!   between a tool host and a running client
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use bedrock::{Engine, Settings};
//!
//! let mut engine = Engine::initialize(Settings::default()).unwrap();
//! engine.vfs().mount_local("./data", "data", false).unwrap();
//!
//! // Game loop
//! engine.begin_frame(0.016);
//! // ... update ...
//! engine.end_frame();
//! ```
//!
//! ## Threading
//!
//! VFS completion callbacks run on the async worker thread or on a remote
//! read-loop thread, never on the caller's thread. Do not hold long locks
//! inside callbacks; marshal back to your own thread if you need to.

pub mod alloc;
pub mod blob;
pub mod engine;
pub mod handle;
pub mod relptr;
pub mod remote;
pub mod settings;
pub mod table;
pub mod util;
pub mod vfs;

pub use alloc::{Allocator, AllocatorKind, AllocatorRef};
pub use blob::{Blob, GrowPolicy};
pub use engine::Engine;
pub use handle::{Handle, HandlePool};
pub use relptr::RelativePtr;
pub use settings::Settings;
pub use table::HashTable;
pub use util::fourcc::FourCc;
