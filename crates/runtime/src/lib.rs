//! HSX bytecode runtime
//!
//! Execution + executive stack for `.hxe` application images:
//! - `image`: loader for the on-disk format (header, CRC, metadata tables)
//! - `vm`: the MiniVM interpreter (16 registers, linear memory, SVC traps)
//! - `mailbox`: the IPC fabric (descriptors, rings, waiters, fan-out)
//! - `registry`: `(group, value)` parameters and command dispatch
//! - `exec`: the executive (task lifecycle, scheduler, syscall dispatch)
//! - `events`: the append-only event log consumed by the control plane
//!
//! The control plane itself (TCP line-JSON server) lives in the `hsxd` crate
//! and drives everything here through `exec::Executive` behind a mutex.

pub mod disasm;
pub mod events;
pub mod exec;
pub mod hal;
pub mod image;
pub mod mailbox;
pub mod persist;
pub mod profile;
pub mod registry;
pub mod symbols;
pub mod vm;

pub use exec::Executive;
pub use image::HxeImage;
pub use profile::Profile;
