//! # pvhost Core Library
//!
//! This crate is the coordination core for long-running instrument-control
//! servers: a process hosts named, typed "channels" (process variables)
//! backed by live device state, accepts external reads and writes through a
//! channel-record interface, and drives instrument work on a schedule. The
//! wire protocol, the device command dialects and any GUI live outside this
//! crate; what lives here is the machinery that makes their interaction
//! deterministic and race-free.
//!
//! ## Crate Structure
//!
//! - **`reactor`**: the cooperative single-thread scheduler — timer heap,
//!   keyed rate-limited dispatch, periodic grid-aligned tasks, cross-thread
//!   mailbox, execution mutex and the canary liveness watchdog. All core
//!   state is mutated on the reactor thread; foreign threads marshal work
//!   in through `post_now`/`schedule`.
//! - **`cell`**: `Cell<T>`, a validated reactive value holder with keyed
//!   subscriber fan-out, ternary write outcomes (accepted/coerced/rejected)
//!   and per-write exclusion keys for echo-loop prevention.
//! - **`configtree`**: hierarchical default/override/value resolution with
//!   provenance markers and introspection export.
//! - **`registry`**: binds cells to externally visible channel names,
//!   merging cell defaults, code-time overrides and config-tree overrides;
//!   produces the record set a protocol server consumes and drives periodic
//!   and urgent persistence through the reactor.
//! - **`settings`**: typed settings loading (TOML file + environment) for
//!   the ambient machinery.
//! - **`logging`**: structured logging setup.
//! - **`error`**: the central `HostError` enum and `AppResult` alias.

pub mod cell;
pub mod configtree;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod registry;
pub mod settings;

pub use cell::{Cell, Validation, WriteOutcome};
pub use configtree::{ConfigTree, GetOpts, Marker};
pub use error::{AppResult, HostError};
pub use reactor::{Canary, FlushBound, Reactor, Schedule};
pub use registry::{ChannelRegistry, ChannelSpec, Interaction, ScalarKind};
