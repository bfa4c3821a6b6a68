//! Cooperative Actor Runtime
//!
//! Drives the actors described by an `actor-graph` wiring: lifecycle and
//! tick scheduling with main-thread affinity, typed message channels, and
//! a bridge between background async work and the cooperative tick loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐     ┌─────────────────────────┐
//! │      Scheduler       │     │         Fabric          │
//! │                      │     │                         │
//! │  group 0 (main)  ◄───┼─────┼── deliver() + wake()    │
//! │  group 1..N (worker) │     │   per-actor mailboxes   │
//! └──────────▲───────────┘     └──────────▲──────────────┘
//!            │ wake                       │ send / call / push
//! ┌──────────┴───────────┐     ┌──────────┴──────────────┐
//! │     Async bridge     │     │       Actor cells       │
//! │  one driver task per │     │  net / rpc / event /    │
//! │  actor with sources  │     │  pipe dispatch + state  │
//! └──────────────────────┘     └─────────────────────────┘
//! ```
//!
//! Actors exchange messages exclusively through envelopes resolved
//! against the graph; a single actor's state is only ever touched by the
//! execution group that owns it. One ambient [`CancellationToken`]
//! (re-exported from `tokio-util`) scopes every pending call, job, and
//! main-thread action to the system's lifetime.

pub mod bridge;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod event;
pub mod jobs;
pub mod net;
pub mod pipe;
pub mod rpc;
pub mod scheduler;
pub mod settings;
pub mod signal;
pub mod system;
pub mod timer;

pub use bridge::{AsyncSource, WaitOutcome};
pub use dispatch::{Completer, MainThreadHandle, MainThreadTask};
pub use envelope::{CallId, Envelope, Payload};
pub use error::{ChannelError, DispatchError, JobError, SystemError};
pub use event::{EventContext, EventOutput};
pub use jobs::JobPool;
pub use net::{NetContext, NetOutput};
pub use pipe::{PipeContext, PipeOutput};
pub use rpc::{PendingCall, RpcContext, RpcOutput};
pub use scheduler::{Scheduler, TickResult};
pub use settings::{SettingChange, SettingsId};
pub use signal::MpscSignal;
pub use system::{Actor, ActorSystem, SetupContext, SystemBuilder};
pub use timer::TimerQueue;

pub use tokio_util::sync::CancellationToken;
