//! Device-integration core of the hearth home-automation hub.
//!
//! This crate owns the family-independent half of every device family:
//!
//! - **[`PacketPipeline`]** — Bounded ring buffer per physical interface with
//!   one consumer thread that hands packets, in receipt order, to the
//!   subscribers of an [`EventSinkRegistry`].
//!
//! - **[`Peer`]** — One paired endpoint: config, value and link paramsets
//!   built from a [`DeviceDescription`], lazily persisted parameter rows,
//!   direct links and [`ServiceMessages`] (UNREACH, CONFIG_PENDING, ...).
//!
//! - **[`LogicalDevice`] / [`DeviceFamily`]** — The central of a family and
//!   the family itself. Together with the peers they form one upward
//!   [`EventSink`] chain ending at the [`HubContext`], which owns the
//!   [`Storage`] engine and the RPC listeners.
//!
//! Nothing here speaks a wire protocol. Concrete families plug in through
//! [`FamilyHooks`], [`DeviceHooks`] and [`PeerHooks`].

pub mod config;
pub mod context;
pub mod description;
pub mod device;
pub mod error;
pub mod family;
pub mod lifecycle;
pub mod packet;
pub mod peer;
pub mod pipeline;
pub mod registry;
pub mod service_messages;
pub mod sink;
pub mod storage;
pub mod variable;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::CoreConfig;
pub use context::HubContext;
pub use description::{
    DeviceDescription, Function, LogicalCodec, LogicalType, Parameter, ParameterGroup,
    ParameterSetType, ValueCodec,
};
pub use device::{DeviceHooks, DeviceInit, LogicalDevice};
pub use error::CoreError;
pub use family::{DeviceFamily, FamilyHooks};
pub use lifecycle::{DisposePhase, LifecyclePhase};
pub use packet::Packet;
pub use peer::{
    BasicPeerRef, LinkFlags, Peer, PeerDirectory, PeerHooks, PeerInfo, PeerInit, PeerLookup,
    PeerOwner,
};
pub use pipeline::{PacketHandler, PacketPipeline, PipelineStats};
pub use registry::{EventSinkRegistry, HandlerRef, SinkId};
pub use service_messages::{ServiceFlag, ServiceMessages};
pub use sink::{EventSink, RpcEvent, RpcListener};
pub use storage::{MemoryStore, Storage};
pub use variable::Variable;
