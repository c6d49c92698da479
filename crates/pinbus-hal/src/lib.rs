//! `pinbus-hal` – the device side of a gateway.
//!
//! # Modules
//!
//! - [`registry`] – [`ResourceRegistry`]: current mode, tag and callback
//!   handle of every pin the gateway has configured.
//! - [`device`] – the [`DeviceAdapter`] contract the dispatch table calls,
//!   plus the callback plumbing ([`ReportSink`], [`DeviceEvent`]).
//! - [`sim`] – [`SimBoard`], an in-process microcontroller implementing
//!   [`DeviceAdapter`] for tests and the `local` CLI mode.

pub mod device;
pub mod registry;
pub mod sim;

pub use device::{
    DEFAULT_EVENT_CAPACITY, DeviceAdapter, DeviceEvent, DeviceInfo, DeviceOp, DeviceQuery, EventReceiver,
    PinConfig, ReportSender, ReportSink, report_channel, report_channel_with_capacity,
};
pub use registry::{CallbackHandle, ModeMetadata, ResourceRegistry, ResourceView};
pub use sim::{DeviceCall, SimBoard, SimBoardConfig};
