//! `pinbus-middleware` – the message bus collaborator.
//!
//! Gateways never talk to each other directly. They publish envelopes to
//! topics and subscribe to the topics they serve, through the
//! [`MessageBus`] trait.
//!
//! # Modules
//!
//! - [`bus`] – in-process topic bus built on Tokio broadcast channels.
//! - [`message_bus`] – the [`MessageBus`] trait gateways are written against.
//! - [`backplane`] – networked forwarder ([`Backplane`]) and its client
//!   ([`RemoteBus`]) so gateways can live in separate processes.

pub mod backplane;
pub mod bus;
pub mod message_bus;

pub use backplane::{Backplane, BackplaneFrame, RemoteBus};
pub use bus::{EventBus, TopicSubscriber};
pub use message_bus::{BusStream, MessageBus};
