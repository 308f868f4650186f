//! # PixelBridge Server
//!
//! Device discovery, routing, proxying and replay for PixelPusher LED
//! controllers, built on [`pixelbridge_core`] for protocol handling with
//! [`tokio`] providing the async runtime.
//!
//! ## Architecture
//!
//! ```text
//! Discovery Listener ──▶ Discovery Registry ──▶ Device Registry
//!                                                    │
//!                 Router ◀── route(ordinal, id) ─────┘
//!                   │ │
//!        listeners ◀┘ └──▶ per-device Sender ──▶ UDP
//!                   │
//!              Recorder ──▶ stream file ──▶ Player ──▶ Router
//! ```
//!
//! Applications either ask the [`device::Router`] to route packets by
//! `(ordinal, id)` or obtain a per-device [`device::Sender`]. Routed packets
//! fan out to registered listeners, which is how the replay
//! [`replay::Recorder`] observes traffic. The [`proxy::Manager`] creates a
//! local stand-in device for each discovered remote device and forwards
//! intercepted traffic, and the [`replay::Player`] reads recorded streams
//! back into the router with original timing.

pub mod device;
pub mod discovery;
pub mod network;
pub mod proxy;
pub mod replay;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
