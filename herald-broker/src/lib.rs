//! # Herald Broker
//!
//! The broker half of Herald: the router owning the subscription table and
//! message fan-out, the route/subscription model with its backpressure
//! contract, the replay+live receiver state machine, and the WebSocket
//! connector speaking the line-oriented client protocol.
//!
//! The router is the single writer of the route table: one dispatch loop
//! owns every mutation, and public subscribe/unsubscribe calls enqueue
//! commands and wait for the loop's acknowledgement.

pub mod receiver;
pub mod route;
pub mod router;
pub mod websocket;

pub use receiver::{Receiver, ReceiverControl};
pub use route::{Matcher, Route, RouteConfig, RouteParams};
pub use router::{Router, RouterMetrics};
pub use websocket::WsServer;
