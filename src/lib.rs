//! Mock Request Server
//!
//! A programmable HTTP test double. It listens on a port, matches incoming
//! requests against an ordered list of caller-defined mappings and replies
//! with the configured status, headers and body, optionally after a delay
//! or never at all.
//!
//! # Features
//!
//! - **Request Matching**: Match by method, URL and body (substring or regex)
//! - **First Match Wins**: Mappings are consulted in the order they were added
//! - **Latency Simulation**: Delay replies without blocking other requests
//! - **Timeout Simulation**: Keep the connection open and never answer
//! - **Response Files**: Serve bodies from files on disk
//! - **Request Interception**: Redirect a browser-automation host's outbound
//!   requests to the mock server
//!
//! # Example Configuration
//!
//! ```yaml
//! port: 8080
//! mappings:
//!   - request:
//!       method: GET
//!       url: ajax_info_1
//!     response:
//!       status: 200
//!       responseText: "Mock Response 1"
//!   - request:
//!       method: POST
//!       url: ajax_info_2
//!       data: member_id=1
//!     response:
//!       responseTime: 5000
//!       responseText: "Mock Response 2"
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod matcher;
pub mod responder;
pub mod server;
pub mod store;

pub use bridge::{HookContext, HookSlot, InterceptionHost, OutboundRequest, RequestController};
pub use config::{MockServerConfig, PortValue, RequestPattern, ResponsePlan, ServerSettings};
pub use error::{Error, Result};
pub use server::{MockServer, ServerState};
