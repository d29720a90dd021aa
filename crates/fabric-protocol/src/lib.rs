// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fabric Protocol - framed Protobuf messaging between controllers and workers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    fabric-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messenger: one persistent connector per worker             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: [u32 BE length][payload] (ProtocolBuffer)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: TCP (tokio)                                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every exchange is one request and one response:
//!
//! ```text
//! Request  := Frame(RequestHeader)  ++ Frame(body)
//! Response := Frame(ResponseHeader) ++ Frame(body)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fabric_protocol::{Messenger, ProtocolBuffer, messages};
//!
//! let messenger = Messenger::new(config.clone());
//! let mut buf = ProtocolBuffer::new(1024);
//! buf.serialize(&header)?;
//! buf.serialize(&messages::EchoRequest { data: "ping".into(), delay: 0 })?;
//!
//! let response: messages::EchoResponse =
//!     messenger.request("worker-1", &header.id, buf.to_bytes()).await?;
//! ```

pub mod connector;
pub mod frame;
pub mod messages;
pub mod messenger;
pub mod server;

pub use connector::{ConnectorError, ConnectorState, MessengerConnector};
pub use frame::{FrameError, HEADER_SIZE, MAX_FRAME_SIZE, ProtocolBuffer, read_message, write_buffer};
pub use messenger::{Messenger, MessengerError};
pub use server::{ServerError, WorkerServer, WorkerServerConfig};
