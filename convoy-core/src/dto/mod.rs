//! Data Transfer Objects for the wire protocol
//!
//! DTOs exchanged between the server, agents and the CLI. Request bodies
//! for the agent-facing RPC routes live in [`rpc`], operator-facing ones
//! in [`job`].

pub mod job;
pub mod rpc;
