//! The two ways a caller can drive a [`crate::runtime::Runtime`]: the
//! stdio MCP tool-call surface and the REST API.

pub mod mcp;
pub mod rest;
