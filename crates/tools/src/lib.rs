//! The Tool Dispatcher: routes named tool calls to the built-in incidents
//! HTTP backend or, for `mcp__<server>__<tool>`-prefixed names, the external
//! tool server pool.

pub mod dispatch;
pub mod incidents;

pub use dispatch::{dispatch, split_external_name, DispatchContext, DispatchResult};
