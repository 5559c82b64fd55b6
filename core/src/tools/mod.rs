//! Tool system: declarative schemas, the order-stable registry, and the
//! built-in pricing tools.

pub mod builtin;
pub mod registry;
pub mod schema;

pub use builtin::{register_builtin_tools, ToolRequest};
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use schema::{canonicalize, ObjectSchema, ParamSpec, ParamType, SideEffect, ToolDescriptor};
