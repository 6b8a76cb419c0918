//! External functions written in Lua.
//!
//! Query terms of kind `script` are evaluated by a [`ScriptPool`]: a fixed
//! number of sandboxed Lua 5.4 states shared by all queries.

pub mod conversion;
mod pool;

pub use pool::ScriptPool;
