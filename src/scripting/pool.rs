//! Bounded pool of sandboxed Lua states.
//!
//! Each state is created once with the unsafe parts of the standard library
//! removed, then lent to one caller at a time. Callers that find every state
//! busy block until one is returned, waking periodically to check whether
//! their query was interrupted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mlua::{HookTriggers, Lua, Table, Value as LuaValue, VmState};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use super::conversion::{json_to_lua, lua_to_json};
use crate::error::ScriptError;
use crate::interrupt::Interruptor;

/// Registry slot holding the globals of a freshly sandboxed state.
const BASELINE_GLOBALS: &str = "docql_baseline_globals";
/// Registry slot holding a copy of each standard library table.
const BASELINE_LIBRARIES: &str = "docql_baseline_libraries";
/// Libraries a script may modify in place; restored field by field.
const LIBRARIES: [&str; 5] = ["coroutine", "math", "string", "table", "utf8"];
/// Instructions between two checks of the interruptor while a script runs.
const INTERRUPT_CHECK_INSTRUCTIONS: u32 = 1000;

pub struct ScriptPool {
    /// Idle states
    idle: Mutex<Vec<Lua>>,
    /// Signalled whenever a state is returned
    returned: Condvar,
    size: usize,
    wait_poll: Duration,
    invocations: AtomicUsize,
}

impl ScriptPool {
    /// Create a pool of `size` states (at least one).
    pub fn new(size: usize) -> Result<Self, ScriptError> {
        Self::with_wait_poll(size, Duration::from_millis(10))
    }

    /// Create a pool whose blocked callers re-check cancellation every
    /// `wait_poll`.
    pub fn with_wait_poll(size: usize, wait_poll: Duration) -> Result<Self, ScriptError> {
        let size = size.max(1);
        let states = (0..size)
            .map(|_| Self::new_state())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            idle: Mutex::new(states),
            returned: Condvar::new(),
            size,
            wait_poll,
            invocations: AtomicUsize::new(0),
        })
    }

    fn new_state() -> Result<Lua, ScriptError> {
        let lua = Lua::new();
        Self::sanitize_globals(&lua);
        Self::snapshot_baseline(&lua)
            .map_err(|e| ScriptError::Pool(format!("Failed to snapshot globals: {}", e)))?;
        Ok(lua)
    }

    /// Remove dangerous globals.
    ///
    /// This removes:
    /// - os: System operations
    /// - io: File I/O
    /// - debug: Debug interface
    /// - package: Module system
    /// - dofile, load, loadfile, require: Code loading
    fn sanitize_globals(lua: &Lua) {
        let globals = lua.globals();

        let unsafe_globals = [
            "os", "io", "debug", "package", "dofile", "load", "loadfile", "require",
        ];

        for name in &unsafe_globals {
            let _ = globals.set(*name, LuaValue::Nil);
        }
    }

    /// Record the sandboxed globals, and the contents of each standard
    /// library, so [`reset_state`](Self::reset_state) can bring the state
    /// back to them.
    fn snapshot_baseline(lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();
        let baseline = lua.create_table()?;
        for pair in globals.pairs::<LuaValue, LuaValue>() {
            let (key, value) = pair?;
            baseline.raw_set(key, value)?;
        }

        let libraries = lua.create_table()?;
        for name in LIBRARIES {
            if let LuaValue::Table(library) = globals.raw_get::<LuaValue>(name)? {
                libraries.raw_set(name, copy_table(lua, &library)?)?;
            }
        }

        lua.set_named_registry_value(BASELINE_GLOBALS, baseline)?;
        lua.set_named_registry_value(BASELINE_LIBRARIES, libraries)
    }

    /// Reset a state for reuse.
    ///
    /// Every global a script created is removed, every sandboxed global it
    /// replaced or removed is put back, and the standard libraries are
    /// restored to their original fields.
    fn reset_state(lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();
        globals.set_metatable(None)?;
        let baseline: Table = lua.named_registry_value(BASELINE_GLOBALS)?;
        restore_table(&globals, &baseline)?;

        let libraries: Table = lua.named_registry_value(BASELINE_LIBRARIES)?;
        for pair in libraries.pairs::<String, Table>() {
            let (name, snapshot) = pair?;
            if let LuaValue::Table(library) = globals.raw_get::<LuaValue>(name.as_str())? {
                library.set_metatable(None)?;
                restore_table(&library, &snapshot)?;
            }
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of states not lent out right now.
    pub fn available(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of completed or failed invocations.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Borrow a state, blocking until one is free or `interruptor` trips.
    fn acquire(&self, interruptor: &Interruptor) -> Result<PooledLua<'_>, ScriptError> {
        let mut idle = self.idle.lock();
        loop {
            if interruptor.is_tripped() {
                return Err(ScriptError::Interrupted);
            }
            if let Some(lua) = idle.pop() {
                return Ok(PooledLua {
                    pool: self,
                    lua: Some(lua),
                });
            }
            tracing::debug!(
                "[SCRIPT] All {} states busy, waiting for one to be returned",
                self.size
            );
            self.returned.wait_for(&mut idle, self.wait_poll);
        }
    }

    fn release(&self, lua: Lua) {
        self.idle.lock().push(lua);
        self.returned.notify_one();
    }

    /// Evaluate `source` with `globals` bound as Lua globals and convert its
    /// result to JSON.
    ///
    /// `source` may be an expression or a chunk ending in `return`. The state
    /// is reset before it goes back to the pool, and a running script is
    /// stopped once `interruptor` trips.
    pub fn invoke(
        &self,
        source: &str,
        globals: &HashMap<String, Value>,
        interruptor: &Interruptor,
    ) -> Result<Value, ScriptError> {
        let mut pooled = self.acquire(interruptor)?;
        let (result, reset) = {
            let lua = pooled.lua()?;
            let result = Self::run(lua, source, globals, interruptor);
            lua.remove_hook();
            (result, Self::reset_state(lua))
        };
        if let Err(e) = reset {
            // A state that cannot be reset is replaced instead of reused.
            tracing::warn!("[SCRIPT] Failed to reset state, replacing it: {}", e);
            pooled.lua = Some(Self::new_state()?);
        }
        drop(pooled);
        self.invocations.fetch_add(1, Ordering::Relaxed);

        if interruptor.is_tripped() {
            return Err(ScriptError::Interrupted);
        }
        if let Err(e) = &result {
            tracing::warn!("[SCRIPT] Script failed: {}", e);
        }
        result
    }

    fn run(
        lua: &Lua,
        source: &str,
        globals: &HashMap<String, Value>,
        interruptor: &Interruptor,
    ) -> Result<Value, ScriptError> {
        let watched = interruptor.clone();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(INTERRUPT_CHECK_INSTRUCTIONS),
            move |_, _| {
                if watched.is_tripped() {
                    Err(mlua::Error::runtime("query interrupted"))
                } else {
                    Ok(VmState::Continue)
                }
            },
        )
        .map_err(|e| ScriptError::Pool(e.to_string()))?;

        let table = lua.globals();
        for (name, value) in globals {
            let value =
                json_to_lua(lua, value).map_err(|e| ScriptError::Conversion(e.to_string()))?;
            table
                .set(name.as_str(), value)
                .map_err(|e| ScriptError::Conversion(e.to_string()))?;
        }

        let result: LuaValue = lua.load(source).eval().map_err(|e| match e {
            mlua::Error::SyntaxError { message, .. } => ScriptError::Compile(message),
            other => ScriptError::Execution(other.to_string()),
        })?;
        lua_to_json(&result).map_err(|e| ScriptError::Conversion(e.to_string()))
    }

}

fn copy_table(lua: &Lua, source: &Table) -> mlua::Result<Table> {
    let copy = lua.create_table()?;
    for pair in source.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        copy.raw_set(key, value)?;
    }
    Ok(copy)
}

/// Make `target` hold exactly the entries of `snapshot`.
fn restore_table(target: &Table, snapshot: &Table) -> mlua::Result<()> {
    let mut stale = Vec::new();
    for pair in target.pairs::<LuaValue, LuaValue>() {
        let (key, _) = pair?;
        if snapshot.raw_get::<LuaValue>(key.clone())?.is_nil() {
            stale.push(key);
        }
    }
    for key in stale {
        target.raw_set(key, LuaValue::Nil)?;
    }
    for pair in snapshot.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        target.raw_set(key, value)?;
    }
    Ok(())
}

/// A state lent out of the pool; returned on drop.
struct PooledLua<'a> {
    pool: &'a ScriptPool,
    lua: Option<Lua>,
}

impl PooledLua<'_> {
    fn lua(&self) -> Result<&Lua, ScriptError> {
        self.lua
            .as_ref()
            .ok_or_else(|| ScriptError::Pool("state already returned".to_string()))
    }
}

impl Drop for PooledLua<'_> {
    fn drop(&mut self) {
        if let Some(lua) = self.lua.take() {
            self.pool.release(lua);
        }
    }
}
