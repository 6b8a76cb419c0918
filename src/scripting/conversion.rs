//! JSON <-> Lua value conversion for script terms.

use mlua::{Lua, Result as LuaResult, Table, Value as LuaValue};
use serde_json::Value as JsonValue;

/// Convert a bound JSON value into a Lua value.
///
/// Integral numbers become Lua integers so scripts can index arrays with
/// them. Arrays are 1-based tables written by explicit index, so a `null`
/// element leaves a hole instead of shifting the elements after it.
pub fn json_to_lua(lua: &Lua, json: &JsonValue) -> LuaResult<LuaValue> {
    Ok(match json {
        JsonValue::Null => LuaValue::Nil,
        JsonValue::Bool(b) => LuaValue::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => LuaValue::String(lua.create_string(s)?),
        JsonValue::Array(elements) => {
            let table = lua.create_table_with_capacity(elements.len(), 0)?;
            for (i, element) in elements.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, element)?)?;
            }
            LuaValue::Table(table)
        }
        JsonValue::Object(fields) => LuaValue::Table(object_table(lua, fields)?),
    })
}

fn object_table(lua: &Lua, fields: &serde_json::Map<String, JsonValue>) -> LuaResult<Table> {
    let table = lua.create_table_with_capacity(0, fields.len())?;
    for (name, value) in fields {
        table.raw_set(name.as_str(), json_to_lua(lua, value)?)?;
    }
    Ok(table)
}

/// Convert a script result to JSON.
///
/// Tables whose keys are all positive integers become arrays up to the
/// largest key, with holes read back as `null`; other tables become objects.
/// Lua cannot tell an empty array from an empty object, so an empty table
/// comes back as `{}`. Functions, userdata and non-finite numbers have no
/// JSON form and are rejected.
pub fn lua_to_json(value: &LuaValue) -> LuaResult<JsonValue> {
    match value {
        LuaValue::Nil => Ok(JsonValue::Null),
        LuaValue::Boolean(b) => Ok(JsonValue::Bool(*b)),
        LuaValue::Integer(i) => Ok(JsonValue::Number((*i).into())),
        LuaValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(JsonValue::Number)
            .ok_or_else(|| mlua::Error::RuntimeError(format!("{} is not a JSON number", n))),
        LuaValue::String(s) => Ok(JsonValue::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let mut is_array = true;
            let mut max_key = 0i64;
            for pair in t.clone().pairs::<LuaValue, LuaValue>() {
                let (k, _) = pair?;
                match k {
                    LuaValue::Integer(i) if i > 0 => {
                        max_key = max_key.max(i);
                    }
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && max_key > 0 {
                let mut arr = Vec::with_capacity(max_key as usize);
                for i in 1..=max_key {
                    let val: LuaValue = t.get(i)?;
                    arr.push(lua_to_json(&val)?);
                }
                Ok(JsonValue::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.clone().pairs::<LuaValue, LuaValue>() {
                    let (k, v) = pair?;
                    let key_str = match k {
                        LuaValue::String(s) => s.to_str()?.to_string(),
                        LuaValue::Integer(i) => i.to_string(),
                        LuaValue::Number(n) => n.to_string(),
                        other => {
                            return Err(mlua::Error::RuntimeError(format!(
                                "table key of type {} has no JSON form",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key_str, lua_to_json(&v)?);
                }
                Ok(JsonValue::Object(map))
            }
        }
        other => Err(mlua::Error::RuntimeError(format!(
            "value of type {} has no JSON form",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_lua_roundtrip() {
        let lua = Lua::new();

        let json = json!({
            "name": "test",
            "count": 42,
            "ratio": 0.5,
            "active": true,
            "tags": ["a", "b", "c"]
        });

        let lua_val = json_to_lua(&lua, &json).unwrap();
        let back = lua_to_json(&lua_val).unwrap();

        assert_eq!(json, back);
    }

    #[test]
    fn test_null_elements_keep_their_position() {
        let lua = Lua::new();
        let json = json!([1, null, 3, null]);
        let lua_val = json_to_lua(&lua, &json).unwrap();
        let LuaValue::Table(table) = &lua_val else {
            panic!("expected a table");
        };
        assert_eq!(table.raw_get::<i64>(3).unwrap(), 3);
        // A trailing null cannot be represented in a Lua table.
        assert_eq!(lua_to_json(&lua_val).unwrap(), json!([1, null, 3]));
    }

    #[test]
    fn test_sparse_table_fills_holes() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("{[1] = 'a', [3] = 'c'}").eval().unwrap();
        assert_eq!(lua_to_json(&value).unwrap(), json!(["a", null, "c"]));
    }

    #[test]
    fn test_empty_array_reads_back_as_object() {
        let lua = Lua::new();
        let lua_val = json_to_lua(&lua, &json!([])).unwrap();
        assert_eq!(lua_to_json(&lua_val).unwrap(), json!({}));
    }

    #[test]
    fn test_function_has_no_json_form() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("function() end").eval().unwrap();
        assert!(lua_to_json(&value).is_err());
    }
}
