//! Lua ⇄ JSON value marshalling.
//!
//! The engine's contract with scripts is language-neutral: nil, bool,
//! number (double), string, ordered sequence, map of string → value.
//! Conversion rides on serde in both directions.

use mlua::{Lua, LuaSerdeExt, Value as LuaValue};

use crate::error::{Error, Result};

/// Convert a JSON value into a Lua value inside `lua`.
pub fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> mlua::Result<LuaValue> {
    lua.to_value(value)
}

/// Convert a Lua value back into JSON. Tables must be sequences or
/// string-keyed maps; anything else (functions, userdata, mixed keys) is an
/// error rather than a silent lossy encode.
pub fn lua_to_json(value: LuaValue) -> Result<serde_json::Value> {
    match &value {
        LuaValue::Function(_) | LuaValue::Thread(_) | LuaValue::UserData(_) => {
            return Err(Error::Invalid(format!(
                "script returned an unmarshallable {}",
                value.type_name()
            )));
        }
        _ => {}
    }
    serde_json::to_value(&value).map_err(|e| Error::Invalid(format!("script result: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(value: serde_json::Value) -> serde_json::Value {
        let lua = Lua::new();
        let lua_value = json_to_lua(&lua, &value).unwrap();
        lua_to_json(lua_value).unwrap()
    }

    #[test]
    fn scalars_roundtrip() {
        assert_eq!(roundtrip(json!(null)), json!(null));
        assert_eq!(roundtrip(json!(true)), json!(true));
        assert_eq!(roundtrip(json!(42)), json!(42));
        assert_eq!(roundtrip(json!(2.5)), json!(2.5));
        assert_eq!(roundtrip(json!("hello")), json!("hello"));
    }

    #[test]
    fn sequences_keep_order() {
        assert_eq!(roundtrip(json!([1, 2, 3])), json!([1, 2, 3]));
        assert_eq!(
            roundtrip(json!(["a", {"k": 1}, null])),
            json!(["a", {"k": 1}, null])
        );
    }

    #[test]
    fn maps_keep_string_keys() {
        let value = json!({"name": "goop", "nested": {"n": 7}});
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn functions_are_rejected() {
        let lua = Lua::new();
        let f: LuaValue = lua
            .load("return function() end")
            .eval()
            .unwrap();
        let err = lua_to_json(f).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)), "{err}");
    }

    #[test]
    fn lua_built_table_converts() {
        let lua = Lua::new();
        let table: LuaValue = lua
            .load(r#"return { name = "x", tags = { "a", "b" } }"#)
            .eval()
            .unwrap();
        let json = lua_to_json(table).unwrap();
        assert_eq!(json["name"], "x");
        assert_eq!(json["tags"], json!(["a", "b"]));
    }
}
