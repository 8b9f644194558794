//! 全局命名空间操作

use mlua::{Lua, MultiValue, Value};

use crate::core::error::{BridgeError, BridgeResult};
use crate::registry::split_name;

/// 把值绑定到（可带点号的）全局名字上，沿途缺失的表会被创建
pub(crate) fn bind<'lua>(lua: &'lua Lua, name: &str, value: Value<'lua>) -> BridgeResult<()> {
    let segments = split_name(name)?;
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Err(BridgeError::Conversion(format!("'{}' is not a valid name", name))),
    };

    let mut table = lua.globals();
    for segment in parents {
        table = match table.raw_get::<_, Value>(*segment)? {
            Value::Table(child) => child,
            Value::Nil => {
                let child = lua.create_table()?;
                table.raw_set(*segment, child.clone())?;
                child
            }
            other => {
                return Err(BridgeError::Conversion(format!(
                    "'{}' in '{}' is a {}, not a table",
                    segment,
                    name,
                    other.type_name()
                )))
            }
        };
    }
    table.raw_set(*last, value)?;
    Ok(())
}

/// 按（可带点号的）全局名字取值；路径不存在时返回 nil
pub(crate) fn lookup<'lua>(lua: &'lua Lua, name: &str) -> BridgeResult<Value<'lua>> {
    let segments = match split_name(name) {
        Ok(segments) => segments,
        Err(_) => return Ok(Value::Nil),
    };
    let mut current = Value::Table(lua.globals());
    for segment in segments {
        current = match current {
            Value::Table(table) => table.raw_get::<_, Value>(segment)?,
            _ => return Ok(Value::Nil),
        };
    }
    Ok(current)
}

/// 去掉沙箱中可以读取文件的基础函数
pub(crate) fn strip_file_access(lua: &Lua) -> BridgeResult<()> {
    let globals = lua.globals();
    for name in ["dofile", "loadfile"] {
        globals.raw_set(name, Value::Nil)?;
    }
    Ok(())
}

/// 用 tracing 替换脚本中的 print
pub(crate) fn capture_print(lua: &Lua) -> BridgeResult<()> {
    let print = lua.create_function(|lua, args: MultiValue| {
        let line = render_line(lua, args)?;
        tracing::info!(target: "script.console", "{}", line);
        Ok(())
    })?;
    lua.globals().raw_set("print", print)?;
    Ok(())
}

fn render_line<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<String> {
    let tostring: mlua::Function = lua.globals().get("tostring")?;
    let mut parts = Vec::with_capacity(args.len());
    for arg in args.into_vec() {
        let text: mlua::String = tostring.call(arg)?;
        parts.push(text.to_string_lossy().into_owned());
    }
    Ok(parts.join("\t"))
}
